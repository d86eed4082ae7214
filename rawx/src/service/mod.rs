pub mod chunk;
pub mod stat;
