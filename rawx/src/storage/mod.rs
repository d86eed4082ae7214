pub mod attrs;
pub mod chunk;
pub mod driver;
pub mod lock;
pub mod paths;
pub mod sys;

pub use chunk::{ChecksumAlgo, ChunkMeta, ChunkRead, ChunkRepository, RangeSpec};
pub use driver::filesystem::{FileRepository, SyncOptions};
pub use paths::ShardResolver;
