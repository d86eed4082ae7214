pub mod middleware;

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Router, middleware as axum_middleware};
use tower_http::trace::TraceLayer;

use crate::api::middleware::access_log;
use crate::error::AppError;
use crate::service::chunk::{
    delete_chunk_handler, get_chunk_handler, head_chunk_handler, put_chunk_handler,
};
use crate::service::stat::{info_handler, stat_handler};
use crate::utils::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*tail}", any(dispatch_handler))
        .layer(axum_middleware::from_fn_with_state(state.clone(), access_log))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(tail): Path<String>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let segments: Vec<&str> = tail.split('/').collect();

    match segments.as_slice() {
        // tail: /info
        ["info"] => match method {
            Method::GET | Method::HEAD => Ok(info_handler(State(state)).await.into_response()),
            _ => Err(AppError::MethodNotAllowed(method)),
        },
        // tail: /stat
        ["stat"] => match method {
            Method::GET | Method::HEAD => stat_handler(State(state))
                .await
                .map(|res| res.into_response()),
            _ => Err(AppError::MethodNotAllowed(method)),
        },
        // tail: /chunk/{id}, /rawx/{id}, or the bare /{id}
        ["chunk" | "rawx", id] | [id] => {
            let id = id.to_string();
            match method {
                // Download a chunk, or a range of it
                Method::GET => get_chunk_handler(State(state), Path(id), headers).await,
                // Chunk metadata
                Method::HEAD => head_chunk_handler(State(state), Path(id))
                    .await
                    .map(|res| res.into_response()),
                // Upload a new chunk
                Method::PUT => put_chunk_handler(State(state), Path(id), headers, request)
                    .await
                    .map(|res| res.into_response()),
                // Remove a chunk
                Method::DELETE => delete_chunk_handler(State(state), Path(id))
                    .await
                    .map(|res| res.into_response()),
                _ => Err(AppError::MethodNotAllowed(method)),
            }
        }
        _ => Err(AppError::InvalidChunkId(tail.clone())),
    }
}
