use std::fmt::Write;
use std::io;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderValue;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use tokio::task::spawn_blocking;

use crate::error::AppError;
use crate::storage::sys;
use crate::utils::state::AppState;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// GET /info
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    let body = format!(
        "namespace {}\nid {}\naddr {}\npath {}\n",
        config.namespace,
        config.id,
        config.addr,
        config.basedir.display()
    );
    ([(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN))], body)
}

/// GET /stat
pub async fn stat_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let basedir = state.config.basedir.clone();
    let (total, avail) = spawn_blocking(move || sys::fs_usage(&basedir))
        .await
        .map_err(io::Error::other)??;

    let mut body = String::new();
    for (name, value) in state.stats.snapshot() {
        let _ = writeln!(body, "counter {name} {value}");
    }
    let _ = writeln!(body, "gauge uptime {}", state.uptime_secs());
    let _ = writeln!(body, "gauge space.total {total}");
    let _ = writeln!(body, "gauge space.avail {avail}");

    let config = &state.config;
    let settings = [
        ("ns", config.namespace.clone()),
        ("id", config.id.clone()),
        ("addr", config.addr.clone()),
        ("volume", config.basedir.display().to_string()),
        ("hash_width", config.hash_width.to_string()),
        ("hash_depth", config.hash_depth.to_string()),
        ("compress", config.compress.to_string()),
        ("checksum", config.checksum.to_string()),
        ("attr_backend", state.repo.files().attrs().name().to_string()),
    ];
    for (key, value) in settings {
        let _ = writeln!(body, "config {key} {value}");
    }

    Ok(([(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN))], body))
}
