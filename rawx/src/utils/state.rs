use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::http::Method;

use crate::config::RawxConfig;
use crate::storage::attrs::open_store;
use crate::storage::{ChunkRepository, FileRepository, ShardResolver, SyncOptions};

/// Pending files older than this at startup belong to a crashed process.
pub const STALE_PENDING_AGE: Duration = Duration::from_secs(3600);

/// Request and traffic counters, as reported by `/stat`.
#[derive(Debug, Default)]
pub struct Stats {
    req_get: AtomicU64,
    req_put: AtomicU64,
    req_head: AtomicU64,
    req_delete: AtomicU64,
    req_other: AtomicU64,
    rep_2xx: AtomicU64,
    rep_4xx: AtomicU64,
    rep_5xx: AtomicU64,
    rep_other: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Stats {
    pub fn record_request(&self, method: &Method) {
        let counter = match *method {
            Method::GET => &self.req_get,
            Method::PUT => &self.req_put,
            Method::HEAD => &self.req_head,
            Method::DELETE => &self.req_delete,
            _ => &self.req_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `status` is raw: 499 has no `StatusCode` constant.
    pub fn record_reply(&self, status: u16, bytes_in: u64, bytes_out: u64) {
        let counter = match status {
            200..=299 => &self.rep_2xx,
            400..=499 => &self.rep_4xx,
            500..=599 => &self.rep_5xx,
            _ => &self.rep_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        [
            ("req.get", &self.req_get),
            ("req.put", &self.req_put),
            ("req.head", &self.req_head),
            ("req.delete", &self.req_delete),
            ("req.other", &self.req_other),
            ("rep.2xx", &self.rep_2xx),
            ("rep.4xx", &self.rep_4xx),
            ("rep.5xx", &self.rep_5xx),
            ("rep.other", &self.rep_other),
            ("bytes.in", &self.bytes_in),
            ("bytes.out", &self.bytes_out),
        ]
        .into_iter()
        .map(|(name, counter)| (name, counter.load(Ordering::Relaxed)))
        .collect()
    }
}

pub struct AppState {
    pub config: Arc<RawxConfig>,
    pub repo: Arc<ChunkRepository>,
    pub stats: Stats,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: RawxConfig, repo: ChunkRepository) -> Self {
        AppState {
            config: Arc::new(config),
            repo: Arc::new(repo),
            stats: Stats::default(),
            started_at: Instant::now(),
        }
    }

    /// Opens the storage root described by `config`: picks the attribute
    /// backend, takes the basedir lock, checks the shard layout and sweeps
    /// leftovers of crashed writes.
    pub async fn open(config: RawxConfig) -> anyhow::Result<Self> {
        let attrs = open_store(&config.basedir, config.attr_backend).with_context(|| {
            format!("cannot probe attribute support of {}", config.basedir.display())
        })?;
        let files = FileRepository::new(
            ShardResolver::new(&config.basedir, config.hash_width, config.hash_depth),
            attrs,
            SyncOptions {
                sync_file: config.fsync_file,
                sync_dir: config.fsync_dir,
                fallocate: config.fallocate,
            },
        );
        let repo = ChunkRepository::new(files, config.compress, config.checksum);

        repo.lock(&config.namespace, &config.addr)
            .await
            .context("basedir cannot be locked")?;
        repo.check_layout().await?;
        let purged = repo.files().purge_pending(STALE_PENDING_AGE).await?;
        if purged > 0 {
            tracing::info!("removed {purged} leftover files of interrupted writes");
        }
        tracing::info!(
            "serving {} (width={}, depth={}, attributes={}, compress={})",
            config.basedir.display(),
            config.hash_width,
            config.hash_depth,
            repo.files().attrs().name(),
            config.compress
        );
        Ok(AppState::new(config, repo))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
