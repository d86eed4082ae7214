//! Ownership of a storage root.
//!
//! A basedir belongs to exactly one (namespace, address) identity, recorded
//! as attributes of the root directory itself. A node starting with another
//! identity against an owned root must refuse to run.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::spawn_blocking;

use crate::error::StorageError;
use crate::storage::attrs::AttrStore;

pub const NAMESPACE_KEY: &str = "user.rawx_server.namespace";
pub const ADDRESS_KEY: &str = "user.rawx_server.address";
pub const HASH_WIDTH_KEY: &str = "user.rawx_server.hash_width";
pub const HASH_DEPTH_KEY: &str = "user.rawx_server.hash_depth";

#[derive(Clone, Debug)]
pub struct BasedirLock {
    root: PathBuf,
    attrs: Arc<dyn AttrStore>,
}

impl BasedirLock {
    pub fn new(root: impl Into<PathBuf>, attrs: Arc<dyn AttrStore>) -> Self {
        BasedirLock {
            root: root.into(),
            attrs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Binds the root to (namespace, address). Succeeds on an unowned root
    /// and when the recorded owner is the same identity; fails with
    /// `LockConflict` otherwise.
    pub async fn acquire(&self, namespace: &str, address: &str) -> Result<(), StorageError> {
        let lock = self.clone();
        let wanted = (namespace.to_string(), address.to_string());
        spawn_blocking(move || lock.acquire_blocking(&wanted))
            .await
            .map_err(io::Error::other)?
    }

    /// The recorded (namespace, address). A partial record has one of them.
    fn recorded(&self) -> io::Result<(Option<String>, Option<String>)> {
        Ok((
            self.attrs.get(&self.root, NAMESPACE_KEY)?,
            self.attrs.get(&self.root, ADDRESS_KEY)?,
        ))
    }

    fn acquire_blocking(&self, wanted: &(String, String)) -> Result<(), StorageError> {
        let (namespace, address) = wanted;
        let (recorded_namespace, recorded_address) = self.recorded()?;
        let agrees = |recorded: &Option<String>, value: &str| {
            recorded.as_deref().is_none_or(|recorded| recorded == value)
        };
        if !agrees(&recorded_namespace, namespace) || !agrees(&recorded_address, address) {
            return Err(self.conflict(recorded_namespace, recorded_address));
        }

        // another process may be claiming the same root right now: only an
        // exclusive create counts as taking the lock
        for (key, value) in [(NAMESPACE_KEY, namespace), (ADDRESS_KEY, address)] {
            match self.attrs.create(&self.root, key, value) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let recorded = self.attrs.get(&self.root, key)?;
                    if recorded.as_deref() != Some(value.as_str()) {
                        let (namespace, address) = self.recorded()?;
                        return Err(self.conflict(namespace, address));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::info!(
            "basedir {} locked for namespace `{}` at `{}`",
            self.root.display(),
            namespace,
            address
        );
        Ok(())
    }

    fn conflict(&self, namespace: Option<String>, address: Option<String>) -> StorageError {
        StorageError::LockConflict {
            basedir: self.root.display().to_string(),
            namespace: namespace.unwrap_or_default(),
            address: address.unwrap_or_default(),
        }
    }

    /// Guards the shard layout. A root recording another (width, depth)
    /// while `populated` is refused with `LayoutConflict`, since its chunks
    /// would no longer resolve; otherwise the requested layout is recorded.
    pub async fn check_layout(
        &self,
        width: usize,
        depth: usize,
        populated: bool,
    ) -> Result<(), StorageError> {
        let lock = self.clone();
        spawn_blocking(move || lock.check_layout_blocking(width, depth, populated))
            .await
            .map_err(io::Error::other)?
    }

    fn check_layout_blocking(
        &self,
        width: usize,
        depth: usize,
        populated: bool,
    ) -> Result<(), StorageError> {
        let recorded_width = self.recorded_usize(HASH_WIDTH_KEY)?;
        let recorded_depth = self.recorded_usize(HASH_DEPTH_KEY)?;
        match (recorded_width, recorded_depth) {
            (Some(w), Some(d)) if w == width && d == depth => return Ok(()),
            (Some(w), Some(d)) if populated => {
                return Err(StorageError::LayoutConflict {
                    basedir: self.root.display().to_string(),
                    width: w,
                    depth: d,
                    requested_width: width,
                    requested_depth: depth,
                });
            }
            _ => {}
        }
        self.attrs.set(&self.root, HASH_WIDTH_KEY, &width.to_string())?;
        self.attrs.set(&self.root, HASH_DEPTH_KEY, &depth.to_string())?;
        Ok(())
    }

    fn recorded_usize(&self, key: &str) -> Result<Option<usize>, StorageError> {
        match self.attrs.get(&self.root, key)? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                StorageError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{key} holds `{raw}`, not an integer"),
                ))
            }),
        }
    }
}
