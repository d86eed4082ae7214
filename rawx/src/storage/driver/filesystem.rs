use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs::{File, OpenOptions, create_dir_all, metadata, remove_file};
use tokio::io::{self, AsyncRead, AsyncSeekExt, AsyncWriteExt, BufWriter, Take};
use tokio::task::spawn_blocking;

use crate::error::StorageError;
use crate::storage::attrs::{AttrStore, DIR_SIDECAR_NAME, SIDECAR_SUFFIX, STAGING_SUFFIX};
use crate::storage::paths::ShardResolver;
use crate::storage::sys;

/// Durability switches of the file layer.
#[derive(Clone, Copy, Debug)]
pub struct SyncOptions {
    /// fsync the chunk file before publishing it.
    pub sync_file: bool,
    /// fsync the shard directory after publishing.
    pub sync_dir: bool,
    /// Reserve the declared size before writing.
    pub fallocate: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            sync_file: false,
            sync_dir: true,
            fallocate: true,
        }
    }
}

/// Durable file operations over the sharded layout.
///
/// Writes never touch the final path directly: data goes to a pending file in
/// the shard directory and is published with an exclusive rename, so readers
/// see either nothing or the complete file, and of several writers racing on
/// one identifier exactly one wins.
#[derive(Debug)]
pub struct FileRepository {
    resolver: ShardResolver,
    attrs: Arc<dyn AttrStore>,
    options: SyncOptions,
}

impl FileRepository {
    pub fn new(resolver: ShardResolver, attrs: Arc<dyn AttrStore>, options: SyncOptions) -> Self {
        FileRepository {
            resolver,
            attrs,
            options,
        }
    }

    pub fn resolver(&self) -> &ShardResolver {
        &self.resolver
    }

    pub fn attrs(&self) -> &Arc<dyn AttrStore> {
        &self.attrs
    }

    pub fn options(&self) -> SyncOptions {
        self.options
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Opens a pending file for `id`. Fails with `AlreadyExists` when the
    /// chunk is already published.
    pub async fn begin(
        &self,
        id: &str,
        size_hint: Option<u64>,
    ) -> Result<PendingFile, StorageError> {
        let final_path = self.resolver.resolve(id);
        if io_exists(&final_path).await? {
            return Err(StorageError::AlreadyExists(id.to_string()));
        }

        let tmp_path = self.resolver.pending_path(id);
        let file = open_exclusive(&tmp_path).await?;
        let mut pending = PendingFile {
            id: id.to_string(),
            tmp_path,
            final_path,
            writer: None,
            written: 0,
            preallocated: 0,
            attrs: self.attrs.clone(),
            options: self.options,
            done: false,
        };

        if self.options.fallocate {
            if let Some(len) = size_hint.filter(|len| *len > 0) {
                let std_file = file.try_clone().await?.into_std().await;
                spawn_blocking(move || sys::preallocate(&std_file, len))
                    .await
                    .map_err(io::Error::other)??;
                pending.preallocated = len;
            }
        }
        pending.writer = Some(BufWriter::new(file));
        Ok(pending)
    }

    /// Streams `payload` into a new file for `id` and publishes it.
    /// Returns the number of bytes written.
    pub async fn create<R>(
        &self,
        id: &str,
        payload: &mut R,
        size_hint: Option<u64>,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut pending = self.begin(id, size_hint).await?;
        pending.write_from(payload).await?;
        pending.commit().await
    }

    /// Opens the published file of `id`, returning it with its size.
    pub async fn open(&self, id: &str) -> Result<(File, u64), StorageError> {
        let path = self.resolver.resolve(id);
        let file = File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(id, e))?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Reads `id`, optionally only the inclusive byte range `range`.
    pub async fn read(
        &self,
        id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Take<File>, StorageError> {
        let (file, size) = self.open(id).await?;
        seek_range(file, size, range).await
    }

    pub async fn stat(&self, id: &str) -> Result<u64, StorageError> {
        let path = self.resolver.resolve(id);
        let meta = metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(id, e))?;
        Ok(meta.len())
    }

    /// Unlinks the chunk, then its attributes. Until the latter are gone a
    /// new chunk of the same id cannot publish its own.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let path = self.resolver.resolve(id);
        remove_file(&path)
            .await
            .map_err(|e| StorageError::from_io(id, e))?;

        let attrs = self.attrs.clone();
        let sync_dir = self.options.sync_dir;
        spawn_blocking(move || {
            attrs.dropped(&path)?;
            if sync_dir {
                if let Some(parent) = path.parent() {
                    sys::fsync_dir(parent)?;
                }
            }
            Ok::<_, io::Error>(())
        })
        .await
        .map_err(io::Error::other)??;
        Ok(())
    }

    /// Identifiers of every published chunk, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let root = self.resolver.root().to_path_buf();
        let depth = self.resolver.depth();
        let ids = spawn_blocking(move || {
            let mut ids = Vec::new();
            walk(&root, depth, &mut |_, name, _| {
                if is_chunk_name(name) {
                    ids.push(name.to_string());
                }
            })?;
            ids.sort();
            Ok::<_, io::Error>(ids)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(ids)
    }

    /// Whether the root holds no published chunk. Empty shard directories
    /// do not count.
    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.list().await?.is_empty())
    }

    /// Removes leftovers of crashed writers: pending files older than
    /// `max_age`, and sidecar descriptors whose file is gone. Meant to run
    /// before serving, with no write in flight. Returns how many files were
    /// removed.
    pub async fn purge_pending(&self, max_age: Duration) -> Result<usize, StorageError> {
        let root = self.resolver.root().to_path_buf();
        let depth = self.resolver.depth();
        let attrs = self.attrs.clone();
        let removed = spawn_blocking(move || {
            let now = SystemTime::now();
            let mut stale = Vec::new();
            walk(&root, depth, &mut |path, name, meta| {
                let old = meta
                    .modified()
                    .ok()
                    .and_then(|at| now.duration_since(at).ok())
                    .is_some_and(|age| age >= max_age);
                if ShardResolver::is_pending_name(name) && old {
                    stale.push((path.to_path_buf(), true));
                } else if is_orphan_descriptor(path, name) {
                    stale.push((path.to_path_buf(), false));
                }
            })?;
            let mut removed = 0;
            for (path, pending) in stale {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        if pending {
                            let _ = attrs.dropped(&path);
                        }
                        removed += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
            Ok::<_, io::Error>(removed)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(removed)
    }
}

/// A write in flight. The data is only visible under its final path once
/// [`PendingFile::commit`] returns; dropping the value beforehand (error,
/// abort, cancelled request) deletes the temporary file.
#[derive(Debug)]
pub struct PendingFile {
    id: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
    preallocated: u64,
    attrs: Arc<dyn AttrStore>,
    options: SyncOptions,
    done: bool,
}

impl PendingFile {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copies `reader` to the end of the file.
    pub async fn write_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        let copied = io::copy(reader, writer).await?;
        self.written += copied;
        Ok(copied)
    }

    /// Attaches attributes to the pending file; they travel with it on commit.
    pub async fn set_attrs(&self, attrs: Vec<(&'static str, String)>) -> io::Result<()> {
        let store = self.attrs.clone();
        let path = self.tmp_path.clone();
        spawn_blocking(move || store.set_all(&path, &attrs))
            .await
            .map_err(io::Error::other)?
    }

    /// Flushes, optionally syncs, and publishes the file under its final
    /// path. Fails with `AlreadyExists` when another writer won the race.
    pub async fn commit(mut self) -> Result<u64, StorageError> {
        let mut writer = self.writer.take().ok_or_else(closed)?;
        writer.flush().await?;
        let file = writer.into_inner();
        if self.preallocated > self.written {
            // give back what the declared size reserved but compression saved
            file.set_len(self.written).await?;
        }
        if self.options.sync_file {
            file.sync_all().await?;
        }
        drop(file);

        let tmp_path = self.tmp_path.clone();
        let final_path = self.final_path.clone();
        let attrs = self.attrs.clone();
        let published = spawn_blocking(move || attrs.publish(&tmp_path, &final_path))
            .await
            .map_err(io::Error::other)?;
        if let Err(e) = published {
            return Err(StorageError::from_io(&self.id, e));
        }
        self.done = true;

        if self.options.sync_dir {
            if let Some(parent) = self.final_path.parent().map(Path::to_path_buf) {
                spawn_blocking(move || sys::fsync_dir(&parent))
                    .await
                    .map_err(io::Error::other)??;
            }
        }
        Ok(self.written)
    }

    /// Discards the pending file.
    pub async fn abort(mut self) -> io::Result<()> {
        self.writer.take();
        self.done = true;
        let result = remove_file(&self.tmp_path).await;
        let attrs = self.attrs.clone();
        let tmp_path = self.tmp_path.clone();
        spawn_blocking(move || attrs.dropped(&tmp_path))
            .await
            .map_err(io::Error::other)??;
        result
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.writer.take();
        if let Err(e) = std::fs::remove_file(&self.tmp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("failed to discard {}: {e}", self.tmp_path.display());
            }
        }
        let _ = self.attrs.dropped(&self.tmp_path);
        tracing::debug!("discarded pending write of chunk {}", self.id);
    }
}

fn closed() -> io::Error {
    io::Error::other("pending file already closed")
}

async fn io_exists(path: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

/// Creates `path` exclusively, creating the shard directories on demand.
/// Concurrent creation of the same directories is not an error.
async fn open_exclusive(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    match options.open(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }
            options.open(path).await
        }
        other => other,
    }
}

/// Positions `file` at the start of the inclusive `range` and limits reads
/// to its length.
pub(crate) async fn seek_range(
    mut file: File,
    size: u64,
    range: Option<(u64, u64)>,
) -> Result<Take<File>, StorageError> {
    use tokio::io::AsyncReadExt;

    match range {
        None => Ok(file.take(size)),
        Some((start, _)) if start >= size => Err(StorageError::RangeNotSatisfiable { size }),
        Some((start, end)) => {
            let end = end.min(size - 1);
            file.seek(SeekFrom::Start(start)).await?;
            Ok(file.take(end.saturating_sub(start) + 1))
        }
    }
}

/// Chunk files carry their identifier as name: hexadecimal, nothing else.
pub fn is_chunk_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A sidecar descriptor whose file no longer exists, or a descriptor
/// rewrite that never completed.
fn is_orphan_descriptor(path: &Path, name: &str) -> bool {
    if name == DIR_SIDECAR_NAME {
        return false;
    }
    if let Some(rewritten) = name.strip_suffix(STAGING_SUFFIX) {
        return rewritten.ends_with(SIDECAR_SUFFIX);
    }
    match name.strip_suffix(SIDECAR_SUFFIX) {
        Some(object) => !path.with_file_name(object).exists(),
        None => false,
    }
}

/// Visits every regular file under `dir`, descending at most `levels`
/// directories.
fn walk(
    dir: &Path,
    levels: usize,
    visit: &mut dyn FnMut(&Path, &str, &std::fs::Metadata),
) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // raced with a delete
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        let path = entry.path();
        if meta.is_dir() {
            if levels > 0 {
                walk(&path, levels - 1, visit)?;
            }
            continue;
        }
        let name = entry.file_name();
        visit(&path, &name.to_string_lossy(), &meta);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::attrs::SidecarStore;
    use tokio::io::AsyncReadExt;

    const ID: &str = "0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF";

    fn repo(root: &Path) -> FileRepository {
        FileRepository::new(
            ShardResolver::new(root, 2, 1),
            Arc::new(SidecarStore),
            SyncOptions {
                sync_file: true,
                sync_dir: true,
                fallocate: true,
            },
        )
    }

    async fn read_all(mut reader: impl AsyncRead + Unpin) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_create_then_read_stat_delete() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());

        let written = repo.create(ID, &mut &b"hello chunk"[..], Some(11)).await.unwrap();
        assert_eq!(written, 11);
        assert!(dir.path().join("01").join(ID).is_file());
        assert_eq!(repo.stat(ID).await.unwrap(), 11);
        assert_eq!(read_all(repo.read(ID, None).await.unwrap()).await, b"hello chunk");
        assert_eq!(read_all(repo.read(ID, Some((6, 10))).await.unwrap()).await, b"chunk");

        repo.delete(ID).await.unwrap();
        assert!(matches!(repo.delete(ID).await, Err(StorageError::NotFound(_))));
        assert!(matches!(repo.stat(ID).await, Err(StorageError::NotFound(_))));
        assert!(matches!(repo.read(ID, None).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_refuses_existing_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        repo.create(ID, &mut &b"first"[..], None).await.unwrap();

        let err = repo.create(ID, &mut &b"second"[..], None).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(read_all(repo.read(ID, None).await.unwrap()).await, b"first");
    }

    #[tokio::test]
    async fn test_concurrent_creates_have_a_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(repo(dir.path()));

        // every writer opens its pending file before anyone publishes
        let mut pendings = Vec::new();
        for i in 0..8u8 {
            let mut pending = repo.begin(ID, None).await.unwrap();
            pending.write_from(&mut &[i; 64][..]).await.unwrap();
            pendings.push(pending);
        }
        let results = futures::future::join_all(pendings.into_iter().map(|p| p.commit())).await;

        let winners: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(winners.len(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, StorageError::AlreadyExists(_)));
            }
        }
        let content = read_all(repo.read(ID, None).await.unwrap()).await;
        assert_eq!(content.len(), 64);
        assert!(content.iter().all(|b| *b == content[0]));
        // losers cleaned up after themselves
        assert_eq!(std::fs::read_dir(dir.path().join("01")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_pending_file_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());

        let mut pending = repo.begin(ID, Some(4096)).await.unwrap();
        pending.write_from(&mut &b"partial"[..]).await.unwrap();
        let tmp = pending.tmp_path().to_path_buf();
        assert!(tmp.exists());
        drop(pending);

        assert!(!tmp.exists());
        assert!(matches!(repo.stat(ID).await, Err(StorageError::NotFound(_))));
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preallocation_does_not_pad_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        repo.create(ID, &mut &b"tiny"[..], Some(1 << 20)).await.unwrap();
        assert_eq!(repo.stat(ID).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_list_skips_pending_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        repo.create("AB01", &mut &b"a"[..], None).await.unwrap();
        repo.create("CD02", &mut &b"b"[..], None).await.unwrap();
        let _pending = repo.begin("EF03", None).await.unwrap();
        repo.attrs().set(&repo.resolver().resolve("AB01"), "user.k", "v").unwrap();

        assert_eq!(repo.list().await.unwrap(), vec!["AB01", "CD02"]);
        assert!(!repo.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_pending_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let pending = repo.begin(ID, None).await.unwrap();
        let tmp = pending.tmp_path().to_path_buf();
        // simulate a crash: the pending file outlives its writer
        std::mem::forget(pending);
        assert!(tmp.exists());

        assert_eq!(repo.purge_pending(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(repo.purge_pending(Duration::ZERO).await.unwrap(), 1);
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_descriptor_moves_before_the_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let sidecar = |path: &Path| SidecarStore::sidecar_path(path);

        let pending = repo.begin(ID, None).await.unwrap();
        pending
            .set_attrs(vec![("user.grid.chunk.size", "4".to_string())])
            .await
            .unwrap();
        let final_path = pending.final_path().to_path_buf();
        // crash between the two renames
        std::fs::rename(sidecar(pending.tmp_path()), sidecar(&final_path)).unwrap();
        std::mem::forget(pending);

        // the orphan descriptor is invisible and blocks no reader
        assert!(matches!(repo.stat(ID).await, Err(StorageError::NotFound(_))));
        assert!(repo.list().await.unwrap().is_empty());
        // but a writer cannot slip its chunk under it
        let err = repo.create(ID, &mut &b"late"[..], None).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert!(!final_path.exists());

        assert_eq!(repo.purge_pending(Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(!sidecar(&final_path).exists());
        repo.create(ID, &mut &b"again"[..], None).await.unwrap();
        assert_eq!(repo.stat(ID).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_delete_takes_the_descriptor_along() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        let mut pending = repo.begin(ID, None).await.unwrap();
        pending.write_from(&mut &b"abc"[..]).await.unwrap();
        pending
            .set_attrs(vec![("user.grid.chunk.hash", "X".to_string())])
            .await
            .unwrap();
        pending.commit().await.unwrap();
        let final_path = repo.resolver().resolve(ID);
        assert!(SidecarStore::sidecar_path(&final_path).exists());

        repo.delete(ID).await.unwrap();
        assert!(!SidecarStore::sidecar_path(&final_path).exists());
        repo.create(ID, &mut &b"abcd"[..], None).await.unwrap();
        assert_eq!(repo.attrs().get(&final_path, "user.grid.chunk.hash").unwrap(), None);
    }

    #[tokio::test]
    async fn test_root_without_chunks_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        repo.create(ID, &mut &b"x"[..], None).await.unwrap();
        assert!(!repo.is_empty().await.unwrap());

        repo.delete(ID).await.unwrap();
        // the shard directory stays behind
        assert!(dir.path().join("01").is_dir());
        assert!(repo.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(dir.path());
        assert!(repo.is_empty().await.unwrap());
        repo.attrs().set(dir.path(), "user.rawx_server.namespace", "NS").unwrap();
        assert!(repo.is_empty().await.unwrap());
    }
}
