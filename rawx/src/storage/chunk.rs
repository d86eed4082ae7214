use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;

use async_compression::tokio::bufread::{ZlibDecoder, ZlibEncoder};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::task::spawn_blocking;
use tokio_util::io::InspectReader;

use crate::error::StorageError;
use crate::storage::driver::filesystem::{FileRepository, seek_range};
use crate::storage::lock::BasedirLock;

pub type ChunkReader = Pin<Box<dyn AsyncRead + Send>>;

pub const ZLIB: &str = "zlib";

pub const ATTR_CHUNK_ID: &str = "user.grid.chunk.id";
pub const ATTR_CHUNK_SIZE: &str = "user.grid.chunk.size";
pub const ATTR_CHUNK_HASH: &str = "user.grid.chunk.hash";
pub const ATTR_CHUNK_HASH_ALGO: &str = "user.grid.chunk.hash-algo";
pub const ATTR_COMPRESSION: &str = "user.grid.compression";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChecksumAlgo {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgo::Md5 => "md5",
            ChecksumAlgo::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgo::Md5),
            "sha256" => Ok(ChecksumAlgo::Sha256),
            other => Err(format!("unsupported checksum algorithm `{other}`")),
        }
    }
}

enum ChunkHasher {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl ChunkHasher {
    fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Md5 => ChunkHasher::Md5(md5::Context::new()),
            ChecksumAlgo::Sha256 => ChunkHasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            ChunkHasher::Md5(ctx) => ctx.consume(data),
            ChunkHasher::Sha256(hasher) => hasher.update(data),
        }
    }

    /// Uppercase hexadecimal digest.
    fn finalize(self) -> String {
        match self {
            ChunkHasher::Md5(ctx) => hex::encode_upper(ctx.compute().0),
            ChunkHasher::Sha256(hasher) => hex::encode_upper(hasher.finalize()),
        }
    }
}

/// Metadata stored along a chunk: what it is (size, checksum, encoding)
/// and where it belongs in the logical object it is part of.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkMeta {
    pub chunk_id: String,
    pub chunk_size: Option<u64>,
    pub chunk_hash: Option<String>,
    pub chunk_hash_algo: Option<ChecksumAlgo>,
    pub chunk_pos: Option<String>,
    pub container_id: Option<String>,
    pub content_id: Option<String>,
    pub content_path: Option<String>,
    pub content_version: Option<String>,
    pub content_chunk_method: Option<String>,
    pub content_storage_policy: Option<String>,
    pub compression: Option<String>,
}

/// Attribute key and HTTP header of a free-form metadata field.
#[derive(Clone, Copy, Debug)]
pub struct MetaField {
    pub attr: &'static str,
    pub header: &'static str,
}

const fn field(attr: &'static str, header: &'static str) -> MetaField {
    MetaField { attr, header }
}

pub const FIELD_CHUNK_POS: MetaField =
    field("user.grid.chunk.position", "x-oio-chunk-meta-chunk-pos");
pub const FIELD_CONTAINER_ID: MetaField =
    field("user.grid.content.container", "x-oio-chunk-meta-container-id");
pub const FIELD_CONTENT_ID: MetaField =
    field("user.grid.content.id", "x-oio-chunk-meta-content-id");
pub const FIELD_CONTENT_PATH: MetaField =
    field("user.grid.content.path", "x-oio-chunk-meta-content-path");
pub const FIELD_CONTENT_VERSION: MetaField =
    field("user.grid.content.version", "x-oio-chunk-meta-content-version");
pub const FIELD_CONTENT_CHUNK_METHOD: MetaField = field(
    "user.grid.content.chunk_method",
    "x-oio-chunk-meta-content-chunk-method",
);
pub const FIELD_CONTENT_STORAGE_POLICY: MetaField = field(
    "user.grid.content.storage_policy",
    "x-oio-chunk-meta-content-storage-policy",
);

impl ChunkMeta {
    pub fn new(chunk_id: impl Into<String>) -> Self {
        ChunkMeta {
            chunk_id: chunk_id.into(),
            ..Default::default()
        }
    }

    pub fn text_fields(&self) -> [(MetaField, &Option<String>); 7] {
        [
            (FIELD_CHUNK_POS, &self.chunk_pos),
            (FIELD_CONTAINER_ID, &self.container_id),
            (FIELD_CONTENT_ID, &self.content_id),
            (FIELD_CONTENT_PATH, &self.content_path),
            (FIELD_CONTENT_VERSION, &self.content_version),
            (FIELD_CONTENT_CHUNK_METHOD, &self.content_chunk_method),
            (FIELD_CONTENT_STORAGE_POLICY, &self.content_storage_policy),
        ]
    }

    pub fn text_fields_mut(&mut self) -> [(MetaField, &mut Option<String>); 7] {
        [
            (FIELD_CHUNK_POS, &mut self.chunk_pos),
            (FIELD_CONTAINER_ID, &mut self.container_id),
            (FIELD_CONTENT_ID, &mut self.content_id),
            (FIELD_CONTENT_PATH, &mut self.content_path),
            (FIELD_CONTENT_VERSION, &mut self.content_version),
            (FIELD_CONTENT_CHUNK_METHOD, &mut self.content_chunk_method),
            (FIELD_CONTENT_STORAGE_POLICY, &mut self.content_storage_policy),
        ]
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    fn to_attrs(&self) -> Vec<(&'static str, String)> {
        let mut attrs = vec![(ATTR_CHUNK_ID, self.chunk_id.clone())];
        if let Some(size) = self.chunk_size {
            attrs.push((ATTR_CHUNK_SIZE, size.to_string()));
        }
        if let Some(hash) = &self.chunk_hash {
            attrs.push((ATTR_CHUNK_HASH, hash.clone()));
        }
        if let Some(algo) = self.chunk_hash_algo {
            attrs.push((ATTR_CHUNK_HASH_ALGO, algo.to_string()));
        }
        if let Some(compression) = &self.compression {
            attrs.push((ATTR_COMPRESSION, compression.clone()));
        }
        for (field, value) in self.text_fields() {
            if let Some(value) = value {
                attrs.push((field.attr, value.clone()));
            }
        }
        attrs
    }

    fn from_attrs<F>(id: &str, mut get: F) -> Result<Self, StorageError>
    where
        F: FnMut(&str) -> io::Result<Option<String>>,
    {
        let corrupt = |reason: String| StorageError::CorruptMetadata {
            id: id.to_string(),
            reason,
        };
        let mut meta = ChunkMeta::new(get(ATTR_CHUNK_ID)?.unwrap_or_else(|| id.to_string()));
        meta.chunk_size = get(ATTR_CHUNK_SIZE)?
            .map(|raw| raw.parse::<u64>().map_err(|_| corrupt(format!("size `{raw}`"))))
            .transpose()?;
        meta.chunk_hash = get(ATTR_CHUNK_HASH)?;
        meta.chunk_hash_algo = get(ATTR_CHUNK_HASH_ALGO)?
            .map(|raw| raw.parse::<ChecksumAlgo>().map_err(corrupt))
            .transpose()?;
        meta.compression = get(ATTR_COMPRESSION)?;
        for (field, value) in meta.text_fields_mut() {
            *value = get(field.attr)?;
        }
        Ok(meta)
    }
}

/// A byte range as a client may ask for it, before the chunk size is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `start-end`, both inclusive.
    FromTo(u64, u64),
    /// `start-`
    From(u64),
    /// `-length`, the last `length` bytes.
    Suffix(u64),
}

impl RangeSpec {
    /// Resolves against a chunk of `size` bytes into an inclusive range.
    pub fn resolve(self, size: u64) -> Result<(u64, u64), StorageError> {
        match self {
            RangeSpec::FromTo(start, end) if start < size && start <= end => {
                Ok((start, end.min(size - 1)))
            }
            RangeSpec::From(start) if start < size => Ok((start, size - 1)),
            RangeSpec::Suffix(len) if len > 0 && size > 0 => Ok((size - len.min(size), size - 1)),
            _ => Err(StorageError::RangeNotSatisfiable { size }),
        }
    }
}

/// The result of a read: metadata, the served range, and the payload.
pub struct ChunkRead {
    pub meta: ChunkMeta,
    /// Logical size of the whole chunk.
    pub size: u64,
    /// Inclusive range served, `None` for the whole chunk.
    pub range: Option<(u64, u64)>,
    pub reader: ChunkReader,
}

impl ChunkRead {
    /// Number of bytes `reader` yields.
    pub fn len(&self) -> u64 {
        match self.range {
            Some((start, end)) => end - start + 1,
            None => self.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chunk-level operations: metadata, checksums and compression on top of
/// the file layer, and ownership of the storage root.
#[derive(Debug)]
pub struct ChunkRepository {
    files: FileRepository,
    lock: BasedirLock,
    compress: bool,
    checksum: ChecksumAlgo,
}

impl ChunkRepository {
    pub fn new(files: FileRepository, compress: bool, checksum: ChecksumAlgo) -> Self {
        let lock = BasedirLock::new(files.root(), files.attrs().clone());
        ChunkRepository {
            files,
            lock,
            compress,
            checksum,
        }
    }

    pub fn files(&self) -> &FileRepository {
        &self.files
    }

    pub fn basedir_lock(&self) -> &BasedirLock {
        &self.lock
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn checksum(&self) -> ChecksumAlgo {
        self.checksum
    }

    /// Takes ownership of the storage root for (namespace, address).
    pub async fn lock(&self, namespace: &str, address: &str) -> Result<(), StorageError> {
        self.lock.acquire(namespace, address).await
    }

    /// Refuses to run a populated root under another shard layout.
    pub async fn check_layout(&self) -> Result<(), StorageError> {
        let populated = !self.files.is_empty().await?;
        let resolver = self.files.resolver();
        self.lock
            .check_layout(resolver.width(), resolver.depth(), populated)
            .await
    }

    /// Stores a new chunk named `declared.chunk_id`.
    ///
    /// The checksum is computed over the uncompressed payload. When
    /// `declared` carries a digest or a size that the payload does not match,
    /// the write is discarded and nothing is published.
    pub async fn put<R>(&self, declared: ChunkMeta, payload: R) -> Result<ChunkMeta, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let id = declared.chunk_id.clone();
        let algo = declared.chunk_hash_algo.unwrap_or(self.checksum);
        let mut pending = self.files.begin(&id, declared.chunk_size).await?;

        let mut hasher = ChunkHasher::new(algo);
        let mut size = 0u64;
        {
            let mut inspected = InspectReader::new(payload, |data: &[u8]| {
                hasher.update(data);
                size += data.len() as u64;
            });
            if self.compress {
                let mut encoder = ZlibEncoder::new(BufReader::new(inspected));
                pending.write_from(&mut encoder).await?;
            } else {
                pending.write_from(&mut inspected).await?;
            }
        }
        let digest = hasher.finalize();

        let rejection = match (&declared.chunk_hash, declared.chunk_size) {
            (Some(expected), _) if !expected.eq_ignore_ascii_case(&digest) => {
                Some(StorageError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: digest.clone(),
                })
            }
            (_, Some(declared_size)) if declared_size != size => Some(StorageError::SizeMismatch {
                declared: declared_size,
                actual: size,
            }),
            _ => None,
        };
        if let Some(err) = rejection {
            if let Err(e) = pending.abort().await {
                tracing::warn!("failed to discard rejected chunk {id}: {e}");
            }
            return Err(err);
        }

        let mut meta = declared;
        meta.chunk_size = Some(size);
        meta.chunk_hash = Some(digest);
        meta.chunk_hash_algo = Some(algo);
        meta.compression = self.compress.then(|| ZLIB.to_string());

        pending.set_attrs(meta.to_attrs()).await?;
        pending.commit().await?;
        tracing::debug!("stored chunk {id} ({size} bytes, {algo} {:?})", meta.chunk_hash);
        Ok(meta)
    }

    /// Reads a chunk, or the logical byte range `range` of it.
    pub async fn get(&self, id: &str, range: Option<RangeSpec>) -> Result<ChunkRead, StorageError> {
        let (file, disk_size) = self.files.open(id).await?;
        let meta = self.load_meta(id).await?;
        let size = logical_size(&meta, disk_size)?;
        let range = range.map(|spec| spec.resolve(size)).transpose()?;

        let reader: ChunkReader = match meta.compression.as_deref() {
            None => Box::pin(seek_range(file, disk_size, range).await?),
            Some(ZLIB) => {
                let mut decoder = ZlibDecoder::new(BufReader::new(file));
                match range {
                    None => Box::pin(decoder),
                    Some((start, end)) => {
                        let skipped =
                            tokio::io::copy(&mut (&mut decoder).take(start), &mut tokio::io::sink())
                                .await?;
                        if skipped != start {
                            return Err(StorageError::CorruptMetadata {
                                id: id.to_string(),
                                reason: format!("payload shorter than its declared {size} bytes"),
                            });
                        }
                        Box::pin(decoder.take(end - start + 1))
                    }
                }
            }
            Some(other) => {
                return Err(StorageError::CorruptMetadata {
                    id: id.to_string(),
                    reason: format!("unsupported compression `{other}`"),
                });
            }
        };

        Ok(ChunkRead {
            meta,
            size,
            range,
            reader,
        })
    }

    /// Metadata of a chunk, without its payload.
    pub async fn head(&self, id: &str) -> Result<ChunkMeta, StorageError> {
        let disk_size = self.files.stat(id).await?;
        let mut meta = self.load_meta(id).await?;
        meta.chunk_size = Some(logical_size(&meta, disk_size)?);
        Ok(meta)
    }

    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.files.delete(id).await
    }

    async fn load_meta(&self, id: &str) -> Result<ChunkMeta, StorageError> {
        let path = self.files.resolver().resolve(id);
        let attrs = self.files.attrs().clone();
        let owned_id = id.to_string();
        spawn_blocking(move || ChunkMeta::from_attrs(&owned_id, |key| attrs.get(&path, key)))
            .await
            .map_err(io::Error::other)?
            .map_err(|e| match e {
                StorageError::Io(e) => StorageError::from_io(id, e),
                other => other,
            })
    }
}

fn logical_size(meta: &ChunkMeta, disk_size: u64) -> Result<u64, StorageError> {
    match (meta.chunk_size, meta.is_compressed()) {
        (Some(size), _) => Ok(size),
        (None, false) => Ok(disk_size),
        (None, true) => Err(StorageError::CorruptMetadata {
            id: meta.chunk_id.clone(),
            reason: "compressed chunk without a recorded size".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::attrs::SidecarStore;
    use crate::storage::driver::filesystem::SyncOptions;
    use crate::storage::paths::ShardResolver;
    use std::path::Path;
    use std::sync::Arc;

    const ID: &str = "3F1C0FFEE0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF012345";

    fn repository(root: &Path, compress: bool) -> ChunkRepository {
        let files = FileRepository::new(
            ShardResolver::new(root, 3, 1),
            Arc::new(SidecarStore),
            SyncOptions::default(),
        );
        ChunkRepository::new(files, compress, ChecksumAlgo::Md5)
    }

    async fn read_all(read: ChunkRead) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = read.reader;
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    fn payload() -> Vec<u8> {
        (0..100_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_plain_and_compressed() {
        for compress in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let repo = repository(dir.path(), compress);
            let data = payload();

            let mut declared = ChunkMeta::new(ID);
            declared.content_path = Some("a/b.txt".into());
            declared.chunk_pos = Some("0".into());
            let stored = repo.put(declared, &data[..]).await.unwrap();
            assert_eq!(stored.chunk_size, Some(data.len() as u64));
            assert_eq!(
                stored.chunk_hash.as_deref(),
                Some(hex::encode_upper(md5::compute(&data).0).as_str())
            );
            assert_eq!(stored.is_compressed(), compress);

            let read = repo.get(ID, None).await.unwrap();
            assert_eq!(read.meta, stored);
            assert_eq!(read.len(), data.len() as u64);
            assert_eq!(read_all(read).await, data);
            assert_eq!(repo.head(ID).await.unwrap(), stored);

            let disk = std::fs::metadata(dir.path().join("3F1").join(ID)).unwrap().len();
            if compress {
                assert!(disk < data.len() as u64);
            } else {
                assert_eq!(disk, data.len() as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_chunk() {
        for compress in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let repo = repository(dir.path(), compress);
            let stored = repo.put(ChunkMeta::new(ID), &b""[..]).await.unwrap();
            assert_eq!(stored.chunk_size, Some(0));
            assert_eq!(read_all(repo.get(ID, None).await.unwrap()).await, b"");
        }
    }

    #[tokio::test]
    async fn test_ranges_apply_to_logical_bytes() {
        for compress in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let repo = repository(dir.path(), compress);
            let data = payload();
            repo.put(ChunkMeta::new(ID), &data[..]).await.unwrap();

            let read = repo.get(ID, Some(RangeSpec::FromTo(1000, 1999))).await.unwrap();
            assert_eq!(read.range, Some((1000, 1999)));
            assert_eq!(read_all(read).await, &data[1000..2000]);

            let read = repo.get(ID, Some(RangeSpec::Suffix(10))).await.unwrap();
            assert_eq!(read_all(read).await, &data[data.len() - 10..]);

            let read = repo.get(ID, Some(RangeSpec::From(5))).await.unwrap();
            assert_eq!(read_all(read).await, &data[5..]);

            let past_end = data.len() as u64;
            assert!(matches!(
                repo.get(ID, Some(RangeSpec::From(past_end))).await,
                Err(StorageError::RangeNotSatisfiable { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(dir.path(), false);
        let mut declared = ChunkMeta::new(ID);
        declared.chunk_hash = Some("00000000000000000000000000000000".into());

        let err = repo.put(declared, &b"some bytes"[..]).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(matches!(repo.head(ID).await, Err(StorageError::NotFound(_))));
        let shard = dir.path().join("3F1");
        assert_eq!(std::fs::read_dir(shard).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_declared_checksum_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(dir.path(), false);
        let mut declared = ChunkMeta::new(ID);
        declared.chunk_hash = Some(format!("{:x}", md5::compute(b"abc")));
        declared.chunk_size = Some(3);
        repo.put(declared, &b"abc"[..]).await.unwrap();
    }

    #[tokio::test]
    async fn test_sha256_and_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(dir.path(), false);

        let mut declared = ChunkMeta::new(ID);
        declared.chunk_size = Some(4);
        assert!(matches!(
            repo.put(declared, &b"abc"[..]).await,
            Err(StorageError::SizeMismatch { declared: 4, actual: 3 })
        ));

        let mut declared = ChunkMeta::new(ID);
        declared.chunk_hash_algo = Some(ChecksumAlgo::Sha256);
        let stored = repo.put(declared, &b"abc"[..]).await.unwrap();
        assert_eq!(
            stored.chunk_hash.as_deref(),
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD")
        );
    }

    #[tokio::test]
    async fn test_delete_is_final() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repository(dir.path(), false);
        repo.put(ChunkMeta::new(ID), &b"x"[..]).await.unwrap();
        assert_eq!(repo.files().list().await.unwrap(), vec![ID.to_string()]);

        repo.delete(ID).await.unwrap();
        for _ in 0..3 {
            assert!(matches!(repo.delete(ID).await, Err(StorageError::NotFound(_))));
        }
        assert!(matches!(repo.head(ID).await, Err(StorageError::NotFound(_))));
        assert!(matches!(repo.get(ID, None).await, Err(StorageError::NotFound(_))));
        // the identifier can be written again
        repo.put(ChunkMeta::new(ID), &b"y"[..]).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_puts_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(repository(dir.path(), false));

        let handles: Vec<_> = (0..6u8)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    let body = vec![i; 256 * 1024];
                    (i, repo.put(ChunkMeta::new(ID), &body[..]).await)
                })
            })
            .collect();

        let mut winner = None;
        for handle in handles {
            let (i, result) = handle.await.unwrap();
            match result {
                Ok(_) => {
                    assert!(winner.is_none());
                    winner = Some(i);
                }
                Err(StorageError::AlreadyExists(_)) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        let winner = winner.expect("one put must succeed");
        let stored = read_all(repo.get(ID, None).await.unwrap()).await;
        assert_eq!(stored, vec![winner; 256 * 1024]);
    }

    #[test]
    fn test_range_resolution() {
        assert_eq!(RangeSpec::FromTo(0, 99).resolve(10).unwrap(), (0, 9));
        assert_eq!(RangeSpec::Suffix(100).resolve(10).unwrap(), (0, 9));
        assert!(RangeSpec::FromTo(5, 4).resolve(10).is_err());
        assert!(RangeSpec::Suffix(0).resolve(10).is_err());
        assert!(RangeSpec::From(0).resolve(0).is_err());
    }
}
