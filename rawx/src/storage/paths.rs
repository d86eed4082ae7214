// ShardResolver maps chunk identifiers to their location under the storage root.
//
// The path layout of a storage root is roughly as follows (width=3, depth=1):
//
//	<root>
//	├── .rawx.attr                 (only with the sidecar attribute backend)
//	├── 0A1
//	│   ├── 0A1B2C...              (chunk file, metadata in xattrs)
//	│   └── 0A1B2C....<uuid>.pending
//	└── FFE
//	    └── FFE012...
//
// Every directory level consumes `width` characters from the front of the
// identifier, `depth` levels deep, and the chunk file is named by the full
// identifier. Nothing else is needed to find a chunk: there is no index.
//
// Changing width or depth on a populated root makes every stored chunk
// unreachable, which is why the lock module records the layout at startup.

use std::path::{Path, PathBuf};

/// Default number of identifier characters per shard directory.
pub const DEFAULT_HASH_WIDTH: usize = 3;
/// Default number of shard directory levels.
pub const DEFAULT_HASH_DEPTH: usize = 1;

/// Suffix of in-flight temporary files living next to their final path.
pub const PENDING_SUFFIX: &str = ".pending";

#[derive(Clone, Debug)]
pub struct ShardResolver {
    root: PathBuf,
    width: usize,
    depth: usize,
}

impl ShardResolver {
    pub fn new(root: impl Into<PathBuf>, width: usize, depth: usize) -> Self {
        ShardResolver {
            root: root.into(),
            width,
            depth,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the directory holding a chunk,
    /// (e.g. `<root>/01` for `0123...` with width=2, depth=1).
    ///
    /// Identifiers shorter than `width * depth` (or not plain ASCII) are not
    /// sharded and live directly under the root.
    pub fn shard_dir(&self, id: &str) -> PathBuf {
        let mut dir = self.root.clone();
        if id.len() < self.width * self.depth || !id.is_ascii() {
            return dir;
        }
        for level in 0..self.depth {
            let start = level * self.width;
            dir.push(&id[start..start + self.width]);
        }
        dir
    }

    /// Returns the path of a single chunk file,
    /// (e.g. `<root>/01/0123456789abcdef`).
    pub fn resolve(&self, id: &str) -> PathBuf {
        self.shard_dir(id).join(id)
    }

    /// Returns a fresh temporary path next to the final path of `id`,
    /// (e.g. `<root>/01/0123....<uuid>.pending`).
    pub fn pending_path(&self, id: &str) -> PathBuf {
        let name = format!("{id}.{}{PENDING_SUFFIX}", uuid::Uuid::new_v4().simple());
        self.shard_dir(id).join(name)
    }

    /// Whether a file name found in a shard directory is a temporary file.
    pub fn is_pending_name(name: &str) -> bool {
        name.ends_with(PENDING_SUFFIX)
    }
}

/// Free-standing form of [`ShardResolver::resolve`].
pub fn resolve(root: &Path, id: &str, width: usize, depth: usize) -> PathBuf {
    ShardResolver::new(root, width, depth).resolve(id)
}
