//! Key/value metadata attached to files and directories.
//!
//! Chunk metadata and the basedir lock record both live "on" a filesystem
//! object rather than in a file of their own. [`AttrStore`] is the seam:
//! [`XattrStore`] keeps attributes as extended attributes, [`SidecarStore`]
//! keeps them in a JSON descriptor next to the object for filesystems
//! without xattr support.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::storage::sys;

/// Suffix of sidecar descriptors for regular files.
pub const SIDECAR_SUFFIX: &str = ".attr";
/// Name of the sidecar descriptor of a directory, stored inside it.
pub const DIR_SIDECAR_NAME: &str = ".rawx.attr";
/// Suffix of a descriptor being rewritten.
pub const STAGING_SUFFIX: &str = ".tmp";

const PROBE_KEY: &str = "user.rawx_server.probe";

pub trait AttrStore: Send + Sync + Debug {
    fn get(&self, path: &Path, key: &str) -> io::Result<Option<String>>;

    fn set(&self, path: &Path, key: &str, value: &str) -> io::Result<()>;

    /// Sets `key` only if it is absent, failing with `AlreadyExists`
    /// otherwise.
    fn create(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        if self.get(path, key)?.is_some() {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        self.set(path, key, value)
    }

    fn remove(&self, path: &Path, key: &str) -> io::Result<()>;

    fn set_all(&self, path: &Path, attrs: &[(&str, String)]) -> io::Result<()> {
        for (key, value) in attrs {
            self.set(path, key, value)?;
        }
        Ok(())
    }

    /// Renames the object at `from` to `to` along with its attributes,
    /// failing with `AlreadyExists` instead of replacing `to`.
    fn publish(&self, from: &Path, to: &Path) -> io::Result<()> {
        sys::rename_noreplace(from, to)
    }

    /// Called after the object at `path` was deleted.
    fn dropped(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct XattrStore;

impl AttrStore for XattrStore {
    fn get(&self, path: &Path, key: &str) -> io::Result<Option<String>> {
        sys::get_xattr(path, key)?
            .map(|raw| {
                String::from_utf8(raw).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("attribute {key} is not utf-8"))
                })
            })
            .transpose()
    }

    fn set(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        sys::set_xattr(path, key, value.as_bytes())
    }

    fn create(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        sys::create_xattr(path, key, value.as_bytes())
    }

    fn remove(&self, path: &Path, key: &str) -> io::Result<()> {
        sys::remove_xattr(path, key)
    }

    fn name(&self) -> &'static str {
        "xattr"
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Descriptor {
    attrs: BTreeMap<String, String>,
}

/// Attributes in a JSON file: `<file>.attr` for files, `<dir>/.rawx.attr`
/// for directories.
///
/// Every read-modify-write of a descriptor holds an exclusive `flock` on
/// the object it describes. On publication the descriptor moves first: a
/// crash halfway leaves an orphan descriptor, which `purge_pending` sweeps,
/// and never a visible chunk without metadata.
#[derive(Debug, Default)]
pub struct SidecarStore;

impl SidecarStore {
    pub fn sidecar_path(path: &Path) -> PathBuf {
        if path.is_dir() {
            return path.join(DIR_SIDECAR_NAME);
        }
        let mut name = path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    fn load(path: &Path) -> io::Result<Descriptor> {
        match std::fs::read(Self::sidecar_path(path)) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Descriptor::default()),
            Err(e) => Err(e),
        }
    }

    fn store(path: &Path, descriptor: &Descriptor) -> io::Result<()> {
        let target = Self::sidecar_path(path);
        let mut staging = target.as_os_str().to_os_string();
        staging.push(STAGING_SUFFIX);
        let raw = serde_json::to_vec(descriptor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&staging, raw)?;
        std::fs::rename(&staging, &target)
    }

    /// Runs `op` under an exclusive `flock` of the object at `path`.
    fn locked<T>(path: &Path, op: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        let object = std::fs::File::open(path)?;
        let _guard = Flock::lock(object, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        op()
    }
}

impl AttrStore for SidecarStore {
    fn get(&self, path: &Path, key: &str) -> io::Result<Option<String>> {
        Ok(Self::load(path)?.attrs.remove(key))
    }

    fn set(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        Self::locked(path, || {
            let mut descriptor = Self::load(path)?;
            descriptor.attrs.insert(key.to_string(), value.to_string());
            Self::store(path, &descriptor)
        })
    }

    fn create(&self, path: &Path, key: &str, value: &str) -> io::Result<()> {
        Self::locked(path, || {
            let mut descriptor = Self::load(path)?;
            if descriptor.attrs.contains_key(key) {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            descriptor.attrs.insert(key.to_string(), value.to_string());
            Self::store(path, &descriptor)
        })
    }

    fn remove(&self, path: &Path, key: &str) -> io::Result<()> {
        Self::locked(path, || {
            let mut descriptor = Self::load(path)?;
            if descriptor.attrs.remove(key).is_some() {
                Self::store(path, &descriptor)?;
            }
            Ok(())
        })
    }

    fn set_all(&self, path: &Path, attrs: &[(&str, String)]) -> io::Result<()> {
        Self::locked(path, || {
            let mut descriptor = Self::load(path)?;
            for (key, value) in attrs {
                descriptor.attrs.insert(key.to_string(), value.clone());
            }
            Self::store(path, &descriptor)
        })
    }

    fn publish(&self, from: &Path, to: &Path) -> io::Result<()> {
        let staged = Self::sidecar_path(from);
        let published = Self::sidecar_path(to);
        let carried = match sys::rename_noreplace(&staged, &published) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // a descriptor in place belongs to someone else
                if published.exists() {
                    return Err(io::Error::from(io::ErrorKind::AlreadyExists));
                }
                false
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = sys::rename_noreplace(from, to) {
            if carried {
                if let Err(undo) = std::fs::rename(&published, &staged) {
                    tracing::warn!("left orphan descriptor {}: {undo}", published.display());
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn dropped(&self, path: &Path) -> io::Result<()> {
        let mut sidecar = path.as_os_str().to_os_string();
        sidecar.push(SIDECAR_SUFFIX);
        match std::fs::remove_file(sidecar) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "sidecar"
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttrBackend {
    #[default]
    Auto,
    Xattr,
    Sidecar,
}

impl std::str::FromStr for AttrBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AttrBackend::Auto),
            "xattr" => Ok(AttrBackend::Xattr),
            "sidecar" => Ok(AttrBackend::Sidecar),
            other => Err(format!("unknown attribute backend `{other}`")),
        }
    }
}

/// Builds the attribute store for `root`. `Auto` probes the root with a
/// throwaway extended attribute and falls back to sidecar files.
pub fn open_store(root: &Path, backend: AttrBackend) -> io::Result<Arc<dyn AttrStore>> {
    match backend {
        AttrBackend::Xattr => Ok(Arc::new(XattrStore)),
        AttrBackend::Sidecar => Ok(Arc::new(SidecarStore)),
        AttrBackend::Auto => {
            if xattr_supported(root)? {
                Ok(Arc::new(XattrStore))
            } else {
                tracing::warn!(
                    "extended attributes unsupported under {}, using sidecar descriptors",
                    root.display()
                );
                Ok(Arc::new(SidecarStore))
            }
        }
    }
}

fn xattr_supported(root: &Path) -> io::Result<bool> {
    match sys::set_xattr(root, PROBE_KEY, b"1") {
        Ok(()) => {
            sys::remove_xattr(root, PROBE_KEY)?;
            Ok(true)
        }
        Err(e) if sys::is_unsupported(&e) => Ok(false),
        Err(e) => Err(e),
    }
}
