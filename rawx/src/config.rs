use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::storage::ChecksumAlgo;
use crate::storage::attrs::AttrBackend;
use crate::storage::paths::{DEFAULT_HASH_DEPTH, DEFAULT_HASH_WIDTH};
use crate::utils::validation::{check_addr, namespace_regex};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Syntax {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Historical key names accepted next to the canonical ones.
const ALIASES: &[(&str, &str)] = &[
    ("grid_namespace", "ns"),
    ("grid_service_id", "id"),
    ("listen", "addr"),
    ("grid_docroot", "basedir"),
    ("grid_hash_width", "hash_width"),
    ("grid_hash_depth", "hash_depth"),
    ("grid_fsync", "fsync_file"),
    ("grid_fsync_dir", "fsync_dir"),
    ("grid_fallocate", "fallocate"),
    ("grid_compression", "compress"),
];

const KNOWN_KEYS: &[&str] = &[
    "ns",
    "id",
    "addr",
    "basedir",
    "hash_width",
    "hash_depth",
    "fsync_file",
    "fsync_dir",
    "fallocate",
    "compress",
    "checksum",
    "attr_backend",
    "ns_pattern",
];

/// Raw `key value` pairs of a configuration file, keys canonicalized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    values: BTreeMap<String, String>,
}

impl Options {
    pub fn parse(path: &str, text: &str) -> Result<Self, ConfigError> {
        let mut values = BTreeMap::new();
        for (index, raw) in text.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((content, _)) => content,
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(|c: char| c == '=' || c.is_whitespace())
                .map(|(key, value)| (key.trim(), value.trim().trim_start_matches('=').trim()))
                .ok_or_else(|| ConfigError::Syntax {
                    path: path.to_string(),
                    line: index + 1,
                    reason: format!("`{line}` has no value"),
                })?;
            let key = canonical_key(key);
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!("{path}:{}: ignoring unknown option `{key}`", index + 1);
                continue;
            }
            values.insert(key, unquote(value).to_string());
        }
        Ok(Options { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str, default: usize) -> Result<usize, String> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| format!("`{key}` must be an integer, got `{raw}`")),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| format!("`{key}` must be a boolean, got `{raw}`")),
        }
    }
}

fn canonical_key(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(key)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "enabled" | "enable" | "1" => Some(true),
        "false" | "no" | "off" | "disabled" | "disable" | "0" => Some(false),
        _ => None,
    }
}

/// Service configuration, immutable once loaded.
#[derive(Clone, Debug)]
pub struct RawxConfig {
    pub namespace: String,
    pub id: String,
    pub addr: String,
    pub basedir: PathBuf,
    pub hash_width: usize,
    pub hash_depth: usize,
    pub fsync_file: bool,
    pub fsync_dir: bool,
    pub fallocate: bool,
    pub compress: bool,
    pub checksum: ChecksumAlgo,
    pub attr_backend: AttrBackend,
}

impl RawxConfig {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        Self::from_options(&Options::parse(&display, &text)?)
    }

    /// Builds the configuration, reporting every problem at once.
    pub fn from_options(options: &Options) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let namespace = options.get("ns").unwrap_or_default().to_string();
        match namespace_regex(options.get("ns_pattern")) {
            Ok(re) if re.is_match(&namespace) => {}
            Ok(_) => errors.push(format!("`{namespace}` is not a valid namespace name")),
            Err(e) => errors.push(format!("`ns_pattern` is not a valid pattern: {e}")),
        }

        let addr = options.get("addr").unwrap_or_default().to_string();
        if let Err(e) = check_addr(&addr) {
            errors.push(format!("`addr`: {e}"));
        }
        let id = options
            .get("id")
            .filter(|id| !id.is_empty())
            .unwrap_or(addr.as_str())
            .to_string();

        let basedir = PathBuf::from(options.get("basedir").unwrap_or_default());
        if !basedir.is_absolute() {
            errors.push(format!(
                "`basedir` must be an absolute path, got `{}`",
                basedir.display()
            ));
        } else if !basedir.is_dir() {
            errors.push(format!(
                "`basedir` `{}` does not exist or is not a directory",
                basedir.display()
            ));
        }

        let hash_width = or_report(&mut errors, options.get_int("hash_width", DEFAULT_HASH_WIDTH), 0);
        let hash_depth = or_report(&mut errors, options.get_int("hash_depth", DEFAULT_HASH_DEPTH), 0);
        let fsync_file = or_report(&mut errors, options.get_bool("fsync_file", false), false);
        let fsync_dir = or_report(&mut errors, options.get_bool("fsync_dir", true), true);
        let fallocate = or_report(&mut errors, options.get_bool("fallocate", true), true);
        let compress = or_report(&mut errors, parse_compress(options.get("compress")), false);
        let checksum = or_report(
            &mut errors,
            options.get("checksum").map_or(Ok(ChecksumAlgo::default()), str::parse::<ChecksumAlgo>),
            ChecksumAlgo::default(),
        );
        let attr_backend = or_report(
            &mut errors,
            options.get("attr_backend").map_or(Ok(AttrBackend::default()), str::parse::<AttrBackend>),
            AttrBackend::default(),
        );

        for key in ["hash_width", "hash_depth"] {
            if options.get_int(key, 1) == Ok(0) {
                errors.push(format!("`{key}` must be positive"));
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(RawxConfig {
            namespace,
            id,
            addr,
            basedir,
            hash_width,
            hash_depth,
            fsync_file,
            fsync_dir,
            fallocate,
            compress,
            checksum,
            attr_backend,
        })
    }
}

fn or_report<T>(errors: &mut Vec<String>, result: Result<T, String>, fallback: T) -> T {
    result.unwrap_or_else(|e| {
        errors.push(e);
        fallback
    })
}

/// `compress` takes a boolean or the name of the codec.
fn parse_compress(raw: Option<&str>) -> Result<bool, String> {
    match raw {
        None => Ok(false),
        Some(raw) if raw.eq_ignore_ascii_case("zlib") => Ok(true),
        Some(raw) => parse_bool(raw)
            .ok_or_else(|| format!("`compress` must be a boolean or `zlib`, got `{raw}`")),
    }
}
