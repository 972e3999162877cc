//! Locating and unpacking versioned signal code.
//!
//! A signal version is published as a tar archive at
//! `{archive_dir}/{namespace}/{name}/{branch_or_tag}.tar`. Archives are
//! unpacked into `{cache_dir}/{name}-{sha256}`, so a version that was already
//! unpacked is reused and a republished tag lands in a fresh directory.
//!
//! Every unpacked version carries a `signal.toml` manifest naming the
//! program to run.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use poolscale_core::SignalIdentity;

use crate::error::{SignalError, SignalResult};

pub const MANIFEST_FILE: &str = "signal.toml";

/// Resolves a signal identity to a directory holding its unpacked code.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch(&self, identity: &SignalIdentity) -> SignalResult<PathBuf>;
}

/// Describes how to start a signal worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalManifest {
    /// Program to execute, relative to the signal directory unless absolute.
    pub entrypoint: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SignalManifest {
    pub fn load(identity: &SignalIdentity, dir: &Path) -> SignalResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| load_error(identity, format!("read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| load_error(identity, format!("parse {}: {e}", path.display())))
    }

    pub fn program(&self, dir: &Path) -> PathBuf {
        let entry = Path::new(&self.entrypoint);
        if entry.is_absolute() {
            entry.to_path_buf()
        } else {
            dir.join(entry)
        }
    }
}

fn load_error(identity: &SignalIdentity, reason: String) -> SignalError {
    SignalError::Load {
        signal: identity.clone(),
        reason,
    }
}

// ── Tar archives ──────────────────────────────────────────────────

/// Fetches signal archives from a local (or mounted) publish directory.
#[derive(Debug, Clone)]
pub struct LocalArchiveFetcher {
    archive_dir: PathBuf,
    cache_dir: PathBuf,
}

impl LocalArchiveFetcher {
    pub fn new(archive_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn archive_path(&self, identity: &SignalIdentity) -> PathBuf {
        self.archive_dir
            .join(&identity.namespace)
            .join(&identity.name)
            .join(format!("{}.tar", identity.branch_or_tag))
    }
}

impl ArchiveFetcher for LocalArchiveFetcher {
    fn fetch(&self, identity: &SignalIdentity) -> SignalResult<PathBuf> {
        let archive = self.archive_path(identity);
        let bytes = std::fs::read(&archive)
            .map_err(|e| load_error(identity, format!("read {}: {e}", archive.display())))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let target = self.cache_dir.join(format!("{}-{}", identity.name, digest));

        if target.join(MANIFEST_FILE).is_file() {
            debug!(signal = %identity, path = %target.display(), "signal already unpacked");
            return Ok(target);
        }

        std::fs::create_dir_all(&self.cache_dir).map_err(|e| {
            load_error(identity, format!("create {}: {e}", self.cache_dir.display()))
        })?;
        let staging = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(&self.cache_dir)
            .map_err(|e| load_error(identity, format!("create staging dir: {e}")))?;
        tar::Archive::new(Cursor::new(&bytes))
            .unpack(staging.path())
            .map_err(|e| load_error(identity, format!("unpack {}: {e}", archive.display())))?;
        if !staging.path().join(MANIFEST_FILE).is_file() {
            return Err(load_error(
                identity,
                format!("{} has no {MANIFEST_FILE}", archive.display()),
            ));
        }

        // Another loader may have won the race for the same digest.
        if let Err(e) = std::fs::rename(staging.path(), &target)
            && !target.join(MANIFEST_FILE).is_file()
        {
            return Err(load_error(
                identity,
                format!("install {}: {e}", target.display()),
            ));
        }

        info!(signal = %identity, sha256 = %digest, path = %target.display(), "signal unpacked");
        Ok(target)
    }
}

// ── Plain directories ─────────────────────────────────────────────

/// Serves already-unpacked signals from `{root}/{namespace}/{name}/{branch_or_tag}`.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArchiveFetcher for DirectoryFetcher {
    fn fetch(&self, identity: &SignalIdentity) -> SignalResult<PathBuf> {
        let dir = self
            .root
            .join(&identity.namespace)
            .join(&identity.name)
            .join(&identity.branch_or_tag);
        if dir.join(MANIFEST_FILE).is_file() {
            Ok(dir)
        } else {
            Err(load_error(
                identity,
                format!("no {MANIFEST_FILE} under {}", dir.display()),
            ))
        }
    }
}
