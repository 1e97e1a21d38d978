//! ZFS dataset management for release images and jail roots
//!
//! Layout under `<pool>/<base>`:
//! - `releases/<release>` with a `@base` snapshot taken after extraction
//! - `jails/<name>` cloned from that snapshot for each one-shot jail

use crate::error::{Error, Result};
use std::path::Path;
use std::process::Command;

/// Snapshot every jail root is cloned from
pub const BASE_SNAPSHOT: &str = "base";

/// ZFS dataset manager
#[derive(Debug, Clone)]
pub struct ZfsManager {
    /// Base dataset name (e.g., "zroot/skiff")
    base_dataset: String,
}

impl ZfsManager {
    /// Create a new ZFS manager
    pub fn new(pool: &str, base: &str) -> Self {
        Self {
            base_dataset: format!("{}/{}", pool, base),
        }
    }

    fn release_dataset(&self, release: &str) -> String {
        format!("{}/releases/{}", self.base_dataset, release)
    }

    fn release_snapshot(&self, release: &str) -> String {
        format!("{}@{}", self.release_dataset(release), BASE_SNAPSHOT)
    }

    /// Dataset name holding a jail's root
    pub fn jail_dataset(&self, name: &str) -> String {
        format!("{}/jails/{}", self.base_dataset, name)
    }

    /// Check if a dataset or snapshot exists
    pub fn dataset_exists(&self, dataset: &str) -> Result<bool> {
        let output = Command::new("zfs")
            .args(["list", "-H", "-t", "all", "-o", "name", dataset])
            .output()
            .map_err(|e| Error::Zfs(format!("Failed to run zfs list: {}", e)))?;

        Ok(output.status.success())
    }

    /// Create the dataset a release is extracted into, mounted at `mountpoint`
    pub fn create_release_dataset(&self, release: &str, mountpoint: &Path) -> Result<()> {
        let dataset = self.release_dataset(release);
        if self.dataset_exists(&dataset)? {
            return Ok(());
        }

        let mountpoint = format!("mountpoint={}", mountpoint.display());
        zfs(&["create", "-p", "-o", "compression=lz4", "-o", &mountpoint, &dataset])
    }

    /// Take the `@base` snapshot of an extracted release
    pub fn snapshot_release(&self, release: &str) -> Result<()> {
        let snapshot = self.release_snapshot(release);
        if self.dataset_exists(&snapshot)? {
            zfs(&["destroy", &snapshot])?;
        }
        zfs(&["snapshot", &snapshot])
    }

    /// Whether a release has been snapshotted and can be cloned
    pub fn has_release_snapshot(&self, release: &str) -> Result<bool> {
        self.dataset_exists(&self.release_snapshot(release))
    }

    /// Clone a release snapshot into a jail root mounted at `mountpoint`
    pub fn clone_release(&self, release: &str, jail: &str, mountpoint: &Path) -> Result<()> {
        if !self.has_release_snapshot(release)? {
            return Err(Error::ReleaseNotFound(release.to_string()));
        }

        let target = self.jail_dataset(jail);
        if self.dataset_exists(&target)? {
            return Err(Error::Zfs(format!("Dataset '{}' already exists", target)));
        }

        let snapshot = self.release_snapshot(release);
        let mountpoint = format!("mountpoint={}", mountpoint.display());
        zfs(&["clone", "-o", &mountpoint, &snapshot, &target])
    }

    /// Destroy a jail's dataset
    ///
    /// Succeeds if the dataset is already gone.
    pub fn destroy_jail_dataset(&self, name: &str) -> Result<()> {
        let dataset = self.jail_dataset(name);

        if !self.dataset_exists(&dataset)? {
            return Ok(());
        }

        zfs(&["destroy", "-r", &dataset])
    }
}

fn zfs(args: &[&str]) -> Result<()> {
    let output = Command::new("zfs")
        .args(args)
        .output()
        .map_err(|e| Error::Zfs(format!("Failed to run zfs {}: {}", args[0], e)))?;

    if output.status.success() {
        tracing::debug!(args = ?args, "zfs");
        Ok(())
    } else {
        Err(Error::Zfs(format!(
            "zfs {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
