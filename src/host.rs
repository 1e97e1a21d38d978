//! Real FreeBSD jails for the one-shot executor
//!
//! Roots are ZFS clones of a release's `@base` snapshot when ZFS is
//! enabled, otherwise `cp -a` copies of the extracted release. Networking
//! is a VNET epair whose host side joins the configured bridge.

use crate::error::{Error, Result};
use crate::jail::{self, JailParams, JAIL_SYS_NEW};
use crate::manifest::SkiffConfig;
use crate::network::{VnetConfig, VnetSetup};
use crate::provider::{JailHandle, JailProvider, JailSpec};
use crate::zfs::ZfsManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Host resolver configuration copied into every jail
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Upper bound for an orderly rc.shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// `ip4` value letting a non-VNET jail share the host's addresses
const JAIL_SYS_INHERIT: i32 = 2;

/// Provider backed by the kernel jail facility
#[derive(Debug, Clone)]
pub struct HostProvider {
    jails_dir: PathBuf,
    releases_dir: PathBuf,
    zfs: Option<ZfsManager>,
    max_output: usize,
}

impl HostProvider {
    pub fn new(config: &SkiffConfig) -> Self {
        let zfs = match (&config.storage.zpool, config.storage.zfs_enabled) {
            (Some(pool), true) => Some(ZfsManager::new(pool, &config.storage.dataset)),
            _ => None,
        };

        Self {
            jails_dir: config.storage.jails_dir(),
            releases_dir: config.releases.releases_dir.clone(),
            zfs,
            max_output: config.oneshot.max_output_bytes,
        }
    }

    fn root_for(&self, name: &str) -> PathBuf {
        self.jails_dir.join(name)
    }

    /// Copy an extracted release into a fresh directory
    fn copy_release(&self, release: &str, root: &Path) -> Result<()> {
        let release_path = self.releases_dir.join(release);
        if !release_path.join("bin/sh").exists() {
            return Err(Error::ReleaseNotFound(release.to_string()));
        }

        fs::create_dir_all(root).map_err(|e| {
            Error::JailOperation(format!("Failed to create jail directory: {}", e))
        })?;

        run(Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", release_path.display()))
            .arg(root))
    }

    fn install_resolv_conf(root: &Path) -> Result<()> {
        if !Path::new(HOST_RESOLV_CONF).exists() {
            warn!("host has no resolv.conf, jail will have no DNS");
            return Ok(());
        }

        fs::copy(HOST_RESOLV_CONF, root.join("etc/resolv.conf"))
            .map_err(|e| Error::JailOperation(format!("Failed to copy resolv.conf: {}", e)))?;
        Ok(())
    }
}

impl JailProvider for HostProvider {
    #[instrument(skip(self, spec), fields(jail = %spec.name))]
    fn create(&self, spec: &JailSpec) -> Result<JailHandle> {
        if jail::jail_lookup(&spec.name)?.is_some() {
            return Err(Error::JailAlreadyRunning(spec.name.clone()));
        }

        let root = self.root_for(&spec.name);
        if root.exists() {
            return Err(Error::JailPathExists(root));
        }
        if let Some(zfs) = &self.zfs {
            let dataset = zfs.jail_dataset(&spec.name);
            if zfs.dataset_exists(&dataset)? {
                return Err(Error::Zfs(format!("Dataset '{}' already exists", dataset)));
            }
        }

        let mut handle = JailHandle::new(&spec.name, root);
        handle.hostname = spec.hostname().to_string();

        if spec.network_enabled {
            let config = VnetConfig {
                binding: spec.interface_binding.clone(),
                ip: spec.cidr(),
                gateway: spec.default_route.to_string(),
            };
            handle.vnet = Some(VnetSetup::create(&spec.name, config)?);
        }

        debug!(path = %handle.path.display(), vnet = spec.network_enabled, "jail reserved");
        Ok(handle)
    }

    #[instrument(skip(self, handle), fields(jail = %handle.name))]
    fn provision(&self, handle: &mut JailHandle, release: &str) -> Result<()> {
        match &self.zfs {
            Some(zfs) => {
                zfs.clone_release(release, &handle.name, &handle.path)?;
                handle.dataset = Some(zfs.jail_dataset(&handle.name));
            }
            None => self.copy_release(release, &handle.path)?,
        }
        Self::install_resolv_conf(&handle.path)?;

        let mut params = JailParams::new()
            .set("name", handle.name.as_str())
            .set("host.hostname", handle.hostname.as_str());
        params = match handle.vnet {
            Some(_) => params.set("vnet", JAIL_SYS_NEW),
            None => params.set("ip4", JAIL_SYS_INHERIT),
        };

        let jid = jail::jail_create(&handle.path, &params)?;
        handle.jid = Some(jid);
        info!(jid, release, "jail started");

        if let Some(vnet) = &handle.vnet {
            vnet.attach_to_jail(jid)?;
            debug!(
                iface = %vnet.config.binding.jail_iface,
                ip = %vnet.config.ip,
                gateway = %vnet.config.gateway,
                "network configured"
            );
        }

        Ok(())
    }

    fn execute(
        &self,
        handle: &JailHandle,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let jid = handle
            .jid
            .ok_or_else(|| Error::JailNotRunning(handle.name.clone()))?;
        jail::exec_captured(jid, command, timeout, self.max_output)
    }

    #[instrument(skip(self, handle), fields(jail = %handle.name))]
    fn stop(&self, handle: &mut JailHandle, force: bool) -> Result<()> {
        if let Some(jid) = handle.jid {
            if !force
                && let Err(e) = jail::exec_captured(
                    jid,
                    "/bin/sh /etc/rc.shutdown",
                    Some(SHUTDOWN_TIMEOUT),
                    self.max_output,
                )
            {
                warn!(error = %e, "rc.shutdown failed, removing anyway");
            }

            if let Err(e) = jail::jail_remove(jid) {
                // Gone already counts as stopped
                if jail::jail_lookup(&handle.name)?.is_some() {
                    return Err(e);
                }
            }
            handle.jid = None;
            debug!(jid, "jail removed");
        }

        if let Some(vnet) = handle.vnet.take()
            && let Err(e) = vnet.cleanup()
        {
            handle.vnet = Some(vnet);
            return Err(e);
        }

        Ok(())
    }

    #[instrument(skip(self, handle), fields(jail = %handle.name))]
    fn destroy(&self, handle: &JailHandle) -> Result<()> {
        if let (Some(zfs), Some(_)) = (&self.zfs, &handle.dataset) {
            zfs.destroy_jail_dataset(&handle.name)?;
        }

        if handle.path.exists() {
            // Base releases ship schg binaries that block unlinking
            run(Command::new("chflags").args(["-R", "noschg"]).arg(&handle.path))?;
            fs::remove_dir_all(&handle.path).map_err(|e| {
                Error::JailOperation(format!(
                    "Failed to remove {}: {}",
                    handle.path.display(),
                    e
                ))
            })?;
        }

        debug!("root removed");
        Ok(())
    }
}

fn run(cmd: &mut Command) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let output = cmd.output().map_err(|e| Error::CommandFailed {
        command: program.clone(),
        message: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: program,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(dir: &TempDir) -> HostProvider {
        let mut config = SkiffConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.releases.releases_dir = dir.path().join("releases");
        HostProvider::new(&config)
    }

    #[test]
    fn test_layout_follows_storage_config() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        assert!(provider.zfs.is_none());
        assert_eq!(provider.max_output, 1024 * 1024);
        assert_eq!(
            provider.root_for("one-shot"),
            dir.path().join("data/jails/one-shot")
        );
    }

    #[test]
    fn test_zfs_needs_pool_and_flag() {
        let mut config = SkiffConfig::default();
        config.storage.zfs_enabled = true;
        assert!(HostProvider::new(&config).zfs.is_none());

        config.storage.zpool = Some("zroot".into());
        assert!(HostProvider::new(&config).zfs.is_some());
    }

    #[test]
    fn test_missing_release_is_reported() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let root = dir.path().join("data/jails/one-shot");

        let err = provider.copy_release("14.2-RELEASE", &root).unwrap_err();
        assert!(matches!(err, Error::ReleaseNotFound(r) if r == "14.2-RELEASE"));
        assert!(!root.exists());
    }

    #[test]
    fn test_execute_requires_running_jail() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let handle = JailHandle::new("one-shot", dir.path().join("root"));

        let err = provider.execute(&handle, "true", None).unwrap_err();
        assert!(matches!(err, Error::JailNotRunning(_)));
    }

    #[test]
    fn test_stop_and_destroy_idempotent_on_empty_handle() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let mut handle = JailHandle::new("one-shot", dir.path().join("never-created"));

        provider.stop(&mut handle, true).unwrap();
        provider.destroy(&handle).unwrap();
    }
}
