//! FreeBSD base releases that jail roots are built from
//!
//! `fetch` downloads the configured archives (normally just `base.txz`)
//! from the mirror, checks them against the release MANIFEST and unpacks
//! them under the releases directory. With ZFS enabled the release gets
//! its own dataset and a `@base` snapshot for jails to clone.

use crate::error::{Error, Result};
use crate::manifest::{RetryConfig, SkiffConfig};
use crate::supply::{download_file, fetch_text, sha256_file};
use crate::zfs::ZfsManager;
use chrono_machines::BackoffStrategy;
use rand::rng;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tar::Archive;
use tracing::{info, warn};
use xz2::read::XzDecoder;

/// Files every usable release must contain
const ESSENTIAL_FILES: [&str; 3] = ["bin/sh", "usr/bin/env", "lib/libc.so.7"];

/// Supported FreeBSD architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Architecture of the running host
    pub fn current() -> Result<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Ok(Arch::Amd64),
            "aarch64" => Ok(Arch::Arm64),
            other => Err(Error::UnsupportedArch(other.to_string())),
        }
    }

    /// Mirror directory name
    pub fn freebsd_name(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }
}

/// A release found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    /// Release name (e.g., "14.2-RELEASE")
    pub name: String,
    /// Path to the extracted release
    pub path: PathBuf,
    /// All essential files are present
    pub complete: bool,
}

/// Fetches and lists base releases
pub struct ReleaseStore {
    mirror_url: String,
    releases_dir: PathBuf,
    cache_dir: PathBuf,
    archives: Vec<String>,
    arch: Arch,
    retry_config: RetryConfig,
    zfs: Option<ZfsManager>,
}

impl ReleaseStore {
    pub fn from_config(config: &SkiffConfig) -> Result<Self> {
        let zfs = match (&config.storage.zpool, config.storage.zfs_enabled) {
            (Some(pool), true) => Some(ZfsManager::new(pool, &config.storage.dataset)),
            _ => None,
        };

        Ok(Self {
            mirror_url: config.releases.mirror_url.trim_end_matches('/').to_string(),
            releases_dir: config.releases.releases_dir.clone(),
            cache_dir: config.releases.cache_dir.clone(),
            archives: config.releases.archives.clone(),
            arch: Arch::current()?,
            retry_config: config.retry.clone(),
            zfs,
        })
    }

    fn archive_url(&self, release: &str, archive: &str) -> String {
        format!(
            "{}/{}/{}/{}.txz",
            self.mirror_url,
            self.arch.freebsd_name(),
            release,
            archive
        )
    }

    fn manifest_url(&self, release: &str) -> String {
        format!(
            "{}/{}/{}/MANIFEST",
            self.mirror_url,
            self.arch.freebsd_name(),
            release
        )
    }

    /// Where a release is (or would be) extracted
    pub fn release_path(&self, release: &str) -> PathBuf {
        self.releases_dir.join(release)
    }

    /// Whether `release` is extracted and complete
    pub fn is_fetched(&self, release: &str) -> bool {
        is_complete(&self.release_path(release))
    }

    /// All release directories, sorted by name
    pub fn list(&self) -> Result<Vec<Release>> {
        let mut releases = Vec::new();

        if !self.releases_dir.exists() {
            return Ok(releases);
        }

        for entry in fs::read_dir(&self.releases_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                releases.push(Release {
                    name: name.to_string(),
                    complete: is_complete(&path),
                    path: path.clone(),
                });
            }
        }

        releases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(releases)
    }

    /// Download, verify and extract `release`
    pub fn fetch(&self, release: &str, force: bool) -> Result<PathBuf> {
        let release_path = self.release_path(release);

        if self.is_fetched(release) && !force {
            return Err(Error::ReleaseAlreadyExists(release.to_string()));
        }

        let manifest = fetch_text(&self.manifest_url(release), &self.retry_config)?
            .ok_or_else(|| Error::ReleaseNotFound(release.to_string()))?;
        let checksums = parse_manifest(&manifest);

        info!(release, arch = self.arch.freebsd_name(), "fetching release");

        fs::create_dir_all(&self.cache_dir)?;
        match &self.zfs {
            Some(zfs) => zfs.create_release_dataset(release, &release_path)?,
            None => fs::create_dir_all(&release_path)?,
        }

        for archive in &self.archives {
            let expected = checksums.get(archive.as_str()).map(String::as_str);
            if expected.is_none() {
                warn!(archive, "archive not listed in MANIFEST, skipping verification");
            }
            self.fetch_archive(release, archive, expected, &release_path)?;
        }

        if !is_complete(&release_path) {
            return Err(Error::ExtractionFailed(format!(
                "{} is missing essential files after extraction",
                release_path.display()
            )));
        }

        if let Some(zfs) = &self.zfs {
            zfs.snapshot_release(release)?;
        }

        info!(path = %release_path.display(), "release ready");
        Ok(release_path)
    }

    /// Download (or reuse from cache) and extract one archive, with retry
    fn fetch_archive(
        &self,
        release: &str,
        archive: &str,
        expected_sha256: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let url = self.archive_url(release, archive);
        let cache_file = self.cache_dir.join(format!("{}-{}.txz", release, archive));
        let backoff = self.retry_config.backoff();
        let mut rng = rng();
        let mut attempt: u8 = 0;

        loop {
            attempt += 1;

            let cached = match expected_sha256 {
                Some(expected) if cache_file.exists() => {
                    sha256_file(&cache_file).is_ok_and(|actual| actual == expected)
                }
                _ => false,
            };

            let result = if cached {
                info!(archive, "using cached archive");
                extract_txz(&cache_file, dest)
            } else {
                download_file(&url, &cache_file, expected_sha256, &self.retry_config)
                    .and_then(|()| extract_txz(&cache_file, dest))
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.delay(attempt, &mut rng) {
                    Some(delay_ms) => {
                        warn!(archive, attempt, delay_ms, error = %e, "archive failed, retrying");
                        let _ = fs::remove_file(&cache_file);
                        thread::sleep(Duration::from_millis(delay_ms));
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

fn is_complete(path: &Path) -> bool {
    ESSENTIAL_FILES.iter().all(|f| path.join(f).exists())
}

/// Parse a release MANIFEST into archive name -> sha256
///
/// Lines look like `base.txz<TAB>sha256<TAB>count<TAB>name<TAB>desc<TAB>default`.
fn parse_manifest(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let archive = parts.next()?.strip_suffix(".txz")?;
            let sha256 = parts.next()?;
            Some((archive.to_string(), sha256.to_string()))
        })
        .collect()
}

/// Extract a .txz (tar.xz) archive, keeping permissions and ownership
fn extract_txz(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| {
        Error::ExtractionFailed(format!(
            "Failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(XzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);

    archive.unpack(dest).map_err(|e| {
        Error::ExtractionFailed(format!(
            "Failed to extract {}: {}",
            archive_path.display(),
            e
        ))
    })
}
