//! HTTP fetches for release bootstrap
//!
//! Every request is retried with the configured backoff. Downloads are
//! hashed while they stream so the checksum costs no second pass.

use crate::error::{Error, Result};
use crate::manifest::RetryConfig;
use chrono_machines::BackoffStrategy;
use rand::rng;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Call `op` until it succeeds or the backoff gives up
fn with_backoff<T>(
    retry_config: &RetryConfig,
    url: &str,
    mut op: impl FnMut() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, (u8, ureq::Error)> {
    let backoff = retry_config.backoff();
    let mut rng = rng();
    let mut attempt: u8 = 0;

    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(ureq::Error::StatusCode(404)) => {
                return Err((attempt, ureq::Error::StatusCode(404)));
            }
            Err(e) => match backoff.delay(attempt, &mut rng) {
                Some(delay_ms) => {
                    warn!(url, attempt, delay_ms, error = %e, "request failed, retrying");
                    thread::sleep(Duration::from_millis(delay_ms));
                }
                None => return Err((attempt, e)),
            },
        }
    }
}

/// Download `url` to `dest`, verifying the SHA-256 when one is given
pub fn download_file(
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
    retry_config: &RetryConfig,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::DownloadFailed(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    info!(url, "downloading");
    let response = with_backoff(retry_config, url, || ureq::get(url).call()).map_err(
        |(attempts, e)| {
            Error::DownloadFailed(format!(
                "HTTP request failed for {} after {} attempts: {}",
                url, attempts, e
            ))
        },
    )?;

    let content_length: Option<u64> = response
        .headers()
        .get("Content-Length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());

    let mut file = File::create(dest).map_err(|e| {
        Error::DownloadFailed(format!("Failed to create file {}: {}", dest.display(), e))
    })?;

    let mut reader = response.into_body().into_reader();
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];
    let mut downloaded: u64 = 0;
    let mut last_decile = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::DownloadFailed(format!("Read error during download: {}", e)))?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .map_err(|e| Error::DownloadFailed(format!("Write error during download: {}", e)))?;
        hasher.update(&buffer[..bytes_read]);
        downloaded += bytes_read as u64;

        if let Some(total) = content_length.filter(|t| *t > 0) {
            let decile = downloaded * 10 / total;
            if decile > last_decile {
                debug!(percent = decile * 10, downloaded, total, "download progress");
                last_decile = decile;
            }
        }
    }

    let actual = hex::encode(hasher.finalize());
    if let Some(expected) = expected_sha256
        && !actual.eq_ignore_ascii_case(expected)
    {
        let _ = fs::remove_file(dest);
        return Err(Error::ChecksumMismatch {
            file: dest.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    info!(bytes = downloaded, sha256 = %actual, "download complete");
    Ok(())
}

/// Compute SHA256 hash of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .map_err(|e| Error::DownloadFailed(format!("Failed to open file for checksum: {}", e)))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::DownloadFailed(format!("Read error computing checksum: {}", e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Fetch a small text document such as a release MANIFEST
///
/// A 404 maps to `None` so callers can report a missing release.
pub fn fetch_text(url: &str, retry_config: &RetryConfig) -> Result<Option<String>> {
    let response = match with_backoff(retry_config, url, || ureq::get(url).call()) {
        Ok(response) => response,
        Err((_, ureq::Error::StatusCode(404))) => return Ok(None),
        Err((attempts, e)) => {
            return Err(Error::DownloadFailed(format!(
                "Failed to fetch {} after {} attempts: {}",
                url, attempts, e
            )));
        }
    };

    response
        .into_body()
        .read_to_string()
        .map(Some)
        .map_err(|e| Error::DownloadFailed(format!("Failed to read response body: {}", e)))
}
