//! Epair interface management for VNET jails
//!
//! Epairs are virtual Ethernet pairs used to connect VNET jails to bridges.
//! One end stays on the host (and is added to a bridge), the other is moved
//! into the jail.

use super::bridge::ifconfig;
use crate::error::{Error, Result};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Counter for generating unique epair names
static EPAIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Longest usable interface name (IFNAMSIZ minus the NUL)
const IFNAMSIZ: usize = 15;

/// An epair interface pair for connecting VNET jails to bridges
#[derive(Debug, Clone)]
pub struct EpairInterface {
    /// Host-side interface name (e.g., "e0a_oneshot")
    host_side: String,
    /// Jail-side interface name (e.g., "e0b_oneshot")
    jail_side: String,
}

impl EpairInterface {
    /// Create an epair named after a jail
    ///
    /// Creates interfaces named like "e0a_jailname" and "e0b_jailname" and
    /// brings the host side up.
    pub fn create_for_jail(jail_name: &str) -> Result<Self> {
        // Output is something like "epair0a\n"
        let host_side = ifconfig(&["epair", "create"])?.trim().to_string();
        let jail_side = host_side
            .strip_suffix('a')
            .map(|s| format!("{}b", s))
            .ok_or_else(|| {
                Error::Network(format!("Unexpected epair name format: {}", host_side))
            })?;

        let counter = EPAIR_COUNTER.fetch_add(1, Ordering::SeqCst);
        let prefix_len = format!("e{}a_", counter).len();
        let suffix: String = Self::sanitize_name(jail_name)
            .chars()
            .take(IFNAMSIZ.saturating_sub(prefix_len))
            .collect();
        let new_host = format!("e{}a_{}", counter, suffix);
        let new_jail = format!("e{}b_{}", counter, suffix);

        if let Err(e) = ifconfig(&[&host_side, "name", &new_host]) {
            let _ = ifconfig(&[&host_side, "destroy"]);
            return Err(e);
        }
        if let Err(e) = ifconfig(&[&jail_side, "name", &new_jail]) {
            let _ = ifconfig(&[&new_host, "destroy"]);
            return Err(e);
        }
        if let Err(e) = ifconfig(&[&new_host, "up"]) {
            let _ = ifconfig(&[&new_host, "destroy"]);
            return Err(e);
        }

        debug!(host = %new_host, jail = %new_jail, "created epair");
        Ok(Self {
            host_side: new_host,
            jail_side: new_jail,
        })
    }

    /// Get the host-side interface name
    pub fn host_side(&self) -> &str {
        &self.host_side
    }

    /// Get the jail-side interface name
    pub fn jail_side(&self) -> &str {
        &self.jail_side
    }

    /// Move the jail-side interface into a VNET jail
    pub fn move_to_jail(&self, jid: i32) -> Result<()> {
        ifconfig(&[&self.jail_side, "vnet", &jid.to_string()]).map(|_| ())
    }

    /// Rename, address and route the interface from inside the jail
    pub fn configure_in_jail(
        jid: i32,
        interface: &str,
        rename_to: &str,
        addr: &str,
        gateway: &str,
    ) -> Result<()> {
        let jid = jid.to_string();

        jexec_host(&jid, &["ifconfig", interface, "name", rename_to])?;
        jexec_host(&jid, &["ifconfig", rename_to, "inet", addr, "up"])?;

        if let Err(e) = jexec_host(&jid, &["route", "add", "default", gateway]) {
            // Don't fail if route already exists
            if !e.to_string().contains("File exists") {
                return Err(e);
            }
            warn!(jid = %jid, gateway, "default route already present");
        }

        Ok(())
    }

    /// Destroy the epair (destroys both ends)
    pub fn destroy(&self) -> Result<()> {
        match ifconfig(&[&self.host_side, "destroy"]) {
            Ok(_) => Ok(()),
            // Don't fail if already destroyed
            Err(e) if e.to_string().contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sanitize a jail name for use in interface names
    ///
    /// Interface names have a max length of 15 characters on FreeBSD.
    fn sanitize_name(name: &str) -> String {
        let sanitized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .take(10)
            .collect();

        if sanitized.is_empty() {
            "jail".to_string()
        } else {
            sanitized
        }
    }
}

/// Run a network tool inside a jail via jexec(8)
fn jexec_host(jid: &str, args: &[&str]) -> Result<()> {
    let output = Command::new("jexec")
        .arg(jid)
        .args(args)
        .output()
        .map_err(|e| Error::Network(format!("Failed to run jexec: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Network(format!(
            "{} in jail {} failed: {}",
            args.join(" "),
            jid,
            stderr.trim()
        )));
    }

    Ok(())
}
