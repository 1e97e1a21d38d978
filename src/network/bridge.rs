//! Bridge interface access
//!
//! The one-shot jail joins an existing host bridge; the bridge itself is
//! host configuration and is created on demand only when missing.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::process::Command;
use tracing::{debug, info};

// FreeBSD kldload syscall - not in libc crate
unsafe extern "C" {
    fn kldload(file: *const libc::c_char) -> libc::c_int;
}

/// A bridge interface
#[derive(Debug, Clone)]
pub struct Bridge {
    /// Bridge interface name (e.g., "bridge0")
    name: String,
}

impl Bridge {
    /// Open an existing bridge interface
    pub fn open(name: &str) -> Result<Self> {
        if !Self::exists(name)? {
            return Err(Error::InterfaceNotFound(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Open the bridge, creating it when it does not exist yet
    pub fn create_or_open(name: &str) -> Result<Self> {
        if Self::exists(name)? {
            return Self::open(name);
        }

        Self::load_modules()?;

        // Named bridges need the generic clone first, then a rename
        let created = ifconfig(&["bridge", "create"])?;
        let created = created.trim();
        if created != name {
            ifconfig(&[created, "name", name])?;
        }
        ifconfig(&[name, "up"])?;
        info!(bridge = name, "created bridge");

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Check if an interface exists
    pub fn exists(name: &str) -> Result<bool> {
        let output = Command::new("ifconfig")
            .arg(name)
            .output()
            .map_err(|e| Error::Network(format!("Failed to run ifconfig: {}", e)))?;

        Ok(output.status.success())
    }

    /// Bridge name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a member interface to the bridge
    pub fn add_member(&self, interface: &str) -> Result<()> {
        debug!(bridge = %self.name, interface, "adding bridge member");
        ifconfig(&[&self.name, "addm", interface]).map(|_| ())
    }

    /// Remove a member interface from the bridge
    pub fn remove_member(&self, interface: &str) -> Result<()> {
        debug!(bridge = %self.name, interface, "removing bridge member");
        ifconfig(&[&self.name, "deletem", interface]).map(|_| ())
    }

    /// Load required kernel modules for bridging using native syscall
    fn load_modules() -> Result<()> {
        let modules = ["if_bridge", "bridgestp", "if_epair"];

        for module in modules {
            let module_cstr = CString::new(module).map_err(|e| {
                Error::Network(format!("Invalid module name {}: {}", module, e))
            })?;

            let result = unsafe { kldload(module_cstr.as_ptr()) };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                let errno = err.raw_os_error().unwrap_or(0);

                // Already loaded (EEXIST) or built into the kernel (ENOENT)
                if errno != libc::EEXIST && errno != libc::ENOENT {
                    return Err(Error::Network(format!(
                        "Failed to load module {}: {}",
                        module, err
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Run ifconfig and return its stdout
pub(crate) fn ifconfig(args: &[&str]) -> Result<String> {
    let output = Command::new("ifconfig")
        .args(args)
        .output()
        .map_err(|e| Error::Network(format!("Failed to run ifconfig: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Network(format!(
            "ifconfig {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires FreeBSD ifconfig
    fn test_bridge_exists_check() {
        // lo0 should always exist
        assert!(Bridge::exists("lo0").unwrap());
        assert!(!Bridge::exists("nonexistent12345").unwrap());
    }

    #[test]
    #[ignore] // Requires FreeBSD ifconfig
    fn test_open_missing_bridge() {
        assert!(matches!(
            Bridge::open("nonexistent12345"),
            Err(Error::InterfaceNotFound(_))
        ));
    }
}
