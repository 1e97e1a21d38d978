//! The seam between the one-shot executor and whatever builds jails
//!
//! The executor only ever talks to a [`JailProvider`]. The host
//! implementation drives real FreeBSD jails; tests substitute a recorder.

use crate::error::Result;
use crate::network::{InterfaceBinding, VnetSetup};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to create one jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailSpec {
    /// Jail name, also the hostname unless overridden
    pub name: String,
    /// Give the jail its own VNET stack
    pub network_enabled: bool,
    /// Address of the jail side of the epair
    pub ipv4_address: Ipv4Addr,
    /// Prefix length for `ipv4_address`
    pub prefix_len: u8,
    /// Default route inside the jail
    pub default_route: Ipv4Addr,
    /// Jail interface name and the host bridge it joins
    pub interface_binding: InterfaceBinding,
    pub hostname: Option<String>,
}

impl JailSpec {
    /// Address in CIDR form, as ifconfig wants it
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.ipv4_address, self.prefix_len)
    }

    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }
}

/// A jail in some stage between create and destroy
///
/// The handle only records what has been set up so far. Stop and destroy
/// consult it to undo exactly that.
#[derive(Debug)]
pub struct JailHandle {
    pub name: String,
    pub hostname: String,
    /// Root filesystem path
    pub path: PathBuf,
    /// ZFS dataset backing the root, when ZFS is in use
    pub dataset: Option<String>,
    /// VNET plumbing, once the epair exists
    pub vnet: Option<VnetSetup>,
    /// Kernel jail ID, while the jail is running
    pub jid: Option<i32>,
}

impl JailHandle {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            hostname: name.clone(),
            name,
            path: path.into(),
            dataset: None,
            vnet: None,
            jid: None,
        }
    }
}

/// Builds, runs and tears down jails on behalf of the executor
///
/// Implementations must make `stop` and `destroy` safe to call on a handle
/// in any state the earlier steps could have left it in.
pub trait JailProvider: Send + Sync {
    /// Reserve the name and set up networking, without starting anything
    fn create(&self, spec: &JailSpec) -> Result<JailHandle>;

    /// Populate the root from `release` and start the kernel jail
    fn provision(&self, handle: &mut JailHandle, release: &str) -> Result<()>;

    /// Run `command` under `/bin/sh -c` and return combined stdout and stderr
    ///
    /// A non-zero exit status is not an error.
    fn execute(&self, handle: &JailHandle, command: &str, timeout: Option<Duration>)
    -> Result<String>;

    /// Stop the jail. `force` skips the orderly rc.shutdown
    fn stop(&self, handle: &mut JailHandle, force: bool) -> Result<()>;

    /// Remove the root filesystem
    fn destroy(&self, handle: &JailHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_cidr_and_hostname() {
        let spec = JailSpec {
            name: "one-shot".into(),
            network_enabled: true,
            ipv4_address: Ipv4Addr::new(10, 0, 1, 89),
            prefix_len: 24,
            default_route: Ipv4Addr::new(10, 0, 1, 1),
            interface_binding: "vnet0:bridge0".parse().unwrap(),
            hostname: None,
        };
        assert_eq!(spec.cidr(), "10.0.1.89/24");
        assert_eq!(spec.hostname(), "one-shot");
    }
}
