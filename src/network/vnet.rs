//! VNET jail network configuration
//!
//! Provides:
//! - Parsing of interface bindings ("vnet0:bridge0")
//! - Full network setup for VNET jails
//! - Integration with bridges and epairs

use crate::error::{Error, Result};
use crate::network::{Bridge, EpairInterface};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Mapping of the jail's interface name to a host bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Interface name seen inside the jail
    pub jail_iface: String,
    /// Host bridge the epair joins
    pub bridge: String,
}

impl FromStr for InterfaceBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (jail_iface, bridge) = s.split_once(':').ok_or_else(|| {
            Error::ConfigValidation(format!(
                "Invalid interface binding '{}': expected <iface>:<bridge>",
                s
            ))
        })?;

        let valid = |n: &str| {
            !n.is_empty() && n.len() <= 15 && n.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !valid(jail_iface) || !valid(bridge) {
            return Err(Error::ConfigValidation(format!(
                "Invalid interface binding '{}': bad interface name",
                s
            )));
        }

        Ok(Self {
            jail_iface: jail_iface.to_string(),
            bridge: bridge.to_string(),
        })
    }
}

impl fmt::Display for InterfaceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.jail_iface, self.bridge)
    }
}

/// VNET network configuration for a jail
#[derive(Debug, Clone)]
pub struct VnetConfig {
    /// Interface binding
    pub binding: InterfaceBinding,
    /// IP address with prefix (e.g., "10.0.1.89/24")
    pub ip: String,
    /// Default route
    pub gateway: String,
}

/// Network setup for a VNET jail
#[derive(Debug, Clone)]
pub struct VnetSetup {
    /// Epair interface pair
    pub epair: EpairInterface,
    /// IP configuration
    pub config: VnetConfig,
}

impl VnetSetup {
    /// Create a VNET network setup for a jail
    ///
    /// This creates the epair and adds it to the bridge, but does NOT
    /// move the interface into the jail (that happens once the jail exists).
    pub fn create(jail_name: &str, config: VnetConfig) -> Result<Self> {
        let bridge = Bridge::create_or_open(&config.binding.bridge)?;
        let epair = EpairInterface::create_for_jail(jail_name)?;

        if let Err(e) = bridge.add_member(epair.host_side()) {
            let _ = epair.destroy();
            return Err(e);
        }

        debug!(
            jail = jail_name,
            host = epair.host_side(),
            bridge = bridge.name(),
            "epair attached to bridge"
        );
        Ok(Self { epair, config })
    }

    /// Move the jail-side interface into the jail and configure it
    pub fn attach_to_jail(&self, jid: i32) -> Result<()> {
        self.epair.move_to_jail(jid)?;

        EpairInterface::configure_in_jail(
            jid,
            self.epair.jail_side(),
            &self.config.binding.jail_iface,
            &self.config.ip,
            &self.config.gateway,
        )
    }

    /// Clean up the network setup
    pub fn cleanup(&self) -> Result<()> {
        // Remove from bridge (if still connected)
        if let Ok(bridge) = Bridge::open(&self.config.binding.bridge)
            && let Err(e) = bridge.remove_member(self.epair.host_side())
        {
            warn!(error = %e, "bridge member already gone");
        }

        // Destroying either end destroys both
        self.epair.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        let binding: InterfaceBinding = "vnet0:bridge0".parse().unwrap();
        assert_eq!(binding.jail_iface, "vnet0");
        assert_eq!(binding.bridge, "bridge0");
        assert_eq!(binding.to_string(), "vnet0:bridge0");
    }

    #[test]
    fn test_parse_binding_errors() {
        assert!("vnet0".parse::<InterfaceBinding>().is_err());
        assert!(":bridge0".parse::<InterfaceBinding>().is_err());
        assert!("vnet0:".parse::<InterfaceBinding>().is_err());
        assert!("vnet0:bridge 0".parse::<InterfaceBinding>().is_err());
        assert!("vnet0:averyveryverylongbridge".parse::<InterfaceBinding>().is_err());
    }
}
