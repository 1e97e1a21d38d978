//! Network management module for VNET jails
//!
//! Provides:
//! - Bridge membership for the host side of the jail's epair
//! - Epair interface creation for VNET jails
//! - IP address allocation for concurrent jails
//! - VNET jail network configuration

pub mod bridge;
pub mod epair;
pub mod ip;
pub mod vnet;

pub use bridge::Bridge;
pub use epair::EpairInterface;
pub use ip::IpPool;
pub use vnet::{InterfaceBinding, VnetConfig, VnetSetup};
