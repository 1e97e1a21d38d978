//! Jail management module
//!
//! This module provides:
//! - FFI bindings to FreeBSD jail syscalls
//! - Command execution inside a running jail
//! - Lifecycle tracking for one-shot jails

pub mod ffi;
pub mod jexec;
pub mod state;
pub mod types;

// Re-exports
pub use ffi::{jail_create, jail_lookup, jail_remove, JailParams};
pub use jexec::exec_captured;
pub use state::{Sortie, SortieMachineEvent, Stage};
pub use types::JAIL_SYS_NEW;
