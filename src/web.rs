//! Browser console for one-shot jails
//!
//! This module provides:
//! - Page and fragment rendering
//! - The HTTP(S) server and its routes
//! - Certificate bootstrap and TLS configuration

pub mod render;
pub mod server;
pub mod tls;

pub use server::{serve, Console};
