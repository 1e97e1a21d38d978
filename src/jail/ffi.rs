//! FFI bindings for FreeBSD jail syscalls
//!
//! The iovec plumbing is adapted from libjail-rs (https://github.com/fubarnetes/libjail-rs)
//! Original authors: Fabian Freyer <fabian.freyer@physik.tu-berlin.de>
//! License: BSD-3-Clause
//!
//! Copyright (c) 2018, Fabian Freyer <fabian.freyer@physik.tu-berlin.de>
//! All rights reserved.
//!
//! Redistribution and use in source and binary forms, with or without
//! modification, are permitted provided that the following conditions are met:
//!
//! 1. Redistributions of source code must retain the above copyright notice, this
//!    list of conditions and the following disclaimer.
//!
//! 2. Redistributions in binary form must reproduce the above copyright notice,
//!    this list of conditions and the following disclaimer in the documentation
//!    and/or other materials provided with the distribution.
//!
//! 3. Neither the name of the copyright holder nor the names of its
//!    contributors may be used to endorse or promote products derived from
//!    this software without specific prior written permission.

use crate::error::Error;
use bitflags::bitflags;
use std::ffi::{CStr, CString};
use std::io;
use std::path::Path;
use std::ptr;

use super::types::ParamValue;

/// Size of the kernel's error message buffer
const ERRMSG_LEN: usize = 256;

/// Macro to construct iovec structures for jail syscalls
macro_rules! iovec {
    ($key:expr => ($value:expr, $size:expr)) => {
        vec![iovec!($key), iovec!($value, $size)]
    };
    ($key:expr => ()) => {
        vec![iovec!($key), iovec!()]
    };
    ($key:expr => $value:expr) => {
        vec![iovec!($key), iovec!($value)]
    };
    ($key:expr => mut $value:expr) => {
        vec![iovec!($key), iovec!(mut $value)]
    };
    ($value:expr, $size:expr) => {
        libc::iovec {
            iov_base: $value as *mut libc::c_void,
            iov_len: $size,
        }
    };
    ($name:expr) => {
        iovec!($name.as_ptr(), $name.len())
    };
    (mut $name:expr) => {
        iovec!($name.as_mut_ptr(), $name.len())
    };
    () => {
        iovec!(ptr::null::<libc::c_void>(), 0)
    };
}

bitflags! {
    /// Flags for jail_set/jail_get syscalls
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JailFlags: i32 {
        /// Create the jail if it doesn't exist
        const CREATE = 0x01;
        /// Update parameters of existing jail
        const UPDATE = 0x02;
        /// Attach to jail upon creation
        const ATTACH = 0x04;
        /// Allow getting a dying jail
        const DYING = 0x08;
    }
}

/// Outcome of a raw jail_set/jail_get call
struct RawCall {
    ret: i32,
    os_error: io::Error,
    errmsg: [u8; ERRMSG_LEN],
}

impl RawCall {
    fn message(&self) -> Option<String> {
        if self.errmsg[0] == 0 {
            return None;
        }
        let msg = CStr::from_bytes_until_nul(&self.errmsg)
            .map(|m| m.to_string_lossy().into_owned())
            .unwrap_or_default();
        Some(msg)
    }
}

/// Ordered jail parameters, encoded for jail_set(2)
#[derive(Debug, Default, Clone)]
pub struct JailParams {
    params: Vec<(String, ParamValue)>,
}

impl JailParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter
    pub fn set(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_string(), value)),
        }
        self
    }

    fn encode(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        self.params
            .iter()
            .map(|(key, value)| {
                Ok((
                    CString::new(key.as_str())?.into_bytes_with_nul(),
                    value.as_bytes()?,
                ))
            })
            .collect()
    }
}

/// Create a persistent jail rooted at `path`
///
/// Returns the jail ID (jid) on success
pub fn jail_create(path: &Path, params: &JailParams) -> Result<i32, Error> {
    let raw_params = params.encode()?;

    let mut jiov: Vec<libc::iovec> = raw_params
        .iter()
        .flat_map(|(key, value)| iovec!(key => value))
        .collect();

    let pathstr = path
        .to_str()
        .ok_or_else(|| Error::JailSet("Invalid path encoding".into()))?;
    let pathstr = CString::new(pathstr)?.into_bytes_with_nul();

    let mut errmsg = [0u8; ERRMSG_LEN];
    jiov.extend(
        [
            iovec!(b"path\0" => pathstr),
            iovec!(b"errmsg\0" => mut errmsg),
            iovec!(b"persist\0" => ()),
        ]
        .into_iter()
        .flatten(),
    );

    let ret = unsafe {
        libc::jail_set(
            jiov[..].as_mut_ptr(),
            jiov.len() as u32,
            JailFlags::CREATE.bits(),
        )
    };
    let call = RawCall {
        ret,
        os_error: io::Error::last_os_error(),
        errmsg,
    };

    if call.ret < 0 {
        return Err(match call.message() {
            Some(msg) => Error::JailSet(msg),
            None => Error::Io(call.os_error),
        });
    }
    Ok(call.ret)
}

/// Look up a running jail by name
///
/// Returns `Ok(None)` when no jail has that name.
pub fn jail_lookup(name: &str) -> Result<Option<i32>, Error> {
    let name = CString::new(name)?.into_bytes_with_nul();
    let mut errmsg = [0u8; ERRMSG_LEN];

    let mut jiov: Vec<libc::iovec> =
        [iovec!(b"name\0" => name), iovec!(b"errmsg\0" => mut errmsg)]
            .into_iter()
            .flatten()
            .collect();

    let ret = unsafe {
        libc::jail_get(
            jiov[..].as_mut_ptr(),
            jiov.len() as u32,
            JailFlags::empty().bits(),
        )
    };
    let call = RawCall {
        ret,
        os_error: io::Error::last_os_error(),
        errmsg,
    };

    if call.ret >= 0 {
        return Ok(Some(call.ret));
    }
    if call.os_error.raw_os_error() == Some(libc::ENOENT) {
        return Ok(None);
    }
    Err(match call.message() {
        Some(msg) => Error::JailGet(msg),
        None => Error::Io(call.os_error),
    })
}

/// Remove a jail by its ID
///
/// This will kill all processes in the jail and remove it
pub fn jail_remove(jid: i32) -> Result<(), Error> {
    let ret = unsafe { libc::jail_remove(jid) };
    match ret {
        0 => Ok(()),
        -1 => Err(Error::Io(io::Error::last_os_error())),
        _ => Err(Error::JailRemoveFailed),
    }
}

/// Attach the current process to a jail
///
/// Only meaningful in a freshly forked child that is about to exec.
pub fn jail_attach(jid: i32) -> Result<(), Error> {
    match unsafe { libc::jail_attach(jid) } {
        0 => Ok(()),
        _ => Err(Error::Io(io::Error::last_os_error())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_replace_in_place() {
        let params = JailParams::new()
            .set("name", "one-shot")
            .set("vnet", 1)
            .set("name", "other");

        assert_eq!(params.params.len(), 2);
        assert!(matches!(
            &params.params[0],
            (key, ParamValue::String(value)) if key == "name" && value == "other"
        ));
        assert_eq!(params.params[1].0, "vnet");
    }

    #[test]
    fn test_params_encode_nul_terminated_keys() {
        let params = JailParams::new().set("host.hostname", "one-shot");
        let raw = params.encode().unwrap();
        assert_eq!(raw[0].0, b"host.hostname\0".to_vec());
        assert_eq!(raw[0].1, b"one-shot\0".to_vec());
    }

    #[test]
    #[ignore] // Requires FreeBSD
    fn test_lookup_missing_jail() {
        assert_eq!(jail_lookup("skiff-does-not-exist").unwrap(), None);
    }
}
