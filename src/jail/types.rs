//! Jail parameter values as the kernel expects them

use crate::error::Error;
use byteorder::{NativeEndian, WriteBytesExt};
use std::ffi::CString;

/// Value for the `vnet` parameter requesting a fresh network stack
pub const JAIL_SYS_NEW: i32 = 1;

/// Jail parameter value types
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Integer value (maps to C int)
    Int(i32),
    /// NUL-terminated string value
    String(String),
    /// Boolean value (stored as int: 0 or 1)
    Bool(bool),
}

impl ParamValue {
    /// Encode the value for an iovec
    pub fn as_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            ParamValue::Int(v) => int_bytes(*v),
            ParamValue::Bool(b) => int_bytes(i32::from(*b)),
            ParamValue::String(s) => Ok(CString::new(s.as_str())?.into_bytes_with_nul()),
        }
    }
}

fn int_bytes(v: i32) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(4);
    buf.write_i32::<NativeEndian>(v)?;
    Ok(buf)
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::String(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_bool_share_layout() {
        assert_eq!(
            ParamValue::Bool(true).as_bytes().unwrap(),
            ParamValue::Int(1).as_bytes().unwrap()
        );
        assert_eq!(ParamValue::Int(JAIL_SYS_NEW).as_bytes().unwrap().len(), 4);
    }

    #[test]
    fn test_string_rejects_interior_nul() {
        assert!(matches!(
            ParamValue::from("one\0shot").as_bytes(),
            Err(Error::CString(_))
        ));
    }
}
