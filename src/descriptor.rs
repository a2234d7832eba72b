use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Shape of a method that can receive one registered instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RegisterSignature {
    /// Internal name of the single class-typed parameter.
    pub(crate) parameter: String,
    /// Stack slots left by the return value: 0, 1 or 2.
    pub(crate) return_slots: u8,
}

/// Parse a register method descriptor.
///
/// Returns `None` unless the method takes exactly one class-typed parameter.
pub(crate) fn register_signature(descriptor: &str) -> Result<Option<RegisterSignature>> {
    let descriptor =
        MethodDescriptor::from_str(descriptor).context("parse method descriptor")?;
    let parameter = match &descriptor.parameter_types()[..] {
        [TypeDescriptor::Object(name)] => name.to_string(),
        _ => return Ok(None),
    };
    let return_slots = match descriptor.return_type() {
        TypeDescriptor::Void => 0,
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        _ => 1,
    };
    Ok(Some(RegisterSignature {
        parameter,
        return_slots,
    }))
}
