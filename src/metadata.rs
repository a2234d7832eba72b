use std::collections::BTreeSet;

use anyhow::{Context, Result};
use jclassfile::class_file::{self, ClassFlags};
use jclassfile::constant_pool::ConstantPool as PoolEntry;
use jclassfile::methods::MethodFlags;

use crate::classfile::{
    ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, Attribute, CLASS_MAGIC, CONSTRUCTOR, ClassReader,
    ConstantPool,
};
use crate::error::AutoRegisterError;

/// Structural facts about one class, enough to evaluate registration rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClassMetadata {
    /// Internal name, e.g. `com/example/Hello`.
    pub(crate) name: String,
    /// Internal name of the direct superclass; empty for `java/lang/Object`.
    pub(crate) super_name: String,
    pub(crate) interfaces: BTreeSet<String>,
    pub(crate) is_abstract: bool,
    pub(crate) is_interface: bool,
    pub(crate) has_public_no_arg_constructor: bool,
}

/// Read class metadata for rule evaluation.
///
/// `origin` names where the bytes came from and only shows up in errors.
pub(crate) fn read_class_metadata(
    data: &[u8],
    origin: &str,
) -> Result<ClassMetadata, AutoRegisterError> {
    parse_metadata(data).map_err(|err| AutoRegisterError::MalformedClass {
        origin: origin.to_string(),
        reason: format!("{err:#}"),
    })
}

fn parse_metadata(data: &[u8]) -> Result<ClassMetadata> {
    if data.len() < 10 || data[..4] != CLASS_MAGIC.to_be_bytes() {
        anyhow::bail!("invalid class file header");
    }
    let class_file = match class_file::parse(data) {
        Ok(parsed) => parsed,
        Err(err) => {
            let message = format!("{err}");
            if message.contains("unmatched attribute") {
                return parse_metadata_minimal(data);
            }
            return Err(err).context("failed to parse class file bytes");
        }
    };
    let pool = class_file.constant_pool();
    let name = resolve_class_name(pool, class_file.this_class()).context("resolve class name")?;
    let super_name = if class_file.super_class() == 0 {
        String::new()
    } else {
        resolve_class_name(pool, class_file.super_class()).context("resolve super class name")?
    };
    let mut interfaces = BTreeSet::new();
    for interface in class_file.interfaces() {
        interfaces.insert(resolve_class_name(pool, *interface).context("resolve interface name")?);
    }

    let mut has_public_no_arg_constructor = false;
    for method in class_file.methods() {
        if method.access_flags().contains(MethodFlags::ACC_PUBLIC)
            && resolve_utf8(pool, method.name_index())? == CONSTRUCTOR
            && resolve_utf8(pool, method.descriptor_index())? == "()V"
        {
            has_public_no_arg_constructor = true;
        }
    }

    let access_flags = class_file.access_flags();
    Ok(ClassMetadata {
        name,
        super_name,
        interfaces,
        is_abstract: access_flags.contains(ClassFlags::ACC_ABSTRACT),
        is_interface: access_flags.contains(ClassFlags::ACC_INTERFACE),
        has_public_no_arg_constructor,
    })
}

fn resolve_class_name(pool: &[PoolEntry], index: u16) -> Result<String> {
    match pool.get(index as usize) {
        Some(PoolEntry::Class { name_index }) => resolve_utf8(pool, *name_index),
        _ => anyhow::bail!("constant #{index} is not a class"),
    }
}

fn resolve_utf8(pool: &[PoolEntry], index: u16) -> Result<String> {
    match pool.get(index as usize) {
        Some(PoolEntry::Utf8 { value }) => Ok(value.clone()),
        _ => anyhow::bail!("constant #{index} is not utf8"),
    }
}

/// Header walk for classes carrying attributes `jclassfile` does not model.
fn parse_metadata_minimal(data: &[u8]) -> Result<ClassMetadata> {
    let mut reader = ClassReader::new(data);
    if reader.read_u32()? != CLASS_MAGIC {
        anyhow::bail!("invalid class file magic");
    }
    reader.skip(4)?;
    let pool = ConstantPool::parse(&mut reader).context("parse constant pool")?;
    let access_flags = reader.read_u16()?;
    let this_class = reader.read_u16()?;
    let super_class = reader.read_u16()?;

    let name = pool
        .class_name(this_class)
        .context("resolve class name")?
        .to_string();
    let super_name = if super_class == 0 {
        String::new()
    } else {
        pool.class_name(super_class)
            .context("resolve super class name")?
            .to_string()
    };

    let interface_count = reader.read_u16()?;
    let mut interfaces = BTreeSet::new();
    for _ in 0..interface_count {
        let index = reader.read_u16()?;
        let interface = pool.class_name(index).context("resolve interface name")?;
        interfaces.insert(interface.to_string());
    }

    let field_count = reader.read_u16()?;
    for _ in 0..field_count {
        reader.skip(6)?;
        Attribute::skip_all(&mut reader).context("skip field attributes")?;
    }

    let mut has_public_no_arg_constructor = false;
    let method_count = reader.read_u16()?;
    for _ in 0..method_count {
        let method_access = reader.read_u16()?;
        let name_index = reader.read_u16()?;
        let descriptor_index = reader.read_u16()?;
        Attribute::skip_all(&mut reader).context("skip method attributes")?;
        if method_access & ACC_PUBLIC != 0
            && pool.utf8(name_index)? == CONSTRUCTOR
            && pool.utf8(descriptor_index)? == "()V"
        {
            has_public_no_arg_constructor = true;
        }
    }

    Ok(ClassMetadata {
        name,
        super_name,
        interfaces,
        is_abstract: access_flags & ACC_ABSTRACT != 0,
        is_interface: access_flags & ACC_INTERFACE != 0,
        has_public_no_arg_constructor,
    })
}
