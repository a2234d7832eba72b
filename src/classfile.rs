//! Structural class file model.
//!
//! The constant pool is decoded into typed entries so that new references can
//! be appended, while fields, methods and attributes keep their raw bytes.
//! Writing a parsed class back produces the original bytes unless something
//! was changed.

use anyhow::{Context, Result};

pub(crate) const CLASS_MAGIC: u32 = 0xCAFEBABE;

pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;

pub(crate) const STATIC_INITIALIZER: &str = "<clinit>";
pub(crate) const CONSTRUCTOR: &str = "<init>";

/// Bounds-checked big-endian reader over class file bytes.
pub(crate) struct ClassReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ClassReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.offset)
            .context("class file out of bounds")?;
        self.offset += 1;
        Ok(byte)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let high = self.read_u32()? as u64;
        let low = self.read_u32()? as u64;
        Ok((high << 32) | low)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.offset;
        let end = start.checked_add(len).context("class file length overflow")?;
        let slice = self
            .data
            .get(start..end)
            .context("class file out of bounds")?;
        self.offset = end;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len)?;
        Ok(())
    }
}

pub(crate) fn write_u16(bytes: &mut Vec<u8>, value: u16) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(bytes: &mut Vec<u8>, value: u32) {
    bytes.extend_from_slice(&value.to_be_bytes());
}

/// Constant pool entry. Index 0 and the slot after a long or double hold `Unusable`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Constant {
    Unusable,
    Utf8 { value: String, raw: Vec<u8> },
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Clone, Debug)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub(crate) fn parse(reader: &mut ClassReader<'_>) -> Result<Self> {
        let count = reader.read_u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let tag = reader.read_u8()?;
            let entry = match tag {
                1 => {
                    let len = reader.read_u16()? as usize;
                    let raw = reader.read_bytes(len)?.to_vec();
                    let value = decode_modified_utf8(&raw);
                    Constant::Utf8 { value, raw }
                }
                3 => Constant::Integer(reader.read_u32()?),
                4 => Constant::Float(reader.read_u32()?),
                5 => Constant::Long(reader.read_u64()?),
                6 => Constant::Double(reader.read_u64()?),
                7 => Constant::Class {
                    name_index: reader.read_u16()?,
                },
                8 => Constant::String {
                    string_index: reader.read_u16()?,
                },
                9 => Constant::Fieldref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                10 => Constant::Methodref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                11 => Constant::InterfaceMethodref {
                    class_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                12 => Constant::NameAndType {
                    name_index: reader.read_u16()?,
                    descriptor_index: reader.read_u16()?,
                },
                15 => Constant::MethodHandle {
                    reference_kind: reader.read_u8()?,
                    reference_index: reader.read_u16()?,
                },
                16 => Constant::MethodType {
                    descriptor_index: reader.read_u16()?,
                },
                17 => Constant::Dynamic {
                    bootstrap_method_attr_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                18 => Constant::InvokeDynamic {
                    bootstrap_method_attr_index: reader.read_u16()?,
                    name_and_type_index: reader.read_u16()?,
                },
                19 => Constant::Module {
                    name_index: reader.read_u16()?,
                },
                20 => Constant::Package {
                    name_index: reader.read_u16()?,
                },
                _ => anyhow::bail!("unsupported constant pool tag: {}", tag),
            };
            let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
            entries.push(entry);
            if wide {
                entries.push(Constant::Unusable);
            }
        }
        if entries.len() != count as usize {
            anyhow::bail!("wide constant overruns constant pool count {}", count);
        }
        Ok(Self { entries })
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        self.entries
            .get(index as usize)
            .with_context(|| format!("constant pool index {index} out of range"))
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8 { value, .. } => Ok(value),
            _ => anyhow::bail!("constant pool entry {} is not utf8", index),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => anyhow::bail!("constant pool entry {} is not a class", index),
        }
    }

    pub(crate) fn utf8_index(&mut self, value: &str) -> Result<u16> {
        let found = self
            .entries
            .iter()
            .position(|entry| matches!(entry, Constant::Utf8 { value: existing, .. } if existing == value));
        match found {
            Some(index) => Ok(index as u16),
            None => self.push(Constant::Utf8 {
                value: value.to_string(),
                raw: encode_modified_utf8(value),
            }),
        }
    }

    pub(crate) fn class_index(&mut self, name: &str) -> Result<u16> {
        let name_index = self.utf8_index(name)?;
        self.find_or_push(Constant::Class { name_index })
    }

    pub(crate) fn name_and_type_index(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.utf8_index(name)?;
        let descriptor_index = self.utf8_index(descriptor)?;
        self.find_or_push(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Index of a method reference, appending the entry chain when missing.
    pub(crate) fn method_ref_index(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        interface: bool,
    ) -> Result<u16> {
        let class_index = self.class_index(owner)?;
        let name_and_type_index = self.name_and_type_index(name, descriptor)?;
        let entry = if interface {
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }
        } else {
            Constant::Methodref {
                class_index,
                name_and_type_index,
            }
        };
        self.find_or_push(entry)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn find_or_push(&mut self, entry: Constant) -> Result<u16> {
        match self.entries.iter().position(|existing| *existing == entry) {
            Some(index) => Ok(index as u16),
            None => self.push(entry),
        }
    }

    fn push(&mut self, entry: Constant) -> Result<u16> {
        let index = self.entries.len();
        if index >= u16::MAX as usize {
            anyhow::bail!("constant pool is full");
        }
        self.entries.push(entry);
        Ok(index as u16)
    }

    fn write(&self, bytes: &mut Vec<u8>) {
        write_u16(bytes, self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Constant::Unusable => {}
                Constant::Utf8 { raw, .. } => {
                    bytes.push(1);
                    write_u16(bytes, raw.len() as u16);
                    bytes.extend_from_slice(raw);
                }
                Constant::Integer(value) => {
                    bytes.push(3);
                    write_u32(bytes, *value);
                }
                Constant::Float(value) => {
                    bytes.push(4);
                    write_u32(bytes, *value);
                }
                Constant::Long(value) => {
                    bytes.push(5);
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Double(value) => {
                    bytes.push(6);
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
                Constant::Class { name_index } => {
                    bytes.push(7);
                    write_u16(bytes, *name_index);
                }
                Constant::String { string_index } => {
                    bytes.push(8);
                    write_u16(bytes, *string_index);
                }
                Constant::Fieldref {
                    class_index,
                    name_and_type_index,
                } => write_pair(bytes, 9, *class_index, *name_and_type_index),
                Constant::Methodref {
                    class_index,
                    name_and_type_index,
                } => write_pair(bytes, 10, *class_index, *name_and_type_index),
                Constant::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => write_pair(bytes, 11, *class_index, *name_and_type_index),
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => write_pair(bytes, 12, *name_index, *descriptor_index),
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    bytes.push(15);
                    bytes.push(*reference_kind);
                    write_u16(bytes, *reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    bytes.push(16);
                    write_u16(bytes, *descriptor_index);
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => write_pair(bytes, 17, *bootstrap_method_attr_index, *name_and_type_index),
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => write_pair(bytes, 18, *bootstrap_method_attr_index, *name_and_type_index),
                Constant::Module { name_index } => {
                    bytes.push(19);
                    write_u16(bytes, *name_index);
                }
                Constant::Package { name_index } => {
                    bytes.push(20);
                    write_u16(bytes, *name_index);
                }
            }
        }
    }
}

fn write_pair(bytes: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    bytes.push(tag);
    write_u16(bytes, first);
    write_u16(bytes, second);
}

/// Decode JVM modified UTF-8, falling back to lossy decoding for odd input.
fn decode_modified_utf8(raw: &[u8]) -> String {
    if let Ok(value) = std::str::from_utf8(raw) {
        return value.to_string();
    }
    let mut units = Vec::with_capacity(raw.len());
    let mut index = 0;
    while index < raw.len() {
        let byte = raw[index];
        if byte & 0x80 == 0 {
            units.push(byte as u16);
            index += 1;
        } else if byte & 0xe0 == 0xc0 && index + 1 < raw.len() {
            units.push((((byte & 0x1f) as u16) << 6) | (raw[index + 1] & 0x3f) as u16);
            index += 2;
        } else if byte & 0xf0 == 0xe0 && index + 2 < raw.len() {
            units.push(
                (((byte & 0x0f) as u16) << 12)
                    | (((raw[index + 1] & 0x3f) as u16) << 6)
                    | (raw[index + 2] & 0x3f) as u16,
            );
            index += 3;
        } else {
            units.push(0xfffd);
            index += 1;
        }
    }
    String::from_utf16_lossy(&units)
}

fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => raw.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                raw.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                raw.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                raw.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                raw.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                raw.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    raw
}

/// Attribute with undecoded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Attribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

impl Attribute {
    pub(crate) fn parse_all(reader: &mut ClassReader<'_>) -> Result<Vec<Attribute>> {
        let count = reader.read_u16()?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_index = reader.read_u16()?;
            let len = reader.read_u32()? as usize;
            let info = reader.read_bytes(len)?.to_vec();
            attributes.push(Attribute { name_index, info });
        }
        Ok(attributes)
    }

    pub(crate) fn skip_all(reader: &mut ClassReader<'_>) -> Result<()> {
        let count = reader.read_u16()?;
        for _ in 0..count {
            reader.skip(2)?;
            let len = reader.read_u32()? as usize;
            reader.skip(len)?;
        }
        Ok(())
    }

    pub(crate) fn write_all(attributes: &[Attribute], bytes: &mut Vec<u8>) -> Result<()> {
        write_u16(bytes, attributes.len() as u16);
        for attribute in attributes {
            let len = u32::try_from(attribute.info.len()).context("attribute too large")?;
            write_u16(bytes, attribute.name_index);
            write_u32(bytes, len);
            bytes.extend_from_slice(&attribute.info);
        }
        Ok(())
    }
}

/// Field or method declaration.
#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<Attribute>,
}

impl Member {
    fn parse_all(reader: &mut ClassReader<'_>) -> Result<Vec<Member>> {
        let count = reader.read_u16()?;
        let mut members = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let access_flags = reader.read_u16()?;
            let name_index = reader.read_u16()?;
            let descriptor_index = reader.read_u16()?;
            let attributes = Attribute::parse_all(reader)?;
            members.push(Member {
                access_flags,
                name_index,
                descriptor_index,
                attributes,
            });
        }
        Ok(members)
    }

    fn write_all(members: &[Member], bytes: &mut Vec<u8>) -> Result<()> {
        write_u16(bytes, members.len() as u16);
        for member in members {
            write_u16(bytes, member.access_flags);
            write_u16(bytes, member.name_index);
            write_u16(bytes, member.descriptor_index);
            Attribute::write_all(&member.attributes, bytes)?;
        }
        Ok(())
    }

    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    /// Position of the named attribute, resolved through the constant pool.
    pub(crate) fn attribute_position(&self, pool: &ConstantPool, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| pool.utf8(attribute.name_index).ok() == Some(name))
    }
}

/// Parsed class file with raw member bodies.
#[derive(Clone, Debug)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<Member>,
    pub(crate) methods: Vec<Member>,
    pub(crate) attributes: Vec<Attribute>,
}

impl ClassFile {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = ClassReader::new(data);
        let magic = reader.read_u32()?;
        if magic != CLASS_MAGIC {
            anyhow::bail!("invalid class file magic");
        }
        let minor_version = reader.read_u16()?;
        let major_version = reader.read_u16()?;
        let constant_pool = ConstantPool::parse(&mut reader).context("parse constant pool")?;
        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;
        let interface_count = reader.read_u16()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(reader.read_u16()?);
        }
        let fields = Member::parse_all(&mut reader).context("parse fields")?;
        let methods = Member::parse_all(&mut reader).context("parse methods")?;
        let attributes = Attribute::parse_all(&mut reader).context("parse class attributes")?;
        if !reader.is_empty() {
            anyhow::bail!("trailing bytes after class attributes at {}", reader.offset());
        }
        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        write_u32(&mut bytes, CLASS_MAGIC);
        write_u16(&mut bytes, self.minor_version);
        write_u16(&mut bytes, self.major_version);
        self.constant_pool.write(&mut bytes);
        write_u16(&mut bytes, self.access_flags);
        write_u16(&mut bytes, self.this_class);
        write_u16(&mut bytes, self.super_class);
        write_u16(&mut bytes, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            write_u16(&mut bytes, *interface);
        }
        Member::write_all(&self.fields, &mut bytes)?;
        Member::write_all(&self.methods, &mut bytes)?;
        Attribute::write_all(&self.attributes, &mut bytes)?;
        Ok(bytes)
    }

    pub(crate) fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    pub(crate) fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub(crate) fn method_name(&self, method: &Member) -> Result<&str> {
        self.constant_pool.utf8(method.name_index)
    }

    pub(crate) fn method_descriptor(&self, method: &Member) -> Result<&str> {
        self.constant_pool.utf8(method.descriptor_index)
    }
}
