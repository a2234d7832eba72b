//! `Code` attribute decoding and instruction insertion with offset relocation.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::classfile::{Attribute, ClassReader, ConstantPool, write_u16, write_u32};
use crate::opcodes;

/// Decoded `Code` attribute. Nested attributes stay raw until relocation.
#[derive(Clone, Debug)]
pub(crate) struct Code {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<Attribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

impl Code {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut reader = ClassReader::new(info);
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?.to_vec();
        let handler_count = reader.read_u16()?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: reader.read_u16()?,
                end_pc: reader.read_u16()?,
                handler_pc: reader.read_u16()?,
                catch_type: reader.read_u16()?,
            });
        }
        let attributes = Attribute::parse_all(&mut reader)?;
        if !reader.is_empty() {
            anyhow::bail!("trailing bytes in Code attribute");
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        write_u16(&mut bytes, self.max_stack);
        write_u16(&mut bytes, self.max_locals);
        let code_len = u32::try_from(self.code.len()).context("code too large")?;
        write_u32(&mut bytes, code_len);
        bytes.extend_from_slice(&self.code);
        write_u16(&mut bytes, self.exception_table.len() as u16);
        for entry in &self.exception_table {
            write_u16(&mut bytes, entry.start_pc);
            write_u16(&mut bytes, entry.end_pc);
            write_u16(&mut bytes, entry.handler_pc);
            write_u16(&mut bytes, entry.catch_type);
        }
        Attribute::write_all(&self.attributes, &mut bytes)?;
        Ok(bytes)
    }
}

/// Start offsets of every instruction in `code`, in order.
pub(crate) fn instruction_offsets(code: &[u8]) -> Result<Vec<usize>> {
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        offsets.push(offset);
        offset += length;
    }
    Ok(offsets)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa6 => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        0xa9 => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == 0x84 { Ok(6) } else { Ok(4) }
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    Ok(read_u16(code, offset)? as i16)
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(i32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub(crate) fn is_return(opcode: u8) -> bool {
    (opcodes::IRETURN..=opcodes::RETURN).contains(&opcode)
}

fn is_short_branch(opcode: u8) -> bool {
    (opcodes::IFEQ..=opcodes::JSR).contains(&opcode)
        || opcode == opcodes::IFNULL
        || opcode == opcodes::IFNONNULL
}

/// Code to splice in front of the instruction at `offset`.
#[derive(Clone, Debug)]
pub(crate) struct Insertion {
    pub(crate) offset: usize,
    pub(crate) bytes: Vec<u8>,
    /// When set, branches, handlers and frames that pointed at the instruction
    /// now point at the inserted code instead.
    pub(crate) captures_targets: bool,
}

/// Old-to-new offset mapping produced by one layout pass.
struct Layout {
    /// Old instruction offset -> (start of inserted code, new instruction offset).
    positions: BTreeMap<usize, (usize, usize)>,
    captures: BTreeMap<usize, bool>,
    old_len: usize,
    new_len: usize,
}

impl Layout {
    /// New position of a branch target, handler or frame at `old`.
    fn target(&self, old: usize) -> Result<usize> {
        if old == self.old_len {
            return Ok(self.new_len);
        }
        let (inserted, instruction) = self
            .positions
            .get(&old)
            .copied()
            .with_context(|| format!("offset {old} is not an instruction boundary"))?;
        if self.captures.get(&old).copied().unwrap_or(false) {
            Ok(inserted)
        } else {
            Ok(instruction)
        }
    }

    /// New position of the instruction itself, ignoring inserted code.
    fn instruction(&self, old: usize) -> Result<usize> {
        self.positions
            .get(&old)
            .map(|(_, instruction)| *instruction)
            .with_context(|| format!("offset {old} is not an instruction boundary"))
    }

    fn target_u16(&self, old: u16) -> Result<u16> {
        narrow(self.target(old as usize)?)
    }
}

fn narrow(value: usize) -> Result<u16> {
    u16::try_from(value).context("offset exceeds 65535")
}

/// Splice `insertions` into `code`, relocating everything that refers to code offsets.
///
/// Attributes that carry offsets this module does not decode (code-level type
/// annotations) are dropped.
pub(crate) fn insert_code(
    code: &Code,
    insertions: &[Insertion],
    pool: &ConstantPool,
) -> Result<Code> {
    let offsets = instruction_offsets(&code.code)?;
    let mut pending: BTreeMap<usize, Vec<&Insertion>> = BTreeMap::new();
    for insertion in insertions {
        pending.entry(insertion.offset).or_default().push(insertion);
    }

    let mut layout = Layout {
        positions: BTreeMap::new(),
        captures: BTreeMap::new(),
        old_len: code.code.len(),
        new_len: 0,
    };
    let mut cursor = 0usize;
    for (index, &offset) in offsets.iter().enumerate() {
        let inserted_at = cursor;
        if let Some(group) = pending.get(&offset) {
            for insertion in group {
                cursor += insertion.bytes.len();
                if insertion.captures_targets {
                    layout.captures.insert(offset, true);
                }
            }
        }
        layout.positions.insert(offset, (inserted_at, cursor));
        let next = offsets.get(index + 1).copied().unwrap_or(code.code.len());
        cursor += relocated_length(&code.code, offset, next - offset, cursor);
    }
    layout.new_len = cursor;
    for offset in pending.keys() {
        if !layout.positions.contains_key(offset) {
            anyhow::bail!("insertion offset {} is not an instruction boundary", offset);
        }
    }
    if layout.new_len > u16::MAX as usize {
        anyhow::bail!("method code grows to {} bytes", layout.new_len);
    }

    let mut output = Vec::with_capacity(layout.new_len);
    for (index, &offset) in offsets.iter().enumerate() {
        if let Some(group) = pending.get(&offset) {
            for insertion in group {
                output.extend_from_slice(&insertion.bytes);
            }
        }
        let next = offsets.get(index + 1).copied().unwrap_or(code.code.len());
        relocate_instruction(&code.code[offset..next], offset, &layout, &mut output)
            .with_context(|| format!("relocate instruction at {offset}"))?;
    }
    debug_assert_eq!(output.len(), layout.new_len);

    let mut exception_table = Vec::with_capacity(code.exception_table.len());
    for entry in &code.exception_table {
        exception_table.push(ExceptionEntry {
            start_pc: layout.target_u16(entry.start_pc)?,
            end_pc: layout.target_u16(entry.end_pc)?,
            handler_pc: layout.target_u16(entry.handler_pc)?,
            catch_type: entry.catch_type,
        });
    }

    let mut attributes = Vec::with_capacity(code.attributes.len());
    for attribute in &code.attributes {
        let name = pool.utf8(attribute.name_index)?;
        let info = match name {
            "LineNumberTable" => relocate_line_numbers(&attribute.info, &layout)?,
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                relocate_local_variables(&attribute.info, &layout)?
            }
            "StackMapTable" => relocate_stack_map(&attribute.info, &layout)
                .context("relocate StackMapTable")?,
            "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                tracing::debug!(attribute = name, "dropping code attribute with offsets");
                continue;
            }
            _ => attribute.info.clone(),
        };
        attributes.push(Attribute {
            name_index: attribute.name_index,
            info,
        });
    }

    Ok(Code {
        max_stack: code.max_stack,
        max_locals: code.max_locals,
        code: output,
        exception_table,
        attributes,
    })
}

/// Length of the instruction once moved to `new_offset`; only switch padding changes.
fn relocated_length(code: &[u8], old_offset: usize, old_len: usize, new_offset: usize) -> usize {
    match code[old_offset] {
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => {
            old_len - padding(old_offset) + padding(new_offset)
        }
        _ => old_len,
    }
}

fn relocate_instruction(
    instruction: &[u8],
    old_offset: usize,
    layout: &Layout,
    output: &mut Vec<u8>,
) -> Result<()> {
    let opcode = instruction[0];
    let new_offset = output.len();
    let relative = |delta: i64| -> Result<i64> {
        let target = usize::try_from(old_offset as i64 + delta).context("negative branch target")?;
        Ok(layout.target(target)? as i64 - new_offset as i64)
    };

    if is_short_branch(opcode) {
        let delta = relative(read_i16(instruction, 1)? as i64)?;
        let delta = i16::try_from(delta).context("branch offset exceeds 16 bits")?;
        output.push(opcode);
        output.extend_from_slice(&delta.to_be_bytes());
        return Ok(());
    }

    match opcode {
        opcodes::GOTO_W | opcodes::JSR_W => {
            let delta = relative(read_i32(instruction, 1)? as i64)?;
            let delta = i32::try_from(delta).context("branch offset exceeds 32 bits")?;
            output.push(opcode);
            output.extend_from_slice(&delta.to_be_bytes());
        }
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => {
            let old_base = 1 + padding(old_offset);
            output.push(opcode);
            output.extend(std::iter::repeat_n(0u8, padding(new_offset)));
            let default = relative(read_i32(instruction, old_base)? as i64)?;
            output.extend_from_slice(&(default as i32).to_be_bytes());
            if opcode == opcodes::TABLESWITCH {
                let low = read_i32(instruction, old_base + 4)?;
                let high = read_i32(instruction, old_base + 8)?;
                output.extend_from_slice(&low.to_be_bytes());
                output.extend_from_slice(&high.to_be_bytes());
                let count = (high as i64 - low as i64 + 1) as usize;
                for index in 0..count {
                    let jump = read_i32(instruction, old_base + 12 + index * 4)?;
                    output.extend_from_slice(&(relative(jump as i64)? as i32).to_be_bytes());
                }
            } else {
                let npairs = read_i32(instruction, old_base + 4)?;
                output.extend_from_slice(&npairs.to_be_bytes());
                for index in 0..npairs as usize {
                    let pair = old_base + 8 + index * 8;
                    let key = read_i32(instruction, pair)?;
                    let jump = read_i32(instruction, pair + 4)?;
                    output.extend_from_slice(&key.to_be_bytes());
                    output.extend_from_slice(&(relative(jump as i64)? as i32).to_be_bytes());
                }
            }
        }
        _ => output.extend_from_slice(instruction),
    }
    Ok(())
}

fn relocate_line_numbers(info: &[u8], layout: &Layout) -> Result<Vec<u8>> {
    let mut reader = ClassReader::new(info);
    let count = reader.read_u16()?;
    let mut bytes = Vec::with_capacity(info.len());
    write_u16(&mut bytes, count);
    for _ in 0..count {
        let start_pc = reader.read_u16()?;
        let line = reader.read_u16()?;
        write_u16(&mut bytes, layout.target_u16(start_pc)?);
        write_u16(&mut bytes, line);
    }
    Ok(bytes)
}

fn relocate_local_variables(info: &[u8], layout: &Layout) -> Result<Vec<u8>> {
    let mut reader = ClassReader::new(info);
    let count = reader.read_u16()?;
    let mut bytes = Vec::with_capacity(info.len());
    write_u16(&mut bytes, count);
    for _ in 0..count {
        let start_pc = reader.read_u16()? as usize;
        let length = reader.read_u16()? as usize;
        let name_index = reader.read_u16()?;
        let descriptor_index = reader.read_u16()?;
        let index = reader.read_u16()?;
        let new_start = layout.target(start_pc)?;
        let new_end = layout.target(start_pc + length)?;
        write_u16(&mut bytes, narrow(new_start)?);
        write_u16(&mut bytes, narrow(new_end - new_start)?);
        write_u16(&mut bytes, name_index);
        write_u16(&mut bytes, descriptor_index);
        write_u16(&mut bytes, index);
    }
    Ok(bytes)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VerificationType {
    Simple(u8),
    Object(u16),
    Uninitialized(u16),
}

impl VerificationType {
    fn parse(reader: &mut ClassReader<'_>) -> Result<Self> {
        let tag = reader.read_u8()?;
        Ok(match tag {
            0..=6 => VerificationType::Simple(tag),
            7 => VerificationType::Object(reader.read_u16()?),
            8 => VerificationType::Uninitialized(reader.read_u16()?),
            _ => anyhow::bail!("unknown verification type tag {}", tag),
        })
    }

    fn parse_many(reader: &mut ClassReader<'_>, count: usize) -> Result<Vec<Self>> {
        (0..count).map(|_| Self::parse(reader)).collect()
    }

    /// `new` instructions never receive inserted code in front of them for
    /// frame purposes, so uninitialized types follow the instruction itself.
    fn relocate(self, layout: &Layout) -> Result<Self> {
        Ok(match self {
            VerificationType::Uninitialized(offset) => {
                VerificationType::Uninitialized(narrow(layout.instruction(offset as usize)?)?)
            }
            other => other,
        })
    }

    fn write(self, bytes: &mut Vec<u8>) {
        match self {
            VerificationType::Simple(tag) => bytes.push(tag),
            VerificationType::Object(index) => {
                bytes.push(7);
                write_u16(bytes, index);
            }
            VerificationType::Uninitialized(offset) => {
                bytes.push(8);
                write_u16(bytes, offset);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum FrameBody {
    Same,
    SameLocals1(VerificationType),
    Chop(u8),
    Append(Vec<VerificationType>),
    Full {
        locals: Vec<VerificationType>,
        stack: Vec<VerificationType>,
    },
}

fn relocate_stack_map(info: &[u8], layout: &Layout) -> Result<Vec<u8>> {
    let mut reader = ClassReader::new(info);
    let count = reader.read_u16()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut previous: Option<usize> = None;
    for _ in 0..count {
        let frame_type = reader.read_u8()?;
        let (delta, body) = match frame_type {
            0..=63 => (frame_type as usize, FrameBody::Same),
            64..=127 => (
                (frame_type - 64) as usize,
                FrameBody::SameLocals1(VerificationType::parse(&mut reader)?),
            ),
            247 => {
                let delta = reader.read_u16()? as usize;
                (delta, FrameBody::SameLocals1(VerificationType::parse(&mut reader)?))
            }
            248..=250 => (reader.read_u16()? as usize, FrameBody::Chop(251 - frame_type)),
            251 => (reader.read_u16()? as usize, FrameBody::Same),
            252..=254 => {
                let delta = reader.read_u16()? as usize;
                let locals =
                    VerificationType::parse_many(&mut reader, (frame_type - 251) as usize)?;
                (delta, FrameBody::Append(locals))
            }
            255 => {
                let delta = reader.read_u16()? as usize;
                let local_count = reader.read_u16()? as usize;
                let locals = VerificationType::parse_many(&mut reader, local_count)?;
                let stack_count = reader.read_u16()? as usize;
                let stack = VerificationType::parse_many(&mut reader, stack_count)?;
                (delta, FrameBody::Full { locals, stack })
            }
            _ => anyhow::bail!("reserved stack map frame type {}", frame_type),
        };
        let offset = match previous {
            None => delta,
            Some(previous) => previous + delta + 1,
        };
        previous = Some(offset);
        frames.push((offset, body));
    }

    let mut bytes = Vec::with_capacity(info.len() + 8);
    write_u16(&mut bytes, count);
    let mut previous: Option<usize> = None;
    for (offset, body) in frames {
        let new_offset = layout.target(offset)?;
        let delta = match previous {
            None => new_offset,
            Some(previous) => new_offset
                .checked_sub(previous + 1)
                .context("stack map frames out of order")?,
        };
        previous = Some(new_offset);
        write_frame(&mut bytes, delta, body, layout)?;
    }
    Ok(bytes)
}

fn write_frame(bytes: &mut Vec<u8>, delta: usize, body: FrameBody, layout: &Layout) -> Result<()> {
    let wide_delta = narrow(delta)?;
    match body {
        FrameBody::Same if delta <= 63 => bytes.push(delta as u8),
        FrameBody::Same => {
            bytes.push(251);
            write_u16(bytes, wide_delta);
        }
        FrameBody::SameLocals1(item) => {
            if delta <= 63 {
                bytes.push(64 + delta as u8);
            } else {
                bytes.push(247);
                write_u16(bytes, wide_delta);
            }
            item.relocate(layout)?.write(bytes);
        }
        FrameBody::Chop(count) => {
            bytes.push(251 - count);
            write_u16(bytes, wide_delta);
        }
        FrameBody::Append(locals) => {
            bytes.push(251 + locals.len() as u8);
            write_u16(bytes, wide_delta);
            for item in locals {
                item.relocate(layout)?.write(bytes);
            }
        }
        FrameBody::Full { locals, stack } => {
            bytes.push(255);
            write_u16(bytes, wide_delta);
            write_u16(bytes, locals.len() as u16);
            for item in locals {
                item.relocate(layout)?.write(bytes);
            }
            write_u16(bytes, stack.len() as u16);
            for item in stack {
                item.relocate(layout)?.write(bytes);
            }
        }
    }
    Ok(())
}
