//! Class file fixtures and bytecode inspection for unit tests.
//!
//! Most fixtures are assembled byte by byte so tests need no JDK; rewritten
//! output is read back through `jclassfile` to check it independently.
//! [`JvmTestHarness`] compiles real sources and runs them when a JDK is found.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use jclassfile::constant_pool::ConstantPool;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use crate::bytecode::{Code, instruction_offsets};
use crate::classfile::{ACC_PUBLIC, ACC_STATIC, ClassFile};
use crate::opcodes;

const ACC_SUPER: u16 = 0x0020;

pub(crate) fn high(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn low(value: u16) -> u8 {
    (value & 0xff) as u8
}

/// Builds minimal, structurally valid class files.
pub(crate) struct ClassFileBuilder {
    pool: Vec<u8>,
    pool_slots: u16,
    pool_indices: HashMap<Vec<u8>, u16>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    super_name: String,
    interfaces: Vec<u16>,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
}

impl ClassFileBuilder {
    pub(crate) fn new(name: &str, super_name: &str) -> Self {
        let mut builder = Self {
            pool: Vec::new(),
            pool_slots: 1,
            pool_indices: HashMap::new(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class: 0,
            super_class: 0,
            super_name: super_name.to_string(),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class(super_name);
        builder
    }

    pub(crate) fn set_access(&mut self, access_flags: u16) {
        self.access_flags = access_flags;
    }

    pub(crate) fn clear_super_class(&mut self) {
        self.super_class = 0;
    }

    pub(crate) fn add_interface(&mut self, name: &str) {
        let index = self.class(name);
        self.interfaces.push(index);
    }

    pub(crate) fn add_long_constant(&mut self, value: i64) -> u16 {
        let mut entry = vec![5];
        entry.extend_from_slice(&value.to_be_bytes());
        self.constant(entry, 2)
    }

    /// `public <init>()V` calling the superclass constructor.
    pub(crate) fn add_default_constructor(&mut self) {
        let super_name = self.super_name.clone();
        let constructor = self.method_ref(&super_name, "<init>", "()V");
        let code = vec![
            opcodes::ALOAD_0,
            opcodes::INVOKESPECIAL,
            high(constructor),
            low(constructor),
            opcodes::RETURN,
        ];
        self.add_method(ACC_PUBLIC, "<init>", "()V", code, 1, 1);
    }

    pub(crate) fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        max_stack: u16,
        max_locals: u16,
    ) {
        let code = Code {
            max_stack,
            max_locals,
            code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        let info = code.to_bytes().expect("encode code");
        let code_name = self.utf8("Code");
        let mut method = self.member_header(access_flags, name, descriptor);
        method.extend_from_slice(&1u16.to_be_bytes());
        method.extend_from_slice(&code_name.to_be_bytes());
        method.extend_from_slice(&(info.len() as u32).to_be_bytes());
        method.extend_from_slice(&info);
        self.methods.push(method);
    }

    /// Declare a static field and return a field reference to it.
    pub(crate) fn add_static_field(&mut self, name: &str, descriptor: &str) -> u16 {
        let mut field = self.member_header(ACC_STATIC, name, descriptor);
        field.extend_from_slice(&0u16.to_be_bytes());
        self.fields.push(field);
        let class_index = self.this_class;
        let name_and_type = self.name_and_type(name, descriptor);
        let mut entry = vec![9];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type.to_be_bytes());
        self.constant(entry, 1)
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&52u16.to_be_bytes());
        bytes.extend_from_slice(&self.pool_slots.to_be_bytes());
        bytes.extend_from_slice(&self.pool);
        bytes.extend_from_slice(&self.access_flags.to_be_bytes());
        bytes.extend_from_slice(&self.this_class.to_be_bytes());
        bytes.extend_from_slice(&self.super_class.to_be_bytes());
        bytes.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for interface in &self.interfaces {
            bytes.extend_from_slice(&interface.to_be_bytes());
        }
        for members in [&self.fields, &self.methods] {
            bytes.extend_from_slice(&(members.len() as u16).to_be_bytes());
            for member in members {
                bytes.extend_from_slice(member);
            }
        }
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes
    }

    fn member_header(&mut self, access_flags: u16, name: &str, descriptor: &str) -> Vec<u8> {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut member = Vec::new();
        member.extend_from_slice(&access_flags.to_be_bytes());
        member.extend_from_slice(&name_index.to_be_bytes());
        member.extend_from_slice(&descriptor_index.to_be_bytes());
        member
    }

    fn constant(&mut self, entry: Vec<u8>, slots: u16) -> u16 {
        if let Some(index) = self.pool_indices.get(&entry) {
            return *index;
        }
        let index = self.pool_slots;
        self.pool.extend_from_slice(&entry);
        self.pool_slots += slots;
        self.pool_indices.insert(entry, index);
        index
    }

    fn utf8(&mut self, value: &str) -> u16 {
        let mut entry = vec![1];
        entry.extend_from_slice(&(value.len() as u16).to_be_bytes());
        entry.extend_from_slice(value.as_bytes());
        self.constant(entry, 1)
    }

    fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut entry = vec![7];
        entry.extend_from_slice(&name_index.to_be_bytes());
        self.constant(entry, 1)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut entry = vec![12];
        entry.extend_from_slice(&name_index.to_be_bytes());
        entry.extend_from_slice(&descriptor_index.to_be_bytes());
        self.constant(entry, 1)
    }

    fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type = self.name_and_type(name, descriptor);
        let mut entry = vec![10];
        entry.extend_from_slice(&class_index.to_be_bytes());
        entry.extend_from_slice(&name_and_type.to_be_bytes());
        self.constant(entry, 1)
    }
}

/// Concrete class with a public no-arg constructor implementing `interface`.
pub(crate) fn implementing_class(name: &str, interface: &str) -> (String, Vec<u8>) {
    let mut builder = ClassFileBuilder::new(name, "java/lang/Object");
    builder.add_interface(interface);
    builder.add_default_constructor();
    (name.to_string(), builder.finish())
}

pub(crate) fn plain_class(name: &str) -> (String, Vec<u8>) {
    let mut builder = ClassFileBuilder::new(name, "java/lang/Object");
    builder.add_default_constructor();
    (name.to_string(), builder.finish())
}

/// Write a class under `root` at its package path.
pub(crate) fn write_class(root: &Path, (name, bytes): &(String, Vec<u8>)) {
    let path = root.join(format!("{name}.class"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create class dir");
    }
    fs::write(path, bytes).expect("write class");
}

pub(crate) fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) {
    let file = fs::File::create(path).expect("create jar");
    let mut writer = zip::ZipWriter::new(file);
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start jar entry");
        writer.write_all(data).expect("write jar entry");
    }
    writer.finish().expect("finish jar");
}

/// One invoke instruction found in a method body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) opcode: u8,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Invoke instructions of the first method called `method`, read with `jclassfile`.
pub(crate) fn invocations(bytes: &[u8], method: &str) -> Vec<Invocation> {
    let class_file = jclassfile::class_file::parse(bytes).expect("jclassfile parse");
    let pool = class_file.constant_pool();
    let info = class_file
        .methods()
        .iter()
        .find(|info| utf8(pool, info.name_index()) == method)
        .expect("method present");
    let code = info
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            jclassfile::attributes::Attribute::Code { code, .. } => Some(code.clone()),
            _ => None,
        })
        .expect("code attribute");

    let mut calls = Vec::new();
    for offset in instruction_offsets(&code).expect("instruction offsets") {
        let opcode = code[offset];
        if !matches!(
            opcode,
            opcodes::INVOKEVIRTUAL
                | opcodes::INVOKESPECIAL
                | opcodes::INVOKESTATIC
                | opcodes::INVOKEINTERFACE
        ) {
            continue;
        }
        let index = u16::from_be_bytes([code[offset + 1], code[offset + 2]]);
        let (class_index, name_and_type_index) = match &pool[index as usize] {
            ConstantPool::Methodref {
                class_index,
                name_and_type_index,
            }
            | ConstantPool::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index),
            _ => panic!("unexpected invoke operand at {index}"),
        };
        let ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } = &pool[name_and_type_index as usize]
        else {
            panic!("unexpected name and type entry");
        };
        calls.push(Invocation {
            opcode,
            owner: class_name(pool, class_index),
            name: utf8(pool, *name_index),
            descriptor: utf8(pool, *descriptor_index),
        });
    }
    calls
}

/// Names of every interface method reference in the constant pool.
pub(crate) fn interface_method_refs(bytes: &[u8]) -> Vec<String> {
    let class_file = jclassfile::class_file::parse(bytes).expect("jclassfile parse");
    let pool = class_file.constant_pool();
    pool.iter()
        .filter_map(|entry| match entry {
            ConstantPool::InterfaceMethodref {
                name_and_type_index,
                ..
            } => match &pool[*name_and_type_index as usize] {
                ConstantPool::NameAndType { name_index, .. } => Some(utf8(pool, *name_index)),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Decoded `Code` of the first method called `method`.
pub(crate) fn code_of(bytes: &[u8], method: &str) -> Code {
    let class = ClassFile::parse(bytes).expect("parse class");
    let member = class
        .methods
        .iter()
        .find(|member| class.method_name(member).expect("method name") == method)
        .expect("method present");
    let position = member
        .attribute_position(&class.constant_pool, "Code")
        .expect("code attribute");
    Code::parse(&member.attributes[position].info).expect("parse code")
}

fn utf8(pool: &[ConstantPool], index: u16) -> String {
    match &pool[index as usize] {
        ConstantPool::Utf8 { value } => value.clone(),
        _ => panic!("expected utf8 at {index}"),
    }
}

fn class_name(pool: &[ConstantPool], index: u16) -> String {
    match &pool[index as usize] {
        ConstantPool::Class { name_index } => utf8(pool, *name_index),
        _ => panic!("expected class at {index}"),
    }
}

/// Source file definition for compilation.
pub(crate) struct SourceFile {
    pub(crate) path: String,
    pub(crate) contents: String,
}

/// Compiled classes, kept alive with their temp dir.
pub(crate) struct CompileOutput {
    temp_dir: TempDir,
    classes_dir: PathBuf,
}

impl CompileOutput {
    pub(crate) fn classes_dir(&self) -> &Path {
        &self.classes_dir
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Compiles Java sources with `javac` and runs classes on a verifying JVM.
pub(crate) struct JvmTestHarness {
    javac: PathBuf,
    java: PathBuf,
}

impl JvmTestHarness {
    /// Tools from `JAVA_HOME`, else from `PATH`; `None` when no JDK answers.
    pub(crate) fn detect() -> Option<Self> {
        let harness = match std::env::var("JAVA_HOME") {
            Ok(home) => Self {
                javac: jdk_tool(&home, "javac"),
                java: jdk_tool(&home, "java"),
            },
            Err(_) => Self {
                javac: PathBuf::from("javac"),
                java: PathBuf::from("java"),
            },
        };
        let mut probe = Command::new(&harness.javac);
        probe.arg("-version");
        run_command(probe, "javac").ok()?;
        Some(harness)
    }

    pub(crate) fn compile(&self, sources: &[SourceFile]) -> Result<CompileOutput> {
        let temp_dir = tempfile::tempdir().context("create temp dir")?;
        let src_dir = temp_dir.path().join("src");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(&classes_dir).context("create classes dir")?;

        let mut source_paths = Vec::new();
        for source in sources {
            let path = src_dir.join(&source.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create source parent dir")?;
            }
            fs::write(&path, source.contents.as_bytes()).context("write source file")?;
            source_paths.push(path);
        }

        let mut command = Command::new(&self.javac);
        command.arg("-d").arg(&classes_dir);
        command.args(&source_paths);
        run_command(command, "javac")?;

        Ok(CompileOutput {
            temp_dir,
            classes_dir,
        })
    }

    /// Run `main_class` with full bytecode verification and return its stdout.
    pub(crate) fn run(&self, classpath: &[PathBuf], main_class: &str) -> Result<String> {
        let mut command = Command::new(&self.java);
        command
            .arg("-Xverify:all")
            .arg("-classpath")
            .arg(classpath_arg(classpath))
            .arg(main_class);
        run_command(command, "java")
    }
}

fn jdk_tool(home: &str, name: &str) -> PathBuf {
    let mut path = PathBuf::from(home);
    path.push("bin");
    path.push(name);
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}

fn classpath_arg(paths: &[PathBuf]) -> String {
    let sep = if cfg!(windows) { ";" } else { ":" };
    paths
        .iter()
        .map(|path| path.to_string_lossy())
        .collect::<Vec<_>>()
        .join(sep)
}

fn run_command(mut command: Command, label: &str) -> Result<String> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{label} failed: stdout={stdout} stderr={stderr}");
    }
    Ok(stdout)
}
