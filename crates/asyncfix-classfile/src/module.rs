//! Class-file model
//!
//! Format:
//! - Header: magic (u4) + minor version (u2) + major version (u2)
//! - Constant pool
//! - Access flags, this class, super class, interfaces
//! - Fields, methods (each with attributes)
//! - Class attributes
//!
//! Attributes other than `Code` are kept as raw bytes so that decoding and
//! re-encoding a module never loses information.

use crate::constants::ConstantPool;
use crate::encoder::{ByteReader, ByteWriter, DecodeError};

/// Magic number for class files
pub const MAGIC: u32 = 0xCAFE_BABE;

/// Major version written by the builder (Java 8)
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

/// Name of the universal base type
pub const OBJECT: &str = "java/lang/Object";

/// Name of instance initializers
pub const CONSTRUCTOR_NAME: &str = "<init>";

/// Descriptor of the no-argument constructor
pub const NO_ARG_DESCRIPTOR: &str = "()V";

/// Access flags
pub mod access {
    /// `ACC_PUBLIC`
    pub const PUBLIC: u16 = 0x0001;
    /// `ACC_PRIVATE`
    pub const PRIVATE: u16 = 0x0002;
    /// `ACC_PROTECTED`
    pub const PROTECTED: u16 = 0x0004;
    /// `ACC_STATIC`
    pub const STATIC: u16 = 0x0008;
    /// `ACC_FINAL`
    pub const FINAL: u16 = 0x0010;
    /// `ACC_SUPER` (classes) / `ACC_SYNCHRONIZED` (methods)
    pub const SUPER: u16 = 0x0020;
    /// `ACC_SYNCHRONIZED`
    pub const SYNCHRONIZED: u16 = 0x0020;
    /// `ACC_VOLATILE`
    pub const VOLATILE: u16 = 0x0040;
    /// `ACC_TRANSIENT`
    pub const TRANSIENT: u16 = 0x0080;
    /// `ACC_NATIVE`
    pub const NATIVE: u16 = 0x0100;
    /// `ACC_INTERFACE`
    pub const INTERFACE: u16 = 0x0200;
    /// `ACC_ABSTRACT`
    pub const ABSTRACT: u16 = 0x0400;
    /// `ACC_SYNTHETIC`
    pub const SYNTHETIC: u16 = 0x1000;
    /// `ACC_ENUM`
    pub const ENUM: u16 = 0x4000;

    /// Render class/member flags as keywords, in declaration order
    pub fn keywords(flags: u16) -> Vec<&'static str> {
        const NAMES: [(u16, &str); 9] = [
            (PUBLIC, "public"),
            (PRIVATE, "private"),
            (PROTECTED, "protected"),
            (STATIC, "static"),
            (FINAL, "final"),
            (NATIVE, "native"),
            (ABSTRACT, "abstract"),
            (SYNTHETIC, "synthetic"),
            (ENUM, "enum"),
        ];
        NAMES
            .iter()
            .filter(|(bit, _)| flags & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// An attribute kept as raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Index of the `Utf8` attribute name
    pub name_index: u16,
    /// Raw attribute payload
    pub info: Vec<u8>,
}

impl Attribute {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u16(self.name_index);
        writer.emit_u32(self.info.len() as u32);
        writer.emit_bytes(&self.info);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let name_index = reader.read_u16()?;
        let len = reader.read_u32()? as usize;
        let info = reader.read_bytes(len)?;
        Ok(Self { name_index, info })
    }
}

fn encode_attributes(attributes: &[Attribute], writer: &mut ByteWriter) {
    writer.emit_u16(attributes.len() as u16);
    for attribute in attributes {
        attribute.encode(writer);
    }
}

fn decode_attributes(reader: &mut ByteReader<'_>) -> Result<Vec<Attribute>, DecodeError> {
    let count = reader.read_u16()? as usize;
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        attributes.push(Attribute::decode(reader)?);
    }
    Ok(attributes)
}

/// A field or method declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Access flags
    pub access_flags: u16,
    /// Index of the `Utf8` name
    pub name_index: u16,
    /// Index of the `Utf8` descriptor
    pub descriptor_index: u16,
    /// Member attributes
    pub attributes: Vec<Attribute>,
}

impl Member {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u16(self.access_flags);
        writer.emit_u16(self.name_index);
        writer.emit_u16(self.descriptor_index);
        encode_attributes(&self.attributes, writer);
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            access_flags: reader.read_u16()?,
            name_index: reader.read_u16()?,
            descriptor_index: reader.read_u16()?,
            attributes: decode_attributes(reader)?,
        })
    }

    /// Find an attribute by name
    pub fn attribute<'a>(&'a self, pool: &ConstantPool, name: &str) -> Option<&'a Attribute> {
        self.attributes
            .iter()
            .find(|a| pool.get_utf8(a.name_index) == Some(name))
    }

    /// Decode this member's `Code` attribute, if it has one
    pub fn code(&self, pool: &ConstantPool) -> Result<Option<Code>, DecodeError> {
        self.attribute(pool, "Code")
            .map(|attribute| Code::decode(&attribute.info))
            .transpose()
    }
}

/// Exception table entry of a `Code` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of the protected range (inclusive)
    pub start_pc: u16,
    /// End of the protected range (exclusive)
    pub end_pc: u16,
    /// Handler entry point
    pub handler_pc: u16,
    /// `Class` index of the caught type, 0 for any
    pub catch_type: u16,
}

/// Decoded `Code` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// Number of local variable slots
    pub max_locals: u16,
    /// Instruction bytes
    pub code: Vec<u8>,
    /// Exception handlers
    pub exception_table: Vec<ExceptionHandler>,
    /// Nested attributes (line numbers, stack maps, ...)
    pub attributes: Vec<Attribute>,
}

impl Code {
    /// Encode as the payload of a `Code` attribute
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(12 + self.code.len());
        writer.emit_u16(self.max_stack);
        writer.emit_u16(self.max_locals);
        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);
        writer.emit_u16(self.exception_table.len() as u16);
        for handler in &self.exception_table {
            writer.emit_u16(handler.start_pc);
            writer.emit_u16(handler.end_pc);
            writer.emit_u16(handler.handler_pc);
            writer.emit_u16(handler.catch_type);
        }
        encode_attributes(&self.attributes, &mut writer);
        writer.into_bytes()
    }

    /// Decode the payload of a `Code` attribute
    pub fn decode(info: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(info);
        let max_stack = reader.read_u16()?;
        let max_locals = reader.read_u16()?;
        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?;
        let handler_count = reader.read_u16()? as usize;
        let mut exception_table = Vec::with_capacity(handler_count);
        for _ in 0..handler_count {
            exception_table.push(ExceptionHandler {
                start_pc: reader.read_u16()?,
                end_pc: reader.read_u16()?,
                handler_pc: reader.read_u16()?,
                catch_type: reader.read_u16()?,
            });
        }
        let attributes = decode_attributes(&mut reader)?;
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }
}

/// A decoded class file
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    /// Minor version
    pub minor_version: u16,
    /// Major version
    pub major_version: u16,
    /// Constant pool
    pub constants: ConstantPool,
    /// Class access flags
    pub access_flags: u16,
    /// `Class` index of this type
    pub this_class: u16,
    /// `Class` index of the super type (0 only for the root type)
    pub super_class: u16,
    /// `Class` indices of declared interfaces
    pub interfaces: Vec<u16>,
    /// Field declarations
    pub fields: Vec<Member>,
    /// Method declarations
    pub methods: Vec<Member>,
    /// Class attributes
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Create a public class with the given internal name and super type
    pub fn new(name: &str, super_name: &str) -> Self {
        let mut constants = ConstantPool::new();
        let this_class = constants.class(name);
        let super_class = constants.class(super_name);
        Self {
            minor_version: 0,
            major_version: DEFAULT_MAJOR_VERSION,
            constants,
            access_flags: access::PUBLIC | access::SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Declared internal name
    pub fn name(&self) -> Option<&str> {
        self.constants.class_name(self.this_class)
    }

    /// Declared super type, `None` for the root type
    pub fn super_name(&self) -> Option<&str> {
        self.constants.class_name(self.super_class)
    }

    /// Declared interfaces that resolve to names
    pub fn interface_names(&self) -> Vec<&str> {
        self.interfaces
            .iter()
            .filter_map(|&index| self.constants.class_name(index))
            .collect()
    }

    /// Check if this type is an interface
    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    /// Name of a field or method
    pub fn member_name(&self, member: &Member) -> Option<&str> {
        self.constants.get_utf8(member.name_index)
    }

    /// Descriptor of a field or method
    pub fn member_descriptor(&self, member: &Member) -> Option<&str> {
        self.constants.get_utf8(member.descriptor_index)
    }

    /// Find a method by name and descriptor
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Member> {
        self.methods.iter().find(|m| {
            self.member_name(m) == Some(name) && self.member_descriptor(m) == Some(descriptor)
        })
    }

    /// Encode to class-file bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(256);
        writer.emit_u32(MAGIC);
        writer.emit_u16(self.minor_version);
        writer.emit_u16(self.major_version);

        self.constants.encode(&mut writer);

        writer.emit_u16(self.access_flags);
        writer.emit_u16(self.this_class);
        writer.emit_u16(self.super_class);
        writer.emit_u16(self.interfaces.len() as u16);
        for &interface in &self.interfaces {
            writer.emit_u16(interface);
        }

        writer.emit_u16(self.fields.len() as u16);
        for field in &self.fields {
            field.encode(&mut writer);
        }

        writer.emit_u16(self.methods.len() as u16);
        for method in &self.methods {
            method.encode(&mut writer);
        }

        encode_attributes(&self.attributes, &mut writer);
        writer.into_bytes()
    }

    /// Decode class-file bytes
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(data);
        let (minor_version, major_version) = read_header(&mut reader)?;
        let constants = ConstantPool::decode(&mut reader)?;

        let access_flags = reader.read_u16()?;
        let this_class = reader.read_u16()?;
        let super_class = reader.read_u16()?;

        let interface_count = reader.read_u16()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count);
        for _ in 0..interface_count {
            interfaces.push(reader.read_u16()?);
        }

        let field_count = reader.read_u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(Member::decode(&mut reader)?);
        }

        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(Member::decode(&mut reader)?);
        }

        let attributes = decode_attributes(&mut reader)?;
        if reader.has_more() {
            return Err(DecodeError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }
}

fn read_header(reader: &mut ByteReader<'_>) -> Result<(u16, u16), DecodeError> {
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic(magic));
    }
    let minor = reader.read_u16()?;
    let major = reader.read_u16()?;
    Ok((minor, major))
}
