//! Constant pool for class files
//!
//! The pool is 1-indexed. Slot 0 is never used, and `Long`/`Double` entries
//! occupy two slots, the second of which is unusable as well. Both kinds of
//! hole are stored as `None`.

use crate::encoder::{
    decode_modified_utf8, encode_modified_utf8, ByteReader, ByteWriter, DecodeError,
};

/// Constant pool tags
pub mod tags {
    /// `CONSTANT_Utf8`
    pub const UTF8: u8 = 1;
    /// `CONSTANT_Integer`
    pub const INTEGER: u8 = 3;
    /// `CONSTANT_Float`
    pub const FLOAT: u8 = 4;
    /// `CONSTANT_Long`
    pub const LONG: u8 = 5;
    /// `CONSTANT_Double`
    pub const DOUBLE: u8 = 6;
    /// `CONSTANT_Class`
    pub const CLASS: u8 = 7;
    /// `CONSTANT_String`
    pub const STRING: u8 = 8;
    /// `CONSTANT_Fieldref`
    pub const FIELD_REF: u8 = 9;
    /// `CONSTANT_Methodref`
    pub const METHOD_REF: u8 = 10;
    /// `CONSTANT_InterfaceMethodref`
    pub const INTERFACE_METHOD_REF: u8 = 11;
    /// `CONSTANT_NameAndType`
    pub const NAME_AND_TYPE: u8 = 12;
    /// `CONSTANT_MethodHandle`
    pub const METHOD_HANDLE: u8 = 15;
    /// `CONSTANT_MethodType`
    pub const METHOD_TYPE: u8 = 16;
    /// `CONSTANT_Dynamic`
    pub const DYNAMIC: u8 = 17;
    /// `CONSTANT_InvokeDynamic`
    pub const INVOKE_DYNAMIC: u8 = 18;
    /// `CONSTANT_Module`
    pub const MODULE: u8 = 19;
    /// `CONSTANT_Package`
    pub const PACKAGE: u8 = 20;

    /// Size in bytes of an entry's payload (excluding the tag), or `None`
    /// for `Utf8` (length-prefixed) and unknown tags
    pub fn fixed_payload_len(tag: u8) -> Option<usize> {
        match tag {
            CLASS | STRING | METHOD_TYPE | MODULE | PACKAGE => Some(2),
            METHOD_HANDLE => Some(3),
            INTEGER | FLOAT | FIELD_REF | METHOD_REF | INTERFACE_METHOD_REF | NAME_AND_TYPE
            | DYNAMIC | INVOKE_DYNAMIC => Some(4),
            LONG | DOUBLE => Some(8),
            _ => None,
        }
    }
}

/// A single constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Modified UTF-8 text
    Utf8(String),
    /// 32-bit integer
    Integer(i32),
    /// 32-bit float
    Float(f32),
    /// 64-bit integer (two slots)
    Long(i64),
    /// 64-bit float (two slots)
    Double(f64),
    /// Class reference: index of a `Utf8` internal name
    Class { name_index: u16 },
    /// String literal: index of a `Utf8`
    String { string_index: u16 },
    /// Field reference
    FieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    /// Method reference
    MethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    /// Interface method reference
    InterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    /// Name and descriptor pair
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    /// Method handle
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    /// Method type: index of a `Utf8` descriptor
    MethodType { descriptor_index: u16 },
    /// Dynamically computed constant
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    /// Invokedynamic call site
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    /// Module name
    Module { name_index: u16 },
    /// Package name
    Package { name_index: u16 },
}

impl Constant {
    /// The tag byte for this entry
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => tags::UTF8,
            Constant::Integer(_) => tags::INTEGER,
            Constant::Float(_) => tags::FLOAT,
            Constant::Long(_) => tags::LONG,
            Constant::Double(_) => tags::DOUBLE,
            Constant::Class { .. } => tags::CLASS,
            Constant::String { .. } => tags::STRING,
            Constant::FieldRef { .. } => tags::FIELD_REF,
            Constant::MethodRef { .. } => tags::METHOD_REF,
            Constant::InterfaceMethodRef { .. } => tags::INTERFACE_METHOD_REF,
            Constant::NameAndType { .. } => tags::NAME_AND_TYPE,
            Constant::MethodHandle { .. } => tags::METHOD_HANDLE,
            Constant::MethodType { .. } => tags::METHOD_TYPE,
            Constant::Dynamic { .. } => tags::DYNAMIC,
            Constant::InvokeDynamic { .. } => tags::INVOKE_DYNAMIC,
            Constant::Module { .. } => tags::MODULE,
            Constant::Package { .. } => tags::PACKAGE,
        }
    }

    /// Whether this entry occupies two pool slots
    pub fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }

    /// Human-readable kind, as printed in traces and errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Utf8(_) => "Utf8",
            Constant::Integer(_) => "Integer",
            Constant::Float(_) => "Float",
            Constant::Long(_) => "Long",
            Constant::Double(_) => "Double",
            Constant::Class { .. } => "Class",
            Constant::String { .. } => "String",
            Constant::FieldRef { .. } => "Fieldref",
            Constant::MethodRef { .. } => "Methodref",
            Constant::InterfaceMethodRef { .. } => "InterfaceMethodref",
            Constant::NameAndType { .. } => "NameAndType",
            Constant::MethodHandle { .. } => "MethodHandle",
            Constant::MethodType { .. } => "MethodType",
            Constant::Dynamic { .. } => "Dynamic",
            Constant::InvokeDynamic { .. } => "InvokeDynamic",
            Constant::Module { .. } => "Module",
            Constant::Package { .. } => "Package",
        }
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u8(self.tag());
        match self {
            Constant::Utf8(text) => {
                let bytes = encode_modified_utf8(text);
                writer.emit_u16(bytes.len() as u16);
                writer.emit_bytes(&bytes);
            }
            Constant::Integer(v) => writer.emit_i32(*v),
            Constant::Float(v) => writer.emit_u32(v.to_bits()),
            Constant::Long(v) => writer.emit_i64(*v),
            Constant::Double(v) => writer.emit_i64(v.to_bits() as i64),
            Constant::Class { name_index: a }
            | Constant::String { string_index: a }
            | Constant::MethodType { descriptor_index: a }
            | Constant::Module { name_index: a }
            | Constant::Package { name_index: a } => writer.emit_u16(*a),
            Constant::FieldRef {
                class_index: a,
                name_and_type_index: b,
            }
            | Constant::MethodRef {
                class_index: a,
                name_and_type_index: b,
            }
            | Constant::InterfaceMethodRef {
                class_index: a,
                name_and_type_index: b,
            }
            | Constant::NameAndType {
                name_index: a,
                descriptor_index: b,
            }
            | Constant::Dynamic {
                bootstrap_method_attr_index: a,
                name_and_type_index: b,
            }
            | Constant::InvokeDynamic {
                bootstrap_method_attr_index: a,
                name_and_type_index: b,
            } => {
                writer.emit_u16(*a);
                writer.emit_u16(*b);
            }
            Constant::MethodHandle {
                reference_kind,
                reference_index,
            } => {
                writer.emit_u8(*reference_kind);
                writer.emit_u16(*reference_index);
            }
        }
    }

    fn decode(reader: &mut ByteReader<'_>, index: u16) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let tag = reader.read_u8()?;
        let constant = match tag {
            tags::UTF8 => {
                let len = reader.read_u16()? as usize;
                let start = reader.position();
                let bytes = reader.read_bytes(len)?;
                Constant::Utf8(decode_modified_utf8(&bytes, start)?)
            }
            tags::INTEGER => Constant::Integer(reader.read_i32()?),
            tags::FLOAT => Constant::Float(f32::from_bits(reader.read_u32()?)),
            tags::LONG => Constant::Long(reader.read_i64()?),
            tags::DOUBLE => Constant::Double(f64::from_bits(reader.read_i64()? as u64)),
            tags::CLASS => Constant::Class { name_index: reader.read_u16()? },
            tags::STRING => Constant::String { string_index: reader.read_u16()? },
            tags::METHOD_TYPE => Constant::MethodType { descriptor_index: reader.read_u16()? },
            tags::MODULE => Constant::Module { name_index: reader.read_u16()? },
            tags::PACKAGE => Constant::Package { name_index: reader.read_u16()? },
            tags::FIELD_REF => Constant::FieldRef {
                class_index: reader.read_u16()?,
                name_and_type_index: reader.read_u16()?,
            },
            tags::METHOD_REF => Constant::MethodRef {
                class_index: reader.read_u16()?,
                name_and_type_index: reader.read_u16()?,
            },
            tags::INTERFACE_METHOD_REF => Constant::InterfaceMethodRef {
                class_index: reader.read_u16()?,
                name_and_type_index: reader.read_u16()?,
            },
            tags::NAME_AND_TYPE => Constant::NameAndType {
                name_index: reader.read_u16()?,
                descriptor_index: reader.read_u16()?,
            },
            tags::DYNAMIC => Constant::Dynamic {
                bootstrap_method_attr_index: reader.read_u16()?,
                name_and_type_index: reader.read_u16()?,
            },
            tags::INVOKE_DYNAMIC => Constant::InvokeDynamic {
                bootstrap_method_attr_index: reader.read_u16()?,
                name_and_type_index: reader.read_u16()?,
            },
            tags::METHOD_HANDLE => Constant::MethodHandle {
                reference_kind: reader.read_u8()?,
                reference_index: reader.read_u16()?,
            },
            tag => return Err(DecodeError::UnknownTag { tag, index, offset }),
        };
        Ok(constant)
    }
}

/// Constant pool of a class file
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPool {
    entries: Vec<Option<Constant>>,
}

impl ConstantPool {
    /// Create an empty pool (slot 0 reserved)
    pub fn new() -> Self {
        Self { entries: vec![None] }
    }

    /// The `constant_pool_count` value: one more than the highest index
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    /// Get the entry at `index`, if that slot holds one
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }

    /// Iterate over occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| entry.as_ref().map(|c| (i as u16, c)))
    }

    /// Append an entry without interning and return its index
    pub fn push(&mut self, constant: Constant) -> u16 {
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.entries.push(Some(constant));
        if wide {
            self.entries.push(None);
        }
        index
    }

    fn intern(&mut self, constant: Constant) -> u16 {
        let found = self
            .iter()
            .find(|(_, c)| **c == constant)
            .map(|(index, _)| index);
        match found {
            Some(index) => index,
            None => self.push(constant),
        }
    }

    /// Intern a `Utf8` entry
    pub fn utf8(&mut self, text: &str) -> u16 {
        let found = self
            .iter()
            .find(|(_, c)| matches!(c, Constant::Utf8(s) if s == text))
            .map(|(index, _)| index);
        match found {
            Some(index) => index,
            None => self.push(Constant::Utf8(text.to_string())),
        }
    }

    /// Intern a `Class` entry for an internal name
    pub fn class(&mut self, internal_name: &str) -> u16 {
        let name_index = self.utf8(internal_name);
        self.intern(Constant::Class { name_index })
    }

    /// Intern a `String` literal
    pub fn string(&mut self, value: &str) -> u16 {
        let string_index = self.utf8(value);
        self.intern(Constant::String { string_index })
    }

    /// Intern an `Integer` entry
    pub fn integer(&mut self, value: i32) -> u16 {
        self.intern(Constant::Integer(value))
    }

    /// Intern a `NameAndType` entry
    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Intern a `Fieldref` entry
    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.intern(Constant::FieldRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Intern a `Methodref` entry
    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.intern(Constant::MethodRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Intern an `InterfaceMethodref` entry
    pub fn interface_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_and_type_index = self.name_and_type(name, descriptor);
        self.intern(Constant::InterfaceMethodRef {
            class_index,
            name_and_type_index,
        })
    }

    /// Text of the `Utf8` entry at `index`
    pub fn get_utf8(&self, index: u16) -> Option<&str> {
        match self.get(index) {
            Some(Constant::Utf8(text)) => Some(text),
            _ => None,
        }
    }

    /// Internal name referenced by the `Class` entry at `index`
    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index) {
            Some(Constant::Class { name_index }) => self.get_utf8(*name_index),
            _ => None,
        }
    }

    /// Name and descriptor of the `NameAndType` entry at `index`
    pub fn name_and_type_at(&self, index: u16) -> Option<(&str, &str)> {
        match self.get(index) {
            Some(Constant::NameAndType {
                name_index,
                descriptor_index,
            }) => Some((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?)),
            _ => None,
        }
    }

    /// Owner, name and descriptor of a field or method reference at `index`
    pub fn member_ref(&self, index: u16) -> Option<(&str, &str, &str)> {
        match self.get(index) {
            Some(Constant::FieldRef {
                class_index,
                name_and_type_index,
            })
            | Some(Constant::MethodRef {
                class_index,
                name_and_type_index,
            })
            | Some(Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            }) => {
                let owner = self.class_name(*class_index)?;
                let (name, descriptor) = self.name_and_type_at(*name_and_type_index)?;
                Some((owner, name, descriptor))
            }
            _ => None,
        }
    }

    /// Encode the pool, starting with `constant_pool_count`
    pub fn encode(&self, writer: &mut ByteWriter) {
        writer.emit_u16(self.count());
        for (_, constant) in self.iter() {
            constant.encode(writer);
        }
    }

    /// Decode the pool, starting with `constant_pool_count`
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u16()?;
        let mut pool = ConstantPool::new();
        pool.entries.reserve(count as usize);
        while pool.count() < count {
            let index = pool.count();
            let constant = Constant::decode(reader, index)?;
            pool.push(constant);
        }
        Ok(pool)
    }
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}
