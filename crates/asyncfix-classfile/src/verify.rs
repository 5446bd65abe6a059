//! Structural verification of class files
//!
//! Checks what a loader needs before it can trust a module: every pool
//! reference points at an entry of the right kind, descriptors parse, method
//! bodies decode into whole instructions, jumps land on instruction
//! boundaries, local slots stay below `max_locals`, and no body falls off its
//! end. Type-flow checking of the operand stack is out of reach here.

use std::collections::HashSet;

use crate::code::{decode_instructions, CodeError, Instruction};
use crate::constants::{Constant, ConstantPool};
use crate::encoder::DecodeError;
use crate::module::{access, ClassFile, Member, OBJECT};
use crate::opcode::Opcode;

/// Verification errors
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VerifyError {
    /// A pool index does not name an entry of the expected kind
    #[error("Invalid constant pool reference #{index}: expected {expected}")]
    InvalidConstantRef { index: u16, expected: &'static str },

    /// Only the root type may omit a super type
    #[error("Missing super type for {0}")]
    MissingSuperType(String),

    /// Malformed field or method descriptor
    #[error("Invalid descriptor {0:?}")]
    InvalidDescriptor(String),

    /// Two members share a name and descriptor
    #[error("Duplicate member {name}{descriptor}")]
    DuplicateMember { name: String, descriptor: String },

    /// A concrete method without a body
    #[error("Method {0} has no Code attribute")]
    MissingCode(String),

    /// An abstract or native method with a body
    #[error("Method {0} is abstract or native but has a Code attribute")]
    UnexpectedCode(String),

    /// The `Code` attribute itself does not decode
    #[error("Malformed Code attribute in {method}: {source}")]
    MalformedCode { method: String, source: DecodeError },

    /// Empty or oversized code array
    #[error("Invalid code length {length} in {method}")]
    InvalidCodeLength { method: String, length: usize },

    /// Instruction stream does not decode
    #[error("Invalid instruction in {method}: {source}")]
    InvalidInstruction { method: String, source: CodeError },

    /// Jump to something that is not an instruction boundary
    #[error("Invalid jump target {target} at offset {offset} in {method}")]
    InvalidJumpTarget {
        method: String,
        target: usize,
        offset: usize,
    },

    /// Local variable slot out of range
    #[error("Invalid local variable {index} (max {max}) at offset {offset} in {method}")]
    InvalidLocalRef {
        method: String,
        index: u16,
        max: u16,
        offset: usize,
    },

    /// Instruction operand names the wrong kind of pool entry
    #[error(
        "Instruction {opcode} at offset {offset} in {method} references #{index}, \
         expected {expected}"
    )]
    InvalidOperandRef {
        method: String,
        opcode: &'static str,
        index: u16,
        offset: usize,
        expected: &'static str,
    },

    /// Execution can run past the last instruction
    #[error("Execution falls off end of {method} at offset {offset}")]
    FallOffEnd { method: String, offset: usize },
}

/// Verify a decoded class file
pub fn verify_class(class: &ClassFile) -> Result<(), VerifyError> {
    verify_pool(&class.constants)?;

    let name = expect_class(&class.constants, class.this_class)?;
    if class.super_class == 0 {
        if name != OBJECT {
            return Err(VerifyError::MissingSuperType(name.to_string()));
        }
    } else {
        expect_class(&class.constants, class.super_class)?;
    }
    for &interface in &class.interfaces {
        expect_class(&class.constants, interface)?;
    }

    let mut seen = HashSet::new();
    for field in &class.fields {
        let (name, descriptor) = member_signature(&class.constants, field)?;
        if parse_field_type(descriptor.as_bytes(), 0) != Some(descriptor.len()) {
            return Err(VerifyError::InvalidDescriptor(descriptor.to_string()));
        }
        check_unique(&mut seen, name, descriptor)?;
    }

    seen.clear();
    for method in &class.methods {
        let (name, descriptor) = member_signature(&class.constants, method)?;
        if !is_method_descriptor(descriptor) {
            return Err(VerifyError::InvalidDescriptor(descriptor.to_string()));
        }
        check_unique(&mut seen, name, descriptor)?;
        verify_method(class, method, &format!("{name}{descriptor}"))?;
    }

    Ok(())
}

fn check_unique<'a>(
    seen: &mut HashSet<(&'a str, &'a str)>,
    name: &'a str,
    descriptor: &'a str,
) -> Result<(), VerifyError> {
    if !seen.insert((name, descriptor)) {
        return Err(VerifyError::DuplicateMember {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
    }
    Ok(())
}

fn member_signature<'a>(
    pool: &'a ConstantPool,
    member: &Member,
) -> Result<(&'a str, &'a str), VerifyError> {
    Ok((
        expect_utf8(pool, member.name_index)?,
        expect_utf8(pool, member.descriptor_index)?,
    ))
}

fn expect_utf8(pool: &ConstantPool, index: u16) -> Result<&str, VerifyError> {
    pool.get_utf8(index).ok_or(VerifyError::InvalidConstantRef {
        index,
        expected: "Utf8",
    })
}

fn expect_class(pool: &ConstantPool, index: u16) -> Result<&str, VerifyError> {
    pool.class_name(index).ok_or(VerifyError::InvalidConstantRef {
        index,
        expected: "Class",
    })
}

fn expect_tag(
    pool: &ConstantPool,
    index: u16,
    expected: &'static str,
    accept: impl Fn(&Constant) -> bool,
) -> Result<(), VerifyError> {
    match pool.get(index) {
        Some(constant) if accept(constant) => Ok(()),
        _ => Err(VerifyError::InvalidConstantRef { index, expected }),
    }
}

/// Check that every pool entry's internal references resolve
fn verify_pool(pool: &ConstantPool) -> Result<(), VerifyError> {
    let is_utf8 = |c: &Constant| matches!(c, Constant::Utf8(_));
    let is_class = |c: &Constant| matches!(c, Constant::Class { .. });
    let is_nat = |c: &Constant| matches!(c, Constant::NameAndType { .. });
    let is_member = |c: &Constant| {
        matches!(
            c,
            Constant::FieldRef { .. }
                | Constant::MethodRef { .. }
                | Constant::InterfaceMethodRef { .. }
        )
    };

    for (_, constant) in pool.iter() {
        match constant {
            Constant::Class { name_index }
            | Constant::Module { name_index }
            | Constant::Package { name_index } => expect_tag(pool, *name_index, "Utf8", is_utf8)?,
            Constant::String { string_index } => expect_tag(pool, *string_index, "Utf8", is_utf8)?,
            Constant::MethodType { descriptor_index } => {
                expect_tag(pool, *descriptor_index, "Utf8", is_utf8)?
            }
            Constant::FieldRef {
                class_index,
                name_and_type_index,
            }
            | Constant::MethodRef {
                class_index,
                name_and_type_index,
            }
            | Constant::InterfaceMethodRef {
                class_index,
                name_and_type_index,
            } => {
                expect_tag(pool, *class_index, "Class", is_class)?;
                expect_tag(pool, *name_and_type_index, "NameAndType", is_nat)?;
            }
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => {
                expect_tag(pool, *name_index, "Utf8", is_utf8)?;
                expect_tag(pool, *descriptor_index, "Utf8", is_utf8)?;
            }
            Constant::MethodHandle {
                reference_index, ..
            } => expect_tag(pool, *reference_index, "member reference", is_member)?,
            Constant::Dynamic {
                name_and_type_index,
                ..
            }
            | Constant::InvokeDynamic {
                name_and_type_index,
                ..
            } => expect_tag(pool, *name_and_type_index, "NameAndType", is_nat)?,
            Constant::Utf8(_)
            | Constant::Integer(_)
            | Constant::Float(_)
            | Constant::Long(_)
            | Constant::Double(_) => {}
        }
    }
    Ok(())
}

fn verify_method(class: &ClassFile, method: &Member, label: &str) -> Result<(), VerifyError> {
    let has_body = method.access_flags & (access::ABSTRACT | access::NATIVE) == 0;
    let code = method
        .code(&class.constants)
        .map_err(|source| VerifyError::MalformedCode {
            method: label.to_string(),
            source,
        })?;

    let code = match (has_body, code) {
        (true, Some(code)) => code,
        (true, None) => return Err(VerifyError::MissingCode(label.to_string())),
        (false, Some(_)) => return Err(VerifyError::UnexpectedCode(label.to_string())),
        (false, None) => return Ok(()),
    };

    if code.code.is_empty() || code.code.len() > u16::MAX as usize {
        return Err(VerifyError::InvalidCodeLength {
            method: label.to_string(),
            length: code.code.len(),
        });
    }

    let instructions =
        decode_instructions(&code.code).map_err(|source| VerifyError::InvalidInstruction {
            method: label.to_string(),
            source,
        })?;

    verify_jump_targets(&instructions, label)?;
    verify_local_refs(&instructions, code.max_locals, label)?;
    verify_operand_refs(&instructions, &class.constants, label)?;

    // Decoding succeeded on a non-empty array, so there is a last instruction
    if let Some(last) = instructions.last() {
        if !last.opcode.is_terminator() {
            return Err(VerifyError::FallOffEnd {
                method: label.to_string(),
                offset: last.offset,
            });
        }
    }

    Ok(())
}

fn verify_jump_targets(instructions: &[Instruction], method: &str) -> Result<(), VerifyError> {
    let boundaries: HashSet<usize> = instructions.iter().map(|i| i.offset).collect();

    for instr in instructions {
        let targets = if instr.opcode.is_branch() {
            instr.branch_target().into_iter().collect()
        } else {
            instr.switch_targets()
        };
        for target in targets {
            if !boundaries.contains(&target) {
                return Err(VerifyError::InvalidJumpTarget {
                    method: method.to_string(),
                    target,
                    offset: instr.offset,
                });
            }
        }
        // Negative branch offsets do not resolve to a target at all
        if instr.opcode.is_branch() && instr.branch_target().is_none() {
            return Err(VerifyError::InvalidJumpTarget {
                method: method.to_string(),
                target: 0,
                offset: instr.offset,
            });
        }
    }
    Ok(())
}

/// Local slot used by the `xload_n` / `xstore_n` shorthand forms
fn implicit_local(opcode: Opcode) -> Option<u16> {
    let byte = opcode.to_u8();
    match byte {
        0x1a..=0x2d => Some(((byte - 0x1a) % 4) as u16),
        0x3b..=0x4e => Some(((byte - 0x3b) % 4) as u16),
        _ => None,
    }
}

fn verify_local_refs(
    instructions: &[Instruction],
    max_locals: u16,
    method: &str,
) -> Result<(), VerifyError> {
    for instr in instructions {
        let index = instr.local_index().or_else(|| implicit_local(instr.opcode));
        if let Some(index) = index {
            if index >= max_locals {
                return Err(VerifyError::InvalidLocalRef {
                    method: method.to_string(),
                    index,
                    max: max_locals,
                    offset: instr.offset,
                });
            }
        }
    }
    Ok(())
}

fn verify_operand_refs(
    instructions: &[Instruction],
    pool: &ConstantPool,
    method: &str,
) -> Result<(), VerifyError> {
    for instr in instructions {
        let Some(index) = instr.pool_index() else {
            continue;
        };
        if !pool
            .get(index)
            .is_some_and(|constant| accepts_operand(instr.opcode, constant))
        {
            return Err(VerifyError::InvalidOperandRef {
                method: method.to_string(),
                opcode: instr.opcode.mnemonic(),
                index,
                offset: instr.offset,
                expected: expected_operand(instr.opcode),
            });
        }
    }
    Ok(())
}

fn expected_operand(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Ldc | Opcode::LdcW => "loadable constant",
        Opcode::Ldc2W => "Long or Double",
        Opcode::Getstatic | Opcode::Putstatic | Opcode::Getfield | Opcode::Putfield => "Fieldref",
        Opcode::Invokevirtual | Opcode::Invokespecial | Opcode::Invokestatic => "Methodref",
        Opcode::Invokeinterface => "InterfaceMethodref",
        Opcode::Invokedynamic => "InvokeDynamic",
        _ => "Class",
    }
}

fn accepts_operand(opcode: Opcode, constant: &Constant) -> bool {
    match opcode {
        Opcode::Ldc | Opcode::LdcW => matches!(
            constant,
            Constant::Integer(_)
                | Constant::Float(_)
                | Constant::String { .. }
                | Constant::Class { .. }
                | Constant::MethodType { .. }
                | Constant::MethodHandle { .. }
                | Constant::Dynamic { .. }
        ),
        Opcode::Ldc2W => matches!(constant, Constant::Long(_) | Constant::Double(_)),
        Opcode::Getstatic | Opcode::Putstatic | Opcode::Getfield | Opcode::Putfield => {
            matches!(constant, Constant::FieldRef { .. })
        }
        Opcode::Invokevirtual | Opcode::Invokespecial | Opcode::Invokestatic => matches!(
            constant,
            Constant::MethodRef { .. } | Constant::InterfaceMethodRef { .. }
        ),
        Opcode::Invokeinterface => matches!(constant, Constant::InterfaceMethodRef { .. }),
        Opcode::Invokedynamic => matches!(constant, Constant::InvokeDynamic { .. }),
        _ => matches!(constant, Constant::Class { .. }),
    }
}

/// Parse one field type starting at `at`; returns the offset just past it
fn parse_field_type(bytes: &[u8], at: usize) -> Option<usize> {
    let mut at = at;
    while bytes.get(at) == Some(&b'[') {
        at += 1;
    }
    match bytes.get(at)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(at + 1),
        b'L' => {
            let end = at + 1 + bytes[at + 1..].iter().position(|&b| b == b';')?;
            (end > at + 1).then_some(end + 1)
        }
        _ => None,
    }
}

fn is_method_descriptor(descriptor: &str) -> bool {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return false;
    }
    let mut at = 1;
    while bytes.get(at) != Some(&b')') {
        match parse_field_type(bytes, at) {
            Some(next) => at = next,
            None => return false,
        }
    }
    at += 1;
    if bytes.get(at) == Some(&b'V') {
        return at + 1 == bytes.len();
    }
    parse_field_type(bytes, at) == Some(bytes.len())
}
