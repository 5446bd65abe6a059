//! Instruction decoding for method bodies

use crate::opcode::{Opcode, Operands};
use thiserror::Error;

/// Errors raised while splitting a `Code` array into instructions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    /// Undefined opcode byte
    #[error("Invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },

    /// Operands run past the end of the code array
    #[error("Truncated instruction at offset {0}")]
    Truncated(usize),

    /// `wide` applied to an opcode it cannot modify
    #[error("Invalid wide target {opcode:#04x} at offset {offset}")]
    InvalidWide { opcode: u8, offset: usize },

    /// Malformed switch table
    #[error("Malformed switch at offset {0}")]
    InvalidSwitch(usize),
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the opcode byte within the code array
    pub offset: usize,
    /// The opcode
    pub opcode: Opcode,
    /// Raw operand bytes (including switch padding)
    pub operands: Vec<u8>,
}

impl Instruction {
    fn u16_at(&self, at: usize) -> Option<u16> {
        Some(u16::from_be_bytes([*self.operands.get(at)?, *self.operands.get(at + 1)?]))
    }

    fn i32_at(&self, at: usize) -> Option<i32> {
        let b = self.operands.get(at..at + 4)?;
        Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Constant pool index carried by this instruction, if any
    pub fn pool_index(&self) -> Option<u16> {
        match self.opcode.operands() {
            Operands::Constant8 => self.operands.first().map(|&b| b as u16),
            Operands::Constant16
            | Operands::InvokeInterface
            | Operands::InvokeDynamic
            | Operands::MultiANewArray => self.u16_at(0),
            _ => None,
        }
    }

    /// Local variable index carried by this instruction, if any
    pub fn local_index(&self) -> Option<u16> {
        match self.opcode.operands() {
            Operands::Local | Operands::Iinc => self.operands.first().map(|&b| b as u16),
            Operands::Wide => self.u16_at(1),
            _ => None,
        }
    }

    /// Signed immediate (`bipush`, `sipush`, `iinc` increment)
    pub fn immediate(&self) -> Option<i32> {
        match self.opcode.operands() {
            Operands::Byte => self.operands.first().map(|&b| b as i8 as i32),
            Operands::Short => self.u16_at(0).map(|v| v as i16 as i32),
            Operands::Iinc => self.operands.get(1).map(|&b| b as i8 as i32),
            _ => None,
        }
    }

    /// Absolute branch target, for branch instructions
    pub fn branch_target(&self) -> Option<usize> {
        let delta = match self.opcode.operands() {
            Operands::Branch16 => self.u16_at(0)? as i16 as i64,
            Operands::Branch32 => self.i32_at(0)? as i64,
            _ => return None,
        };
        usize::try_from(self.offset as i64 + delta).ok()
    }

    /// Absolute targets of a switch: default first, then each case
    pub fn switch_targets(&self) -> Vec<usize> {
        let pad = switch_padding(self.offset);
        let base = self.offset as i64;
        let resolve = |delta: i32| usize::try_from(base + delta as i64).ok();
        let mut targets = Vec::new();
        match self.opcode {
            Opcode::Tableswitch => {
                let (Some(default), Some(low), Some(high)) =
                    (self.i32_at(pad), self.i32_at(pad + 4), self.i32_at(pad + 8))
                else {
                    return targets;
                };
                targets.extend(resolve(default));
                let count = (high as i64 - low as i64 + 1).max(0) as usize;
                for i in 0..count {
                    if let Some(delta) = self.i32_at(pad + 12 + i * 4) {
                        targets.extend(resolve(delta));
                    }
                }
            }
            Opcode::Lookupswitch => {
                let (Some(default), Some(pairs)) = (self.i32_at(pad), self.i32_at(pad + 4)) else {
                    return targets;
                };
                targets.extend(resolve(default));
                for i in 0..pairs.max(0) as usize {
                    if let Some(delta) = self.i32_at(pad + 8 + i * 8 + 4) {
                        targets.extend(resolve(delta));
                    }
                }
            }
            _ => {}
        }
        targets
    }
}

/// Padding bytes between a switch opcode at `offset` and its 4-byte aligned table
fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

/// Split a code array into instructions
pub fn decode_instructions(code: &[u8]) -> Result<Vec<Instruction>, CodeError> {
    let mut instructions = Vec::new();
    let mut offset = 0;

    while offset < code.len() {
        let byte = code[offset];
        let opcode = Opcode::from_u8(byte).ok_or(CodeError::InvalidOpcode {
            opcode: byte,
            offset,
        })?;

        let operand_len = match opcode.operands().size() {
            Some(size) => size,
            None => variable_operand_len(code, offset, opcode)?,
        };

        let start = offset + 1;
        let end = start + operand_len;
        if end > code.len() {
            return Err(CodeError::Truncated(offset));
        }

        instructions.push(Instruction {
            offset,
            opcode,
            operands: code[start..end].to_vec(),
        });
        offset = end;
    }

    Ok(instructions)
}

fn variable_operand_len(code: &[u8], offset: usize, opcode: Opcode) -> Result<usize, CodeError> {
    let read_i32 = |at: usize| -> Result<i32, CodeError> {
        code.get(at..at + 4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(CodeError::Truncated(offset))
    };

    match opcode {
        Opcode::Wide => {
            let target = *code.get(offset + 1).ok_or(CodeError::Truncated(offset))?;
            match Opcode::from_u8(target) {
                Some(Opcode::Iinc) => Ok(5),
                Some(
                    Opcode::Iload
                    | Opcode::Lload
                    | Opcode::Fload
                    | Opcode::Dload
                    | Opcode::Aload
                    | Opcode::Istore
                    | Opcode::Lstore
                    | Opcode::Fstore
                    | Opcode::Dstore
                    | Opcode::Astore
                    | Opcode::Ret,
                ) => Ok(3),
                _ => Err(CodeError::InvalidWide {
                    opcode: target,
                    offset,
                }),
            }
        }
        Opcode::Tableswitch => {
            let table = offset + 1 + switch_padding(offset);
            let low = read_i32(table + 4)?;
            let high = read_i32(table + 8)?;
            if high < low {
                return Err(CodeError::InvalidSwitch(offset));
            }
            let jumps = (high as i64 - low as i64 + 1) as usize;
            Ok(switch_padding(offset) + 12 + jumps * 4)
        }
        Opcode::Lookupswitch => {
            let table = offset + 1 + switch_padding(offset);
            let pairs = read_i32(table + 4)?;
            if pairs < 0 {
                return Err(CodeError::InvalidSwitch(offset));
            }
            Ok(switch_padding(offset) + 8 + pairs as usize * 8)
        }
        _ => Ok(0),
    }
}
