//! JVM class-file handling for the fixture harness
//!
//! This crate provides the class-file model and codec, a constant pool
//! scanner that answers reference queries without a full decode, builders
//! for synthesizing classes, structural verification, and a text renderer
//! used for debug traces.

#![warn(rust_2018_idioms)]

pub mod builder;
pub mod code;
pub mod constants;
pub mod encoder;
pub mod module;
pub mod opcode;
pub mod scan;
pub mod trace;
pub mod verify;

pub use builder::{argument_slots, BuildError, BuildResult, ClassBuilder, MethodBuilder};
pub use code::{decode_instructions, CodeError, Instruction};
pub use constants::{Constant, ConstantPool};
pub use encoder::{ByteReader, ByteWriter, DecodeError};
pub use module::{
    access, Attribute, ClassFile, Code, ExceptionHandler, Member, CONSTRUCTOR_NAME,
    NO_ARG_DESCRIPTOR, OBJECT,
};
pub use opcode::Opcode;
pub use scan::{references, PoolIndex, Scanner};
pub use trace::render_trace;
pub use verify::{verify_class, VerifyError};
