//! Builders for constructing class files

use crate::constants::ConstantPool;
use crate::encoder::ByteWriter;
use crate::module::{access, Attribute, ClassFile, Code, Member};
use crate::opcode::Opcode;
use thiserror::Error;

/// Errors raised while assembling a class
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// Branch offset does not fit in 16 bits
    #[error("Jump from {from} to {to} does not fit in a 16-bit offset")]
    JumpOutOfRange { from: usize, to: usize },

    /// Patch position does not hold a branch instruction
    #[error("No branch instruction at offset {0}")]
    NotABranch(usize),

    /// Method body exceeds the 64 KiB limit
    #[error("Code too large: {0} bytes")]
    CodeTooLarge(usize),

    /// Method descriptor does not parse
    #[error("Invalid method descriptor {0:?}")]
    InvalidDescriptor(String),
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Helper for building class files
///
/// Pool entries are interned as members are added, so a name or reference
/// used from several methods occupies one slot.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    /// Start a public class with the given internal name and super type
    pub fn new(name: &str, super_name: &str) -> Self {
        Self {
            class: ClassFile::new(name, super_name),
        }
    }

    /// Internal name of the class being built
    pub fn name(&self) -> &str {
        self.class.name().unwrap_or_default()
    }

    /// Replace the class access flags
    pub fn set_access_flags(&mut self, flags: u16) {
        self.class.access_flags = flags;
    }

    /// Set the class-file major version
    pub fn set_major_version(&mut self, version: u16) {
        self.class.major_version = version;
    }

    /// Declare an implemented interface
    pub fn add_interface(&mut self, name: &str) {
        let index = self.class.constants.class(name);
        if !self.class.interfaces.contains(&index) {
            self.class.interfaces.push(index);
        }
    }

    /// Declare a field
    pub fn add_field(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let field = Member {
            access_flags,
            name_index: self.class.constants.utf8(name),
            descriptor_index: self.class.constants.utf8(descriptor),
            attributes: Vec::new(),
        };
        self.class.fields.push(field);
    }

    /// Declare a method without a body
    pub fn add_abstract_method(&mut self, access_flags: u16, name: &str, descriptor: &str) {
        let method = Member {
            access_flags: access_flags | access::ABSTRACT,
            name_index: self.class.constants.utf8(name),
            descriptor_index: self.class.constants.utf8(descriptor),
            attributes: Vec::new(),
        };
        self.class.methods.push(method);
    }

    /// Declare a method with an already assembled body
    pub fn add_method_with_code(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: &Code,
    ) {
        let method = Member {
            access_flags,
            name_index: self.class.constants.utf8(name),
            descriptor_index: self.class.constants.utf8(descriptor),
            attributes: vec![Attribute {
                name_index: self.class.constants.utf8("Code"),
                info: code.encode(),
            }],
        };
        self.class.methods.push(method);
    }

    /// Check whether a method with this name and descriptor was declared
    pub fn has_method(&self, name: &str, descriptor: &str) -> bool {
        self.class.find_method(name, descriptor).is_some()
    }

    /// Record the `SourceFile` attribute
    pub fn set_source_file(&mut self, file_name: &str) {
        let name_index = self.class.constants.utf8("SourceFile");
        let value = self.class.constants.utf8(file_name);
        self.class.attributes.retain(|a| a.name_index != name_index);
        self.class.attributes.push(Attribute {
            name_index,
            info: value.to_be_bytes().to_vec(),
        });
    }

    /// Intern a `Class` entry
    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.class.constants.class(name)
    }

    /// Direct access to the constant pool
    pub fn constants_mut(&mut self) -> &mut ConstantPool {
        &mut self.class.constants
    }

    /// Start a method body
    ///
    /// The method is added when [`MethodBuilder::finish`] is called.
    pub fn method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
    ) -> BuildResult<MethodBuilder<'_>> {
        let argument_slots = argument_slots(descriptor)
            .ok_or_else(|| BuildError::InvalidDescriptor(descriptor.to_string()))?;
        let receiver = if access_flags & access::STATIC == 0 { 1 } else { 0 };
        Ok(MethodBuilder {
            access_flags,
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            code: Vec::new(),
            max_stack: 0,
            max_locals: argument_slots + receiver,
            line_numbers: Vec::new(),
            class: &mut self.class,
        })
    }

    /// Finish and return the class file
    pub fn build(self) -> ClassFile {
        self.class
    }
}

/// Helper for building method bytecode
#[derive(Debug)]
pub struct MethodBuilder<'a> {
    class: &'a mut ClassFile,
    access_flags: u16,
    name: String,
    descriptor: String,
    code: Vec<u8>,
    max_stack: u16,
    max_locals: u16,
    line_numbers: Vec<(u16, u16)>,
}

impl MethodBuilder<'_> {
    /// Emit a single-byte opcode
    pub fn emit(&mut self, opcode: Opcode) {
        self.code.push(opcode.to_u8());
    }

    /// Emit a u8 operand
    pub fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    /// Emit a u16 operand (big-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    /// Emit an i16 operand (big-endian)
    pub fn emit_i16(&mut self, value: i16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    /// Get current code position (for jump offsets)
    pub fn current_position(&self) -> usize {
        self.code.len()
    }

    /// Set the operand stack depth
    pub fn set_max_stack(&mut self, max_stack: u16) {
        self.max_stack = max_stack;
    }

    /// Raise the local slot count to at least `count`
    pub fn reserve_locals(&mut self, count: u16) {
        self.max_locals = self.max_locals.max(count);
    }

    /// Map the current position to a source line
    pub fn line_number(&mut self, line: u16) {
        let pc = self.code.len() as u16;
        self.line_numbers.push((pc, line));
    }

    fn emit_local(&mut self, short_base: Opcode, long_form: Opcode, index: u16) {
        self.reserve_locals(index.saturating_add(1));
        match index {
            0..=3 => self.code.push(short_base.to_u8() + index as u8),
            4..=255 => {
                self.emit(long_form);
                self.emit_u8(index as u8);
            }
            _ => {
                self.emit(Opcode::Wide);
                self.emit(long_form);
                self.emit_u16(index);
            }
        }
    }

    /// Load a reference from a local slot
    pub fn aload(&mut self, index: u16) {
        self.emit_local(Opcode::Aload0, Opcode::Aload, index);
    }

    /// Store a reference into a local slot
    pub fn astore(&mut self, index: u16) {
        self.emit_local(Opcode::Astore0, Opcode::Astore, index);
    }

    /// Load an int from a local slot
    pub fn iload(&mut self, index: u16) {
        self.emit_local(Opcode::Iload0, Opcode::Iload, index);
    }

    /// Push an int constant using the shortest encoding
    pub fn iconst(&mut self, value: i32) {
        match value {
            -1..=5 => self.code.push((Opcode::Iconst0.to_u8() as i32 + value) as u8),
            -128..=127 => {
                self.emit(Opcode::Bipush);
                self.emit_u8(value as i8 as u8);
            }
            -32768..=32767 => {
                self.emit(Opcode::Sipush);
                self.emit_i16(value as i16);
            }
            _ => {
                let index = self.class.constants.integer(value);
                self.emit_ldc(index);
            }
        }
    }

    /// Push a string constant
    pub fn ldc_string(&mut self, value: &str) {
        let index = self.class.constants.string(value);
        self.emit_ldc(index);
    }

    fn emit_ldc(&mut self, index: u16) {
        if index <= u8::MAX as u16 {
            self.emit(Opcode::Ldc);
            self.emit_u8(index as u8);
        } else {
            self.emit(Opcode::LdcW);
            self.emit_u16(index);
        }
    }

    /// Push `null`
    pub fn aconst_null(&mut self) {
        self.emit(Opcode::AconstNull);
    }

    /// Allocate an uninitialized instance
    pub fn new_object(&mut self, class_name: &str) {
        let index = self.class.constants.class(class_name);
        self.emit(Opcode::New);
        self.emit_u16(index);
    }

    /// Duplicate the top of stack
    pub fn dup(&mut self) {
        self.emit(Opcode::Dup);
    }

    /// Discard the top of stack
    pub fn pop(&mut self) {
        self.emit(Opcode::Pop);
    }

    /// Cast the top of stack
    pub fn checkcast(&mut self, class_name: &str) {
        let index = self.class.constants.class(class_name);
        self.emit(Opcode::Checkcast);
        self.emit_u16(index);
    }

    fn emit_member(&mut self, opcode: Opcode, index: u16) {
        self.emit(opcode);
        self.emit_u16(index);
    }

    /// Read an instance field
    pub fn getfield(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.field_ref(owner, name, descriptor);
        self.emit_member(Opcode::Getfield, index);
    }

    /// Write an instance field
    pub fn putfield(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.field_ref(owner, name, descriptor);
        self.emit_member(Opcode::Putfield, index);
    }

    /// Read a static field
    pub fn getstatic(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.field_ref(owner, name, descriptor);
        self.emit_member(Opcode::Getstatic, index);
    }

    /// Write a static field
    pub fn putstatic(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.field_ref(owner, name, descriptor);
        self.emit_member(Opcode::Putstatic, index);
    }

    /// Invoke a constructor, private or super method
    pub fn invokespecial(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.method_ref(owner, name, descriptor);
        self.emit_member(Opcode::Invokespecial, index);
    }

    /// Invoke a virtual method
    pub fn invokevirtual(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.method_ref(owner, name, descriptor);
        self.emit_member(Opcode::Invokevirtual, index);
    }

    /// Invoke a static method
    pub fn invokestatic(&mut self, owner: &str, name: &str, descriptor: &str) {
        let index = self.class.constants.method_ref(owner, name, descriptor);
        self.emit_member(Opcode::Invokestatic, index);
    }

    /// Invoke an interface method
    pub fn invokeinterface(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> BuildResult<()> {
        let slots = argument_slots(descriptor)
            .ok_or_else(|| BuildError::InvalidDescriptor(descriptor.to_string()))?;
        let index = self
            .class
            .constants
            .interface_method_ref(owner, name, descriptor);
        self.emit_member(Opcode::Invokeinterface, index);
        self.emit_u8((slots + 1) as u8);
        self.emit_u8(0);
        Ok(())
    }

    /// Return from a `void` method
    pub fn return_void(&mut self) {
        self.emit(Opcode::Return);
    }

    /// Return a reference
    pub fn areturn(&mut self) {
        self.emit(Opcode::Areturn);
    }

    /// Return an int
    pub fn ireturn(&mut self) {
        self.emit(Opcode::Ireturn);
    }

    /// Throw the reference on top of the stack
    pub fn athrow(&mut self) {
        self.emit(Opcode::Athrow);
    }

    /// Emit a branch with a placeholder offset; returns the position to patch
    pub fn branch(&mut self, opcode: Opcode) -> usize {
        let position = self.current_position();
        self.emit(opcode);
        self.emit_i16(0);
        position
    }

    /// Point the branch emitted at `position` to `target`
    pub fn patch_jump(&mut self, position: usize, target: usize) -> BuildResult<()> {
        let is_branch = self
            .code
            .get(position)
            .and_then(|&byte| Opcode::from_u8(byte))
            .is_some_and(|op| op.is_branch() && op.operands().size() == Some(2));
        if !is_branch || position + 3 > self.code.len() {
            return Err(BuildError::NotABranch(position));
        }
        let offset = i16::try_from(target as i64 - position as i64).map_err(|_| {
            BuildError::JumpOutOfRange {
                from: position,
                to: target,
            }
        })?;
        self.code[position + 1..position + 3].copy_from_slice(&offset.to_be_bytes());
        Ok(())
    }

    /// Build the `Code` attribute and add the method to the class
    pub fn finish(self) -> BuildResult<()> {
        if self.code.len() > u16::MAX as usize {
            return Err(BuildError::CodeTooLarge(self.code.len()));
        }

        let constants = &mut self.class.constants;
        let mut attributes = Vec::new();
        if !self.line_numbers.is_empty() {
            let mut table = ByteWriter::with_capacity(2 + self.line_numbers.len() * 4);
            table.emit_u16(self.line_numbers.len() as u16);
            for (pc, line) in &self.line_numbers {
                table.emit_u16(*pc);
                table.emit_u16(*line);
            }
            attributes.push(Attribute {
                name_index: constants.utf8("LineNumberTable"),
                info: table.into_bytes(),
            });
        }

        let body = Code {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code: self.code,
            exception_table: Vec::new(),
            attributes,
        };
        let method = Member {
            access_flags: self.access_flags,
            name_index: constants.utf8(&self.name),
            descriptor_index: constants.utf8(&self.descriptor),
            attributes: vec![Attribute {
                name_index: constants.utf8("Code"),
                info: body.encode(),
            }],
        };
        self.class.methods.push(method);
        Ok(())
    }
}

/// Local slots taken by the parameters of a method descriptor
pub fn argument_slots(descriptor: &str) -> Option<u16> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return None;
    }
    let mut at = 1;
    let mut slots = 0u16;
    loop {
        match *bytes.get(at)? {
            b')' => return Some(slots),
            b'J' | b'D' => {
                slots += 2;
                at += 1;
            }
            b'B' | b'C' | b'F' | b'I' | b'S' | b'Z' => {
                slots += 1;
                at += 1;
            }
            b'L' => {
                at += bytes[at..].iter().position(|&b| b == b';')? + 1;
                slots += 1;
            }
            b'[' => {
                while bytes.get(at) == Some(&b'[') {
                    at += 1;
                }
                match *bytes.get(at)? {
                    b'L' => at += bytes[at..].iter().position(|&b| b == b';')? + 1,
                    _ => at += 1,
                }
                slots += 1;
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::decode_instructions;
    use crate::constants::Constant;
    use crate::module::{CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR, OBJECT};
    use crate::verify::verify_class;

    #[test]
    fn test_default_constructor() {
        let mut builder = ClassBuilder::new("test/Built", OBJECT);
        let mut init = builder
            .method(access::PUBLIC, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR)
            .unwrap();
        init.aload(0);
        init.invokespecial(OBJECT, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
        init.return_void();
        init.set_max_stack(1);
        init.finish().unwrap();

        let class = builder.build();
        verify_class(&class).unwrap();

        let method = class.find_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR).unwrap();
        let code = method.code(&class.constants).unwrap().unwrap();
        assert_eq!(code.max_locals, 1);
        assert_eq!(code.max_stack, 1);
        let ops: Vec<_> = decode_instructions(&code.code)
            .unwrap()
            .into_iter()
            .map(|i| i.opcode)
            .collect();
        assert_eq!(ops, vec![Opcode::Aload0, Opcode::Invokespecial, Opcode::Return]);
    }

    #[test]
    fn test_iconst_encodings() {
        let mut builder = ClassBuilder::new("test/Consts", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()I").unwrap();
        m.iconst(-1);
        m.iconst(100);
        m.iconst(1000);
        m.iconst(100_000);
        assert_eq!(&m.code[..1], &[Opcode::IconstM1.to_u8()]);
        assert_eq!(&m.code[1..3], &[Opcode::Bipush.to_u8(), 100]);
        assert_eq!(&m.code[3..6], &[Opcode::Sipush.to_u8(), 0x03, 0xe8]);
        assert_eq!(m.code[6], Opcode::Ldc.to_u8());
    }

    #[test]
    fn test_locals_grow_with_use() {
        let mut builder = ClassBuilder::new("test/Locals", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "(JI)V").unwrap();
        assert_eq!(m.max_locals, 3);
        m.aload(5);
        assert_eq!(m.max_locals, 6);
        assert_eq!(&m.code, &[Opcode::Aload.to_u8(), 5]);
    }

    #[test]
    fn test_patch_jump() {
        let mut builder = ClassBuilder::new("test/Jump", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()V").unwrap();
        let jump = m.branch(Opcode::Goto);
        let target = m.current_position();
        m.return_void();
        m.patch_jump(jump, target).unwrap();
        assert_eq!(m.patch_jump(target, 0), Err(BuildError::NotABranch(target)));
        m.finish().unwrap();
        verify_class(&builder.build()).unwrap();
    }

    #[test]
    fn test_interfaces_are_deduplicated() {
        let mut builder = ClassBuilder::new("test/Impl", OBJECT);
        builder.add_interface("java/lang/Runnable");
        builder.add_interface("java/lang/Runnable");
        let class = builder.build();
        assert_eq!(class.interface_names(), vec!["java/lang/Runnable"]);
    }

    #[test]
    fn test_argument_slots() {
        assert_eq!(argument_slots("()V"), Some(0));
        assert_eq!(argument_slots("(IJ[DLjava/lang/String;)V"), Some(5));
        assert_eq!(argument_slots("([[Ljava/lang/Object;)V"), Some(1));
        assert_eq!(argument_slots("I"), None);
        assert_eq!(argument_slots("(Q)V"), None);
    }

    #[test]
    fn test_line_numbers_attribute() {
        let mut builder = ClassBuilder::new("test/Lines", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()V").unwrap();
        m.line_number(42);
        m.return_void();
        m.finish().unwrap();
        let class = builder.build();
        let code = class.methods[0].code(&class.constants).unwrap().unwrap();
        assert_eq!(code.attributes.len(), 1);
        assert_eq!(code.attributes[0].info, vec![0, 1, 0, 0, 0, 42]);
    }

    #[test]
    fn test_allocating_method() {
        let mut builder = ClassBuilder::new("test/Alloc", OBJECT);
        builder.set_major_version(55);
        builder.set_source_file("Alloc.java");
        builder.set_source_file("Alloc.kt");

        let mut m = builder
            .method(access::PUBLIC | access::STATIC, "make", "()Ljava/lang/Object;")
            .unwrap();
        m.new_object(OBJECT);
        m.dup();
        m.invokespecial(OBJECT, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
        m.areturn();
        m.set_max_stack(2);
        m.finish().unwrap();

        let class = builder.build();
        assert_eq!(class.major_version, 55);
        assert_eq!(class.attributes.len(), 1);
        verify_class(&class).unwrap();

        let code = class.methods[0].code(&class.constants).unwrap().unwrap();
        let ops: Vec<_> = decode_instructions(&code.code)
            .unwrap()
            .into_iter()
            .map(|i| i.opcode)
            .collect();
        assert_eq!(
            ops,
            vec![Opcode::New, Opcode::Dup, Opcode::Invokespecial, Opcode::Areturn]
        );
    }

    #[test]
    fn test_member_access_emitters() {
        let mut builder = ClassBuilder::new("test/Dispatch", OBJECT);
        builder.add_field(access::STATIC, "task", "Lapp/Task;");
        builder.add_field(access::STATIC, "last", "Ljava/lang/String;");

        let mut m = builder
            .method(
                access::PUBLIC | access::STATIC,
                "dispatch",
                "(Ljava/lang/Object;)Ljava/lang/String;",
            )
            .unwrap();
        m.getstatic("test/Dispatch", "task", "Lapp/Task;");
        m.aload(0);
        m.invokeinterface("app/Task", "accept", "(Ljava/lang/Object;)V")
            .unwrap();
        m.aload(0);
        m.checkcast("java/lang/String");
        m.dup();
        m.putstatic("test/Dispatch", "last", "Ljava/lang/String;");
        m.invokevirtual("java/lang/String", "trim", "()Ljava/lang/String;");
        m.areturn();
        m.set_max_stack(2);
        m.finish().unwrap();

        let class = builder.build();
        verify_class(&class).unwrap();

        let code = class.methods[0].code(&class.constants).unwrap().unwrap();
        let instructions = decode_instructions(&code.code).unwrap();
        let ops: Vec<_> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Getstatic,
                Opcode::Aload0,
                Opcode::Invokeinterface,
                Opcode::Aload0,
                Opcode::Checkcast,
                Opcode::Dup,
                Opcode::Putstatic,
                Opcode::Invokevirtual,
                Opcode::Areturn,
            ]
        );

        let pool = &class.constants;
        let listing = &instructions;
        let member = move |i: usize| pool.member_ref(listing[i].pool_index().unwrap());
        assert_eq!(member(0), Some(("test/Dispatch", "task", "Lapp/Task;")));
        assert_eq!(
            member(2),
            Some(("app/Task", "accept", "(Ljava/lang/Object;)V"))
        );
        assert_eq!(member(6), Some(("test/Dispatch", "last", "Ljava/lang/String;")));
        assert_eq!(
            member(7),
            Some(("java/lang/String", "trim", "()Ljava/lang/String;"))
        );
        assert_eq!(
            pool.class_name(instructions[4].pool_index().unwrap()),
            Some("java/lang/String")
        );
        assert!(matches!(
            pool.get(instructions[2].pool_index().unwrap()),
            Some(Constant::InterfaceMethodRef { .. })
        ));

        // Receiver plus one argument slot, then the reserved zero byte
        assert_eq!(&instructions[2].operands[2..], &[2, 0]);
    }

    #[test]
    fn test_invokeinterface_counts_wide_arguments() {
        let mut builder = ClassBuilder::new("test/Wide", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()V").unwrap();
        m.invokeinterface("app/Sink", "put", "(JD)V").unwrap();
        assert_eq!(&m.code[3..], &[5, 0]);
    }

    #[test]
    fn test_invokeinterface_rejects_bad_descriptor() {
        let mut builder = ClassBuilder::new("test/Bad", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()V").unwrap();
        assert_eq!(
            m.invokeinterface("app/Task", "run", "run()"),
            Err(BuildError::InvalidDescriptor("run()".to_string()))
        );
        assert!(m.code.is_empty());
    }

    #[test]
    fn test_highest_local_slot() {
        let mut builder = ClassBuilder::new("test/Slots", OBJECT);
        let mut m = builder.method(access::STATIC, "f", "()V").unwrap();
        m.aload(u16::MAX);
        assert_eq!(m.max_locals, u16::MAX);
        assert_eq!(
            &m.code,
            &[Opcode::Wide.to_u8(), Opcode::Aload.to_u8(), 0xFF, 0xFF]
        );
    }
}
