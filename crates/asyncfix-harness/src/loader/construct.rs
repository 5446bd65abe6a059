//! Constructor execution
//!
//! Runs `<init>()V` bodies over a small operand stack. The supported subset
//! covers what fixture constructors do: push constants, store them into
//! fields of `this`, and chain to the super constructor. Host super types are
//! opaque; reaching one only checks that it has a default constructor.

use super::{IsolationContext, LoadedType};
use asyncfix_classfile::{
    decode_instructions, CodeError, Constant, DecodeError, Instruction, Opcode, CONSTRUCTOR_NAME,
    NO_ARG_DESCRIPTOR,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

/// Constructor execution errors
#[derive(Debug, Error, PartialEq)]
pub enum ConstructError {
    /// No `<init>()V` body to run
    #[error("No constructor body in {0}")]
    MissingBody(String),

    /// The body does not decode
    #[error("Malformed constructor: {0}")]
    Malformed(String),

    /// Instruction outside the supported subset
    #[error("Unsupported instruction {mnemonic} at offset {offset}")]
    Unsupported {
        mnemonic: &'static str,
        offset: usize,
    },

    /// Pop from an empty operand stack
    #[error("Operand stack underflow at offset {0}")]
    StackUnderflow(usize),

    /// Field store or constructor call on something other than `this`
    #[error("Receiver is not this at offset {0}")]
    NotThis(usize),

    /// Pool entry cannot be pushed
    #[error("Unusable constant #{index} at offset {offset}")]
    BadConstant { index: u16, offset: usize },

    /// Field store to a field this type does not declare
    #[error("Unknown field {owner}.{name}")]
    UnknownField { owner: String, name: String },

    /// `invokespecial` that is not the super type's `<init>()V`
    #[error("Invalid constructor call {owner}.{name}{descriptor}")]
    InvalidSuperCall {
        owner: String,
        name: String,
        descriptor: String,
    },

    /// Super constructor invoked more than once
    #[error("Super constructor called twice in {0}")]
    DuplicateSuperCall(String),

    /// Returned without calling the super constructor
    #[error("Constructor of {0} returned without calling super")]
    MissingSuperCall(String),

    /// A host super type without a usable no-argument constructor
    #[error("Super type {0} has no default constructor")]
    NoDefaultConstructor(String),

    /// The body ended without returning
    #[error("Constructor of {0} does not return")]
    NoReturn(String),
}

impl From<CodeError> for ConstructError {
    fn from(err: CodeError) -> Self {
        ConstructError::Malformed(err.to_string())
    }
}

impl From<DecodeError> for ConstructError {
    fn from(err: DecodeError) -> Self {
        ConstructError::Malformed(err.to_string())
    }
}

/// A value on the operand stack or in a field
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `null`
    Null,
    /// The instance under construction
    This,
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `float`
    Float(f32),
    /// `double`
    Double(f64),
    /// String constant
    Str(String),
    /// Class literal
    Class(String),
}

/// An instantiated fixture
#[derive(Debug)]
pub struct Instance {
    context: Arc<IsolationContext>,
    ty: Arc<LoadedType>,
    fields: FxHashMap<String, Value>,
}

impl Instance {
    /// Internal name of the instance's type
    pub fn type_name(&self) -> &str {
        self.ty.name()
    }

    /// The instance's type
    pub fn loaded_type(&self) -> &Arc<LoadedType> {
        &self.ty
    }

    /// The context that defined the type
    pub fn context(&self) -> &Arc<IsolationContext> {
        &self.context
    }

    /// Value stored into a field by the constructor chain
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All stored fields
    pub fn fields(&self) -> &FxHashMap<String, Value> {
        &self.fields
    }

    /// Check whether the instance can be used as `target`
    pub fn is_instance_of(&self, target: &str) -> bool {
        self.context.scope().is_assignable(self.type_name(), target)
    }
}

/// Run the constructor chain of `ty` and wrap the result
pub(super) fn construct(
    context: Arc<IsolationContext>,
    ty: Arc<LoadedType>,
) -> Result<Instance, ConstructError> {
    let mut fields = FxHashMap::default();
    run_constructor(&context, &ty, &mut fields)?;
    Ok(Instance {
        context,
        ty,
        fields,
    })
}

fn run_constructor(
    context: &IsolationContext,
    ty: &LoadedType,
    fields: &mut FxHashMap<String, Value>,
) -> Result<(), ConstructError> {
    let class = ty.class();
    let code = class
        .find_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR)
        .map(|method| method.code(&class.constants))
        .transpose()?
        .flatten()
        .ok_or_else(|| ConstructError::MissingBody(ty.name().to_string()))?;

    let mut frame = Frame {
        stack: Vec::with_capacity(code.max_stack as usize),
        super_called: false,
    };

    for instr in decode_instructions(&code.code)? {
        let offset = instr.offset;
        match instr.opcode {
            Opcode::Aload0 => frame.stack.push(Value::This),
            Opcode::AconstNull => frame.stack.push(Value::Null),
            Opcode::IconstM1
            | Opcode::Iconst0
            | Opcode::Iconst1
            | Opcode::Iconst2
            | Opcode::Iconst3
            | Opcode::Iconst4
            | Opcode::Iconst5 => {
                let value = instr.opcode.to_u8() as i32 - Opcode::Iconst0.to_u8() as i32;
                frame.stack.push(Value::Int(value));
            }
            Opcode::Bipush | Opcode::Sipush => {
                let value = instr.immediate().ok_or_else(|| {
                    ConstructError::Malformed(format!("missing immediate at offset {offset}"))
                })?;
                frame.stack.push(Value::Int(value));
            }
            Opcode::Ldc | Opcode::LdcW | Opcode::Ldc2W => {
                frame.stack.push(load_constant(ty, &instr)?);
            }
            Opcode::Dup => {
                let top = frame.peek(offset)?.clone();
                frame.stack.push(top);
            }
            Opcode::Pop => {
                frame.pop(offset)?;
            }
            Opcode::Putfield => {
                let value = frame.pop(offset)?;
                if frame.pop(offset)? != Value::This {
                    return Err(ConstructError::NotThis(offset));
                }
                let name = declared_field(ty, &instr)?;
                fields.insert(name, value);
            }
            Opcode::Invokespecial => {
                if frame.pop(offset)? != Value::This {
                    return Err(ConstructError::NotThis(offset));
                }
                if frame.super_called {
                    return Err(ConstructError::DuplicateSuperCall(ty.name().to_string()));
                }
                call_super(context, ty, &instr, fields)?;
                frame.super_called = true;
            }
            Opcode::Return => {
                if !frame.super_called {
                    return Err(ConstructError::MissingSuperCall(ty.name().to_string()));
                }
                return Ok(());
            }
            other => {
                return Err(ConstructError::Unsupported {
                    mnemonic: other.mnemonic(),
                    offset,
                })
            }
        }
    }

    Err(ConstructError::NoReturn(ty.name().to_string()))
}

struct Frame {
    stack: Vec<Value>,
    super_called: bool,
}

impl Frame {
    fn pop(&mut self, offset: usize) -> Result<Value, ConstructError> {
        self.stack.pop().ok_or(ConstructError::StackUnderflow(offset))
    }

    fn peek(&self, offset: usize) -> Result<&Value, ConstructError> {
        self.stack.last().ok_or(ConstructError::StackUnderflow(offset))
    }
}

fn load_constant(ty: &LoadedType, instr: &Instruction) -> Result<Value, ConstructError> {
    let pool = &ty.class().constants;
    let index = instr.pool_index().unwrap_or(0);
    let bad = || ConstructError::BadConstant {
        index,
        offset: instr.offset,
    };
    let value = match pool.get(index).ok_or_else(bad)? {
        Constant::Integer(v) => Value::Int(*v),
        Constant::Float(v) => Value::Float(*v),
        Constant::Long(v) => Value::Long(*v),
        Constant::Double(v) => Value::Double(*v),
        Constant::String { string_index } => {
            Value::Str(pool.get_utf8(*string_index).ok_or_else(bad)?.to_string())
        }
        Constant::Class { .. } => Value::Class(pool.class_name(index).ok_or_else(bad)?.to_string()),
        _ => return Err(bad()),
    };
    Ok(value)
}

fn declared_field(ty: &LoadedType, instr: &Instruction) -> Result<String, ConstructError> {
    let class = ty.class();
    let (owner, name, descriptor) = instr
        .pool_index()
        .and_then(|index| class.constants.member_ref(index))
        .ok_or(ConstructError::BadConstant {
            index: instr.pool_index().unwrap_or(0),
            offset: instr.offset,
        })?;

    let declared = owner == ty.name()
        && class.fields.iter().any(|field| {
            class.member_name(field) == Some(name)
                && class.member_descriptor(field) == Some(descriptor)
        });
    if !declared {
        return Err(ConstructError::UnknownField {
            owner: owner.to_string(),
            name: name.to_string(),
        });
    }
    Ok(name.to_string())
}

fn call_super(
    context: &IsolationContext,
    ty: &LoadedType,
    instr: &Instruction,
    fields: &mut FxHashMap<String, Value>,
) -> Result<(), ConstructError> {
    let class = ty.class();
    let (owner, name, descriptor) = instr
        .pool_index()
        .and_then(|index| class.constants.member_ref(index))
        .ok_or(ConstructError::BadConstant {
            index: instr.pool_index().unwrap_or(0),
            offset: instr.offset,
        })?;

    if name != CONSTRUCTOR_NAME
        || descriptor != NO_ARG_DESCRIPTOR
        || class.super_name() != Some(owner)
    {
        return Err(ConstructError::InvalidSuperCall {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        });
    }

    if let Some(parent) = context.loaded(owner) {
        return run_constructor(context, &parent, fields);
    }
    match context.resolve(owner) {
        Some(host) if host.def().has_default_ctor => Ok(()),
        _ => Err(ConstructError::NoDefaultConstructor(owner.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{TypeDef, TypeScope};
    use asyncfix_classfile::{access, ClassBuilder, OBJECT};

    fn define(context: &IsolationContext, builder: ClassBuilder) -> Arc<LoadedType> {
        context.define(&builder.build().encode()).unwrap()
    }

    fn with_constructor(
        name: &str,
        super_name: &str,
        body: impl FnOnce(&mut asyncfix_classfile::MethodBuilder<'_>),
    ) -> ClassBuilder {
        let mut builder = ClassBuilder::new(name, super_name);
        builder.add_field(access::PUBLIC, "count", "I");
        builder.add_field(access::PUBLIC, "label", "Ljava/lang/String;");
        let mut init = builder
            .method(access::PUBLIC, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR)
            .unwrap();
        body(&mut init);
        init.set_max_stack(2);
        init.finish().unwrap();
        builder
    }

    #[test]
    fn test_field_stores() {
        let context = IsolationContext::new(&TypeScope::bootstrap());
        let ty = define(
            &context,
            with_constructor("fx/Fields", OBJECT, |m| {
                m.aload(0);
                m.invokespecial(OBJECT, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
                m.aload(0);
                m.iconst(300);
                m.putfield("fx/Fields", "count", "I");
                m.aload(0);
                m.ldc_string("hello");
                m.putfield("fx/Fields", "label", "Ljava/lang/String;");
                m.return_void();
            }),
        );

        let instance = construct(context.clone(), ty).unwrap();
        assert_eq!(instance.field("count"), Some(&Value::Int(300)));
        assert_eq!(instance.field("label"), Some(&Value::Str("hello".to_string())));
    }

    #[test]
    fn test_chain_through_defined_parent() {
        let context = IsolationContext::new(&TypeScope::bootstrap());
        define(
            &context,
            with_constructor("fx/Parent", OBJECT, |m| {
                m.aload(0);
                m.invokespecial(OBJECT, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
                m.aload(0);
                m.iconst(1);
                m.putfield("fx/Parent", "count", "I");
                m.return_void();
            }),
        );
        let child = define(
            &context,
            with_constructor("fx/Child", "fx/Parent", |m| {
                m.aload(0);
                m.invokespecial("fx/Parent", CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
                m.return_void();
            }),
        );

        let instance = construct(context.clone(), child).unwrap();
        assert_eq!(instance.field("count"), Some(&Value::Int(1)));
        assert!(instance.is_instance_of("fx/Parent"));
    }

    #[test]
    fn test_missing_super_call() {
        let context = IsolationContext::new(&TypeScope::bootstrap());
        let ty = define(
            &context,
            with_constructor("fx/Lazy", OBJECT, |m| m.return_void()),
        );
        assert_eq!(
            construct(context.clone(), ty).unwrap_err(),
            ConstructError::MissingSuperCall("fx/Lazy".to_string())
        );
    }

    #[test]
    fn test_unsupported_instruction() {
        let context = IsolationContext::new(&TypeScope::bootstrap());
        let ty = define(
            &context,
            with_constructor("fx/Thrower", OBJECT, |m| {
                m.aconst_null();
                m.athrow();
            }),
        );
        assert!(matches!(
            construct(context.clone(), ty),
            Err(ConstructError::Unsupported { mnemonic: "athrow", .. })
        ));
    }

    #[test]
    fn test_store_to_undeclared_field() {
        let context = IsolationContext::new(&TypeScope::bootstrap());
        let ty = define(
            &context,
            with_constructor("fx/Stray", OBJECT, |m| {
                m.aload(0);
                m.invokespecial(OBJECT, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
                m.aload(0);
                m.iconst(1);
                m.putfield("fx/Stray", "missing", "I");
                m.return_void();
            }),
        );
        assert!(matches!(
            construct(context.clone(), ty),
            Err(ConstructError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_call_to_wrong_super() {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::class("host/Other", OBJECT)).unwrap();
        let context = IsolationContext::new(&scope);
        let ty = define(
            &context,
            with_constructor("fx/Confused", OBJECT, |m| {
                m.aload(0);
                m.invokespecial("host/Other", CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
                m.return_void();
            }),
        );
        assert!(matches!(
            construct(context.clone(), ty),
            Err(ConstructError::InvalidSuperCall { .. })
        ));
    }
}
