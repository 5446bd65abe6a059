//! Isolated loading
//!
//! Every load gets a fresh [`IsolationContext`] whose scope is a child of the
//! super type's own scope. Types defined there are visible to nothing else,
//! so the same fixture bytes can be loaded any number of times. The context
//! stays alive for as long as an [`Instance`] created in it does.

mod construct;

pub use construct::{ConstructError, Instance, Value};

use crate::scope::{ScopeError, TypeDef, TypeHandle, TypeKind, TypeScope};
use crate::synth::{CallSite, ModuleSynthesizer};
use asyncfix_classfile::{
    access, verify_class, ClassBuilder, ClassFile, DecodeError, VerifyError, CONSTRUCTOR_NAME,
    NO_ARG_DESCRIPTOR,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Load errors
#[derive(Debug, Error)]
pub enum LoadError {
    /// Bytes are not a class file
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Class file is structurally invalid
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// Super type or interface cannot be used
    #[error("Resolution failed: {0}")]
    Resolve(#[from] ScopeError),

    /// Name already defined in this context
    #[error("Duplicate definition of {0}")]
    DuplicateDefinition(String),

    /// No type by that name was defined in this context
    #[error("Type {0} is not defined in this context")]
    UnknownType(String),

    /// Interfaces and abstract classes cannot be instantiated
    #[error("Type {0} cannot be instantiated")]
    NotInstantiable(String),

    /// No `<init>()V`
    #[error("Type {0} has no no-argument constructor")]
    MissingConstructor(String),

    /// The constructor chain failed
    #[error("Constructor of {type_name} failed: {source}")]
    Constructor {
        type_name: String,
        source: ConstructError,
    },

    /// The instance cannot be used as the requested super type
    #[error("{name} is not assignable to {target}")]
    NotAssignable { name: String, target: String },
}

/// A type defined in an isolation context
#[derive(Debug)]
pub struct LoadedType {
    handle: TypeHandle,
    class: ClassFile,
    bytes: Vec<u8>,
}

impl LoadedType {
    /// Internal name
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Scope-level view of the type
    pub fn handle(&self) -> &TypeHandle {
        &self.handle
    }

    /// Decoded class
    pub fn class(&self) -> &ClassFile {
        &self.class
    }

    /// The exact bytes the type was defined from
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// A disposable scope for defining types from raw bytes
#[derive(Debug)]
pub struct IsolationContext {
    id: u64,
    scope: TypeScope,
    loaded: RwLock<FxHashMap<String, Arc<LoadedType>>>,
}

impl IsolationContext {
    /// Create a context whose lookups fall back to `parent`
    pub fn new(parent: &TypeScope) -> Arc<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            scope: parent.child(format!("isolation-{id}")),
            loaded: RwLock::new(FxHashMap::default()),
        })
    }

    /// Unique id of this context
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The context's own scope
    pub fn scope(&self) -> &TypeScope {
        &self.scope
    }

    /// Define a type from class-file bytes
    ///
    /// Super type and interfaces resolve through the parent chain first, then
    /// through types already defined here.
    pub fn define(&self, bytes: &[u8]) -> Result<Arc<LoadedType>, LoadError> {
        let class = ClassFile::decode(bytes)?;
        verify_class(&class)?;

        let name = class
            .name()
            .ok_or(VerifyError::InvalidConstantRef {
                index: class.this_class,
                expected: "Class",
            })?
            .to_string();
        if self.loaded.read().contains_key(&name) {
            return Err(LoadError::DuplicateDefinition(name));
        }

        let kind = if class.is_interface() {
            TypeKind::Interface
        } else {
            TypeKind::Class
        };
        let def = TypeDef {
            name: name.clone(),
            kind,
            super_name: match kind {
                TypeKind::Class => class.super_name().map(str::to_string),
                TypeKind::Interface => None,
            },
            interfaces: class.interface_names().into_iter().map(str::to_string).collect(),
            has_default_ctor: class.find_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR).is_some(),
        };

        let handle = self.scope.register(def).map_err(|err| match err {
            ScopeError::DuplicateType(name) => LoadError::DuplicateDefinition(name),
            other => LoadError::Resolve(other),
        })?;

        let loaded = Arc::new(LoadedType {
            handle,
            class,
            bytes: bytes.to_vec(),
        });
        self.loaded.write().insert(name.clone(), loaded.clone());
        debug!(context = self.id, name = %name, "defined type");
        Ok(loaded)
    }

    /// Find a type by name, asking the parent chain first
    pub fn resolve(&self, name: &str) -> Option<TypeHandle> {
        self.scope.resolve(name)
    }

    /// A type defined in this context
    pub fn loaded(&self, name: &str) -> Option<Arc<LoadedType>> {
        self.loaded.read().get(name).cloned()
    }

    /// Create an instance of a type defined in this context
    pub fn instantiate(self: &Arc<Self>, name: &str) -> Result<Instance, LoadError> {
        let ty = self
            .loaded(name)
            .ok_or_else(|| LoadError::UnknownType(name.to_string()))?;

        if ty.class.access_flags & (access::INTERFACE | access::ABSTRACT) != 0 {
            return Err(LoadError::NotInstantiable(name.to_string()));
        }
        if ty.class.find_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR).is_none() {
            return Err(LoadError::MissingConstructor(name.to_string()));
        }

        let instance = construct::construct(self.clone(), ty).map_err(|source| {
            LoadError::Constructor {
                type_name: name.to_string(),
                source,
            }
        })?;
        debug!(context = self.id, name = %name, "constructed instance");
        Ok(instance)
    }
}

/// Loads fixture bytes into fresh isolation contexts
#[derive(Debug)]
pub struct IsolatedLoader {
    synthesizer: ModuleSynthesizer,
}

impl IsolatedLoader {
    /// Loader that synthesizes fixtures with `synthesizer`
    pub fn new(synthesizer: ModuleSynthesizer) -> Self {
        Self { synthesizer }
    }

    /// The synthesizer used by [`IsolatedLoader::create`]
    pub fn synthesizer(&self) -> &ModuleSynthesizer {
        &self.synthesizer
    }

    /// Define `bytes` in a new context under `super_type`'s scope and instantiate it
    pub fn load(&self, super_type: &TypeHandle, bytes: &[u8]) -> Result<Instance, LoadError> {
        let context = IsolationContext::new(super_type.scope());
        let ty = context.define(bytes)?;
        let instance = context.instantiate(ty.name())?;
        if !instance.is_instance_of(super_type.name()) {
            return Err(LoadError::NotAssignable {
                name: ty.name().to_string(),
                target: super_type.name().to_string(),
            });
        }
        Ok(instance)
    }

    /// Synthesize an empty fixture for `super_type` and load it
    pub fn create(&self, super_type: &TypeHandle, site: &CallSite) -> Result<Instance, LoadError> {
        let bytes = self.synthesizer.synthesize(super_type, site);
        self.load(super_type, &bytes)
    }

    /// Synthesize a populated fixture for `super_type` and load it
    pub fn create_with<F>(
        &self,
        super_type: &TypeHandle,
        site: &CallSite,
        populate: F,
    ) -> Result<Instance, LoadError>
    where
        F: FnOnce(&mut ClassBuilder),
    {
        let bytes = self.synthesizer.synthesize_with(super_type, site, populate);
        self.load(super_type, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::TypeDef;
    use asyncfix_classfile::OBJECT;

    fn host() -> TypeScope {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::interface("app/Task")).unwrap();
        scope.register(TypeDef::class("app/Base", OBJECT)).unwrap();
        scope
            .register(TypeDef::class("app/NoCtor", OBJECT).without_default_ctor())
            .unwrap();
        scope
    }

    fn loader() -> IsolatedLoader {
        IsolatedLoader::new(ModuleSynthesizer::with_call_site_naming("app/Tests"))
    }

    #[test]
    fn test_create_extends_class() {
        let scope = host();
        let base = scope.resolve("app/Base").unwrap();
        let instance = loader().create(&base, &CallSite::new("run", 1)).unwrap();

        assert_eq!(instance.type_name(), "app/Tests$ExperimentRun1");
        assert!(instance.is_instance_of("app/Base"));
        assert!(instance.is_instance_of(OBJECT));
        assert!(scope.resolve(instance.type_name()).is_none());
    }

    #[test]
    fn test_create_implements_interface() {
        let scope = host();
        let task = scope.resolve("app/Task").unwrap();
        let instance = loader().create(&task, &CallSite::new("run", 2)).unwrap();
        assert!(instance.is_instance_of("app/Task"));
    }

    #[test]
    fn test_same_bytes_in_two_contexts() {
        let scope = host();
        let base = scope.resolve("app/Base").unwrap();
        let loader = loader();
        let site = CallSite::new("twice", 5);

        let first = loader.create(&base, &site).unwrap();
        let second = loader.create(&base, &site).unwrap();
        assert_eq!(first.type_name(), second.type_name());
        assert_ne!(first.context().id(), second.context().id());
    }

    #[test]
    fn test_duplicate_in_one_context() {
        let scope = host();
        let base = scope.resolve("app/Base").unwrap();
        let bytes = loader().synthesizer().synthesize(&base, &CallSite::new("dup", 1));

        let context = IsolationContext::new(&scope);
        context.define(&bytes).unwrap();
        assert!(matches!(
            context.define(&bytes),
            Err(LoadError::DuplicateDefinition(_))
        ));
    }

    #[test]
    fn test_host_without_default_ctor() {
        let scope = host();
        let no_ctor = scope.resolve("app/NoCtor").unwrap();
        let result = loader().create(&no_ctor, &CallSite::new("ctor", 1));
        assert!(matches!(result, Err(LoadError::Constructor { .. })));
    }

    #[test]
    fn test_unresolved_super_type() {
        let scope = host();
        let other = TypeScope::bootstrap();
        other.register(TypeDef::class("elsewhere/Base", OBJECT)).unwrap();
        let foreign = other.resolve("elsewhere/Base").unwrap();
        let bytes = loader().synthesizer().synthesize(&foreign, &CallSite::new("x", 1));

        let context = IsolationContext::new(&scope);
        assert!(matches!(
            context.define(&bytes),
            Err(LoadError::Resolve(ScopeError::UnresolvedType { .. }))
        ));
    }

    #[test]
    fn test_garbage_bytes() {
        let scope = host();
        let base = scope.resolve("app/Base").unwrap();
        assert!(matches!(
            loader().load(&base, b"not a class"),
            Err(LoadError::Decode(_))
        ));
    }

    #[test]
    fn test_loaded_type_keeps_bytes() {
        let scope = host();
        let base = scope.resolve("app/Base").unwrap();
        let bytes = loader().synthesizer().synthesize(&base, &CallSite::new("keep", 1));
        let instance = loader().load(&base, &bytes).unwrap();
        assert_eq!(instance.loaded_type().bytes(), bytes.as_slice());
    }
}
