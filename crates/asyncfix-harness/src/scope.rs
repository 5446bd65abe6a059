//! Type scopes
//!
//! A [`TypeScope`] is a named table of type definitions with an optional
//! parent. Lookups go to the parent first, so a child can see everything its
//! ancestors define but can never shadow it. Host scopes describe the types a
//! fixture may extend; isolation contexts use a child scope for the types they
//! define.

use asyncfix_classfile::OBJECT;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Scope errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    /// The name is already visible from this scope
    #[error("Type {0} is already defined")]
    DuplicateType(String),

    /// A referenced type is not visible from this scope
    #[error("Type {referenced_by} refers to unknown type {name}")]
    UnresolvedType { name: String, referenced_by: String },

    /// A super type names an interface
    #[error("Type {referenced_by} extends interface {name}")]
    NotAClass { name: String, referenced_by: String },

    /// An implemented type names a class
    #[error("Type {referenced_by} implements class {name}")]
    NotAnInterface { name: String, referenced_by: String },

    /// A non-root type without a super type
    #[error("Class {0} has no super type")]
    MissingSuperType(String),
}

/// Kind of a type definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Instantiable or abstract class
    Class,
    /// Interface
    Interface,
}

/// A type visible in a scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// Internal name
    pub name: String,
    /// Class or interface
    pub kind: TypeKind,
    /// Super class; `None` for the root type and for interfaces
    pub super_name: Option<String>,
    /// Directly implemented (or, for interfaces, extended) interfaces
    pub interfaces: Vec<String>,
    /// Whether a public no-argument constructor exists
    pub has_default_ctor: bool,
}

impl TypeDef {
    /// A class with a default constructor
    pub fn class(name: impl Into<String>, super_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Class,
            super_name: Some(super_name.into()),
            interfaces: Vec::new(),
            has_default_ctor: true,
        }
    }

    /// An interface
    pub fn interface(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Interface,
            super_name: None,
            interfaces: Vec::new(),
            has_default_ctor: false,
        }
    }

    /// Add implemented interfaces
    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.extend(interfaces.into_iter().map(Into::into));
        self
    }

    /// Mark the type as lacking a usable no-argument constructor
    pub fn without_default_ctor(mut self) -> Self {
        self.has_default_ctor = false;
        self
    }

    /// Check if this is an interface
    pub fn is_interface(&self) -> bool {
        self.kind == TypeKind::Interface
    }
}

struct ScopeInner {
    name: String,
    parent: Option<TypeScope>,
    types: RwLock<FxHashMap<String, Arc<TypeDef>>>,
}

/// A shared, hierarchical table of types
#[derive(Clone)]
pub struct TypeScope {
    inner: Arc<ScopeInner>,
}

impl TypeScope {
    /// Create an empty root scope
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_parent(name, None)
    }

    fn with_parent(name: impl Into<String>, parent: Option<TypeScope>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                parent,
                types: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    /// Create a root scope holding only `java/lang/Object`
    pub fn bootstrap() -> Self {
        let scope = Self::new("bootstrap");
        scope.inner.types.write().insert(
            OBJECT.to_string(),
            Arc::new(TypeDef {
                name: OBJECT.to_string(),
                kind: TypeKind::Class,
                super_name: None,
                interfaces: Vec::new(),
                has_default_ctor: true,
            }),
        );
        scope
    }

    /// Create a child scope
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self::with_parent(name, Some(self.clone()))
    }

    /// Scope name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Parent scope, if any
    pub fn parent(&self) -> Option<&TypeScope> {
        self.inner.parent.as_ref()
    }

    /// Check whether two handles refer to the same scope
    pub fn same_scope(&self, other: &TypeScope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of types defined directly in this scope
    pub fn len(&self) -> usize {
        self.inner.types.read().len()
    }

    /// Check if this scope defines no types itself
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names defined directly in this scope, sorted
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a type after checking its references
    ///
    /// The super type must resolve to a class and every listed interface to
    /// an interface. Only the root type may omit its super type.
    pub fn register(&self, def: TypeDef) -> Result<TypeHandle, ScopeError> {
        if self.resolve(&def.name).is_some() {
            return Err(ScopeError::DuplicateType(def.name));
        }

        match (&def.super_name, def.kind) {
            (Some(super_name), _) => {
                let parent = self.require(super_name, &def.name)?;
                if parent.is_interface() {
                    return Err(ScopeError::NotAClass {
                        name: super_name.clone(),
                        referenced_by: def.name,
                    });
                }
            }
            (None, TypeKind::Class) if def.name != OBJECT => {
                return Err(ScopeError::MissingSuperType(def.name));
            }
            (None, _) => {}
        }

        for interface in &def.interfaces {
            if !self.require(interface, &def.name)?.is_interface() {
                return Err(ScopeError::NotAnInterface {
                    name: interface.clone(),
                    referenced_by: def.name,
                });
            }
        }

        let def = Arc::new(def);
        let mut types = self.inner.types.write();
        if types.contains_key(&def.name) {
            return Err(ScopeError::DuplicateType(def.name.clone()));
        }
        types.insert(def.name.clone(), def.clone());
        Ok(TypeHandle {
            def,
            scope: self.clone(),
        })
    }

    fn require(&self, name: &str, referenced_by: &str) -> Result<TypeHandle, ScopeError> {
        self.resolve(name).ok_or_else(|| ScopeError::UnresolvedType {
            name: name.to_string(),
            referenced_by: referenced_by.to_string(),
        })
    }

    /// Find a type, asking the parent chain first
    pub fn resolve(&self, name: &str) -> Option<TypeHandle> {
        if let Some(found) = self.parent().and_then(|p| p.resolve(name)) {
            return Some(found);
        }
        let def = self.inner.types.read().get(name).cloned()?;
        Some(TypeHandle {
            def,
            scope: self.clone(),
        })
    }

    /// Find a type or fail with the name
    pub fn handle(&self, name: &str) -> Result<TypeHandle, ScopeError> {
        self.require(name, self.name())
    }

    /// Check whether a value of type `sub` can be used where `target` is expected
    pub fn is_assignable(&self, sub: &str, target: &str) -> bool {
        if sub == target || target == OBJECT {
            return self.resolve(sub).is_some();
        }
        let Some(handle) = self.resolve(sub) else {
            return false;
        };
        let def = handle.def();
        def.super_name
            .iter()
            .chain(def.interfaces.iter())
            .any(|parent| self.is_assignable(parent, target))
    }
}

impl fmt::Debug for TypeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeScope")
            .field("name", &self.inner.name)
            .field("types", &self.local_names())
            .field("parent", &self.parent().map(TypeScope::name))
            .finish()
    }
}

/// A type together with the scope that defined it
#[derive(Debug, Clone)]
pub struct TypeHandle {
    def: Arc<TypeDef>,
    scope: TypeScope,
}

impl TypeHandle {
    /// Internal name
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// The definition
    pub fn def(&self) -> &TypeDef {
        &self.def
    }

    /// Check if this is an interface
    pub fn is_interface(&self) -> bool {
        self.def.is_interface()
    }

    /// The scope the type was registered in
    pub fn scope(&self) -> &TypeScope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_has_object() {
        let scope = TypeScope::bootstrap();
        let object = scope.resolve(OBJECT).unwrap();
        assert_eq!(object.name(), OBJECT);
        assert!(!object.is_interface());
        assert!(object.scope().same_scope(&scope));
    }

    #[test]
    fn test_register_and_resolve() {
        let scope = TypeScope::bootstrap();
        let handle = scope
            .register(TypeDef::class("app/Base", OBJECT))
            .unwrap();
        assert_eq!(handle.name(), "app/Base");
        assert!(scope.resolve("app/Base").is_some());
        assert!(scope.resolve("app/Missing").is_none());
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::class("app/Base", OBJECT)).unwrap();
        assert_eq!(
            scope.register(TypeDef::class("app/Base", OBJECT)).unwrap_err(),
            ScopeError::DuplicateType("app/Base".to_string())
        );
    }

    #[test]
    fn test_child_sees_parent_but_cannot_shadow() {
        let host = TypeScope::bootstrap();
        host.register(TypeDef::class("app/Base", OBJECT)).unwrap();
        let child = host.child("isolated");

        let base = child.resolve("app/Base").unwrap();
        assert!(base.scope().same_scope(&host));
        assert!(matches!(
            child.register(TypeDef::class("app/Base", OBJECT)),
            Err(ScopeError::DuplicateType(_))
        ));

        child.register(TypeDef::class("app/Local", "app/Base")).unwrap();
        assert!(host.resolve("app/Local").is_none());
    }

    #[test]
    fn test_reference_checks() {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::interface("app/Task")).unwrap();

        assert!(matches!(
            scope.register(TypeDef::class("app/A", "app/Task")),
            Err(ScopeError::NotAClass { .. })
        ));
        assert!(matches!(
            scope.register(TypeDef::class("app/B", OBJECT).with_interfaces([OBJECT])),
            Err(ScopeError::NotAnInterface { .. })
        ));
        assert!(matches!(
            scope.register(TypeDef::class("app/C", "app/Nope")),
            Err(ScopeError::UnresolvedType { .. })
        ));
    }

    #[test]
    fn test_assignability() {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::interface("app/Task")).unwrap();
        scope
            .register(TypeDef::class("app/Base", OBJECT).with_interfaces(["app/Task"]))
            .unwrap();
        scope.register(TypeDef::class("app/Leaf", "app/Base")).unwrap();

        assert!(scope.is_assignable("app/Leaf", "app/Base"));
        assert!(scope.is_assignable("app/Leaf", "app/Task"));
        assert!(scope.is_assignable("app/Leaf", OBJECT));
        assert!(scope.is_assignable("app/Task", OBJECT));
        assert!(!scope.is_assignable("app/Base", "app/Leaf"));
        assert!(!scope.is_assignable("app/Unknown", OBJECT));
    }
}
