//! Fixture synthesis
//!
//! Builds a minimal class extending (or implementing) a host type. The
//! synthesized class always has a public no-argument constructor that chains
//! to the super type's; callers can add fields, methods and pool references
//! through a populate step before the class is sealed.

use crate::config::HarnessConfig;
use crate::scope::TypeHandle;
use asyncfix_classfile::{
    access, ClassBuilder, ClassFile, Code, Opcode, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR, OBJECT,
};
use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};

/// Where a fixture was requested from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    method: String,
    line: u32,
}

impl CallSite {
    /// Call site with an explicit method name and line
    pub fn new(method: impl Into<String>, line: u32) -> Self {
        Self {
            method: method.into(),
            line,
        }
    }

    /// Call site at the caller's line
    #[track_caller]
    pub fn caller(method: impl Into<String>) -> Self {
        Self::new(method, Location::caller().line())
    }

    /// Requesting method name
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Requesting line
    pub fn line(&self) -> u32 {
        self.line
    }
}

/// Picks the simple name of a synthesized class
pub trait NamingStrategy {
    /// Name for a fixture requested at `site`
    fn fixture_name(&self, site: &CallSite) -> String;
}

/// `Experiment<Method><line>`, stable for a given call site
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSiteNaming;

impl NamingStrategy for CallSiteNaming {
    fn fixture_name(&self, site: &CallSite) -> String {
        format!("Experiment{}{}", capitalize(site.method()), site.line())
    }
}

/// `Experiment<n>` from a counter, ignoring the call site
#[derive(Debug, Default)]
pub struct SequentialNaming {
    next: AtomicU32,
}

impl SequentialNaming {
    /// Start counting at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl NamingStrategy for SequentialNaming {
    fn fixture_name(&self, _site: &CallSite) -> String {
        format!("Experiment{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Builds fixture classes nested under an owner type
pub struct ModuleSynthesizer {
    owner: String,
    naming: Box<dyn NamingStrategy>,
}

impl ModuleSynthesizer {
    /// Synthesizer with an explicit naming strategy
    pub fn new(owner: impl Into<String>, naming: impl NamingStrategy + 'static) -> Self {
        Self {
            owner: owner.into(),
            naming: Box::new(naming),
        }
    }

    /// Synthesizer using call-site naming
    pub fn with_call_site_naming(owner: impl Into<String>) -> Self {
        Self::new(owner, CallSiteNaming)
    }

    /// Synthesizer for the configured owner, using call-site naming
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::with_call_site_naming(config.owner.as_str())
    }

    /// Owner internal name
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Internal name a fixture requested at `site` will get
    pub fn fixture_name(&self, site: &CallSite) -> String {
        format!("{}${}", self.owner, self.naming.fixture_name(site))
    }

    /// Build a fixture class with no extra members
    pub fn synthesize_class(&self, super_type: &TypeHandle, site: &CallSite) -> ClassFile {
        self.synthesize_class_with(super_type, site, |_| {})
    }

    /// Build a fixture class, letting `populate` add members first
    pub fn synthesize_class_with<F>(
        &self,
        super_type: &TypeHandle,
        site: &CallSite,
        populate: F,
    ) -> ClassFile
    where
        F: FnOnce(&mut ClassBuilder),
    {
        let super_name = if super_type.is_interface() {
            OBJECT
        } else {
            super_type.name()
        };

        let mut builder = ClassBuilder::new(&self.fixture_name(site), super_name);
        builder.set_access_flags(access::PUBLIC | access::SUPER);
        if super_type.is_interface() {
            builder.add_interface(super_type.name());
        }

        populate(&mut builder);

        let mut code = Vec::with_capacity(5);
        code.push(Opcode::Aload0.to_u8());
        code.push(Opcode::Invokespecial.to_u8());
        let init = builder
            .constants_mut()
            .method_ref(super_name, CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR);
        code.extend_from_slice(&init.to_be_bytes());
        code.push(Opcode::Return.to_u8());

        builder.add_method_with_code(
            access::PUBLIC,
            CONSTRUCTOR_NAME,
            NO_ARG_DESCRIPTOR,
            &Code {
                max_stack: 1,
                max_locals: 1,
                code,
                exception_table: Vec::new(),
                attributes: Vec::new(),
            },
        );
        builder.build()
    }

    /// Build and encode a fixture with no extra members
    pub fn synthesize(&self, super_type: &TypeHandle, site: &CallSite) -> Vec<u8> {
        self.synthesize_class(super_type, site).encode()
    }

    /// Build and encode a fixture, letting `populate` add members first
    pub fn synthesize_with<F>(
        &self,
        super_type: &TypeHandle,
        site: &CallSite,
        populate: F,
    ) -> Vec<u8>
    where
        F: FnOnce(&mut ClassBuilder),
    {
        self.synthesize_class_with(super_type, site, populate).encode()
    }
}

impl std::fmt::Debug for ModuleSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSynthesizer")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{TypeDef, TypeScope};
    use asyncfix_classfile::{decode_instructions, verify_class};

    fn host() -> TypeScope {
        let scope = TypeScope::bootstrap();
        scope.register(TypeDef::interface("app/Task")).unwrap();
        scope.register(TypeDef::class("app/Base", OBJECT)).unwrap();
        scope
    }

    #[test]
    fn test_call_site_naming() {
        let naming = CallSiteNaming;
        assert_eq!(
            naming.fixture_name(&CallSite::new("testSimple", 42)),
            "ExperimentTestSimple42"
        );
        assert_eq!(naming.fixture_name(&CallSite::new("", 7)), "Experiment7");
    }

    #[test]
    fn test_sequential_naming() {
        let naming = SequentialNaming::new();
        let site = CallSite::new("ignored", 1);
        assert_eq!(naming.fixture_name(&site), "Experiment0");
        assert_eq!(naming.fixture_name(&site), "Experiment1");
    }

    #[test]
    fn test_caller_captures_line() {
        let (site, line) = (CallSite::caller("here"), line!());
        assert_eq!(site.line(), line);
        assert_eq!(site.method(), "here");
    }

    #[test]
    fn test_class_super_type() {
        let scope = host();
        let synth = ModuleSynthesizer::with_call_site_naming("app/Tests");
        let class = synth.synthesize_class(
            &scope.resolve("app/Base").unwrap(),
            &CallSite::new("run", 10),
        );

        assert_eq!(class.name(), Some("app/Tests$ExperimentRun10"));
        assert_eq!(class.super_name(), Some("app/Base"));
        assert!(class.interfaces.is_empty());
        assert_eq!(class.major_version, 52);
        assert_eq!(class.access_flags, access::PUBLIC | access::SUPER);
        verify_class(&class).unwrap();
    }

    #[test]
    fn test_interface_super_type() {
        let scope = host();
        let synth = ModuleSynthesizer::with_call_site_naming("app/Tests");
        let class = synth.synthesize_class(
            &scope.resolve("app/Task").unwrap(),
            &CallSite::new("run", 11),
        );

        assert_eq!(class.super_name(), Some(OBJECT));
        assert_eq!(class.interface_names(), vec!["app/Task"]);
    }

    #[test]
    fn test_constructor_shape() {
        let scope = host();
        let synth = ModuleSynthesizer::new("app/Tests", SequentialNaming::new());
        let class = synth.synthesize_class(
            &scope.resolve("app/Base").unwrap(),
            &CallSite::new("run", 1),
        );

        let init = class.find_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR).unwrap();
        assert_eq!(init.access_flags, access::PUBLIC);
        let code = init.code(&class.constants).unwrap().unwrap();
        assert_eq!((code.max_stack, code.max_locals), (1, 1));

        let instructions = decode_instructions(&code.code).unwrap();
        let ops: Vec<_> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(ops, vec![Opcode::Aload0, Opcode::Invokespecial, Opcode::Return]);
        let target = class.constants.member_ref(instructions[1].pool_index().unwrap());
        assert_eq!(target, Some(("app/Base", CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR)));
    }

    #[test]
    fn test_populate_runs_before_constructor() {
        let scope = host();
        let synth = ModuleSynthesizer::with_call_site_naming("app/Tests");
        let class = synth.synthesize_class_with(
            &scope.resolve("app/Base").unwrap(),
            &CallSite::new("populate", 3),
            |builder| {
                assert!(!builder.has_method(CONSTRUCTOR_NAME, NO_ARG_DESCRIPTOR));
                builder.add_field(access::PUBLIC, "value", "I");
            },
        );
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.methods.len(), 1);
    }
}
