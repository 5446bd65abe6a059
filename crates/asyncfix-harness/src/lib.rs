//! Test harness for class-file transformers
//!
//! Synthesizes fixture classes against host types, loads them into isolated
//! scopes, runs a transformer over them while writing inspectable artifacts,
//! and completes deferred values in the order tests queued them.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod debug;
pub mod deferred;
pub mod loader;
pub mod scope;
pub mod synth;
pub mod transform;

pub use config::{ConfigError, HarnessConfig};
pub use debug::{
    ArtifactLayout, ClassPath, DebugDriver, DebugError, DebugReport, FileTraceSink,
    MemoryTraceSink, TraceSink,
};
pub use deferred::{DeferredQueue, Pending};
pub use loader::{
    ConstructError, Instance, IsolatedLoader, IsolationContext, LoadError, LoadedType, Value,
};
pub use scope::{ScopeError, TypeDef, TypeHandle, TypeKind, TypeScope};
pub use synth::{CallSite, CallSiteNaming, ModuleSynthesizer, NamingStrategy, SequentialNaming};
pub use transform::{Transform, TransformError};
