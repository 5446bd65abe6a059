//! Transform debugging
//!
//! Runs a [`Transform`] on one class and keeps everything needed to diff the
//! result: the input bytes as `<debug_dir>/<name>.class`, the output bytes as
//! `<debug_dir>/<name>.out.class`, and a text trace of each side.

use crate::config::HarnessConfig;
use crate::loader::LoadedType;
use crate::scope::TypeScope;
use crate::transform::{Transform, TransformError};
use asyncfix_classfile::{render_trace, ClassFile, DecodeError};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Debug driver errors
#[derive(Debug, Error)]
pub enum DebugError {
    /// Filesystem failure
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// The input is not a class file
    #[error("Invalid input class: {0}")]
    Decode(#[from] DecodeError),

    /// The transformer produced something that is not a class file
    #[error("Transformer produced an invalid class: {0}")]
    InvalidOutput(DecodeError),

    /// The transformer failed
    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    /// No class path root holds the requested class
    #[error("Class {name} not found on class path ({searched} roots searched)")]
    ClassNotFound { name: String, searched: usize },

    /// A class without a resolvable name
    #[error("Class has no resolvable name")]
    Unnamed,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> DebugError + '_ {
    move |source| DebugError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Receives a text trace for each class the driver handles
pub trait TraceSink {
    /// Save the trace of `class` under `key`
    fn save_trace(&self, key: &str, class: &ClassFile) -> Result<(), DebugError>;
}

/// Writes traces to `<dir>/<key>.txt`
#[derive(Debug, Clone)]
pub struct FileTraceSink {
    dir: PathBuf,
}

impl FileTraceSink {
    /// Sink rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path a trace with this key is written to
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.txt"))
    }
}

impl TraceSink for FileTraceSink {
    fn save_trace(&self, key: &str, class: &ClassFile) -> Result<(), DebugError> {
        let path = self.path_for(key);
        write_replacing(&path, render_trace(class).as_bytes())?;
        info!(path = %path.display(), "wrote trace");
        Ok(())
    }
}

/// Keeps traces in memory, in the order they were saved
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    traces: Mutex<Vec<(String, String)>>,
}

impl MemoryTraceSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest trace saved under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.traces
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, trace)| trace.clone())
    }

    /// Keys in save order
    pub fn keys(&self) -> Vec<String> {
        self.traces.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn save_trace(&self, key: &str, class: &ClassFile) -> Result<(), DebugError> {
        self.traces.lock().push((key.to_string(), render_trace(class)));
        Ok(())
    }
}

impl<S: TraceSink + ?Sized> TraceSink for std::sync::Arc<S> {
    fn save_trace(&self, key: &str, class: &ClassFile) -> Result<(), DebugError> {
        (**self).save_trace(key, class)
    }
}

/// Where `.class` artifacts go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    debug_dir: PathBuf,
}

impl ArtifactLayout {
    /// Layout rooted at `debug_dir`
    pub fn new(debug_dir: impl Into<PathBuf>) -> Self {
        Self {
            debug_dir: debug_dir.into(),
        }
    }

    /// Root directory
    pub fn debug_dir(&self) -> &Path {
        &self.debug_dir
    }

    /// `<debug_dir>/<name>.class`
    pub fn input_path(&self, name: &str) -> PathBuf {
        self.debug_dir.join(format!("{name}.class"))
    }

    /// `<debug_dir>/<name>.out.class`
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.debug_dir.join(format!("{name}.out.class"))
    }
}

/// Roots searched for compiled classes by logical name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassPath {
    roots: Vec<PathBuf>,
}

impl ClassPath {
    /// Class path over `roots`, searched in order
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// Search roots
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// `com.example.Foo` -> `com/example/Foo.class`
    pub fn relative_path(logical_name: &str) -> PathBuf {
        PathBuf::from(format!("{}.class", logical_name.replace('.', "/")))
    }

    /// First root holding the class
    pub fn resolve(&self, logical_name: &str) -> Option<PathBuf> {
        let relative = Self::relative_path(logical_name);
        self.roots
            .iter()
            .map(|root| root.join(&relative))
            .find(|path| path.is_file())
    }

    /// Read the class bytes
    pub fn read(&self, logical_name: &str) -> Result<Vec<u8>, DebugError> {
        let path = self
            .resolve(logical_name)
            .ok_or_else(|| DebugError::ClassNotFound {
                name: logical_name.to_string(),
                searched: self.roots.len(),
            })?;
        fs::read(&path).map_err(io_error(&path))
    }
}

/// Outcome of one debug run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugReport {
    /// Declared name of the input class
    pub input_name: String,
    /// Declared name of the output class
    pub output_name: String,
    /// Where the input bytes were written
    pub input_path: PathBuf,
    /// Where the output bytes were written
    pub output_path: PathBuf,
    /// CRC-32 of the input bytes
    pub input_crc32: u32,
    /// CRC-32 of the output bytes
    pub output_crc32: u32,
}

impl DebugReport {
    /// Check whether the transformer changed the bytes
    pub fn changed(&self) -> bool {
        self.input_crc32 != self.output_crc32
    }
}

/// Runs a transformer and persists both sides
pub struct DebugDriver {
    transform: Box<dyn Transform>,
    layout: ArtifactLayout,
    sink: Box<dyn TraceSink>,
    class_path: ClassPath,
    scope: TypeScope,
}

impl DebugDriver {
    /// Driver writing artifacts by `layout` and traces to `sink`
    pub fn new(
        transform: impl Transform + 'static,
        layout: ArtifactLayout,
        sink: impl TraceSink + 'static,
    ) -> Self {
        Self {
            transform: Box::new(transform),
            layout,
            sink: Box::new(sink),
            class_path: ClassPath::default(),
            scope: TypeScope::bootstrap(),
        }
    }

    /// Driver using the configured directories and class path
    pub fn from_config(config: &HarnessConfig, transform: impl Transform + 'static) -> Self {
        Self::new(
            transform,
            ArtifactLayout::new(&config.debug_dir),
            FileTraceSink::new(config.trace_dir()),
        )
        .with_class_path(ClassPath::new(config.class_path.iter().cloned()))
    }

    /// Replace the class path
    pub fn with_class_path(mut self, class_path: ClassPath) -> Self {
        self.class_path = class_path;
        self
    }

    /// Replace the scope handed to the transformer
    pub fn with_scope(mut self, scope: TypeScope) -> Self {
        self.scope = scope;
        self
    }

    /// Artifact layout
    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Transform `input` and persist both sides
    #[tracing::instrument(level = "debug", skip_all, fields(len = input.len()))]
    pub fn debug_transform(&self, input: &[u8]) -> Result<DebugReport, DebugError> {
        let input_class = ClassFile::decode(input)?;
        let input_name = class_name(&input_class)?;
        let input_path = self.layout.input_path(&input_name);
        write_replacing(&input_path, input)?;
        info!(path = %input_path.display(), "wrote input class");
        self.sink.save_trace(&input_name, &input_class)?;

        let output = self.transform.transform(&self.scope, input)?;

        let output_class = ClassFile::decode(&output).map_err(DebugError::InvalidOutput)?;
        let output_name = class_name(&output_class)?;
        let output_path = self.layout.output_path(&output_name);
        write_replacing(&output_path, &output)?;
        info!(path = %output_path.display(), "wrote output class");
        self.sink
            .save_trace(&format!("{output_name}.out"), &output_class)?;

        Ok(DebugReport {
            input_name,
            output_name,
            input_path,
            output_path,
            input_crc32: crc32fast::hash(input),
            output_crc32: crc32fast::hash(&output),
        })
    }

    /// Transform a class found on the class path by logical name
    pub fn debug_transform_named(&self, logical_name: &str) -> Result<DebugReport, DebugError> {
        let bytes = self.class_path.read(logical_name)?;
        self.debug_transform(&bytes)
    }

    /// Transform the bytes a loaded type was defined from
    pub fn debug_transform_type(&self, ty: &LoadedType) -> Result<DebugReport, DebugError> {
        self.debug_transform(ty.bytes())
    }
}

impl std::fmt::Debug for DebugDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugDriver")
            .field("layout", &self.layout)
            .field("class_path", &self.class_path)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn class_name(class: &ClassFile) -> Result<String, DebugError> {
    class.name().map(str::to_string).ok_or(DebugError::Unnamed)
}

/// Write `bytes` to `path`, creating parents and replacing any old file
fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), DebugError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_error(path)(err)),
    }
    fs::write(path, bytes).map_err(io_error(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use asyncfix_classfile::OBJECT;
    use std::sync::Arc;

    fn identity(_: &TypeScope, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        Ok(input.to_vec())
    }

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("target/classes2");
        assert_eq!(
            layout.input_path("a/b/C"),
            PathBuf::from("target/classes2/a/b/C.class")
        );
        assert_eq!(
            layout.output_path("a/b/C"),
            PathBuf::from("target/classes2/a/b/C.out.class")
        );
    }

    #[test]
    fn test_class_path_relative() {
        assert_eq!(
            ClassPath::relative_path("com.example.Foo"),
            PathBuf::from("com/example/Foo.class")
        );
    }

    #[test]
    fn test_memory_sink_keeps_latest() {
        let sink = MemoryTraceSink::new();
        sink.save_trace("k", &ClassFile::new("a/A", OBJECT)).unwrap();
        sink.save_trace("k", &ClassFile::new("b/B", OBJECT)).unwrap();
        assert_eq!(sink.keys(), vec!["k", "k"]);
        assert!(sink.get("k").unwrap().contains("b/B"));
        assert!(sink.get("missing").is_none());
    }

    #[test]
    fn test_report_changed() {
        let sink = Arc::new(MemoryTraceSink::new());
        let dir = tempfile::tempdir().unwrap();
        let driver = DebugDriver::new(identity, ArtifactLayout::new(dir.path()), sink.clone());

        let report = driver
            .debug_transform(&ClassFile::new("unit/Same", OBJECT).encode())
            .unwrap();
        assert!(!report.changed());
        assert_eq!(sink.keys(), vec!["unit/Same", "unit/Same.out"]);
        assert!(dir.path().join("unit/Same.out.class").is_file());
    }

    #[test]
    fn test_missing_class_on_class_path() {
        let driver = DebugDriver::new(
            identity,
            ArtifactLayout::new("unused"),
            MemoryTraceSink::new(),
        )
        .with_class_path(ClassPath::new(["/nonexistent/root"]));
        assert!(matches!(
            driver.debug_transform_named("com.example.Missing"),
            Err(DebugError::ClassNotFound { searched: 1, .. })
        ));
    }
}
