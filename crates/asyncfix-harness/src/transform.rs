//! The transformer under test
//!
//! The rewriting itself lives outside this crate; the harness only needs a
//! function from class bytes to class bytes that can fail with an analysis
//! error.

use crate::scope::TypeScope;
use thiserror::Error;

/// Transform errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The transformer could not analyze the input
    #[error("Analysis failed: {message}")]
    Analysis { message: String },
}

impl TransformError {
    /// Analysis error with a message
    pub fn analysis(message: impl Into<String>) -> Self {
        TransformError::Analysis {
            message: message.into(),
        }
    }
}

/// A class-file rewriter
pub trait Transform {
    /// Rewrite `input`, resolving referenced types through `scope`
    fn transform(&self, scope: &TypeScope, input: &[u8]) -> Result<Vec<u8>, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&TypeScope, &[u8]) -> Result<Vec<u8>, TransformError>,
{
    fn transform(&self, scope: &TypeScope, input: &[u8]) -> Result<Vec<u8>, TransformError> {
        self(scope, input)
    }
}
