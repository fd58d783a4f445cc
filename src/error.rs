//! Error types and Result aliases.
//!
//! Three failure kinds, one per pipeline stage ([`ErrorKind::Plan`], [`ErrorKind::Execute`],
//! [`ErrorKind::Finalize`]), all carried by a single [`BridgeError`] so callers can match on
//! `kind()` or catch everything uniformly.

#![allow(clippy::doc_markdown)]

use std::{
    backtrace::Backtrace,
    fmt::{self, Display},
};

use smol_str::SmolStr;

/// Result type returned from fallible operations in this crate.
pub type BridgeResult<T, E = Box<BridgeError>> = Result<T, E>;

/// The stage an error fired in. All three derive from this single base kind, per the
/// error handling design: nothing is re-categorized across stages.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Plan error
    Plan,
    /// Execute error
    Execute,
    /// Finalize error
    Finalize,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
/// An error produced by this crate.
pub struct BridgeError {
    /// Which stage produced this error.
    kind: ErrorKind,

    /// Human-readable message naming the offending path(s) and the root cause.
    message: SmolStr,

    /// The underlying cause, if any.
    source: Option<Box<dyn std::error::Error + Send + Sync>>,

    /// Paths or identifiers relevant to the error, attached as `(label, value)` pairs.
    context: Box<[(&'static str, SmolStr)]>,

    backtrace: Option<Backtrace>,
}

impl Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for (key, value) in self.context.iter() {
            write!(f, "\n  {key}: {value}")?;
        }
        if let Some(cause) = &self.source {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

impl BridgeError {
    /// Creates a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Box<Self> {
        Box::new(Self {
            kind,
            message: message.into().into(),
            source: None,
            context: Box::default(),
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// Creates a new error wrapping an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Box<Self> {
        Box::new(Self {
            kind,
            message: message.into().into(),
            source: Some(source.into()),
            context: Box::default(),
            backtrace: Some(Backtrace::capture()),
        })
    }

    /// The stage that produced this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Attach a `(label, value)` context pair, e.g. the offending path.
    #[must_use]
    pub fn attach_context(mut self: Box<Self>, key: &'static str, value: impl Into<SmolStr>) -> Box<Self> {
        let mut context = self.context.to_vec();
        context.push((key, value.into()));
        self.context = context.into_boxed_slice();
        self
    }
}

/// Shorthand constructor for a [`BridgeError`] of kind [`ErrorKind::Plan`].
pub fn plan_error(message: impl Into<String>) -> Box<BridgeError> {
    BridgeError::new(ErrorKind::Plan, message)
}

/// Shorthand constructor for a [`BridgeError`] of kind [`ErrorKind::Execute`].
pub fn execute_error(message: impl Into<String>) -> Box<BridgeError> {
    BridgeError::new(ErrorKind::Execute, message)
}

/// Shorthand constructor for a [`BridgeError`] of kind [`ErrorKind::Finalize`].
pub fn finalize_error(message: impl Into<String>) -> Box<BridgeError> {
    BridgeError::new(ErrorKind::Finalize, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_context() {
        let err = plan_error("output already exists").attach_context("output", "out/");
        let rendered = err.to_string();
        assert!(rendered.contains("Plan error"));
        assert!(rendered.contains("output already exists"));
        assert!(rendered.contains("output: out/"));
    }

    #[test]
    fn kind_is_preserved() {
        let err = execute_error("read failed");
        assert_eq!(err.kind(), ErrorKind::Execute);
    }
}
