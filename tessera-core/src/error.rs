//! Error types for the engine.
//!
//! Two taxonomies live here. `EngineError` covers everything that aborts a
//! render or attach pass: unresolvable dependencies, malformed markup,
//! expression failures and invalid registrations. `AsyncFailure` covers what
//! an asynchronous directive's initialization can report; the async lifecycle
//! turns those into fallback markers and never lets them escape.

use thiserror::Error;

use crate::tree::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that abort the pass that raised them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A directive asked for a dependency nobody supplies.
    #[error("directive `{directive}` depends on `{name}`, which no built-in, provider or service supplies")]
    UnresolvedDependency {
        /// The directive whose invocation failed.
        directive: String,
        /// The dependency name that could not be resolved.
        name: String,
    },

    /// A directive registration was rejected.
    #[error("invalid directive `{name}`: {reason}")]
    InvalidDirective {
        /// The directive name.
        name: String,
        /// Why the registration is meaningless.
        reason: String,
    },

    /// An expression could not be parsed or evaluated.
    #[error("expression `{expression}` failed: {cause}")]
    Expression {
        /// The offending expression text.
        expression: String,
        /// Reason for the failure.
        cause: String,
    },

    /// Markup could not be parsed.
    #[error("malformed markup at byte {offset}: {cause}")]
    Markup {
        /// Byte offset into the markup.
        offset: usize,
        /// Reason for the failure.
        cause: String,
    },

    /// A directive's synchronous body failed.
    #[error("directive `{directive}` failed on node {node}: {cause}")]
    Directive {
        /// The directive name.
        directive: String,
        /// The node it ran on.
        node: NodeId,
        /// Reason for the failure.
        cause: String,
    },

    /// Options could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Convenience constructor for expression failures.
    pub fn expression(expression: &str, cause: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.to_string(),
            cause: cause.into(),
        }
    }
}

/// Outcomes an asynchronous initialization function can report instead of a
/// value.
///
/// `UseFallback` is a control-flow signal, not a failure: it asks the
/// lifecycle to render the fallback and leave completion to the client. Code
/// that matches on `AsyncFailure` has to name it explicitly. When user code
/// wraps its own fallible work, mapping every error into `Failed` with a
/// catch-all will also swallow a `UseFallback` raised further down, and the
/// fallback then reports as an error instead of a deferral. Propagate it with
/// `?` or match it first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsyncFailure {
    /// Render the fallback and let the client finish the work.
    #[error("fallback requested")]
    UseFallback,

    /// The initialization failed.
    #[error("async initialization failed: {0}")]
    Failed(String),
}

impl AsyncFailure {
    /// Build a `Failed` from anything displayable.
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }

    /// Whether this is the fallback signal rather than a failure.
    pub fn is_fallback_signal(&self) -> bool {
        matches!(self, Self::UseFallback)
    }
}
