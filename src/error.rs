//! Error taxonomy for the store.
//!
//! Structural/programmer errors surface as [`StoreError`] values and are never
//! silently swallowed. Administrative states (a locked store, a continuation
//! without a completion handler) are deliberately NOT errors; those paths log
//! and carry on, see the store-level documentation.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the store.
///
/// Every variant here indicates a usage bug at the call site, not a runtime
/// condition to retry. A corrupt history record is worse than a failed
/// mutation, so the store throws early instead of guessing.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A namespace with this name has already been created.
    ///
    /// Only raised when the store was built without `devtools`; in devtools
    /// mode re-declaration warns and replaces instead.
    #[error("namespace `{0}` is already registered")]
    DuplicateNamespace(String),

    /// The namespace has never been created (or was destroyed).
    #[error("unknown namespace `{0}`")]
    UnknownNamespace(String),

    /// A write happened outside a sanctioned `mutate` call.
    ///
    /// This is a hard correctness boundary: all mutations must flow through
    /// [`Store::mutate`](crate::Store::mutate) so the history ledger stays
    /// complete. The `trace` field carries a captured backtrace when the
    /// store was built with `capture_stack`, to locate the offending write.
    #[error("unauthorized mutation of `{namespace}` at `{path}`: writes must go through Store::mutate")]
    UnauthorizedMutation {
        /// Namespace the write targeted.
        namespace: String,
        /// Path of the property the write targeted.
        path: String,
        /// Call-site backtrace, populated when stack capture is enabled.
        trace: Option<String>,
    },

    /// Nested mutation calls exceeded the configured ceiling.
    ///
    /// Protects against runaway recursive watcher triggering.
    #[error("mutation nesting exceeded the configured ceiling of {max}")]
    MaxNestingDepthExceeded {
        /// The configured ceiling.
        max: usize,
    },

    /// The addressed path does not exist in the namespace.
    #[error("path `{path}` does not exist in namespace `{namespace}`")]
    PathNotFound {
        /// Namespace the access targeted.
        namespace: String,
        /// The missing path.
        path: String,
    },

    /// The value at the addressed path is not the expected container kind.
    #[error("expected {expected} at `{path}` in namespace `{namespace}`")]
    TypeMismatch {
        /// Namespace the access targeted.
        namespace: String,
        /// Path of the offending value.
        path: String,
        /// What the operation required ("an object" or "an array").
        expected: &'static str,
    },

    /// Undo/redo was requested while a mutation or an asynchronous
    /// continuation is still in flight.
    ///
    /// Rewriting history under a pending continuation has no well-defined
    /// outcome, so the store fails fast instead of guessing.
    #[error("cannot rewrite history while a mutation or continuation is in flight")]
    MutationInFlight,
}
