//! Operation context: correlation, causation, transaction scope and
//! cancellation, threaded through every suspension point.

use std::fmt;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::DomainError;

/// Header and metadata key carrying the correlation identifier.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Header and metadata key carrying the causation identifier.
pub const CAUSATION_ID_KEY: &str = "causation_id";

/// Identifier of an open unit-of-work transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Allocates a fresh transaction identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-operation context.
///
/// Cloning is cheap. A clone shares the cancellation token; use
/// [`Context::child`] for a sub-context that can be cancelled on its own.
#[derive(Debug, Clone)]
pub struct Context {
    correlation_id: String,
    causation_id: Option<String>,
    transaction: Option<TransactionId>,
    cancellation: CancellationToken,
}

impl Context {
    /// A root context with a generated correlation id.
    #[must_use]
    pub fn background() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            transaction: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// A root context bound to an existing cancellation token (service lifetime).
    #[must_use]
    pub fn with_token(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..Self::background()
        }
    }

    /// Replaces the correlation id. An empty id keeps the current one.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        if !correlation_id.is_empty() {
            self.correlation_id = correlation_id;
        }
        self
    }

    /// Sets the causation id (the parent event of work done in this context).
    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Scopes repository calls made with this context to a transaction.
    #[must_use]
    pub fn with_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Drops the transaction scope (used for post-commit work).
    #[must_use]
    pub fn without_transaction(mut self) -> Self {
        self.transaction = None;
        self
    }

    /// A context whose cancellation is triggered by the parent or by itself.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            ..self.clone()
        }
    }

    /// The correlation id propagated to produced envelopes.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The causation id, if any.
    #[must_use]
    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    /// The transaction repository calls participate in, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// The cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Requests cancellation of this context and all children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Fails with [`DomainError::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled` when the context is cancelled.
    pub fn check(&self) -> Result<(), DomainError> {
        if self.is_cancelled() {
            Err(DomainError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
