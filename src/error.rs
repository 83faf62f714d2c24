use crate::events::EventKind;
use crate::sequence::SequenceId;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

/// Terminal failure of a knock run or of a façade lookup.
#[derive(Debug, Error)]
pub enum KnockError {
    #[error("invalid host '{0}'")]
    InvalidHost(String),
    #[error("cannot resolve '{host}': {reason}")]
    ResolveHost { host: String, reason: String },
    #[error("sequence '{0}' has no steps to send")]
    EmptySequence(String),
    #[error("network error: {0}")]
    Network(#[from] TransportError),
    #[error("cancelled")]
    Cancelled,
    #[error("sequence {0} not found")]
    SequenceNotFound(SequenceId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KnockError {
    pub fn event_kind(&self) -> EventKind {
        match self {
            KnockError::InvalidHost(_) => EventKind::ErrorInvalidHost,
            KnockError::ResolveHost { .. } => EventKind::ErrorResolveHost,
            KnockError::EmptySequence(_) => EventKind::ErrorEmptySequence,
            KnockError::Network(_) => EventKind::ErrorNetwork,
            KnockError::Cancelled => EventKind::Cancelled,
            KnockError::SequenceNotFound(_) | KnockError::Store(_) => EventKind::ErrorUnknown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, KnockError::Cancelled)
    }
}
