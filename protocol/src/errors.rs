use thiserror::Error;

use crate::identifiers::Address;

/// Errors surfaced by the protocol runner and the data-model transitions it
/// drives. Callers match on these exhaustively rather than inspecting ad-hoc
/// strings, except [`EngineError::ValidationRejected`], which carries a
/// verbatim reason string from the validation middleware.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EngineError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("already exists: {0}")]
	AlreadyExists(String),

	#[error("invariant violation: {0}")]
	InvariantViolation(String),

	#[error("signature mismatch: expected signer {expected}, recovered {recovered}")]
	SignatureMismatch { expected: Address, recovered: Address },

	#[error("validation rejected: {0}")]
	ValidationRejected(String),

	#[error("timeout waiting for peer response")]
	Timeout,

	#[error("store error: {0}")]
	StoreError(String),

	#[error("chain error: {0}")]
	ChainError(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
