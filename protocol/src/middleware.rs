//! Validation middleware (spec §9 design note): a typed trait in place of
//! the source's untyped callback-returning-a-string, dispatched by protocol
//! tag, one implementation per app type.

use crate::{app::AppIdentity, identifiers::Address};

/// Which of the six protocols is being validated, carried on
/// [`ValidationContext`] so one `Validate` implementation can dispatch on it
/// instead of middleware needing a separate entry point per protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolName {
	Setup,
	Propose,
	Install,
	Update,
	TakeAction,
	Uninstall,
}

/// Everything a validator needs to decide whether a step is admissible:
/// which app, whose turn it claims to be, and the opaque action/state bytes
/// in play. Not every field is relevant to every protocol; Setup/Propose
/// leave `action` empty.
#[derive(Debug, Clone)]
pub struct ValidationContext {
	pub protocol: ProtocolName,
	pub app_identity: AppIdentity,
	pub claimed_turn_taker: Address,
	pub action: Vec<u8>,
}

/// A human-readable rejection reason, propagated verbatim to the caller as
/// `EngineError::ValidationRejected` (spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason(pub String);

impl std::fmt::Display for RejectReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One implementation per app type; the engine looks one up by
/// `app_definition` address before running `OP_VALIDATE` (spec §4.3).
pub trait Validate: Send + Sync {
	fn validate(&self, ctx: &ValidationContext) -> Option<RejectReason>;
}

/// Enforces turn-taking only: the action's claimed turn taker must be one of
/// the app's two participants, alternating by `versionNumber` parity. Used
/// directly by apps with no additional ACLs, and as a base case other
/// `Validate` implementations can delegate to.
pub struct TurnTakingValidator {
	pub version_number: u64,
}

impl Validate for TurnTakingValidator {
	fn validate(&self, ctx: &ValidationContext) -> Option<RejectReason> {
		let expected_idx = (self.version_number % 2) as usize;
		let expected = ctx.app_identity.participants[expected_idx];
		if ctx.claimed_turn_taker != expected {
			return Some(RejectReason(format!(
				"out-of-turn action: expected {expected}, claimed {}",
				ctx.claimed_turn_taker
			)));
		}
		None
	}
}
