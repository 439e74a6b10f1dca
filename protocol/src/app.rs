//! App instance identity and the pure state-transition boundary (spec §3
//! "App instance", §4.2).

use ethabi::Token;
use serde::{Deserialize, Serialize};

use crate::{crypto::keccak256, errors::EngineError, identifiers::Address};

/// `{channelNonce, participants, appDefinition, defaultTimeout}` — the
/// immutable identity of an app instance. `identityHash =
/// keccak256(abi.encode(identity))` is the canonical app key used
/// everywhere else in the data model (spec §3, §8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
	pub channel_nonce: u64,
	pub participants: [Address; 2],
	pub app_definition: Address,
	pub default_timeout: u64,
}

impl AppIdentity {
	/// `abi.encode({channelNonce, participants[], appDefinition,
	/// defaultTimeout})`, matching the on-chain `AppIdentity` struct layout
	/// the ChallengeRegistry hashes (spec §4.1, §6).
	pub fn encode(&self) -> Vec<u8> {
		ethabi::encode(&[Token::Tuple(vec![
			Token::Uint(self.channel_nonce.into()),
			Token::Array(vec![
				Token::Address(self.participants[0].0.into()),
				Token::Address(self.participants[1].0.into()),
			]),
			Token::Address(self.app_definition.0.into()),
			Token::Uint(self.default_timeout.into()),
		])])
	}

	pub fn identity_hash(&self) -> [u8; 32] {
		keccak256(&self.encode())
	}
}

/// A sub-agreement installed in a channel: its own state, version and
/// dispute timeout (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
	pub identity: AppIdentity,
	pub latest_state: Vec<u8>,
	/// Monotonically non-decreasing per instance (spec §3 invariant).
	pub version_number: u64,
	/// Challenge window, in blocks, for the current state.
	pub state_timeout: u64,
	/// The action whose post-image is `latest_state`, retained only while a
	/// single-signed `SetState` commitment exists to enable `progressState`
	/// (spec §4.3 TakeAction step 5, §9 open question).
	pub latest_action: Option<Vec<u8>>,
}

impl AppInstance {
	pub fn identity_hash(&self) -> [u8; 32] {
		self.identity.identity_hash()
	}

	pub fn latest_state_hash(&self) -> [u8; 32] {
		keccak256(&self.latest_state)
	}
}

/// The abstracted external collaborator for `computeStateTransition` (spec
/// §4.2): a pure function, invoked via EVM execution in production, applying
/// one action to an app's state. The engine neither trusts nor inspects the
/// returned bytes beyond hashing them.
pub trait EvmProvider: Send + Sync {
	fn apply_action(
		&self,
		app_definition: Address,
		state: &[u8],
		action: &[u8],
	) -> Result<Vec<u8>, EngineError>;
}

/// Invoke the app definition's `applyAction(state, action) -> state'` (spec
/// §4.2) and fold the result back into a fresh `AppInstance` at the next
/// version number. Callers are responsible for turn-taking and middleware
/// validation (spec §4.3) before calling this.
pub fn compute_state_transition(
	app: &AppInstance,
	action: &[u8],
	provider: &dyn EvmProvider,
) -> Result<Vec<u8>, EngineError> {
	provider.apply_action(app.identity.app_definition, &app.latest_state, action)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn identity() -> AppIdentity {
		AppIdentity {
			channel_nonce: 1,
			participants: [Address([0xAA; 20]), Address([0xBB; 20])],
			app_definition: Address([0xCC; 20]),
			default_timeout: 100,
		}
	}

	#[test]
	fn identity_hash_is_deterministic_and_order_sensitive() {
		let id = identity();
		let mut swapped = id.clone();
		swapped.participants.swap(0, 1);

		assert_eq!(id.identity_hash(), id.identity_hash());
		assert_ne!(id.identity_hash(), swapped.identity_hash());
	}
}
