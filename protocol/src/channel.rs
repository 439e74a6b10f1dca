//! State channel value type and its pure transitions (spec §3, §4.2). Every
//! transition is `(channel, ..) -> channel'`; nothing here mutates in place,
//! matching the design note that app <-> channel references are one-way
//! (channels own apps by `identityHash`, apps hold no back-reference).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
	app::{AppIdentity, AppInstance},
	errors::{EngineError, Result},
	identifiers::{Address, ExtendedPublicKey},
};

/// The pseudo-token-address convention for native ETH balances, matching the
/// on-chain free-balance interpreter's convention (spec §8 scenario 1).
pub const CONVENTION_FOR_ETH_TOKEN_ADDRESS: Address = Address([0u8; 20]);

/// A proposed app instance: an accepted [`Proposal`] is promoted to an
/// [`AppInstance`] by `installApp`; until then it lives only in
/// `proposedAppInstances` (spec §3, §4.3 Propose/Install).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
	pub identity: AppIdentity,
	pub initial_state: Vec<u8>,
	pub initial_state_timeout: u64,
	pub initiator: Address,
	pub responder: Address,
	pub token_address: Address,
	pub initiator_deposit: u128,
	pub responder_deposit: u128,
}

impl Proposal {
	pub fn identity_hash(&self) -> [u8; 32] {
		self.identity.identity_hash()
	}
}

/// The distinguished app instance tracking uncommitted per-token balances
/// (spec §3 "Free balance"). Modeled as its own identity/version/timeout
/// triple (so it can be the subject of `SetState` commitments like any other
/// app) alongside a typed balance map, rather than threading its balances
/// through the generic `Vec<u8>` app-state encoding used by installed apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBalance {
	pub identity: AppIdentity,
	pub version_number: u64,
	pub state_timeout: u64,
	/// token address -> balances, ordered the same as `multisigOwners`.
	pub balances: BTreeMap<Address, [u128; 2]>,
}

impl FreeBalance {
	pub fn identity_hash(&self) -> [u8; 32] {
		self.identity.identity_hash()
	}

	pub fn balance_of(&self, token: Address, owner_idx: usize) -> u128 {
		self.balances.get(&token).map(|b| b[owner_idx]).unwrap_or(0)
	}
}

/// Uniquely keyed by `multisigAddress` (spec §3). Owns installed and
/// proposed apps by `identityHash`; enforces the channel-level invariants
/// (no id in both maps, monotonic nonce, free balance always present).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChannel {
	pub multisig_address: Address,
	pub user_identifiers: [ExtendedPublicKey; 2],
	pub multisig_owners: [Address; 2],
	pub free_balance: FreeBalance,
	pub app_instances: BTreeMap<[u8; 32], AppInstance>,
	pub proposed_app_instances: BTreeMap<[u8; 32], Proposal>,
	pub monotonic_num_proposed_apps: u64,
	pub schema_version: u32,
}

impl StateChannel {
	/// `setState`: replace an app's state, incrementing its version number
	/// by one (spec §4.2).
	pub fn set_state(
		&self,
		identity_hash: [u8; 32],
		new_state: Vec<u8>,
		new_timeout: u64,
	) -> Result<Self> {
		let mut next = self.clone();
		let app = next
			.app_instances
			.get_mut(&identity_hash)
			.ok_or_else(|| EngineError::NotFound(format!("app {}", hex::encode(identity_hash))))?;
		app.latest_state = new_state;
		app.version_number += 1;
		app.state_timeout = new_timeout;
		Ok(next)
	}

	/// `proposeApp`: insert a proposal keyed by its identity hash, assigning
	/// it the next `channelNonce` from the channel's monotonic counter (spec
	/// §3, §4.2). Rejects a proposal whose identity hash collides with an
	/// existing proposal or installed app (spec §4.3 "Duplicate proposal").
	pub fn propose_app(
		&self,
		mut identity: AppIdentity,
		initial_state: Vec<u8>,
		initial_state_timeout: u64,
		initiator: Address,
		responder: Address,
		token_address: Address,
		initiator_deposit: u128,
		responder_deposit: u128,
	) -> Result<(Self, Proposal)> {
		identity.channel_nonce = self.monotonic_num_proposed_apps;
		let identity_hash = identity.identity_hash();

		if self.proposed_app_instances.contains_key(&identity_hash)
			|| self.app_instances.contains_key(&identity_hash)
		{
			return Err(EngineError::AlreadyExists(format!(
				"app {}",
				hex::encode(identity_hash)
			)));
		}

		let proposal = Proposal {
			identity,
			initial_state,
			initial_state_timeout,
			initiator,
			responder,
			token_address,
			initiator_deposit,
			responder_deposit,
		};

		let mut next = self.clone();
		next.proposed_app_instances.insert(identity_hash, proposal.clone());
		next.monotonic_num_proposed_apps += 1;
		Ok((next, proposal))
	}

	/// Insert a proposal whose `channelNonce` was already allocated against
	/// this exact channel state (the Propose initiator stage builds and signs
	/// the proposal's commitment before persisting it, so by the time it
	/// reaches here the identity hash is fixed and must not be re-derived).
	/// Rejects a proposal allocated against a stale nonce, or one colliding
	/// with an existing proposal or installed app.
	pub fn insert_proposal(&self, proposal: Proposal) -> Result<Self> {
		if proposal.identity.channel_nonce != self.monotonic_num_proposed_apps {
			return Err(EngineError::InvariantViolation(format!(
				"proposal channelNonce {} does not match channel's monotonicNumProposedApps {}",
				proposal.identity.channel_nonce, self.monotonic_num_proposed_apps
			)));
		}

		let identity_hash = proposal.identity_hash();
		if self.proposed_app_instances.contains_key(&identity_hash)
			|| self.app_instances.contains_key(&identity_hash)
		{
			return Err(EngineError::AlreadyExists(format!(
				"app {}",
				hex::encode(identity_hash)
			)));
		}

		let mut next = self.clone();
		next.proposed_app_instances.insert(identity_hash, proposal);
		next.monotonic_num_proposed_apps += 1;
		Ok(next)
	}

	/// `installApp`: remove the matching proposal, insert the app, and debit
	/// the free balance by the sum of both deposits under the proposal's
	/// token (spec §4.2, §4.3 Install, §8 scenario 1).
	pub fn install_app(&self, identity_hash: [u8; 32]) -> Result<Self> {
		let proposal = self
			.proposed_app_instances
			.get(&identity_hash)
			.ok_or_else(|| EngineError::NotFound(format!("proposal {}", hex::encode(identity_hash))))?
			.clone();

		if self.app_instances.contains_key(&identity_hash) {
			return Err(EngineError::AlreadyExists(format!(
				"app {}",
				hex::encode(identity_hash)
			)));
		}

		let mut next = self.clone();
		next.proposed_app_instances.remove(&identity_hash);

		let entry = next.free_balance.balances.entry(proposal.token_address).or_insert([0, 0]);
		entry[0] = entry[0]
			.checked_sub(proposal.initiator_deposit)
			.ok_or_else(|| EngineError::InvariantViolation("initiator free balance underflow".into()))?;
		entry[1] = entry[1]
			.checked_sub(proposal.responder_deposit)
			.ok_or_else(|| EngineError::InvariantViolation("responder free balance underflow".into()))?;
		next.free_balance.version_number += 1;

		let app = AppInstance {
			identity: proposal.identity,
			latest_state: proposal.initial_state,
			version_number: 1,
			state_timeout: proposal.initial_state_timeout,
			latest_action: None,
		};
		next.app_instances.insert(identity_hash, app);

		Ok(next)
	}

	/// `uninstallApp`: remove the app and credit the free balance per the
	/// outcome interpreter's redistribution (spec §4.2, §4.3 Uninstall).
	pub fn uninstall_app(
		&self,
		identity_hash: [u8; 32],
		token_address: Address,
		redistribution: [u128; 2],
	) -> Result<Self> {
		if !self.app_instances.contains_key(&identity_hash) {
			return Err(EngineError::NotFound(format!("app {}", hex::encode(identity_hash))));
		}

		let mut next = self.clone();
		next.app_instances.remove(&identity_hash);

		let entry = next.free_balance.balances.entry(token_address).or_insert([0, 0]);
		entry[0] = entry[0]
			.checked_add(redistribution[0])
			.ok_or_else(|| EngineError::InvariantViolation("free balance overflow".into()))?;
		entry[1] = entry[1]
			.checked_add(redistribution[1])
			.ok_or_else(|| EngineError::InvariantViolation("free balance overflow".into()))?;
		next.free_balance.version_number += 1;

		Ok(next)
	}

	/// spec §3 invariant: `monotonicNumProposedApps` must exceed every
	/// existing app's `channelNonce`.
	pub fn check_monotonic_nonce_invariant(&self) -> Result<()> {
		for app in self.app_instances.values() {
			if app.identity.channel_nonce >= self.monotonic_num_proposed_apps {
				return Err(EngineError::InvariantViolation(format!(
					"app channelNonce {} is not smaller than monotonicNumProposedApps {}",
					app.identity.channel_nonce, self.monotonic_num_proposed_apps
				)));
			}
		}
		Ok(())
	}

	/// spec §3 invariant: no identity hash appears in both maps.
	pub fn check_no_overlap_invariant(&self) -> Result<()> {
		for hash in self.proposed_app_instances.keys() {
			if self.app_instances.contains_key(hash) {
				return Err(EngineError::InvariantViolation(format!(
					"identity hash {} present in both proposed and installed apps",
					hex::encode(hash)
				)));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap as Map;

	fn participant_key(b: u8) -> ExtendedPublicKey {
		use secp256k1::{PublicKey, Secp256k1, SecretKey};
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		ExtendedPublicKey::new(pk.serialize(), [0u8; 32])
	}

	fn fresh_channel() -> StateChannel {
		let a = participant_key(1);
		let b = participant_key(2);
		let (identifiers, addrs) = crate::identifiers::sort_participants([a, b]);

		StateChannel {
			multisig_address: Address([0x11; 20]),
			user_identifiers: identifiers,
			multisig_owners: addrs,
			free_balance: FreeBalance {
				identity: AppIdentity {
					channel_nonce: 0,
					participants: addrs,
					app_definition: Address([0; 20]),
					default_timeout: 100,
				},
				version_number: 1,
				state_timeout: 100,
				balances: {
					let mut m = Map::new();
					m.insert(CONVENTION_FOR_ETH_TOKEN_ADDRESS, [1_000u128, 1_000u128]);
					m
				},
			},
			app_instances: Map::new(),
			proposed_app_instances: Map::new(),
			monotonic_num_proposed_apps: 1,
			schema_version: 1,
		}
	}

	#[test]
	fn propose_then_install_debits_free_balance_and_conserves_total() {
		let channel = fresh_channel();
		let addrs = channel.multisig_owners;

		let identity = AppIdentity {
			channel_nonce: 0,
			participants: addrs,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};

		let (channel, proposal) = channel
			.propose_app(
				identity,
				b"{\"counter\":0}".to_vec(),
				10,
				addrs[0],
				addrs[1],
				CONVENTION_FOR_ETH_TOKEN_ADDRESS,
				100,
				100,
			)
			.unwrap();

		assert_eq!(proposal.identity.channel_nonce, 1);
		assert_eq!(channel.monotonic_num_proposed_apps, 2);

		let hash = proposal.identity_hash();
		let channel = channel.install_app(hash).unwrap();

		let app = channel.app_instances.get(&hash).unwrap();
		assert_eq!(app.version_number, 1);
		assert_eq!(channel.free_balance.balance_of(CONVENTION_FOR_ETH_TOKEN_ADDRESS, 0), 900);
		assert_eq!(channel.free_balance.balance_of(CONVENTION_FOR_ETH_TOKEN_ADDRESS, 1), 900);

		let total: u128 = channel
			.free_balance
			.balances
			.values()
			.map(|b| b[0] + b[1])
			.sum::<u128>()
			+ 200; // the app's own deposit
		assert_eq!(total, 2_000);
	}

	#[test]
	fn duplicate_proposal_is_rejected() {
		let channel = fresh_channel();
		let addrs = channel.multisig_owners;
		let identity = AppIdentity {
			channel_nonce: 0,
			participants: addrs,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};

		let (channel, _) = channel
			.propose_app(
				identity.clone(),
				vec![],
				10,
				addrs[0],
				addrs[1],
				CONVENTION_FOR_ETH_TOKEN_ADDRESS,
				1,
				1,
			)
			.unwrap();

		let err = channel
			.propose_app(identity, vec![], 10, addrs[0], addrs[1], CONVENTION_FOR_ETH_TOKEN_ADDRESS, 1, 1)
			.unwrap_err();

		assert!(matches!(err, EngineError::AlreadyExists(_)));
	}

	#[test]
	fn insert_proposal_preserves_the_already_allocated_nonce() {
		let channel = fresh_channel();
		let addrs = channel.multisig_owners;
		let identity = AppIdentity {
			channel_nonce: channel.monotonic_num_proposed_apps,
			participants: addrs,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};
		let proposal = Proposal {
			identity,
			initial_state: vec![],
			initial_state_timeout: 10,
			initiator: addrs[0],
			responder: addrs[1],
			token_address: CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			initiator_deposit: 1,
			responder_deposit: 1,
		};
		let identity_hash = proposal.identity_hash();

		let next = channel.insert_proposal(proposal).unwrap();

		assert_eq!(next.monotonic_num_proposed_apps, 2);
		assert!(next.proposed_app_instances.contains_key(&identity_hash));
	}

	#[test]
	fn insert_proposal_rejects_a_stale_nonce() {
		let channel = fresh_channel();
		let addrs = channel.multisig_owners;
		let identity = AppIdentity {
			channel_nonce: channel.monotonic_num_proposed_apps + 1,
			participants: addrs,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};
		let proposal = Proposal {
			identity,
			initial_state: vec![],
			initial_state_timeout: 10,
			initiator: addrs[0],
			responder: addrs[1],
			token_address: CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			initiator_deposit: 1,
			responder_deposit: 1,
		};

		let err = channel.insert_proposal(proposal).unwrap_err();
		assert!(matches!(err, EngineError::InvariantViolation(_)));
	}
}
