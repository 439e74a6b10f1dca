//! `SetState` commitment: `keccak256(0x19 || identityHash || versionNumber ||
//! stateTimeout || appStateHash)`, targeting the ChallengeRegistry's
//! `setState(AppIdentity, SignedStateHashUpdate)` (spec §4.1, §6, §8
//! scenario 2).

use ethabi::{ParamType, Token};

use serde::{Deserialize, Serialize};

use super::{
	concat_signature_bytes, order_signatures_by_recovered_address, u256_be_u64, Commitment,
	MinimalTransaction,
};
use crate::{
	app::AppIdentity,
	crypto::Signature,
	errors::{EngineError, Result},
	identifiers::Address,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateCommitment {
	pub identity: AppIdentity,
	pub version_number: u64,
	pub state_timeout: u64,
	pub app_state_hash: [u8; 32],
	pub challenge_registry_address: Address,
	signatures: Vec<(Address, Signature)>,
}

impl SetStateCommitment {
	pub fn new(
		identity: AppIdentity,
		version_number: u64,
		state_timeout: u64,
		app_state_hash: [u8; 32],
		challenge_registry_address: Address,
	) -> Self {
		Self {
			identity,
			version_number,
			state_timeout,
			app_state_hash,
			challenge_registry_address,
			signatures: Vec::new(),
		}
	}

	pub fn signatures(&self) -> &[(Address, Signature)] {
		&self.signatures
	}

	/// `true` once both participants have signed; a single-signed commitment
	/// is still persisted on its own to enable `progressState` (spec §9
	/// open question, §4.3 TakeAction step 5).
	pub fn is_fully_signed(&self) -> bool {
		self.signatures.len() == self.identity.participants.len()
	}
}

impl Commitment for SetStateCommitment {
	fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(32 * 4);
		out.extend_from_slice(&self.identity.identity_hash());
		out.extend_from_slice(&u256_be_u64(self.version_number));
		out.extend_from_slice(&u256_be_u64(self.state_timeout));
		out.extend_from_slice(&self.app_state_hash);
		out
	}

	fn add_signatures(&mut self, signatures: &[Signature]) -> Result<()> {
		let digest = self.hash_to_sign();
		let ordered =
			order_signatures_by_recovered_address(digest, &self.identity.participants, signatures)?;
		if ordered.len() > self.identity.participants.len() {
			return Err(EngineError::InvariantViolation(
				"more signatures than participants on SetState commitment".into(),
			));
		}
		self.signatures = ordered;
		Ok(())
	}

	fn get_signed_transaction(&self) -> Result<MinimalTransaction> {
		if self.signatures.is_empty() {
			return Err(EngineError::InvariantViolation(
				"SetState commitment has no signatures".into(),
			));
		}

		let identity_tuple = Token::Tuple(vec![
			Token::Uint(self.identity.channel_nonce.into()),
			Token::Array(vec![
				Token::Address(self.identity.participants[0].0.into()),
				Token::Address(self.identity.participants[1].0.into()),
			]),
			Token::Address(self.identity.app_definition.0.into()),
			Token::Uint(self.identity.default_timeout.into()),
		]);

		let update_tuple = Token::Tuple(vec![
			Token::FixedBytes(self.app_state_hash.to_vec()),
			Token::Uint(self.version_number.into()),
			Token::Uint(self.state_timeout.into()),
			Token::Bytes(concat_signature_bytes(&self.signatures)),
		]);

		#[allow(deprecated)]
		let function = ethabi::Function {
			name: "setState".into(),
			inputs: vec![
				ethabi::Param {
					name: "identity".into(),
					kind: ParamType::Tuple(vec![
						ParamType::Uint(256),
						ParamType::Array(Box::new(ParamType::Address)),
						ParamType::Address,
						ParamType::Uint(256),
					]),
					internal_type: None,
				},
				ethabi::Param {
					name: "update".into(),
					kind: ParamType::Tuple(vec![
						ParamType::FixedBytes(32),
						ParamType::Uint(256),
						ParamType::Uint(256),
						ParamType::Bytes,
					]),
					internal_type: None,
				},
			],
			outputs: vec![],
			constant: None,
			state_mutability: ethabi::StateMutability::NonPayable,
		};

		let data = function
			.encode_input(&[identity_tuple, update_tuple])
			.map_err(|e| EngineError::InvariantViolation(format!("ABI encode failed: {e}")))?;

		Ok(MinimalTransaction { to: self.challenge_registry_address, value: 0, data })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{keccak256, LocalSigner, Signer};
	use secp256k1::SecretKey;
	use std::str::FromStr;

	fn identity(participants: [Address; 2]) -> AppIdentity {
		AppIdentity { channel_nonce: 1, participants, app_definition: Address([0xCC; 20]), default_timeout: 100 }
	}

	#[test]
	fn digest_matches_spec_formula_exactly() {
		let participants = [Address([0xAA; 20]), Address([0xBB; 20])];
		let app_state_hash = keccak256(br#"{"counter":3}"#);
		let commitment =
			SetStateCommitment::new(identity(participants), 2, 100, app_state_hash, Address([0xEE; 20]));

		let mut expected_preimage = vec![0x19u8];
		expected_preimage.extend_from_slice(&commitment.identity.identity_hash());
		expected_preimage.extend_from_slice(&u256_be_u64(2));
		expected_preimage.extend_from_slice(&u256_be_u64(100));
		expected_preimage.extend_from_slice(&app_state_hash);
		let expected = keccak256(&expected_preimage);

		assert_eq!(commitment.hash_to_sign(), expected);
	}

	#[test]
	fn signatures_are_ordered_ascending_by_recovered_address() {
		let sk_a =
			SecretKey::from_str("f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315").unwrap();
		let sk_b =
			SecretKey::from_str("b3b0e5d984113075f805057c6dbf1ad1078a17a925ebbeaaac09aaf39754d6c5").unwrap();
		let signer_a = LocalSigner::new(sk_a);
		let signer_b = LocalSigner::new(sk_b);

		let (lo, hi) =
			if signer_a.address() < signer_b.address() { (signer_a, signer_b) } else { (signer_b, signer_a) };

		let mut commitment =
			SetStateCommitment::new(identity([lo.address(), hi.address()]), 1, 10, [0x42; 32], Address([0xEE; 20]));

		let digest = commitment.hash_to_sign();
		// deliberately supply them out of order
		commitment.add_signatures(&[hi.sign(digest), lo.sign(digest)]).unwrap();

		assert_eq!(commitment.signatures()[0].0, lo.address());
		assert_eq!(commitment.signatures()[1].0, hi.address());
		assert!(commitment.is_fully_signed());
	}

	#[test]
	fn foreign_signature_is_rejected() {
		let sk_a =
			SecretKey::from_str("f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315").unwrap();
		let sk_stranger =
			SecretKey::from_str("4be4eec582faa34075bad8193923b111782936d729cc135fad095f49482ed25e").unwrap();
		let signer_a = LocalSigner::new(sk_a);
		let stranger = LocalSigner::new(sk_stranger);

		let mut commitment = SetStateCommitment::new(
			identity([signer_a.address(), Address([0xBB; 20])]),
			1,
			10,
			[0x42; 32],
			Address([0xEE; 20]),
		);
		let digest = commitment.hash_to_sign();

		let err = commitment.add_signatures(&[stranger.sign(digest)]).unwrap_err();
		assert!(matches!(err, EngineError::SignatureMismatch { .. }));
	}
}
