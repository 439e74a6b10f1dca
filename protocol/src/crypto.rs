//! The one cryptographic primitive the commitment builders cannot avoid
//! calling themselves: ECDSA signing/recovery over the secp256k1 curve used
//! by the on-chain multisig and ChallengeRegistry contracts, plus
//! `keccak256`, the hash function both contracts are defined in terms of.
//!
//! Everything else (ABI encoding layout, digest assembly) is specified
//! bit-for-bit by the on-chain contracts this engine must stay compatible
//! with (spec §6) and is implemented as pure functions in [`crate::commitments`].

use secp256k1::{
	ecdsa::{RecoverableSignature, RecoveryId},
	Message, PublicKey, Secp256k1, SecretKey,
};
use sha3::{Digest, Keccak256};

use crate::identifiers::Address;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
	let mut hasher = Keccak256::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// A 65-byte `(r, s, v)` ECDSA signature, Ethereum-style, as attached to
/// signed transactions and `SetState` commitments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
	pub r: [u8; 32],
	pub s: [u8; 32],
	pub v: u8,
}

impl Signature {
	pub fn to_bytes(self) -> [u8; 65] {
		let mut out = [0u8; 65];
		out[..32].copy_from_slice(&self.r);
		out[32..64].copy_from_slice(&self.s);
		out[64] = self.v;
		out
	}
}

pub fn pubkey_to_address(pubkey: &PublicKey) -> Address {
	let uncompressed = pubkey.serialize_uncompressed();
	// drop the leading 0x04 tag, hash the 64-byte (x, y) pair
	let hash = keccak256(&uncompressed[1..]);
	let mut addr = [0u8; 20];
	addr.copy_from_slice(&hash[12..]);
	Address(addr)
}

/// The abstracted external signing capability ("global signing key / HD
/// wallet" in design notes): a process-scoped object passed by reference,
/// never a module-level global, so that multiple engines per process can
/// each hold a distinct signer.
pub trait Signer: Send + Sync {
	fn address(&self) -> Address;
	fn sign(&self, digest: [u8; 32]) -> Signature;
}

/// A signer backed by a raw secp256k1 secret key. Production deployments
/// plug in an HSM- or HD-wallet-backed implementation of [`Signer`] instead;
/// this one is used directly by tests and by single-node demos.
pub struct LocalSigner {
	secret_key: SecretKey,
	address: Address,
}

impl LocalSigner {
	pub fn new(secret_key: SecretKey) -> Self {
		let secp = Secp256k1::signing_only();
		let pubkey = PublicKey::from_secret_key(&secp, &secret_key);
		Self { secret_key, address: pubkey_to_address(&pubkey) }
	}
}

impl Signer for LocalSigner {
	fn address(&self) -> Address {
		self.address
	}

	fn sign(&self, digest: [u8; 32]) -> Signature {
		let secp = Secp256k1::signing_only();
		let message = Message::from_slice(&digest).expect("digest is exactly 32 bytes");
		let (recovery_id, raw) = secp
			.sign_ecdsa_recoverable(&message, &self.secret_key)
			.serialize_compact();

		let mut r = [0u8; 32];
		let mut s = [0u8; 32];
		r.copy_from_slice(&raw[..32]);
		s.copy_from_slice(&raw[32..]);

		Signature { r, s, v: 27 + recovery_id.to_i32() as u8 }
	}
}

/// Recover the signer address from a digest and signature. This is the
/// primitive the commitment builders use to enforce ascending-by-address
/// signature ordering at the builder boundary (spec §4.1, §4.3).
pub fn recover_signer(digest: [u8; 32], signature: &Signature) -> crate::errors::Result<Address> {
	let secp = Secp256k1::verification_only();
	let message = Message::from_slice(&digest).expect("digest is exactly 32 bytes");

	let recovery_id = RecoveryId::from_i32((signature.v as i32 - 27).rem_euclid(4))
		.map_err(|e| crate::errors::EngineError::InvariantViolation(format!("bad recovery id: {e}")))?;

	let mut raw = [0u8; 64];
	raw[..32].copy_from_slice(&signature.r);
	raw[32..].copy_from_slice(&signature.s);

	let recoverable = RecoverableSignature::from_compact(&raw, recovery_id)
		.map_err(|e| crate::errors::EngineError::InvariantViolation(format!("malformed signature: {e}")))?;

	let pubkey = secp
		.recover_ecdsa(&message, &recoverable)
		.map_err(|e| crate::errors::EngineError::InvariantViolation(format!("recovery failed: {e}")))?;

	Ok(pubkey_to_address(&pubkey))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::str::FromStr;

	#[test]
	fn pubkey_to_address_matches_known_answer_vector() {
		// Secret key / address pair from "Mastering Ethereum".
		let sk = SecretKey::from_str(
			"f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315",
		)
		.unwrap();
		let secp = Secp256k1::signing_only();
		let pk = PublicKey::from_secret_key(&secp, &sk);

		let expected = Address(
			hex::decode("001d3f1ef827552ae1114027bd3ecf1f086ba0f9")
				.unwrap()
				.try_into()
				.unwrap(),
		);

		assert_eq!(pubkey_to_address(&pk), expected);
	}

	#[test]
	fn sign_then_recover_round_trips() {
		let sk = SecretKey::from_str(
			"f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315",
		)
		.unwrap();
		let signer = LocalSigner::new(sk);
		let digest = keccak256(b"hello state channel");

		let sig = signer.sign(digest);
		let recovered = recover_signer(digest, &sig).unwrap();

		assert_eq!(recovered, signer.address());
	}
}
