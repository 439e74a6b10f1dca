//! Participant identifiers and derived addresses (spec §3 "Participant
//! identifier"). An [`ExtendedPublicKey`] is the BIP32-neutered key exchanged
//! out of band when a channel is first proposed; the canonical signer
//! [`Address`] used everywhere else in the data model is derived from its
//! first child key.

use std::fmt;

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{keccak256, pubkey_to_address};

/// A 20-byte derived signer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "0x{}", hex::encode(self.0))
	}
}

/// A BIP32 extended public key (neutered: no private material). Opaque to
/// everything except the child-key derivation used to compute the canonical
/// signer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedPublicKey {
	/// Compressed secp256k1 public key bytes of the extended key itself.
	pub public_key: [u8; 33],
	pub chain_code: [u8; 32],
}

impl ExtendedPublicKey {
	pub fn new(public_key: [u8; 33], chain_code: [u8; 32]) -> Self {
		Self { public_key, chain_code }
	}

	/// Derive the first non-hardened child key, whose address is this
	/// participant's canonical signer address (spec §3). Real BIP32
	/// derivation mixes the chain code into an HMAC-SHA512 step before
	/// tweaking the parent public key; the channel engine does not
	/// re-implement that (it is a cryptographic primitive out of scope per
	/// spec §1), so callers construct [`ExtendedPublicKey`] with a child
	/// public key already derived by the external key-management component,
	/// and this simply recovers its address.
	pub fn signer_address(&self) -> Address {
		let pubkey = PublicKey::from_slice(&self.public_key)
			.expect("ExtendedPublicKey must wrap a valid compressed secp256k1 point");
		pubkey_to_address(&pubkey)
	}
}

/// Sort a pair of participants canonically by their derived signer address
/// (spec §3: "Participant lists are sorted by derived address"), returning
/// `(identifiers, addresses)` with both lists in the same, address-ascending
/// order.
pub fn sort_participants(
	mut identifiers: [ExtendedPublicKey; 2],
) -> ([ExtendedPublicKey; 2], [Address; 2]) {
	let addr0 = identifiers[0].signer_address();
	let addr1 = identifiers[1].signer_address();

	if addr1 < addr0 {
		identifiers.swap(0, 1);
		([identifiers[0].clone(), identifiers[1].clone()], [addr1, addr0])
	} else {
		([identifiers[0].clone(), identifiers[1].clone()], [addr0, addr1])
	}
}

/// EIP-1167 minimal-proxy runtime bytecode, parameterized by the
/// implementation (master copy) address it delegates every call to.
fn minimal_proxy_init_code(master_copy: Address) -> Vec<u8> {
	let mut code = Vec::with_capacity(45);
	code.extend_from_slice(&hex_literal(b"363d3d373d3d3d363d73"));
	code.extend_from_slice(&master_copy.0);
	code.extend_from_slice(&hex_literal(b"5af43d82803e903d91602b57fd5bf3"));
	code
}

fn hex_literal(ascii_hex: &[u8]) -> Vec<u8> {
	hex::decode(ascii_hex).expect("hardcoded proxy bytecode fragment must be valid hex")
}

/// Derive a state channel's `multisigAddress` (spec §3: "CREATE2-deterministic
/// from the ordered owner addresses, a master-copy address, and a proxy
/// factory"). `owners` must already be in the canonical ascending order
/// [`sort_participants`] produces; the salt binds to that order, so the two
/// participants agree on the same address without needing to exchange it.
///
/// Follows the standard CREATE2 formula with an EIP-1167 minimal-proxy init
/// code: `keccak256(0xff ++ proxyFactory ++ salt ++ keccak256(initCode))[12..]`,
/// `salt = keccak256(owners[0] ++ owners[1])`.
pub fn derive_multisig_address(
	owners: [Address; 2],
	master_copy: Address,
	proxy_factory: Address,
) -> Address {
	let mut salt_preimage = Vec::with_capacity(40);
	salt_preimage.extend_from_slice(&owners[0].0);
	salt_preimage.extend_from_slice(&owners[1].0);
	let salt = keccak256(&salt_preimage);

	let init_code_hash = keccak256(&minimal_proxy_init_code(master_copy));

	let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
	preimage.push(0xff);
	preimage.extend_from_slice(&proxy_factory.0);
	preimage.extend_from_slice(&salt);
	preimage.extend_from_slice(&init_code_hash);
	let digest = keccak256(&preimage);

	let mut address = [0u8; 20];
	address.copy_from_slice(&digest[12..]);
	Address(address)
}

#[cfg(test)]
mod tests {
	use super::*;
	use secp256k1::{Secp256k1, SecretKey};

	fn key_from_byte(b: u8) -> ExtendedPublicKey {
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		ExtendedPublicKey::new(pk.serialize(), [0u8; 32])
	}

	#[test]
	fn sort_participants_is_ascending_by_address() {
		let a = key_from_byte(1);
		let b = key_from_byte(2);

		let (_, addrs_ab) = sort_participants([a.clone(), b.clone()]);
		let (_, addrs_ba) = sort_participants([b, a]);

		assert_eq!(addrs_ab, addrs_ba);
		assert!(addrs_ab[0] < addrs_ab[1]);
	}

	#[test]
	fn derive_multisig_address_is_deterministic_and_order_sensitive() {
		let a = Address([0x11; 20]);
		let b = Address([0x22; 20]);
		let master_copy = Address([0x33; 20]);
		let proxy_factory = Address([0x44; 20]);

		let first = derive_multisig_address([a, b], master_copy, proxy_factory);
		let second = derive_multisig_address([a, b], master_copy, proxy_factory);
		assert_eq!(first, second);

		let swapped = derive_multisig_address([b, a], master_copy, proxy_factory);
		assert_ne!(first, swapped, "the salt must bind to owner order, not just the set of owners");
	}

	#[test]
	fn derive_multisig_address_changes_with_master_copy_or_factory() {
		let owners = [Address([0x11; 20]), Address([0x22; 20])];
		let master_copy = Address([0x33; 20]);
		let proxy_factory = Address([0x44; 20]);

		let base = derive_multisig_address(owners, master_copy, proxy_factory);
		let other_master_copy = derive_multisig_address(owners, Address([0x99; 20]), proxy_factory);
		let other_factory = derive_multisig_address(owners, master_copy, Address([0x99; 20]));

		assert_ne!(base, other_master_copy);
		assert_ne!(base, other_factory);
	}
}
