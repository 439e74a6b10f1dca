//! Commitment builders (spec §4.1, §6). Every commitment implements
//! [`Commitment`]: `encode()` produces the canonical packed bytes the
//! on-chain contract hashes, `hash_to_sign()` is `keccak256(0x19 ||
//! encode())`, `add_signatures()` accepts one or two ECDSA signatures
//! (verifying and sorting them ascending by recovered address), and
//! `get_signed_transaction()` assembles the broadcast-ready
//! [`MinimalTransaction`].
//!
//! These are pure functions over their inputs; no I/O, no global state. The
//! digests here are bit-exact with the on-chain multisig and
//! ChallengeRegistry contracts (spec §4.1 "Rationale") and are exercised by
//! known-answer-style tests in each submodule, the same posture the crypto
//! module's `pubkey_to_eth_addr` test vector takes toward its contract.

pub mod conditional;
pub mod set_state;
pub mod setup;
pub mod withdraw;

pub use conditional::ConditionalTransactionCommitment;
pub use set_state::SetStateCommitment;
pub use setup::SetupCommitment;
pub use withdraw::WithdrawCommitment;

use serde::{Deserialize, Serialize};

use crate::{
	crypto::{keccak256, recover_signer, Signature},
	errors::{EngineError, Result},
	identifiers::Address,
};

/// `{to, value, data}` ready to broadcast as a raw transaction, the common
/// output shape of every commitment builder (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinimalTransaction {
	pub to: Address,
	pub value: u128,
	pub data: Vec<u8>,
}

/// The common builder contract (spec §4.1).
pub trait Commitment {
	fn encode(&self) -> Vec<u8>;

	fn hash_to_sign(&self) -> [u8; 32] {
		let mut preimage = Vec::with_capacity(1 + 32);
		preimage.push(0x19);
		preimage.extend_from_slice(&self.encode());
		keccak256(&preimage)
	}

	fn add_signatures(&mut self, signatures: &[Signature]) -> Result<()>;

	fn get_signed_transaction(&self) -> Result<MinimalTransaction>;
}

pub(crate) fn u256_be_u64(value: u64) -> [u8; 32] {
	let mut out = [0u8; 32];
	out[24..].copy_from_slice(&value.to_be_bytes());
	out
}

pub(crate) fn u256_be_u128(value: u128) -> [u8; 32] {
	let mut out = [0u8; 32];
	out[16..].copy_from_slice(&value.to_be_bytes());
	out
}

/// Recover each signature's signer, check it against `participants`, and
/// return `(address, signature)` pairs sorted ascending by address — the
/// ordering the multisig and ChallengeRegistry both enforce on chain (spec
/// §4.1 "signature ordering by recovered address is enforced at the builder
/// boundary, not the caller").
pub(crate) fn order_signatures_by_recovered_address(
	digest: [u8; 32],
	participants: &[Address],
	signatures: &[Signature],
) -> Result<Vec<(Address, Signature)>> {
	let mut ordered = Vec::with_capacity(signatures.len());
	for signature in signatures {
		let recovered = recover_signer(digest, signature)?;
		if !participants.contains(&recovered) {
			return Err(EngineError::SignatureMismatch {
				expected: participants[0],
				recovered,
			});
		}
		ordered.push((recovered, *signature));
	}

	ordered.sort_by_key(|(address, _)| *address);

	let mut seen = ordered.clone();
	seen.dedup_by_key(|(address, _)| *address);
	if seen.len() != ordered.len() {
		return Err(EngineError::InvariantViolation(
			"duplicate signer in commitment signature set".into(),
		));
	}

	Ok(ordered)
}

pub(crate) fn concat_signature_bytes(ordered: &[(Address, Signature)]) -> Vec<u8> {
	let mut out = Vec::with_capacity(ordered.len() * 65);
	for (_, signature) in ordered {
		out.extend_from_slice(&signature.to_bytes());
	}
	out
}

/// The EIP-712-flavored domain separator the multisig mixes into every
/// transaction hash (spec §6): `keccak256(abi.encodePacked(keccak256(name),
/// keccak256(version), chainId, address(multisig), salt))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigDomain {
	pub name: &'static str,
	pub version: &'static str,
	pub chain_id: u64,
	pub multisig_address: Address,
	pub salt: [u8; 32],
}

impl MultisigDomain {
	pub fn separator_hash(&self) -> [u8; 32] {
		let mut preimage = Vec::with_capacity(32 + 32 + 32 + 20 + 32);
		preimage.extend_from_slice(&keccak256(self.name.as_bytes()));
		preimage.extend_from_slice(&keccak256(self.version.as_bytes()));
		preimage.extend_from_slice(&u256_be_u64(self.chain_id));
		preimage.extend_from_slice(&self.multisig_address.0);
		preimage.extend_from_slice(&self.salt);
		keccak256(&preimage)
	}
}

/// `Operation` for the multisig's `execTransaction`: a plain message call
/// versus a `delegatecall` into an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultisigOperation {
	Call = 0,
	DelegateCall = 1,
}

/// Encode the multisig transaction hash preimage (spec §6):
/// `abi.encodePacked(0x19, owners[], to, value, keccak256(data),
/// uint8(op), domainSeparatorHash, nonce)`. Shared by every commitment that
/// targets `execTransaction` (Setup, ConditionalTransaction, Withdraw).
pub(crate) fn encode_multisig_transaction(
	owners: &[Address; 2],
	inner: &MinimalTransaction,
	operation: MultisigOperation,
	domain: &MultisigDomain,
	nonce: u64,
) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(&owners[0].0);
	out.extend_from_slice(&owners[1].0);
	out.extend_from_slice(&inner.to.0);
	out.extend_from_slice(&u256_be_u128(inner.value));
	out.extend_from_slice(&keccak256(&inner.data));
	out.push(operation as u8);
	out.extend_from_slice(&domain.separator_hash());
	out.extend_from_slice(&u256_be_u64(nonce));
	out
}

/// ABI-encode a call to the multisig's `execTransaction(to, value, data, op,
/// domainName, domainVersion, chainId, domainSalt, nonce, signatures)` (spec
/// §6), the outer transaction every Setup, ConditionalTransaction, and
/// Withdraw commitment broadcasts.
pub(crate) fn encode_exec_transaction_call(
	inner: &MinimalTransaction,
	operation: MultisigOperation,
	domain: &MultisigDomain,
	nonce: u64,
	signatures: &[u8],
) -> Result<Vec<u8>> {
	use ethabi::{Param, ParamType, StateMutability, Token};

	#[allow(deprecated)]
	let function = ethabi::Function {
		name: "execTransaction".into(),
		inputs: vec![
			Param { name: "to".into(), kind: ParamType::Address, internal_type: None },
			Param { name: "value".into(), kind: ParamType::Uint(256), internal_type: None },
			Param { name: "data".into(), kind: ParamType::Bytes, internal_type: None },
			Param { name: "operation".into(), kind: ParamType::Uint(8), internal_type: None },
			Param { name: "domainName".into(), kind: ParamType::String, internal_type: None },
			Param { name: "domainVersion".into(), kind: ParamType::String, internal_type: None },
			Param { name: "chainId".into(), kind: ParamType::Uint(256), internal_type: None },
			Param { name: "domainSalt".into(), kind: ParamType::FixedBytes(32), internal_type: None },
			Param { name: "nonce".into(), kind: ParamType::Uint(256), internal_type: None },
			Param { name: "signatures".into(), kind: ParamType::Bytes, internal_type: None },
		],
		outputs: vec![],
		constant: None,
		state_mutability: StateMutability::NonPayable,
	};

	let tokens = [
		Token::Address(inner.to.0.into()),
		Token::Uint(inner.value.into()),
		Token::Bytes(inner.data.clone()),
		Token::Uint((operation as u8).into()),
		Token::String(domain.name.to_string()),
		Token::String(domain.version.to_string()),
		Token::Uint(domain.chain_id.into()),
		Token::FixedBytes(domain.salt.to_vec()),
		Token::Uint(nonce.into()),
		Token::Bytes(signatures.to_vec()),
	];

	function
		.encode_input(&tokens)
		.map_err(|e| EngineError::InvariantViolation(format!("ABI encode failed: {e}")))
}
