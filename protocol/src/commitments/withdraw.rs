//! Withdraw commitment: a conditional transfer straight out of the multisig
//! to a recipient, outside any app (spec §4.1).

use serde::{Deserialize, Serialize};

use super::{
	encode_exec_transaction_call, encode_multisig_transaction, order_signatures_by_recovered_address,
	Commitment, MinimalTransaction, MultisigDomain, MultisigOperation,
};
use crate::{
	errors::{EngineError, Result},
	identifiers::Address,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawCommitment {
	pub multisig_address: Address,
	pub owners: [Address; 2],
	pub recipient: Address,
	pub token_address: Address,
	pub amount: u128,
	pub domain: MultisigDomain,
	pub nonce: u64,
	signatures: Vec<u8>,
	signed_count: usize,
}

impl WithdrawCommitment {
	pub fn new(
		multisig_address: Address,
		owners: [Address; 2],
		recipient: Address,
		token_address: Address,
		amount: u128,
		domain: MultisigDomain,
		nonce: u64,
	) -> Self {
		Self {
			multisig_address,
			owners,
			recipient,
			token_address,
			amount,
			domain,
			nonce,
			signatures: Vec::new(),
			signed_count: 0,
		}
	}

	/// A direct ETH transfer when `token_address` is the native-ETH
	/// convention address, otherwise an ERC20 `transfer(recipient, amount)`
	/// call routed through the token contract.
	fn inner_transaction(&self) -> MinimalTransaction {
		if self.token_address == crate::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS {
			MinimalTransaction { to: self.recipient, value: self.amount, data: Vec::new() }
		} else {
			use ethabi::{Param, ParamType, StateMutability, Token};
			#[allow(deprecated)]
			let function = ethabi::Function {
				name: "transfer".into(),
				inputs: vec![
					Param { name: "to".into(), kind: ParamType::Address, internal_type: None },
					Param { name: "amount".into(), kind: ParamType::Uint(256), internal_type: None },
				],
				outputs: vec![Param {
					name: "".into(),
					kind: ParamType::Bool,
					internal_type: None,
				}],
				constant: None,
				state_mutability: StateMutability::NonPayable,
			};
			let data = function
				.encode_input(&[Token::Address(self.recipient.0.into()), Token::Uint(self.amount.into())])
				.expect("fixed ABI shape always encodes");
			MinimalTransaction { to: self.token_address, value: 0, data }
		}
	}
}

impl Commitment for WithdrawCommitment {
	fn encode(&self) -> Vec<u8> {
		encode_multisig_transaction(
			&self.owners,
			&self.inner_transaction(),
			MultisigOperation::Call,
			&self.domain,
			self.nonce,
		)
	}

	fn add_signatures(&mut self, signatures: &[crate::crypto::Signature]) -> Result<()> {
		let digest = self.hash_to_sign();
		let ordered = order_signatures_by_recovered_address(digest, &self.owners, signatures)?;
		if ordered.len() > self.owners.len() {
			return Err(EngineError::InvariantViolation(
				"more signatures than owners on Withdraw commitment".into(),
			));
		}
		self.signed_count = ordered.len();
		self.signatures = super::concat_signature_bytes(&ordered);
		Ok(())
	}

	fn get_signed_transaction(&self) -> Result<MinimalTransaction> {
		if self.signed_count != self.owners.len() {
			return Err(EngineError::InvariantViolation(
				"Withdraw commitment must be double-signed before broadcast".into(),
			));
		}

		let data = encode_exec_transaction_call(
			&self.inner_transaction(),
			MultisigOperation::Call,
			&self.domain,
			self.nonce,
			&self.signatures,
		)?;

		Ok(MinimalTransaction { to: self.multisig_address, value: 0, data })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn domain(multisig: Address) -> MultisigDomain {
		MultisigDomain {
			name: "StateChannelMultisig",
			version: "0.0.1",
			chain_id: 1,
			multisig_address: multisig,
			salt: [0u8; 32],
		}
	}

	#[test]
	fn native_eth_withdrawal_carries_value_and_no_calldata() {
		let multisig = Address([0x10; 20]);
		let owners = [Address([0xAA; 20]), Address([0xBB; 20])];
		let commitment = WithdrawCommitment::new(
			multisig,
			owners,
			Address([0x40; 20]),
			crate::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			1_000,
			domain(multisig),
			3,
		);

		let inner = commitment.inner_transaction();
		assert_eq!(inner.value, 1_000);
		assert!(inner.data.is_empty());
	}

	#[test]
	fn erc20_withdrawal_targets_token_contract() {
		let multisig = Address([0x10; 20]);
		let owners = [Address([0xAA; 20]), Address([0xBB; 20])];
		let token = Address([0x55; 20]);
		let commitment =
			WithdrawCommitment::new(multisig, owners, Address([0x40; 20]), token, 1_000, domain(multisig), 3);

		let inner = commitment.inner_transaction();
		assert_eq!(inner.to, token);
		assert_eq!(inner.value, 0);
		assert!(!inner.data.is_empty());
	}
}
