//! Conditional transaction commitment: the multisig `execTransaction` call
//! binding an app's outcome to an interpreter, produced during Install and
//! re-targeted during Uninstall (spec §4.1, §4.3 Install).

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
pub struct ConditionalTransactionCommitment {
	pub multisig_address: Address,
	pub owners: [Address; 2],
	pub app_identity_hash: [u8; 32],
	pub interpreter_address: Address,
	pub interpreter_params: Vec<u8>,
	pub domain: MultisigDomain,
	pub nonce: u64,
	signatures: Vec<u8>,
	signed_count: usize,
}

impl ConditionalTransactionCommitment {
	pub fn new(
		multisig_address: Address,
		owners: [Address; 2],
		app_identity_hash: [u8; 32],
		interpreter_address: Address,
		interpreter_params: Vec<u8>,
		domain: MultisigDomain,
		nonce: u64,
	) -> Self {
		Self {
			multisig_address,
			owners,
			app_identity_hash,
			interpreter_address,
			interpreter_params,
			domain,
			nonce,
			signatures: Vec::new(),
			signed_count: 0,
		}
	}

	fn inner_transaction(&self) -> MinimalTransaction {
		MinimalTransaction { to: self.interpreter_address, value: 0, data: self.interpreter_params.clone() }
	}
}

impl Commitment for ConditionalTransactionCommitment {
	fn encode(&self) -> Vec<u8> {
		encode_multisig_transaction(
			&self.owners,
			&self.inner_transaction(),
			MultisigOperation::DelegateCall,
			&self.domain,
			self.nonce,
		)
	}

	fn add_signatures(&mut self, signatures: &[crate::crypto::Signature]) -> Result<()> {
		let digest = self.hash_to_sign();
		let ordered = order_signatures_by_recovered_address(digest, &self.owners, signatures)?;
		if ordered.len() > self.owners.len() {
			return Err(EngineError::InvariantViolation(
				"more signatures than owners on ConditionalTransaction commitment".into(),
			));
		}
		self.signed_count = ordered.len();
		self.signatures = super::concat_signature_bytes(&ordered);
		Ok(())
	}

	fn get_signed_transaction(&self) -> Result<MinimalTransaction> {
		if self.signed_count != self.owners.len() {
			return Err(EngineError::InvariantViolation(
				"ConditionalTransaction commitment must be double-signed before broadcast".into(),
			));
		}

		let data = encode_exec_transaction_call(
			&self.inner_transaction(),
			MultisigOperation::DelegateCall,
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
	fn distinct_app_identity_hashes_do_not_collide_via_interpreter_params() {
		let multisig = Address([0x10; 20]);
		let owners = [Address([0xAA; 20]), Address([0xBB; 20])];

		let a = ConditionalTransactionCommitment::new(
			multisig,
			owners,
			[0x01; 32],
			Address([0x30; 20]),
			b"app-a-params".to_vec(),
			domain(multisig),
			0,
		);
		let b = ConditionalTransactionCommitment::new(
			multisig,
			owners,
			[0x02; 32],
			Address([0x30; 20]),
			b"app-b-params".to_vec(),
			domain(multisig),
			0,
		);

		assert_ne!(a.hash_to_sign(), b.hash_to_sign());
	}
}
