//! Setup commitment: the multisig `execTransaction` call that seeds the
//! free-balance interpreter on channel creation (spec §4.1, §4.3 Setup).

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
pub struct SetupCommitment {
	pub multisig_address: Address,
	pub owners: [Address; 2],
	pub free_balance_interpreter_address: Address,
	pub interpreter_params: Vec<u8>,
	pub domain: MultisigDomain,
	pub nonce: u64,
	signatures: Vec<u8>,
	signed_count: usize,
}

impl SetupCommitment {
	pub fn new(
		multisig_address: Address,
		owners: [Address; 2],
		free_balance_interpreter_address: Address,
		interpreter_params: Vec<u8>,
		domain: MultisigDomain,
		nonce: u64,
	) -> Self {
		Self {
			multisig_address,
			owners,
			free_balance_interpreter_address,
			interpreter_params,
			domain,
			nonce,
			signatures: Vec::new(),
			signed_count: 0,
		}
	}

	fn inner_transaction(&self) -> MinimalTransaction {
		MinimalTransaction {
			to: self.free_balance_interpreter_address,
			value: 0,
			data: self.interpreter_params.clone(),
		}
	}
}

impl Commitment for SetupCommitment {
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
				"more signatures than owners on Setup commitment".into(),
			));
		}
		self.signed_count = ordered.len();
		self.signatures = super::concat_signature_bytes(&ordered);
		Ok(())
	}

	fn get_signed_transaction(&self) -> Result<MinimalTransaction> {
		if self.signed_count != self.owners.len() {
			return Err(EngineError::InvariantViolation(
				"Setup commitment must be signed by both owners before broadcast".into(),
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
