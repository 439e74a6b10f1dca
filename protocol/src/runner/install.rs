//! Install (spec §4.3): promote an accepted [`Proposal`] into an
//! [`AppInstance`], debiting the free balance by both deposits and
//! countersigning a ConditionalTransaction commitment that lets either party
//! unilaterally fund the app's outcome interpreter on chain if the
//! counterparty disappears.

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	app::AppInstance,
	channel::{FreeBalance, Proposal, StateChannel},
	commitments::{Commitment, ConditionalTransactionCommitment, MultisigDomain, SetStateCommitment},
	crypto::{recover_signer, Signature},
	errors::EngineError,
	identifiers::Address,
	middleware::{ProtocolName, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

#[derive(Debug, Clone)]
pub struct InstallOutput {
	pub app: AppInstance,
	pub new_free_balance: FreeBalance,
	pub free_balance_set_state: SetStateCommitment,
	pub conditional_transaction: ConditionalTransactionCommitment,
}

fn debit_channel(channel: &StateChannel, identity_hash: [u8; 32]) -> Result<StateChannel, EngineError> {
	channel.install_app(identity_hash)
}

fn conditional_transaction_for(
	channel_after: &StateChannel,
	identity_hash: [u8; 32],
	interpreter_address: Address,
	interpreter_params: Vec<u8>,
	domain: MultisigDomain,
	nonce: u64,
) -> ConditionalTransactionCommitment {
	ConditionalTransactionCommitment::new(
		channel_after.multisig_address,
		channel_after.multisig_owners,
		identity_hash,
		interpreter_address,
		interpreter_params,
		domain,
		nonce,
	)
}

fn free_balance_set_state(channel_after: &StateChannel, challenge_registry_address: Address) -> SetStateCommitment {
	SetStateCommitment::new(
		channel_after.free_balance.identity.clone(),
		channel_after.free_balance.version_number,
		channel_after.free_balance.state_timeout,
		crate::crypto::keccak256(
			&serde_json::to_vec(
				&channel_after
					.free_balance
					.balances
					.iter()
					.map(|(k, v)| (k.to_string(), *v))
					.collect::<std::collections::BTreeMap<_, _>>(),
			)
			.expect("balance map always serializes"),
		),
		challenge_registry_address,
	)
}

enum InitiatorPhase {
	AwaitingFreeBalanceSign { channel_after: StateChannel, commitment: SetStateCommitment, conditional: ConditionalTransactionCommitment },
	AwaitingConditionalSign {
		channel_after: StateChannel,
		commitment: SetStateCommitment,
		free_balance_sig: Signature,
		conditional: ConditionalTransactionCommitment,
	},
	AwaitingReply {
		channel_after: StateChannel,
		commitment: SetStateCommitment,
		free_balance_sig: Signature,
		conditional: ConditionalTransactionCommitment,
		conditional_sig: Signature,
	},
	AwaitingPersist { output: InstallOutput },
}

pub struct InstallInitiatorStage {
	proposal: Proposal,
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: InitiatorPhase,
}

impl InstallInitiatorStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel: &StateChannel,
		proposal: Proposal,
		interpreter_address: Address,
		interpreter_params: Vec<u8>,
		domain: MultisigDomain,
		nonce: u64,
		challenge_registry_address: Address,
		peer_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Result<Self, EngineError> {
		let identity_hash = proposal.identity_hash();
		let channel_after = debit_channel(channel, identity_hash)?;
		let commitment = free_balance_set_state(&channel_after, challenge_registry_address);
		let conditional = conditional_transaction_for(
			&channel_after,
			identity_hash,
			interpreter_address,
			interpreter_params,
			domain,
			nonce,
		);
		Ok(Self {
			proposal,
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: InitiatorPhase::AwaitingFreeBalanceSign { channel_after, commitment, conditional },
		})
	}
}

impl ProtocolStage for InstallInitiatorStage {
	type Output = InstallOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			InitiatorPhase::AwaitingFreeBalanceSign { commitment, .. } => {
				StepOutcome::Yield(Opcode::Sign { digest: commitment.hash_to_sign() })
			}
			_ => unreachable!("Install initiator always starts in AwaitingFreeBalanceSign"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(
				InitiatorPhase::AwaitingFreeBalanceSign { channel_after, commitment, conditional },
				OpcodeResult::Signed(free_balance_sig),
			) => {
				let digest = conditional.hash_to_sign();
				self.phase = InitiatorPhase::AwaitingConditionalSign {
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					free_balance_sig,
					conditional: conditional.clone(),
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(
				InitiatorPhase::AwaitingConditionalSign { channel_after, commitment, free_balance_sig, conditional },
				OpcodeResult::Signed(conditional_sig),
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Install,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "identityHash": hex::encode(self.proposal.identity_hash()) }),
					custom_data: CustomData {
						signature: Some(*free_balance_sig),
						free_balance_signature: Some(conditional_sig),
					},
					prev_message_received: None,
				};
				self.phase = InitiatorPhase::AwaitingReply {
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					free_balance_sig: *free_balance_sig,
					conditional: conditional.clone(),
					conditional_sig,
				};
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(
				InitiatorPhase::AwaitingReply { channel_after, commitment, free_balance_sig, conditional, conditional_sig },
				OpcodeResult::Received(envelope),
			) => {
				let (peer_fb_sig, peer_cond_sig) =
					match (envelope.custom_data.signature, envelope.custom_data.free_balance_signature) {
						(Some(a), Some(b)) => (a, b),
						_ => {
							return StepOutcome::Fail(EngineError::InvariantViolation(
								"Install reply missing one of the two expected signatures".into(),
							))
						}
					};

				let recovered = match recover_signer(commitment.hash_to_sign(), &peer_fb_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch { expected: self.peer_address, recovered });
				}

				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*free_balance_sig, peer_fb_sig]) {
					return StepOutcome::Fail(e);
				}
				let mut conditional = conditional.clone();
				if let Err(e) = conditional.add_signatures(&[*conditional_sig, peer_cond_sig]) {
					return StepOutcome::Fail(e);
				}

				let identity_hash = self.proposal.identity_hash();
				let app = channel_after.app_instances.get(&identity_hash).cloned().ok_or_else(|| {
					EngineError::InvariantViolation("installed app missing from channel_after".into())
				});
				let app = match app {
					Ok(app) => app,
					Err(e) => return StepOutcome::Fail(e),
				};

				let output = InstallOutput {
					app,
					new_free_balance: channel_after.free_balance.clone(),
					free_balance_set_state: commitment,
					conditional_transaction: conditional,
				};
				self.phase = InitiatorPhase::AwaitingPersist { output: output.clone() };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateAppInstance {
						app: output.app.clone(),
						new_free_balance: output.new_free_balance.clone(),
						free_balance_set_state: output.free_balance_set_state.clone(),
						conditional_transaction: output.conditional_transaction.clone(),
					},
				})
			}
			(InitiatorPhase::AwaitingPersist { output }, OpcodeResult::Persisted) => {
				StepOutcome::Done(output.clone())
			}
			(InitiatorPhase::AwaitingPersist { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Install initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation { channel_after: StateChannel, commitment: SetStateCommitment, conditional: ConditionalTransactionCommitment, peer_fb_sig: Signature, peer_cond_sig: Signature },
	AwaitingFreeBalanceSign { channel_after: StateChannel, commitment: SetStateCommitment, conditional: ConditionalTransactionCommitment, peer_fb_sig: Signature, peer_cond_sig: Signature },
	AwaitingConditionalSign { channel_after: StateChannel, commitment: SetStateCommitment, conditional: ConditionalTransactionCommitment, peer_fb_sig: Signature, peer_cond_sig: Signature, local_fb_sig: Signature },
	AwaitingPersist { output: InstallOutput, local_fb_sig: Signature, local_cond_sig: Signature },
	AwaitingSendAck { output: InstallOutput, local_fb_sig: Signature, local_cond_sig: Signature },
}

pub struct InstallResponderStage {
	identity_hash: [u8; 32],
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: ResponderPhase,
}

impl InstallResponderStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel: &StateChannel,
		proposal: &Proposal,
		interpreter_address: Address,
		interpreter_params: Vec<u8>,
		domain: MultisigDomain,
		nonce: u64,
		challenge_registry_address: Address,
		peer_address: Address,
		peer_fb_sig: Signature,
		peer_cond_sig: Signature,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Result<Self, EngineError> {
		let identity_hash = proposal.identity_hash();
		let channel_after = debit_channel(channel, identity_hash)?;
		let commitment = free_balance_set_state(&channel_after, challenge_registry_address);
		let conditional = conditional_transaction_for(
			&channel_after,
			identity_hash,
			interpreter_address,
			interpreter_params,
			domain,
			nonce,
		);
		Ok(Self {
			identity_hash,
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: ResponderPhase::AwaitingValidation { channel_after, commitment, conditional, peer_fb_sig, peer_cond_sig },
		})
	}
}

impl ProtocolStage for InstallResponderStage {
	type Output = InstallOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			ResponderPhase::AwaitingValidation { channel_after, .. } => {
				let identity = channel_after
					.app_instances
					.get(&self.identity_hash)
					.map(|app| app.identity.clone())
					.expect("channel_after was just built by installing this app");
				let ctx = ValidationContext {
					protocol: ProtocolName::Install,
					app_identity: identity,
					claimed_turn_taker: self.peer_address,
					action: Vec::new(),
				};
				StepOutcome::Yield(Opcode::Validate { ctx })
			}
			_ => unreachable!("Install responder always starts in AwaitingValidation"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(
				ResponderPhase::AwaitingValidation { channel_after, commitment, conditional, peer_fb_sig, peer_cond_sig },
				OpcodeResult::Validated(None),
			) => {
				let recovered = match recover_signer(commitment.hash_to_sign(), peer_fb_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch { expected: self.peer_address, recovered });
				}
				let digest = commitment.hash_to_sign();
				self.phase = ResponderPhase::AwaitingFreeBalanceSign {
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					conditional: conditional.clone(),
					peer_fb_sig: *peer_fb_sig,
					peer_cond_sig: *peer_cond_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(ResponderPhase::AwaitingValidation { .. }, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(
				ResponderPhase::AwaitingFreeBalanceSign { channel_after, commitment, conditional, peer_fb_sig, peer_cond_sig },
				OpcodeResult::Signed(local_fb_sig),
			) => {
				let digest = conditional.hash_to_sign();
				self.phase = ResponderPhase::AwaitingConditionalSign {
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					conditional: conditional.clone(),
					peer_fb_sig: *peer_fb_sig,
					peer_cond_sig: *peer_cond_sig,
					local_fb_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(
				ResponderPhase::AwaitingConditionalSign { channel_after, commitment, conditional, peer_fb_sig, peer_cond_sig, local_fb_sig },
				OpcodeResult::Signed(local_cond_sig),
			) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*peer_fb_sig, *local_fb_sig]) {
					return StepOutcome::Fail(e);
				}
				let mut conditional = conditional.clone();
				if let Err(e) = conditional.add_signatures(&[*peer_cond_sig, local_cond_sig]) {
					return StepOutcome::Fail(e);
				}

				let app = match channel_after.app_instances.get(&self.identity_hash).cloned() {
					Some(app) => app,
					None => {
						return StepOutcome::Fail(EngineError::InvariantViolation(
							"installed app missing from channel_after".into(),
						))
					}
				};

				let output = InstallOutput {
					app,
					new_free_balance: channel_after.free_balance.clone(),
					free_balance_set_state: commitment,
					conditional_transaction: conditional,
				};
				let local_fb_sig = *local_fb_sig;
				self.phase = ResponderPhase::AwaitingPersist { output: output.clone(), local_fb_sig, local_cond_sig };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateAppInstance {
						app: output.app.clone(),
						new_free_balance: output.new_free_balance.clone(),
						free_balance_set_state: output.free_balance_set_state.clone(),
						conditional_transaction: output.conditional_transaction.clone(),
					},
				})
			}
			(
				ResponderPhase::AwaitingPersist { output, local_fb_sig, local_cond_sig },
				OpcodeResult::Persisted,
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Install,
					seq: 1,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "identityHash": hex::encode(self.identity_hash) }),
					custom_data: CustomData {
						signature: Some(*local_fb_sig),
						free_balance_signature: Some(*local_cond_sig),
					},
					prev_message_received: None,
				};
				self.phase = ResponderPhase::AwaitingSendAck {
					output: output.clone(),
					local_fb_sig: *local_fb_sig,
					local_cond_sig: *local_cond_sig,
				};
				StepOutcome::Yield(Opcode::Send { envelope })
			}
			(ResponderPhase::AwaitingPersist { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(ResponderPhase::AwaitingSendAck { output, .. }, OpcodeResult::Sent) => {
				StepOutcome::Done(output.clone())
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Install responder's current phase".into(),
			)),
		}
	}
}
