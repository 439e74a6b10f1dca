//! Propose (spec §4.3): the initiator allocates the next `channelNonce`,
//! proposes an app's initial terms, and both sides countersign a SetState
//! commitment over the proposed initial state before the proposal is
//! persisted — nothing is installed yet, that is Install's job.

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	app::AppIdentity,
	channel::Proposal,
	commitments::{Commitment, SetStateCommitment},
	crypto::{keccak256, recover_signer, Signature},
	errors::EngineError,
	identifiers::Address,
	middleware::{ProtocolName, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

#[derive(Debug, Clone)]
pub struct ProposeOutput {
	pub proposal: Proposal,
	pub commitment: SetStateCommitment,
}

fn proposal_commitment(proposal: &Proposal, challenge_registry_address: Address) -> SetStateCommitment {
	SetStateCommitment::new(
		proposal.identity.clone(),
		1,
		proposal.initial_state_timeout,
		keccak256(&proposal.initial_state),
		challenge_registry_address,
	)
}

enum InitiatorPhase {
	AwaitingSign { proposal: Proposal, commitment: SetStateCommitment },
	AwaitingReply { proposal: Proposal, commitment: SetStateCommitment, local_sig: Signature },
	AwaitingPersist { output: ProposeOutput },
}

pub struct ProposeInitiatorStage {
	peer_address: Address,
	challenge_registry_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: InitiatorPhase,
}

impl ProposeInitiatorStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel_nonce: u64,
		app_definition: Address,
		default_timeout: u64,
		initial_state: Vec<u8>,
		initial_state_timeout: u64,
		initiator: Address,
		responder: Address,
		token_address: Address,
		initiator_deposit: u128,
		responder_deposit: u128,
		challenge_registry_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Self {
		let identity = AppIdentity {
			channel_nonce,
			participants: [initiator, responder],
			app_definition,
			default_timeout,
		};
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
		let commitment = proposal_commitment(&proposal, challenge_registry_address);
		Self {
			peer_address: responder,
			challenge_registry_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: InitiatorPhase::AwaitingSign { proposal, commitment },
		}
	}
}

impl ProtocolStage for ProposeInitiatorStage {
	type Output = ProposeOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			InitiatorPhase::AwaitingSign { commitment, .. } => {
				StepOutcome::Yield(Opcode::Sign { digest: commitment.hash_to_sign() })
			}
			_ => unreachable!("Propose initiator always starts in AwaitingSign"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(InitiatorPhase::AwaitingSign { proposal, commitment }, OpcodeResult::Signed(sig)) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Propose,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({
						"channelNonce": proposal.identity.channel_nonce,
						"appDefinition": proposal.identity.app_definition.to_string(),
						"defaultTimeout": proposal.identity.default_timeout,
						"initialState": hex::encode(&proposal.initial_state),
						"initialStateTimeout": proposal.initial_state_timeout,
						"initiator": proposal.initiator.to_string(),
						"responder": proposal.responder.to_string(),
						"tokenAddress": proposal.token_address.to_string(),
						"initiatorDeposit": proposal.initiator_deposit.to_string(),
						"responderDeposit": proposal.responder_deposit.to_string(),
					}),
					custom_data: CustomData { signature: Some(sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = InitiatorPhase::AwaitingReply {
					proposal: proposal.clone(),
					commitment: commitment.clone(),
					local_sig: sig,
				};
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(
				InitiatorPhase::AwaitingReply { proposal, commitment, local_sig },
				OpcodeResult::Received(envelope),
			) => {
				let responder_sig = match envelope.custom_data.signature {
					Some(sig) => sig,
					None => {
						return StepOutcome::Fail(EngineError::InvariantViolation(
							"Propose reply carried no signature".into(),
						))
					}
				};

				let recovered = match recover_signer(commitment.hash_to_sign(), &responder_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}

				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*local_sig, responder_sig]) {
					return StepOutcome::Fail(e);
				}

				let output = ProposeOutput { proposal: proposal.clone(), commitment };
				self.phase = InitiatorPhase::AwaitingPersist { output: output.clone() };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateAppProposal {
						proposal: output.proposal.clone(),
						set_state: output.commitment.clone(),
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
				"opcode result did not match Propose initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation { proposal: Proposal, commitment: SetStateCommitment, initiator_sig: Signature },
	AwaitingSign { proposal: Proposal, commitment: SetStateCommitment, initiator_sig: Signature },
	AwaitingPersist { output: ProposeOutput, local_sig: Signature },
	AwaitingSendAck { output: ProposeOutput },
}

pub struct ProposeResponderStage {
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: ResponderPhase,
}

impl ProposeResponderStage {
	pub fn new(
		proposal: Proposal,
		initiator_sig: Signature,
		challenge_registry_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Self {
		let peer_address = proposal.initiator;
		let commitment = proposal_commitment(&proposal, challenge_registry_address);
		Self {
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: ResponderPhase::AwaitingValidation { proposal, commitment, initiator_sig },
		}
	}
}

impl ProtocolStage for ProposeResponderStage {
	type Output = ProposeOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			ResponderPhase::AwaitingValidation { proposal, .. } => {
				let ctx = ValidationContext {
					protocol: ProtocolName::Propose,
					app_identity: proposal.identity.clone(),
					claimed_turn_taker: self.peer_address,
					action: Vec::new(),
				};
				StepOutcome::Yield(Opcode::Validate { ctx })
			}
			_ => unreachable!("Propose responder always starts in AwaitingValidation"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(
				ResponderPhase::AwaitingValidation { proposal, commitment, initiator_sig },
				OpcodeResult::Validated(None),
			) => {
				let recovered = match recover_signer(commitment.hash_to_sign(), initiator_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}
				let digest = commitment.hash_to_sign();
				self.phase = ResponderPhase::AwaitingSign {
					proposal: proposal.clone(),
					commitment: commitment.clone(),
					initiator_sig: *initiator_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(ResponderPhase::AwaitingValidation { .. }, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(
				ResponderPhase::AwaitingSign { proposal, commitment, initiator_sig },
				OpcodeResult::Signed(local_sig),
			) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*initiator_sig, local_sig]) {
					return StepOutcome::Fail(e);
				}

				let output = ProposeOutput { proposal: proposal.clone(), commitment };
				self.phase = ResponderPhase::AwaitingPersist { output: output.clone(), local_sig };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateAppProposal {
						proposal: output.proposal.clone(),
						set_state: output.commitment.clone(),
					},
				})
			}
			(ResponderPhase::AwaitingPersist { output, local_sig }, OpcodeResult::Persisted) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Propose,
					seq: 1,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "identityHash": hex::encode(output.proposal.identity_hash()) }),
					custom_data: CustomData { signature: Some(*local_sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = ResponderPhase::AwaitingSendAck { output: output.clone() };
				StepOutcome::Yield(Opcode::Send { envelope })
			}
			(ResponderPhase::AwaitingPersist { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(ResponderPhase::AwaitingSendAck { output }, OpcodeResult::Sent) => {
				StepOutcome::Done(output.clone())
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Propose responder's current phase".into(),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{LocalSigner, Signer};
	use secp256k1::SecretKey;
	use std::str::FromStr;

	#[test]
	fn propose_end_to_end_persists_identical_commitment_on_both_sides() {
		let sk_a =
			SecretKey::from_str("f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315").unwrap();
		let sk_b =
			SecretKey::from_str("b3b0e5d984113075f805057c6dbf1ad1078a17a925ebbeaaac09aaf39754d6c5").unwrap();
		let initiator = LocalSigner::new(sk_a);
		let responder = LocalSigner::new(sk_b);
		let challenge_registry = Address([0xEE; 20]);

		let mut initiator_stage = ProposeInitiatorStage::new(
			3,
			Address([0xAA; 20]),
			10,
			b"{\"counter\":0}".to_vec(),
			10,
			initiator.address(),
			responder.address(),
			crate::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			100,
			100,
			challenge_registry,
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
		);

		let mut outcome = initiator_stage.init();
		loop {
			match outcome {
				StepOutcome::Yield(Opcode::Sign { digest }) => {
					outcome = initiator_stage.resume(OpcodeResult::Signed(initiator.sign(digest)));
				}
				StepOutcome::Yield(Opcode::SendAndWait { envelope }) => {
					let initiator_sig = envelope.custom_data.signature.unwrap();
					let proposal = Proposal {
						identity: AppIdentity {
							channel_nonce: 3,
							participants: [initiator.address(), responder.address()],
							app_definition: Address([0xAA; 20]),
							default_timeout: 10,
						},
						initial_state: b"{\"counter\":0}".to_vec(),
						initial_state_timeout: 10,
						initiator: initiator.address(),
						responder: responder.address(),
						token_address: crate::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS,
						initiator_deposit: 100,
						responder_deposit: 100,
					};

					let mut responder_stage = ProposeResponderStage::new(
						proposal,
						initiator_sig,
						challenge_registry,
						ProcessId(1),
						"responder".into(),
						"initiator".into(),
					);
					let mut responder_outcome = responder_stage.init();
					let reply = loop {
						match responder_outcome {
							StepOutcome::Yield(Opcode::Validate { .. }) => {
								responder_outcome = responder_stage.resume(OpcodeResult::Validated(None));
							}
							StepOutcome::Yield(Opcode::Sign { digest }) => {
								responder_outcome =
									responder_stage.resume(OpcodeResult::Signed(responder.sign(digest)));
							}
							StepOutcome::Yield(Opcode::Persist { .. }) => {
								responder_outcome = responder_stage.resume(OpcodeResult::Persisted);
							}
							StepOutcome::Yield(Opcode::Send { envelope }) => break envelope,
							StepOutcome::Fail(e) => panic!("responder failed: {e}"),
							_ => panic!("unexpected responder opcode"),
						}
					};
					outcome = initiator_stage.resume(OpcodeResult::Received(reply));
				}
				StepOutcome::Yield(Opcode::Persist { .. }) => {
					outcome = initiator_stage.resume(OpcodeResult::Persisted);
				}
				StepOutcome::Done(output) => {
					assert!(output.commitment.is_fully_signed());
					assert_eq!(output.proposal.identity.channel_nonce, 3);
					return;
				}
				StepOutcome::Fail(e) => panic!("initiator failed: {e}"),
				_ => panic!("unexpected initiator opcode"),
			}
		}
	}
}
