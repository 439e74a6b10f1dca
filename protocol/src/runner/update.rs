//! Update (spec §4.3): commit directly to a caller-supplied new app state,
//! with no `computeStateTransition` call — the caller has already decided
//! the post-state (e.g. to apply an off-chain-agreed correction), so this
//! protocol is TakeAction's exchange minus the state-transition step.

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	app::AppInstance,
	commitments::{Commitment, SetStateCommitment},
	crypto::{keccak256, recover_signer, Signature},
	errors::EngineError,
	identifiers::Address,
	middleware::{ProtocolName, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

#[derive(Debug, Clone)]
pub struct UpdateOutput {
	pub app: AppInstance,
	pub commitment: SetStateCommitment,
}

enum InitiatorPhase {
	AwaitingValidation,
	AwaitingSign { commitment: SetStateCommitment },
	AwaitingPersistSingleSigned { commitment: SetStateCommitment, local_sig: Signature },
	AwaitingReply { commitment: SetStateCommitment, local_sig: Signature },
	AwaitingPersistDoubleSigned { app: AppInstance, commitment: SetStateCommitment },
}

pub struct UpdateInitiatorStage {
	app: AppInstance,
	new_state: Vec<u8>,
	new_state_timeout: u64,
	local_address: Address,
	peer_address: Address,
	challenge_registry_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: InitiatorPhase,
}

impl UpdateInitiatorStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		app: AppInstance,
		new_state: Vec<u8>,
		new_state_timeout: u64,
		local_address: Address,
		peer_address: Address,
		challenge_registry_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Self {
		Self {
			app,
			new_state,
			new_state_timeout,
			local_address,
			peer_address,
			challenge_registry_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: InitiatorPhase::AwaitingValidation,
		}
	}
}

impl ProtocolStage for UpdateInitiatorStage {
	type Output = UpdateOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		let ctx = ValidationContext {
			protocol: ProtocolName::Update,
			app_identity: self.app.identity.clone(),
			claimed_turn_taker: self.local_address,
			action: Vec::new(),
		};
		StepOutcome::Yield(Opcode::Validate { ctx })
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(InitiatorPhase::AwaitingValidation, OpcodeResult::Validated(None)) => {
				let commitment = SetStateCommitment::new(
					self.app.identity.clone(),
					self.app.version_number + 1,
					self.new_state_timeout,
					keccak256(&self.new_state),
					self.challenge_registry_address,
				);
				let digest = commitment.hash_to_sign();
				self.phase = InitiatorPhase::AwaitingSign { commitment };
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(InitiatorPhase::AwaitingValidation, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(InitiatorPhase::AwaitingSign { commitment }, OpcodeResult::Signed(sig)) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[sig]) {
					return StepOutcome::Fail(e);
				}

				let mut app_with_pending = self.app.clone();
				app_with_pending.latest_action = Some(self.new_state.clone());

				self.phase =
					InitiatorPhase::AwaitingPersistSingleSigned { commitment: commitment.clone(), local_sig: sig };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::UpdateAppInstance {
						app: app_with_pending,
						set_state: commitment,
						fully_signed: false,
					},
				})
			}
			(
				InitiatorPhase::AwaitingPersistSingleSigned { commitment, local_sig },
				OpcodeResult::Persisted,
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Update,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({
						"appIdentityHash": hex::encode(self.app.identity_hash()),
						"newState": hex::encode(&self.new_state),
						"versionNumber": commitment.version_number,
						"stateTimeout": commitment.state_timeout,
					}),
					custom_data: CustomData { signature: Some(*local_sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase =
					InitiatorPhase::AwaitingReply { commitment: commitment.clone(), local_sig: *local_sig };
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingPersistSingleSigned { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(InitiatorPhase::AwaitingReply { commitment, local_sig }, OpcodeResult::Received(envelope)) => {
				let responder_sig = match envelope.custom_data.signature {
					Some(sig) => sig,
					None => {
						return StepOutcome::Fail(EngineError::InvariantViolation(
							"Update reply carried no signature".into(),
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

				let updated_app = AppInstance {
					identity: self.app.identity.clone(),
					latest_state: self.new_state.clone(),
					version_number: self.app.version_number + 1,
					state_timeout: commitment.state_timeout,
					latest_action: None,
				};

				self.phase = InitiatorPhase::AwaitingPersistDoubleSigned {
					app: updated_app.clone(),
					commitment: commitment.clone(),
				};
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::UpdateAppInstance {
						app: updated_app,
						set_state: commitment,
						fully_signed: true,
					},
				})
			}
			(InitiatorPhase::AwaitingPersistDoubleSigned { app, commitment }, OpcodeResult::Persisted) => {
				StepOutcome::Done(UpdateOutput { app: app.clone(), commitment: commitment.clone() })
			}
			(InitiatorPhase::AwaitingPersistDoubleSigned { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Update initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation,
	AwaitingSign { commitment: SetStateCommitment, initiator_sig: Signature },
	AwaitingPersist { app: AppInstance, commitment: SetStateCommitment, local_sig: Signature },
	AwaitingSendAck { app: AppInstance, commitment: SetStateCommitment, local_sig: Signature },
}

pub struct UpdateResponderStage {
	app: AppInstance,
	new_state: Vec<u8>,
	new_state_timeout: u64,
	initiator_sig: Signature,
	peer_address: Address,
	challenge_registry_address: Address,
	requested_version_number: u64,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: ResponderPhase,
}

impl UpdateResponderStage {
	/// `requested_version_number` is the `versionNumber` the initiator's
	/// envelope claims (spec §6); see the matching guard on
	/// [`super::take_action::TakeActionResponderStage`] for why this is
	/// checked against `app.version_number` before anything else runs.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		app: AppInstance,
		new_state: Vec<u8>,
		new_state_timeout: u64,
		initiator_sig: Signature,
		peer_address: Address,
		challenge_registry_address: Address,
		requested_version_number: u64,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Self {
		Self {
			app,
			new_state,
			new_state_timeout,
			initiator_sig,
			peer_address,
			challenge_registry_address,
			requested_version_number,
			process_id,
			from_identifier,
			to_identifier,
			phase: ResponderPhase::AwaitingValidation,
		}
	}
}

impl ProtocolStage for UpdateResponderStage {
	type Output = UpdateOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		if self.requested_version_number <= self.app.version_number {
			return StepOutcome::Fail(EngineError::ValidationRejected(format!(
				"Update requested versionNumber {} is not greater than local versionNumber {}; treated as replay",
				self.requested_version_number, self.app.version_number
			)));
		}

		let ctx = ValidationContext {
			protocol: ProtocolName::Update,
			app_identity: self.app.identity.clone(),
			claimed_turn_taker: self.peer_address,
			action: Vec::new(),
		};
		StepOutcome::Yield(Opcode::Validate { ctx })
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(None)) => {
				let commitment = SetStateCommitment::new(
					self.app.identity.clone(),
					self.app.version_number + 1,
					self.new_state_timeout,
					keccak256(&self.new_state),
					self.challenge_registry_address,
				);

				let digest = commitment.hash_to_sign();
				let recovered = match recover_signer(digest, &self.initiator_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}

				self.phase = ResponderPhase::AwaitingSign { commitment, initiator_sig: self.initiator_sig };
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(ResponderPhase::AwaitingSign { commitment, initiator_sig }, OpcodeResult::Signed(local_sig)) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*initiator_sig, local_sig]) {
					return StepOutcome::Fail(e);
				}

				let updated_app = AppInstance {
					identity: self.app.identity.clone(),
					latest_state: self.new_state.clone(),
					version_number: self.app.version_number + 1,
					state_timeout: commitment.state_timeout,
					latest_action: None,
				};

				self.phase = ResponderPhase::AwaitingPersist {
					app: updated_app.clone(),
					commitment: commitment.clone(),
					local_sig,
				};
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::UpdateAppInstance {
						app: updated_app,
						set_state: commitment,
						fully_signed: true,
					},
				})
			}
			(ResponderPhase::AwaitingPersist { app, commitment, local_sig }, OpcodeResult::Persisted) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Update,
					seq: 1,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({
						"appIdentityHash": hex::encode(self.app.identity_hash()),
						"versionNumber": commitment.version_number,
					}),
					custom_data: CustomData { signature: Some(*local_sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = ResponderPhase::AwaitingSendAck {
					app: app.clone(),
					commitment: commitment.clone(),
					local_sig: *local_sig,
				};
				StepOutcome::Yield(Opcode::Send { envelope })
			}
			(ResponderPhase::AwaitingPersist { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(ResponderPhase::AwaitingSendAck { app, commitment, .. }, OpcodeResult::Sent) => {
				StepOutcome::Done(UpdateOutput { app: app.clone(), commitment: commitment.clone() })
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Update responder's current phase".into(),
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
	fn update_commits_caller_supplied_state_without_state_transition() {
		let sk_a =
			SecretKey::from_str("f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315").unwrap();
		let sk_b =
			SecretKey::from_str("b3b0e5d984113075f805057c6dbf1ad1078a17a925ebbeaaac09aaf39754d6c5").unwrap();
		let signer_a = LocalSigner::new(sk_a);
		let signer_b = LocalSigner::new(sk_b);
		let (initiator, responder) = if signer_a.address() < signer_b.address() {
			(signer_a, signer_b)
		} else {
			(signer_b, signer_a)
		};

		let identity = crate::app::AppIdentity {
			channel_nonce: 1,
			participants: [initiator.address(), responder.address()],
			app_definition: Address([0xCC; 20]),
			default_timeout: 100,
		};
		let app = AppInstance {
			identity,
			latest_state: b"{\"counter\":0}".to_vec(),
			version_number: 1,
			state_timeout: 100,
			latest_action: None,
		};
		let new_state = b"{\"counter\":99}".to_vec();
		let challenge_registry = Address([0xEE; 20]);

		let mut initiator_stage = UpdateInitiatorStage::new(
			app.clone(),
			new_state.clone(),
			100,
			initiator.address(),
			responder.address(),
			challenge_registry,
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
		);

		let mut outcome = initiator_stage.init();
		loop {
			match outcome {
				StepOutcome::Yield(Opcode::Validate { .. }) => {
					outcome = initiator_stage.resume(OpcodeResult::Validated(None));
				}
				StepOutcome::Yield(Opcode::Sign { digest }) => {
					outcome = initiator_stage.resume(OpcodeResult::Signed(initiator.sign(digest)));
				}
				StepOutcome::Yield(Opcode::Persist { .. }) => {
					outcome = initiator_stage.resume(OpcodeResult::Persisted);
				}
				StepOutcome::Yield(Opcode::SendAndWait { envelope }) => {
					let requested_version_number = envelope.params["versionNumber"].as_u64().unwrap();
					let mut responder_stage = UpdateResponderStage::new(
						app.clone(),
						new_state.clone(),
						100,
						envelope.custom_data.signature.unwrap(),
						initiator.address(),
						challenge_registry,
						requested_version_number,
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
				StepOutcome::Done(output) => {
					assert_eq!(output.app.latest_state, new_state);
					assert_eq!(output.app.version_number, 2);
					assert!(output.commitment.is_fully_signed());
					return;
				}
				StepOutcome::Fail(e) => panic!("initiator failed: {e}"),
			}
		}
	}

	/// Spec §4.3 "Version-number tie": a resent Update request claiming a
	/// version at or behind the responder's local version must be rejected
	/// with no opcode that could mutate state ever yielded.
	#[test]
	fn responder_rejects_version_number_tie_without_state_change() {
		let sk_b =
			SecretKey::from_str("b3b0e5d984113075f805057c6dbf1ad1078a17a925ebbeaaac09aaf39754d6c5").unwrap();
		let responder = LocalSigner::new(sk_b);

		let identity = crate::app::AppIdentity {
			channel_nonce: 1,
			participants: [Address([0xAA; 20]), responder.address()],
			app_definition: Address([0xCC; 20]),
			default_timeout: 100,
		};
		let app = AppInstance {
			identity,
			latest_state: b"{\"counter\":99}".to_vec(),
			version_number: 2,
			state_timeout: 100,
			latest_action: None,
		};

		let mut responder_stage = UpdateResponderStage::new(
			app,
			b"{\"counter\":99}".to_vec(),
			100,
			responder.sign([0x11; 32]),
			Address([0xAA; 20]),
			Address([0xEE; 20]),
			2,
			ProcessId(1),
			"responder".into(),
			"initiator".into(),
		);

		match responder_stage.init() {
			StepOutcome::Fail(EngineError::ValidationRejected(_)) => {}
			other => panic!("expected the tied request to be rejected before any opcode, got {other:?}"),
		}
	}
}
