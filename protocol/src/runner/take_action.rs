//! TakeAction (spec §4.3 "TakeAction exchange (illustrative detail)"): run a
//! pure state transition via the app definition, then commit to the
//! post-state with a SetState exchange. The initiator persists a
//! single-signed checkpoint before waiting on the peer (step 5) so a
//! vanished responder leaves `progressState` available on chain; the
//! responder never does, since it cannot unilaterally progress state.

use std::sync::Arc;

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	app::{compute_state_transition, AppInstance, EvmProvider},
	commitments::{Commitment, SetStateCommitment},
	crypto::{keccak256, recover_signer, Signature},
	errors::EngineError,
	identifiers::Address,
	middleware::{ProtocolName, RejectReason, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

#[derive(Debug, Clone)]
pub struct TakeActionOutput {
	pub app: AppInstance,
	pub commitment: SetStateCommitment,
}

enum InitiatorPhase {
	AwaitingValidation,
	AwaitingSign { commitment: SetStateCommitment, new_state: Vec<u8> },
	AwaitingPersistSingleSigned { commitment: SetStateCommitment, new_state: Vec<u8>, local_sig: Signature },
	AwaitingReply { commitment: SetStateCommitment, new_state: Vec<u8>, local_sig: Signature },
	AwaitingPersistDoubleSigned { app: AppInstance, commitment: SetStateCommitment },
}

pub struct TakeActionInitiatorStage {
	app: AppInstance,
	action: Vec<u8>,
	local_address: Address,
	peer_address: Address,
	challenge_registry_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	provider: Arc<dyn EvmProvider>,
	phase: InitiatorPhase,
}

impl TakeActionInitiatorStage {
	pub fn new(
		app: AppInstance,
		action: Vec<u8>,
		local_address: Address,
		peer_address: Address,
		challenge_registry_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
		provider: Arc<dyn EvmProvider>,
	) -> Self {
		Self {
			app,
			action,
			local_address,
			peer_address,
			challenge_registry_address,
			process_id,
			from_identifier,
			to_identifier,
			provider,
			phase: InitiatorPhase::AwaitingValidation,
		}
	}
}

impl ProtocolStage for TakeActionInitiatorStage {
	type Output = TakeActionOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		let ctx = ValidationContext {
			protocol: ProtocolName::TakeAction,
			app_identity: self.app.identity.clone(),
			claimed_turn_taker: self.local_address,
			action: self.action.clone(),
		};
		StepOutcome::Yield(Opcode::Validate { ctx })
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(InitiatorPhase::AwaitingValidation, OpcodeResult::Validated(None)) => {
				let new_state =
					match compute_state_transition(&self.app, &self.action, self.provider.as_ref()) {
						Ok(state) => state,
						Err(e) => return StepOutcome::Fail(e),
					};

				let commitment = SetStateCommitment::new(
					self.app.identity.clone(),
					self.app.version_number + 1,
					self.app.state_timeout,
					keccak256(&new_state),
					self.challenge_registry_address,
				);
				let digest = commitment.hash_to_sign();
				self.phase = InitiatorPhase::AwaitingSign { commitment, new_state };
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(InitiatorPhase::AwaitingValidation, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(InitiatorPhase::AwaitingSign { commitment, new_state }, OpcodeResult::Signed(sig)) => {
				let mut commitment = commitment.clone();
				let new_state = std::mem::take(new_state);
				if let Err(e) = commitment.add_signatures(&[sig]) {
					return StepOutcome::Fail(e);
				}

				let mut app_with_pending_action = self.app.clone();
				app_with_pending_action.latest_action = Some(self.action.clone());

				self.phase = InitiatorPhase::AwaitingPersistSingleSigned {
					commitment: commitment.clone(),
					new_state,
					local_sig: sig,
				};
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::UpdateAppInstance {
						app: app_with_pending_action,
						set_state: commitment,
						fully_signed: false,
					},
				})
			}
			(
				InitiatorPhase::AwaitingPersistSingleSigned { commitment, new_state, local_sig },
				OpcodeResult::Persisted,
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::TakeAction,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({
						"appIdentityHash": hex::encode(self.app.identity_hash()),
						"action": hex::encode(&self.action),
						"versionNumber": commitment.version_number,
						"stateTimeout": commitment.state_timeout,
					}),
					custom_data: CustomData { signature: Some(*local_sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = InitiatorPhase::AwaitingReply {
					commitment: commitment.clone(),
					new_state: std::mem::take(new_state),
					local_sig: *local_sig,
				};
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingPersistSingleSigned { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(
				InitiatorPhase::AwaitingReply { commitment, new_state, local_sig },
				OpcodeResult::Received(envelope),
			) => {
				let responder_sig = match envelope.custom_data.signature {
					Some(sig) => sig,
					None => {
						return StepOutcome::Fail(EngineError::InvariantViolation(
							"TakeAction reply carried no signature".into(),
						))
					}
				};

				let digest = commitment.hash_to_sign();
				let recovered = match recover_signer(digest, &responder_sig) {
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
					latest_state: std::mem::take(new_state),
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
				StepOutcome::Done(TakeActionOutput { app: app.clone(), commitment: commitment.clone() })
			}
			(InitiatorPhase::AwaitingPersistDoubleSigned { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match TakeAction initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation,
	AwaitingSign { commitment: SetStateCommitment, new_state: Vec<u8>, initiator_sig: Signature },
	AwaitingPersist { app: AppInstance, commitment: SetStateCommitment, local_sig: Signature },
	AwaitingSendAck { app: AppInstance, commitment: SetStateCommitment, local_sig: Signature },
}

pub struct TakeActionResponderStage {
	app: AppInstance,
	action: Vec<u8>,
	initiator_sig: Signature,
	peer_address: Address,
	challenge_registry_address: Address,
	requested_version_number: u64,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	provider: Arc<dyn EvmProvider>,
	phase: ResponderPhase,
}

impl TakeActionResponderStage {
	/// `requested_version_number` is the `versionNumber` the initiator's
	/// envelope claims (spec §6) — the version it believes this action will
	/// produce. Comparing it against `app.version_number` here is how a
	/// resent request for an already-applied action is told apart from a
	/// fresh one (spec §4.3 "Version-number tie").
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		app: AppInstance,
		action: Vec<u8>,
		initiator_sig: Signature,
		peer_address: Address,
		challenge_registry_address: Address,
		requested_version_number: u64,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
		provider: Arc<dyn EvmProvider>,
	) -> Self {
		Self {
			app,
			action,
			initiator_sig,
			peer_address,
			challenge_registry_address,
			requested_version_number,
			process_id,
			from_identifier,
			to_identifier,
			provider,
			phase: ResponderPhase::AwaitingValidation,
		}
	}
}

impl ProtocolStage for TakeActionResponderStage {
	type Output = TakeActionOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		// Version-number tie (spec §4.3, §8 scenario 4): a request targeting a
		// version at or behind the one already on file is a replay, not a
		// fresh action. Reject before OP_VALIDATE so nothing is signed or
		// persisted and the store stays byte-identical.
		if self.requested_version_number <= self.app.version_number {
			return StepOutcome::Fail(EngineError::ValidationRejected(format!(
				"TakeAction requested versionNumber {} is not greater than local versionNumber {}; treated as replay",
				self.requested_version_number, self.app.version_number
			)));
		}

		let ctx = ValidationContext {
			protocol: ProtocolName::TakeAction,
			app_identity: self.app.identity.clone(),
			claimed_turn_taker: self.peer_address,
			action: self.action.clone(),
		};
		StepOutcome::Yield(Opcode::Validate { ctx })
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(None)) => {
				let new_state =
					match compute_state_transition(&self.app, &self.action, self.provider.as_ref()) {
						Ok(state) => state,
						Err(e) => return StepOutcome::Fail(e),
					};

				let commitment = SetStateCommitment::new(
					self.app.identity.clone(),
					self.app.version_number + 1,
					self.app.state_timeout,
					keccak256(&new_state),
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

				self.phase =
					ResponderPhase::AwaitingSign { commitment, new_state, initiator_sig: self.initiator_sig };
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(
				ResponderPhase::AwaitingSign { commitment, new_state, initiator_sig },
				OpcodeResult::Signed(local_sig),
			) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*initiator_sig, local_sig]) {
					return StepOutcome::Fail(e);
				}

				let updated_app = AppInstance {
					identity: self.app.identity.clone(),
					latest_state: std::mem::take(new_state),
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
			(
				ResponderPhase::AwaitingPersist { app, commitment, local_sig },
				OpcodeResult::Persisted,
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::TakeAction,
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
				StepOutcome::Done(TakeActionOutput { app: app.clone(), commitment: commitment.clone() })
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match TakeAction responder's current phase".into(),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{keccak256, LocalSigner, Signer};
	use secp256k1::SecretKey;
	use std::str::FromStr;

	/// `{counter: N}` as its own minimal JSON encoding, standing in for an
	/// app-specific ABI schema the engine treats as opaque (spec §3
	/// "latestState: opaque bytes with a domain-specific ABI schema").
	struct CounterIncrementProvider;

	impl EvmProvider for CounterIncrementProvider {
		fn apply_action(
			&self,
			_app_definition: Address,
			state: &[u8],
			action: &[u8],
		) -> Result<Vec<u8>, EngineError> {
			let state: serde_json::Value = serde_json::from_slice(state).unwrap();
			let action: serde_json::Value = serde_json::from_slice(action).unwrap();
			let counter = state["counter"].as_i64().unwrap();
			let amount = action["amount"].as_i64().unwrap();
			Ok(serde_json::json!({ "counter": counter + amount }).to_string().into_bytes())
		}
	}

	fn run_to_completion<S: ProtocolStage>(
		stage: &mut S,
		mut drive: impl FnMut(&Opcode) -> OpcodeResult,
	) -> Result<S::Output, EngineError> {
		let mut outcome = stage.init();
		loop {
			match outcome {
				StepOutcome::Yield(op) => {
					let result = drive(&op);
					outcome = stage.resume(result);
				}
				StepOutcome::Done(output) => return Ok(output),
				StepOutcome::Fail(e) => return Err(e),
			}
		}
	}

	#[test]
	fn take_action_end_to_end_matches_spec_vector() {
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
			identity: identity.clone(),
			latest_state: br#"{"counter":0}"#.to_vec(),
			version_number: 1,
			state_timeout: 100,
			latest_action: None,
		};
		let action = br#"{"type":"INCREMENT","amount":3}"#.to_vec();
		let challenge_registry = Address([0xEE; 20]);
		let provider: Arc<dyn EvmProvider> = Arc::new(CounterIncrementProvider);

		let mut initiator_stage = TakeActionInitiatorStage::new(
			app.clone(),
			action.clone(),
			initiator.address(),
			responder.address(),
			challenge_registry,
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
			provider.clone(),
		);

		let mut sent_envelope: Option<Envelope> = None;
		let initiator_output = run_to_completion(&mut initiator_stage, |op| match op {
			Opcode::Validate { .. } => OpcodeResult::Validated(None),
			Opcode::Sign { digest } => OpcodeResult::Signed(initiator.sign(*digest)),
			Opcode::Persist { .. } => OpcodeResult::Persisted,
			Opcode::SendAndWait { envelope } => {
				sent_envelope = Some(envelope.clone());

				let requested_version_number = envelope.params["versionNumber"].as_u64().unwrap();
				let mut responder_stage = TakeActionResponderStage::new(
					app.clone(),
					action.clone(),
					envelope.custom_data.signature.unwrap(),
					initiator.address(),
					challenge_registry,
					requested_version_number,
					ProcessId(1),
					"responder".into(),
					"initiator".into(),
					provider.clone(),
				);
				let responder_output = run_to_completion(&mut responder_stage, |op| match op {
					Opcode::Validate { .. } => OpcodeResult::Validated(None),
					Opcode::Sign { digest } => OpcodeResult::Signed(responder.sign(*digest)),
					Opcode::Persist { .. } => OpcodeResult::Persisted,
					Opcode::Send { .. } => OpcodeResult::Sent,
					_ => panic!("responder stage yielded an unexpected opcode"),
				})
				.expect("responder stage should complete TakeAction");

				OpcodeResult::Received(Envelope {
					process_id: ProcessId(1),
					protocol: ProtocolName::TakeAction,
					seq: 1,
					to_identifier: "initiator".into(),
					from_identifier: "responder".into(),
					params: serde_json::json!({}),
					custom_data: CustomData {
						signature: responder_output.commitment.signatures()
							.iter()
							.find(|(addr, _)| *addr == responder.address())
							.map(|(_, sig)| *sig),
						free_balance_signature: None,
					},
					prev_message_received: None,
				})
			}
			other => panic!("initiator stage yielded an unexpected opcode: {other:?}"),
		})
		.expect("initiator stage should complete TakeAction");

		assert!(sent_envelope.is_some());
		assert_eq!(initiator_output.app.version_number, 2);
		assert!(initiator_output.commitment.is_fully_signed());

		let expected_state_hash = keccak256(br#"{"counter":3}"#);
		assert_eq!(initiator_output.commitment.app_state_hash, expected_state_hash);

		let mut expected_preimage = vec![0x19u8];
		expected_preimage.extend_from_slice(&identity.identity_hash());
		expected_preimage.extend_from_slice(&crate::commitments::u256_be_u64(2));
		expected_preimage.extend_from_slice(&crate::commitments::u256_be_u64(100));
		expected_preimage.extend_from_slice(&expected_state_hash);
		let expected_digest = keccak256(&expected_preimage);

		assert_eq!(initiator_output.commitment.hash_to_sign(), expected_digest);

		let recovered_first = recover_signer(expected_digest, &initiator_output.commitment.signatures()[0].1)
			.unwrap();
		let recovered_second =
			recover_signer(expected_digest, &initiator_output.commitment.signatures()[1].1).unwrap();
		assert!(recovered_first < recovered_second);
	}

	/// Spec §8 scenario 4: a TakeAction request whose claimed `versionNumber`
	/// is not ahead of the responder's local version is a replay. It must be
	/// rejected before any opcode that could mutate state is yielded.
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
			latest_state: br#"{"counter":3}"#.to_vec(),
			version_number: 2,
			state_timeout: 100,
			latest_action: None,
		};
		let provider: Arc<dyn EvmProvider> = Arc::new(CounterIncrementProvider);
		let challenge_registry = Address([0xEE; 20]);

		// A stale resend of the request that already produced version 2;
		// the responder is already at version_number = 2, so a claimed
		// target of 2 (or anything <= 2) is a tie, not a fresh action.
		let mut responder_stage = TakeActionResponderStage::new(
			app,
			br#"{"type":"INCREMENT","amount":3}"#.to_vec(),
			responder.sign([0x11; 32]),
			Address([0xAA; 20]),
			challenge_registry,
			2,
			ProcessId(1),
			"responder".into(),
			"initiator".into(),
			provider,
		);

		let outcome = responder_stage.init();
		match outcome {
			StepOutcome::Fail(EngineError::ValidationRejected(_)) => {}
			other => panic!("expected the tied request to be rejected before any opcode, got {other:?}"),
		}
	}
}

