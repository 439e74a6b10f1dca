//! Uninstall (spec §4.3): remove an app instance and credit the free
//! balance with the outcome interpreter's redistribution, signing a new
//! free-balance SetState at the next version number.

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	channel::{FreeBalance, StateChannel},
	commitments::{Commitment, SetStateCommitment},
	crypto::{recover_signer, Signature},
	errors::EngineError,
	identifiers::Address,
	middleware::{ProtocolName, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

#[derive(Debug, Clone)]
pub struct UninstallOutput {
	pub identity_hash: [u8; 32],
	pub new_free_balance: FreeBalance,
	pub free_balance_set_state: SetStateCommitment,
}

fn free_balance_commitment(channel_after: &StateChannel, challenge_registry_address: Address) -> SetStateCommitment {
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
	AwaitingSign { channel_after: StateChannel, commitment: SetStateCommitment },
	AwaitingReply { channel_after: StateChannel, commitment: SetStateCommitment, local_sig: Signature },
	AwaitingPersist { output: UninstallOutput },
}

pub struct UninstallInitiatorStage {
	identity_hash: [u8; 32],
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: InitiatorPhase,
}

impl UninstallInitiatorStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel: &StateChannel,
		identity_hash: [u8; 32],
		token_address: Address,
		redistribution: [u128; 2],
		challenge_registry_address: Address,
		peer_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Result<Self, EngineError> {
		let channel_after = channel.uninstall_app(identity_hash, token_address, redistribution)?;
		let commitment = free_balance_commitment(&channel_after, challenge_registry_address);
		Ok(Self {
			identity_hash,
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: InitiatorPhase::AwaitingSign { channel_after, commitment },
		})
	}
}

impl ProtocolStage for UninstallInitiatorStage {
	type Output = UninstallOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			InitiatorPhase::AwaitingSign { commitment, .. } => {
				StepOutcome::Yield(Opcode::Sign { digest: commitment.hash_to_sign() })
			}
			_ => unreachable!("Uninstall initiator always starts in AwaitingSign"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(InitiatorPhase::AwaitingSign { channel_after, commitment }, OpcodeResult::Signed(sig)) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Uninstall,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "identityHash": hex::encode(self.identity_hash) }),
					custom_data: CustomData { signature: Some(sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = InitiatorPhase::AwaitingReply {
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					local_sig: sig,
				};
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(
				InitiatorPhase::AwaitingReply { channel_after, commitment, local_sig },
				OpcodeResult::Received(envelope),
			) => {
				let responder_sig = match envelope.custom_data.signature {
					Some(sig) => sig,
					None => {
						return StepOutcome::Fail(EngineError::InvariantViolation(
							"Uninstall reply carried no signature".into(),
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

				let output = UninstallOutput {
					identity_hash: self.identity_hash,
					new_free_balance: channel_after.free_balance.clone(),
					free_balance_set_state: commitment,
				};
				self.phase = InitiatorPhase::AwaitingPersist { output: output.clone() };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::RemoveAppInstance {
						identity_hash: output.identity_hash,
						new_free_balance: output.new_free_balance.clone(),
						free_balance_set_state: output.free_balance_set_state.clone(),
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
				"opcode result did not match Uninstall initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation { channel_after: StateChannel, commitment: SetStateCommitment, initiator_sig: Signature },
	AwaitingSign { channel_after: StateChannel, commitment: SetStateCommitment, initiator_sig: Signature },
	AwaitingPersist { output: UninstallOutput, local_sig: Signature },
	AwaitingSendAck { output: UninstallOutput, local_sig: Signature },
}

pub struct UninstallResponderStage {
	identity_hash: [u8; 32],
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	phase: ResponderPhase,
}

impl UninstallResponderStage {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		channel: &StateChannel,
		identity_hash: [u8; 32],
		token_address: Address,
		redistribution: [u128; 2],
		challenge_registry_address: Address,
		peer_address: Address,
		initiator_sig: Signature,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Result<Self, EngineError> {
		let channel_after = channel.uninstall_app(identity_hash, token_address, redistribution)?;
		let commitment = free_balance_commitment(&channel_after, challenge_registry_address);
		Ok(Self {
			identity_hash,
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			phase: ResponderPhase::AwaitingValidation { channel_after, commitment, initiator_sig },
		})
	}
}

impl ProtocolStage for UninstallResponderStage {
	type Output = UninstallOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			ResponderPhase::AwaitingValidation { channel_after, .. } => {
				let ctx = ValidationContext {
					protocol: ProtocolName::Uninstall,
					app_identity: channel_after.free_balance.identity.clone(),
					claimed_turn_taker: self.peer_address,
					action: Vec::new(),
				};
				StepOutcome::Yield(Opcode::Validate { ctx })
			}
			_ => unreachable!("Uninstall responder always starts in AwaitingValidation"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(
				ResponderPhase::AwaitingValidation { channel_after, commitment, initiator_sig },
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
					channel_after: channel_after.clone(),
					commitment: commitment.clone(),
					initiator_sig: *initiator_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(ResponderPhase::AwaitingValidation { .. }, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(
				ResponderPhase::AwaitingSign { channel_after, commitment, initiator_sig },
				OpcodeResult::Signed(local_sig),
			) => {
				let mut commitment = commitment.clone();
				if let Err(e) = commitment.add_signatures(&[*initiator_sig, local_sig]) {
					return StepOutcome::Fail(e);
				}

				let output = UninstallOutput {
					identity_hash: self.identity_hash,
					new_free_balance: channel_after.free_balance.clone(),
					free_balance_set_state: commitment,
				};
				self.phase = ResponderPhase::AwaitingPersist { output: output.clone(), local_sig };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::RemoveAppInstance {
						identity_hash: output.identity_hash,
						new_free_balance: output.new_free_balance.clone(),
						free_balance_set_state: output.free_balance_set_state.clone(),
					},
				})
			}
			(ResponderPhase::AwaitingPersist { output, local_sig }, OpcodeResult::Persisted) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Uninstall,
					seq: 1,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "identityHash": hex::encode(output.identity_hash) }),
					custom_data: CustomData { signature: Some(*local_sig), free_balance_signature: None },
					prev_message_received: None,
				};
				self.phase = ResponderPhase::AwaitingSendAck { output: output.clone(), local_sig: *local_sig };
				StepOutcome::Yield(Opcode::Send { envelope })
			}
			(ResponderPhase::AwaitingPersist { .. }, OpcodeResult::PersistFailed(e)) => {
				StepOutcome::Fail(EngineError::StoreError(e))
			}
			(ResponderPhase::AwaitingSendAck { output, .. }, OpcodeResult::Sent) => {
				StepOutcome::Done(output.clone())
			}
			_ => StepOutcome::Fail(EngineError::InvariantViolation(
				"opcode result did not match Uninstall responder's current phase".into(),
			)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS,
		crypto::{LocalSigner, Signer},
		identifiers::ExtendedPublicKey,
	};
	use secp256k1::{PublicKey, Secp256k1, SecretKey};
	use std::str::FromStr;

	fn dummy_key(b: u8) -> ExtendedPublicKey {
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		ExtendedPublicKey::new(pk.serialize(), [0u8; 32])
	}

	#[test]
	fn uninstall_end_to_end_credits_free_balance_and_removes_app() {
		let sk_a =
			SecretKey::from_str("f8f8a2f43c8376ccb0871305060d7b27b0554d2cc72bccf41b2705608452f315").unwrap();
		let sk_b =
			SecretKey::from_str("b3b0e5d984113075f805057c6dbf1ad1078a17a925ebbeaaac09aaf39754d6c5").unwrap();
		let initiator = LocalSigner::new(sk_a);
		let responder = LocalSigner::new(sk_b);
		let (lo, hi) = if initiator.address() < responder.address() {
			(initiator, responder)
		} else {
			(responder, initiator)
		};

		let multisig_address = Address([0x10; 20]);
		let app_identity = crate::app::AppIdentity {
			channel_nonce: 0,
			participants: [lo.address(), hi.address()],
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};
		let actual_identity_hash = app_identity.identity_hash();

		let mut app_instances = std::collections::BTreeMap::new();
		app_instances.insert(
			actual_identity_hash,
			crate::app::AppInstance {
				identity: app_identity,
				latest_state: b"{\"counter\":3}".to_vec(),
				version_number: 2,
				state_timeout: 10,
				latest_action: None,
			},
		);

		let mut balances = std::collections::BTreeMap::new();
		balances.insert(CONVENTION_FOR_ETH_TOKEN_ADDRESS, [800u128, 800u128]);

		let channel = StateChannel {
			multisig_address,
			user_identifiers: [dummy_key(1), dummy_key(2)],
			multisig_owners: [lo.address(), hi.address()],
			free_balance: FreeBalance {
				identity: crate::app::AppIdentity {
					channel_nonce: 0,
					participants: [lo.address(), hi.address()],
					app_definition: Address([0x20; 20]),
					default_timeout: 0,
				},
				version_number: 2,
				state_timeout: 0,
				balances,
			},
			app_instances,
			proposed_app_instances: Default::default(),
			monotonic_num_proposed_apps: 1,
			schema_version: 1,
		};

		let challenge_registry = Address([0xEE; 20]);
		let redistribution = [100u128, 100u128];

		let mut initiator_stage = UninstallInitiatorStage::new(
			&channel,
			actual_identity_hash,
			CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			redistribution,
			challenge_registry,
			hi.address(),
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
		)
		.unwrap();

		let mut outcome = initiator_stage.init();
		loop {
			match outcome {
				StepOutcome::Yield(Opcode::Sign { digest }) => {
					outcome = initiator_stage.resume(OpcodeResult::Signed(lo.sign(digest)));
				}
				StepOutcome::Yield(Opcode::SendAndWait { envelope }) => {
					let initiator_sig = envelope.custom_data.signature.unwrap();
					let mut responder_stage = UninstallResponderStage::new(
						&channel,
						actual_identity_hash,
						CONVENTION_FOR_ETH_TOKEN_ADDRESS,
						redistribution,
						challenge_registry,
						lo.address(),
						initiator_sig,
						ProcessId(1),
						"responder".into(),
						"initiator".into(),
					)
					.unwrap();

					let mut responder_outcome = responder_stage.init();
					let reply = loop {
						match responder_outcome {
							StepOutcome::Yield(Opcode::Validate { .. }) => {
								responder_outcome = responder_stage.resume(OpcodeResult::Validated(None));
							}
							StepOutcome::Yield(Opcode::Sign { digest }) => {
								responder_outcome =
									responder_stage.resume(OpcodeResult::Signed(hi.sign(digest)));
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
					assert_eq!(
						output.new_free_balance.balance_of(CONVENTION_FOR_ETH_TOKEN_ADDRESS, 0),
						900
					);
					assert_eq!(
						output.new_free_balance.balance_of(CONVENTION_FOR_ETH_TOKEN_ADDRESS, 1),
						900
					);
					assert!(output.free_balance_set_state.is_fully_signed());
					return;
				}
				StepOutcome::Fail(e) => panic!("initiator failed: {e}"),
				_ => panic!("unexpected initiator opcode"),
			}
		}
	}
}
