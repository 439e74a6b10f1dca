//! Setup (spec §4.3): the two-round protocol that brings a channel into
//! existence. The initiator proposes channel parameters and signs the
//! multisig Setup commitment plus the initial free-balance SetState
//! commitment in the same round; the responder validates, counter-signs
//! both, and both sides persist the new channel at `versionNumber = 1`.

use serde_json::json;

use super::{
	opcode::{Opcode, OpcodeResult},
	persist::PersistWrite,
	stage::{ProtocolStage, StepOutcome},
};
use crate::{
	app::AppIdentity,
	channel::{FreeBalance, StateChannel},
	commitments::{Commitment, SetStateCommitment, SetupCommitment},
	crypto::{keccak256, recover_signer, Signature},
	errors::EngineError,
	identifiers::{Address, ExtendedPublicKey},
	middleware::{ProtocolName, ValidationContext},
	wire::{CustomData, Envelope, ProcessId},
};

/// Everything the initiator proposes up front; identical on both sides once
/// agreed (the responder's middleware validates it, it does not negotiate
/// it further).
#[derive(Debug, Clone)]
pub struct SetupParams {
	pub multisig_address: Address,
	pub owners: [Address; 2],
	pub user_identifiers: [ExtendedPublicKey; 2],
	pub initial_deposits: std::collections::BTreeMap<Address, [u128; 2]>,
	pub free_balance_interpreter_address: Address,
	pub interpreter_params: Vec<u8>,
	pub domain: crate::commitments::MultisigDomain,
}

fn free_balance_identity(params: &SetupParams) -> AppIdentity {
	AppIdentity {
		channel_nonce: 0,
		participants: params.owners,
		app_definition: params.free_balance_interpreter_address,
		default_timeout: 0,
	}
}

fn free_balance_state_hash(deposits: &std::collections::BTreeMap<Address, [u128; 2]>) -> [u8; 32] {
	let encoded = serde_json::to_vec(
		&deposits.iter().map(|(k, v)| (k.to_string(), *v)).collect::<std::collections::BTreeMap<_, _>>(),
	)
	.expect("balance map always serializes");
	keccak256(&encoded)
}

#[derive(Debug, Clone)]
pub struct SetupOutput {
	pub channel: StateChannel,
	pub setup_commitment: SetupCommitment,
	pub free_balance_set_state: SetStateCommitment,
}

enum InitiatorPhase {
	AwaitingSetupSign { setup_commitment: SetupCommitment, free_balance_commitment: SetStateCommitment },
	AwaitingFreeBalanceSign {
		setup_commitment: SetupCommitment,
		free_balance_commitment: SetStateCommitment,
		setup_sig: Signature,
	},
	AwaitingReply { setup_commitment: SetupCommitment, free_balance_commitment: SetStateCommitment, setup_sig: Signature, free_balance_sig: Signature },
	AwaitingPersist { output: SetupOutput },
}

pub struct SetupInitiatorStage {
	params: SetupParams,
	challenge_registry_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	peer_address: Address,
	phase: InitiatorPhase,
}

impl SetupInitiatorStage {
	pub fn new(
		params: SetupParams,
		challenge_registry_address: Address,
		peer_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
	) -> Self {
		let setup_commitment = SetupCommitment::new(
			params.multisig_address,
			params.owners,
			params.free_balance_interpreter_address,
			params.interpreter_params.clone(),
			params.domain,
			0,
		);
		let free_balance_commitment = SetStateCommitment::new(
			free_balance_identity(&params),
			1,
			0,
			free_balance_state_hash(&params.initial_deposits),
			challenge_registry_address,
		);
		Self {
			params,
			challenge_registry_address,
			process_id,
			from_identifier,
			to_identifier,
			peer_address,
			phase: InitiatorPhase::AwaitingSetupSign { setup_commitment, free_balance_commitment },
		}
	}
}

impl ProtocolStage for SetupInitiatorStage {
	type Output = SetupOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		match &self.phase {
			InitiatorPhase::AwaitingSetupSign { setup_commitment, .. } => {
				StepOutcome::Yield(Opcode::Sign { digest: setup_commitment.hash_to_sign() })
			}
			_ => unreachable!("Setup initiator always starts in AwaitingSetupSign"),
		}
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(
				InitiatorPhase::AwaitingSetupSign { setup_commitment, free_balance_commitment },
				OpcodeResult::Signed(sig),
			) => {
				let digest = free_balance_commitment.hash_to_sign();
				self.phase = InitiatorPhase::AwaitingFreeBalanceSign {
					setup_commitment: setup_commitment.clone(),
					free_balance_commitment: free_balance_commitment.clone(),
					setup_sig: sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest })
			}
			(
				InitiatorPhase::AwaitingFreeBalanceSign { setup_commitment, free_balance_commitment, setup_sig },
				OpcodeResult::Signed(free_balance_sig),
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Setup,
					seq: 0,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({
						"multisigAddress": self.params.multisig_address.to_string(),
						"owners": [self.params.owners[0].to_string(), self.params.owners[1].to_string()],
					}),
					custom_data: CustomData {
						signature: Some(*setup_sig),
						free_balance_signature: Some(free_balance_sig),
					},
					prev_message_received: None,
				};
				self.phase = InitiatorPhase::AwaitingReply {
					setup_commitment: setup_commitment.clone(),
					free_balance_commitment: free_balance_commitment.clone(),
					setup_sig: *setup_sig,
					free_balance_sig,
				};
				StepOutcome::Yield(Opcode::SendAndWait { envelope })
			}
			(InitiatorPhase::AwaitingReply { .. }, OpcodeResult::TimedOut) => {
				StepOutcome::Fail(EngineError::Timeout)
			}
			(
				InitiatorPhase::AwaitingReply {
					setup_commitment,
					free_balance_commitment,
					setup_sig,
					free_balance_sig,
				},
				OpcodeResult::Received(envelope),
			) => {
				let (peer_setup_sig, peer_free_balance_sig) =
					match (envelope.custom_data.signature, envelope.custom_data.free_balance_signature) {
						(Some(a), Some(b)) => (a, b),
						_ => {
							return StepOutcome::Fail(EngineError::InvariantViolation(
								"Setup reply missing one of the two expected signatures".into(),
							))
						}
					};

				let recovered = match recover_signer(setup_commitment.hash_to_sign(), &peer_setup_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}

				let mut setup_commitment = setup_commitment.clone();
				if let Err(e) = setup_commitment.add_signatures(&[*setup_sig, peer_setup_sig]) {
					return StepOutcome::Fail(e);
				}
				let mut free_balance_commitment = free_balance_commitment.clone();
				if let Err(e) =
					free_balance_commitment.add_signatures(&[*free_balance_sig, peer_free_balance_sig])
				{
					return StepOutcome::Fail(e);
				}

				let channel = StateChannel {
					multisig_address: self.params.multisig_address,
					user_identifiers: self.params.user_identifiers.clone(),
					multisig_owners: self.params.owners,
					free_balance: FreeBalance {
						identity: free_balance_identity(&self.params),
						version_number: 1,
						state_timeout: 0,
						balances: self.params.initial_deposits.clone(),
					},
					app_instances: Default::default(),
					proposed_app_instances: Default::default(),
					monotonic_num_proposed_apps: 1,
					schema_version: 1,
				};

				let output = SetupOutput { channel, setup_commitment, free_balance_set_state: free_balance_commitment };
				self.phase = InitiatorPhase::AwaitingPersist { output: output.clone() };
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateStateChannel {
						channel: output.channel,
						setup_commitment: output.setup_commitment,
						free_balance_set_state: output.free_balance_set_state,
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
				"opcode result did not match Setup initiator's current phase".into(),
			)),
		}
	}
}

enum ResponderPhase {
	AwaitingValidation,
	AwaitingSetupSign { setup_commitment: SetupCommitment, free_balance_commitment: SetStateCommitment, peer_setup_sig: Signature, peer_free_balance_sig: Signature },
	AwaitingFreeBalanceSign {
		setup_commitment: SetupCommitment,
		free_balance_commitment: SetStateCommitment,
		setup_sig: Signature,
	},
	AwaitingPersist { output: SetupOutput, setup_sig: Signature, free_balance_sig: Signature },
	AwaitingSendAck { output: SetupOutput, setup_sig: Signature, free_balance_sig: Signature },
}

pub struct SetupResponderStage {
	params: SetupParams,
	challenge_registry_address: Address,
	peer_address: Address,
	process_id: ProcessId,
	from_identifier: String,
	to_identifier: String,
	peer_setup_sig: Signature,
	peer_free_balance_sig: Signature,
	phase: ResponderPhase,
}

impl SetupResponderStage {
	pub fn new(
		params: SetupParams,
		challenge_registry_address: Address,
		peer_address: Address,
		process_id: ProcessId,
		from_identifier: String,
		to_identifier: String,
		peer_setup_sig: Signature,
		peer_free_balance_sig: Signature,
	) -> Self {
		Self {
			params,
			challenge_registry_address,
			peer_address,
			process_id,
			from_identifier,
			to_identifier,
			peer_setup_sig,
			peer_free_balance_sig,
			phase: ResponderPhase::AwaitingValidation,
		}
	}
}

impl ProtocolStage for SetupResponderStage {
	type Output = SetupOutput;

	fn init(&mut self) -> StepOutcome<Self::Output> {
		let ctx = ValidationContext {
			protocol: ProtocolName::Setup,
			app_identity: free_balance_identity(&self.params),
			claimed_turn_taker: self.peer_address,
			action: Vec::new(),
		};
		StepOutcome::Yield(Opcode::Validate { ctx })
	}

	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output> {
		match (&mut self.phase, result) {
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(None)) => {
				let setup_commitment = SetupCommitment::new(
					self.params.multisig_address,
					self.params.owners,
					self.params.free_balance_interpreter_address,
					self.params.interpreter_params.clone(),
					self.params.domain,
					0,
				);
				let free_balance_commitment = SetStateCommitment::new(
					free_balance_identity(&self.params),
					1,
					0,
					free_balance_state_hash(&self.params.initial_deposits),
					self.challenge_registry_address,
				);

				let setup_digest = setup_commitment.hash_to_sign();
				let recovered = match recover_signer(setup_digest, &self.peer_setup_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}

				self.phase = ResponderPhase::AwaitingSetupSign {
					setup_commitment,
					free_balance_commitment,
					peer_setup_sig: self.peer_setup_sig,
					peer_free_balance_sig: self.peer_free_balance_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest: setup_digest })
			}
			(ResponderPhase::AwaitingValidation, OpcodeResult::Validated(Some(reason))) => {
				StepOutcome::Fail(EngineError::ValidationRejected(reason.0))
			}
			(
				ResponderPhase::AwaitingSetupSign {
					setup_commitment,
					free_balance_commitment,
					peer_setup_sig,
					peer_free_balance_sig,
				},
				OpcodeResult::Signed(setup_sig),
			) => {
				let free_balance_digest = free_balance_commitment.hash_to_sign();
				let recovered = match recover_signer(free_balance_digest, peer_free_balance_sig) {
					Ok(addr) => addr,
					Err(e) => return StepOutcome::Fail(e),
				};
				if recovered != self.peer_address {
					return StepOutcome::Fail(EngineError::SignatureMismatch {
						expected: self.peer_address,
						recovered,
					});
				}

				let mut setup_commitment = setup_commitment.clone();
				if let Err(e) = setup_commitment.add_signatures(&[*peer_setup_sig, setup_sig]) {
					return StepOutcome::Fail(e);
				}

				self.phase = ResponderPhase::AwaitingFreeBalanceSign {
					setup_commitment,
					free_balance_commitment: free_balance_commitment.clone(),
					setup_sig,
				};
				StepOutcome::Yield(Opcode::Sign { digest: free_balance_digest })
			}
			(
				ResponderPhase::AwaitingFreeBalanceSign { setup_commitment, free_balance_commitment, setup_sig },
				OpcodeResult::Signed(free_balance_sig),
			) => {
				let mut free_balance_commitment = free_balance_commitment.clone();
				if let Err(e) =
					free_balance_commitment.add_signatures(&[self.peer_free_balance_sig, free_balance_sig])
				{
					return StepOutcome::Fail(e);
				}

				let channel = StateChannel {
					multisig_address: self.params.multisig_address,
					user_identifiers: self.params.user_identifiers.clone(),
					multisig_owners: self.params.owners,
					free_balance: FreeBalance {
						identity: free_balance_identity(&self.params),
						version_number: 1,
						state_timeout: 0,
						balances: self.params.initial_deposits.clone(),
					},
					app_instances: Default::default(),
					proposed_app_instances: Default::default(),
					monotonic_num_proposed_apps: 1,
					schema_version: 1,
				};

				let output = SetupOutput {
					channel,
					setup_commitment: setup_commitment.clone(),
					free_balance_set_state: free_balance_commitment,
				};
				self.phase = ResponderPhase::AwaitingPersist {
					output: output.clone(),
					setup_sig: *setup_sig,
					free_balance_sig,
				};
				StepOutcome::Yield(Opcode::Persist {
					write: PersistWrite::CreateStateChannel {
						channel: output.channel,
						setup_commitment: output.setup_commitment,
						free_balance_set_state: output.free_balance_set_state,
					},
				})
			}
			(
				ResponderPhase::AwaitingPersist { output, setup_sig, free_balance_sig },
				OpcodeResult::Persisted,
			) => {
				let envelope = Envelope {
					process_id: self.process_id,
					protocol: ProtocolName::Setup,
					seq: 1,
					to_identifier: self.to_identifier.clone(),
					from_identifier: self.from_identifier.clone(),
					params: json!({ "multisigAddress": self.params.multisig_address.to_string() }),
					custom_data: CustomData {
						signature: Some(*setup_sig),
						free_balance_signature: Some(*free_balance_sig),
					},
					prev_message_received: None,
				};
				self.phase = ResponderPhase::AwaitingSendAck {
					output: output.clone(),
					setup_sig: *setup_sig,
					free_balance_sig: *free_balance_sig,
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
				"opcode result did not match Setup responder's current phase".into(),
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
	fn setup_initializes_free_balance_at_version_one() {
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

		let mut deposits = std::collections::BTreeMap::new();
		deposits.insert(crate::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS, [1_000u128, 1_000u128]);

		let params = SetupParams {
			multisig_address: Address([0x10; 20]),
			owners: [lo.address(), hi.address()],
			user_identifiers: [dummy_key(1), dummy_key(2)],
			initial_deposits: deposits,
			free_balance_interpreter_address: Address([0x20; 20]),
			interpreter_params: vec![1, 2, 3],
			domain: crate::commitments::MultisigDomain {
				name: "StateChannelMultisig",
				version: "0.0.1",
				chain_id: 1,
				multisig_address: Address([0x10; 20]),
				salt: [0u8; 32],
			},
		};

		let mut initiator_stage = SetupInitiatorStage::new(
			params.clone(),
			Address([0xEE; 20]),
			hi.address(),
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
		);

		let mut outcome = initiator_stage.init();
		let setup_sig;
		loop {
			match outcome {
				StepOutcome::Yield(Opcode::Sign { digest }) => {
					outcome = initiator_stage.resume(OpcodeResult::Signed(lo.sign(digest)));
				}
				StepOutcome::Yield(Opcode::SendAndWait { envelope }) => {
					setup_sig = envelope.custom_data.signature.unwrap();
					let free_balance_sig = envelope.custom_data.free_balance_signature.unwrap();

					let mut responder_stage = SetupResponderStage::new(
						params.clone(),
						Address([0xEE; 20]),
						lo.address(),
						ProcessId(1),
						"responder".into(),
						"initiator".into(),
						setup_sig,
						free_balance_sig,
					);
					let mut responder_outcome = responder_stage.init();
					let reply_envelope = loop {
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

					outcome = initiator_stage.resume(OpcodeResult::Received(reply_envelope));
				}
				StepOutcome::Yield(Opcode::Persist { .. }) => {
					outcome = initiator_stage.resume(OpcodeResult::Persisted);
				}
				StepOutcome::Done(output) => {
					assert_eq!(output.channel.free_balance.version_number, 1);
					assert!(output.setup_commitment.get_signed_transaction().is_ok());
					assert!(output.free_balance_set_state.is_fully_signed());
					return;
				}
				StepOutcome::Fail(e) => panic!("initiator failed: {e}"),
				_ => panic!("unexpected initiator opcode"),
			}
		}
	}

	fn dummy_key(b: u8) -> ExtendedPublicKey {
		use secp256k1::{PublicKey, Secp256k1};
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		ExtendedPublicKey::new(pk.serialize(), [0u8; 32])
	}
}
