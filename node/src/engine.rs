//! Ties the lock manager, store, signer, and peer bus together into the
//! driver a [`sc_protocol::runner::stage::ProtocolStage`] is run against
//! (spec §4.3, §9): acquire the channel's lock, carry out each yielded
//! opcode, release on completion.

use std::{sync::Arc, time::Duration};

use sc_protocol::{
	crypto::Signer,
	errors::{EngineError, Result},
	identifiers::Address,
	lock::LockManager,
	middleware::Validate,
	runner::{Opcode, OpcodeResult, PersistWrite, ProtocolStage, StepOutcome},
	store::Store,
};
use tracing::{debug, info, instrument};

use crate::io::Io;

async fn apply_persist_write(store: &dyn Store, multisig: Address, write: PersistWrite) -> Result<()> {
	match write {
		PersistWrite::CreateStateChannel { channel, setup_commitment, free_balance_set_state } => {
			store.create_state_channel(channel, setup_commitment, free_balance_set_state).await
		}
		PersistWrite::CreateAppProposal { proposal, set_state } => {
			store.create_app_proposal(multisig, proposal, set_state).await
		}
		PersistWrite::RemoveAppProposal { identity_hash } => {
			store.remove_app_proposal(multisig, identity_hash).await
		}
		PersistWrite::CreateAppInstance { app, new_free_balance, free_balance_set_state, conditional_transaction } => {
			store
				.create_app_instance(multisig, app, new_free_balance, free_balance_set_state, conditional_transaction)
				.await
		}
		PersistWrite::UpdateAppInstance { app, set_state, fully_signed: _ } => {
			store.update_app_instance(multisig, app, set_state).await
		}
		PersistWrite::RemoveAppInstance { identity_hash, new_free_balance, free_balance_set_state } => {
			store.remove_app_instance(multisig, identity_hash, new_free_balance, free_balance_set_state).await
		}
	}
}

/// Run one [`ProtocolStage`] to completion, carrying out every opcode it
/// yields against the concrete collaborators supplied by the caller. No
/// protocol crate type appears in this function's body beyond the stage
/// itself and the opcodes/results it exchanges with the driver.
pub async fn drive<S: ProtocolStage>(
	mut stage: S,
	multisig: Address,
	signer: &dyn Signer,
	io: &dyn Io,
	store: &dyn Store,
	validator: &dyn Validate,
	send_and_wait_timeout: Duration,
) -> Result<S::Output> {
	let mut outcome = stage.init();
	loop {
		outcome = match outcome {
			StepOutcome::Done(output) => return Ok(output),
			StepOutcome::Fail(e) => return Err(e),
			StepOutcome::Yield(Opcode::Sign { digest }) => {
				debug!(multisig = %multisig, "OP_SIGN");
				stage.resume(OpcodeResult::Signed(signer.sign(digest)))
			}
			StepOutcome::Yield(Opcode::Validate { ctx }) => {
				let verdict = validator.validate(&ctx);
				debug!(multisig = %multisig, rejected = verdict.is_some(), "OP_VALIDATE");
				stage.resume(OpcodeResult::Validated(verdict))
			}
			StepOutcome::Yield(Opcode::Send { envelope }) => {
				info!(multisig = %multisig, process_id = envelope.process_id.0, "IO_SEND");
				io.send(envelope).await?;
				stage.resume(OpcodeResult::Sent)
			}
			StepOutcome::Yield(Opcode::SendAndWait { envelope }) => {
				info!(multisig = %multisig, process_id = envelope.process_id.0, "IO_SEND_AND_WAIT");
				match io.send_and_wait(envelope, send_and_wait_timeout).await {
					Ok(reply) => stage.resume(OpcodeResult::Received(reply)),
					Err(EngineError::Timeout) => stage.resume(OpcodeResult::TimedOut),
					Err(e) => return Err(e),
				}
			}
			StepOutcome::Yield(Opcode::Persist { write }) => {
				debug!(multisig = %multisig, "PERSIST");
				match apply_persist_write(store, multisig, write).await {
					Ok(()) => stage.resume(OpcodeResult::Persisted),
					Err(e) => stage.resume(OpcodeResult::PersistFailed(e.to_string())),
				}
			}
		};
	}
}

/// The engine's fixed collaborators: one [`LockManager`] and one `Store` per
/// node process (spec §4.4, §4.5), a signer and a peer bus injected at
/// construction. Callers drive individual protocol runs through [`Engine::run`],
/// each one independently lock-scoped to the multisig it names.
pub struct Engine {
	pub store: Arc<dyn Store>,
	pub locks: Arc<LockManager>,
	pub signer: Arc<dyn Signer>,
	pub io: Arc<dyn Io>,
	pub send_and_wait_timeout: Duration,
}

impl Engine {
	pub fn new(store: Arc<dyn Store>, signer: Arc<dyn Signer>, io: Arc<dyn Io>) -> Self {
		Self {
			store,
			locks: Arc::new(LockManager::new()),
			signer,
			io,
			send_and_wait_timeout: Duration::from_secs(30),
		}
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.send_and_wait_timeout = timeout;
		self
	}

	/// Acquire `multisig`'s lock for the duration of the run (spec §4.4: the
	/// lock is released automatically when the returned guard drops at the
	/// end of this call, regardless of how the stage terminates).
	#[instrument(skip(self, stage, validator), fields(multisig = %multisig))]
	pub async fn run<S: ProtocolStage>(
		&self,
		multisig: Address,
		stage: S,
		validator: &dyn Validate,
	) -> Result<S::Output> {
		let _guard = self.locks.acquire(&[multisig]).await;
		drive(
			stage,
			multisig,
			self.signer.as_ref(),
			self.io.as_ref(),
			self.store.as_ref(),
			validator,
			self.send_and_wait_timeout,
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{io::MockNetwork, store::InMemoryStore};
	use sc_protocol::{
		app::AppIdentity,
		channel::{FreeBalance, StateChannel, CONVENTION_FOR_ETH_TOKEN_ADDRESS},
		commitments::{Commitment, MultisigDomain},
		crypto::LocalSigner,
		identifiers::{sort_participants, Address as Addr, ExtendedPublicKey},
		middleware::TurnTakingValidator,
		runner::uninstall::{UninstallInitiatorStage, UninstallResponderStage},
		wire::ProcessId,
	};
	use secp256k1::{PublicKey, Secp256k1, SecretKey};
	use std::collections::BTreeMap;

	fn key_from_byte(b: u8) -> (SecretKey, ExtendedPublicKey) {
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		(sk, ExtendedPublicKey::new(pk.serialize(), [0u8; 32]))
	}

	fn domain(multisig: Addr) -> MultisigDomain {
		MultisigDomain { name: "Multisig", version: "1", chain_id: 1, multisig_address: multisig, salt: [0u8; 32] }
	}

	#[tokio::test]
	async fn uninstall_runs_end_to_end_through_two_engines_and_persists_to_each_store() {
		let (sk_a, key_a) = key_from_byte(11);
		let (sk_b, key_b) = key_from_byte(12);
		let (identifiers, addrs) = sort_participants([key_a, key_b]);
		let multisig = Addr([0x99; 20]);

		let app_identity = AppIdentity {
			channel_nonce: 0,
			participants: addrs,
			app_definition: Addr([0xAA; 20]),
			default_timeout: 10,
		};
		let identity_hash = app_identity.identity_hash();

		let mut app_instances = BTreeMap::new();
		app_instances.insert(
			identity_hash,
			sc_protocol::app::AppInstance {
				identity: app_identity,
				latest_state: vec![],
				version_number: 1,
				state_timeout: 10,
				latest_action: None,
			},
		);

		let mut balances = BTreeMap::new();
		balances.insert(CONVENTION_FOR_ETH_TOKEN_ADDRESS, [700u128, 700u128]);

		let channel = StateChannel {
			multisig_address: multisig,
			user_identifiers: identifiers,
			multisig_owners: addrs,
			free_balance: FreeBalance {
				identity: AppIdentity {
					channel_nonce: 0,
					participants: addrs,
					app_definition: Addr([0; 20]),
					default_timeout: 0,
				},
				version_number: 3,
				state_timeout: 0,
				balances,
			},
			app_instances,
			proposed_app_instances: BTreeMap::new(),
			monotonic_num_proposed_apps: 1,
			schema_version: 1,
		};

		let initiator_store = Arc::new(InMemoryStore::new());
		let responder_store = Arc::new(InMemoryStore::new());
		initiator_store
			.create_state_channel(
				channel.clone(),
				sc_protocol::commitments::SetupCommitment::new(
					multisig,
					addrs,
					Addr([0x55; 20]),
					vec![],
					domain(multisig),
					0,
				),
				sc_protocol::commitments::SetStateCommitment::new(
					channel.free_balance.identity.clone(),
					1,
					0,
					[0u8; 32],
					Addr([0x66; 20]),
				),
			)
			.await
			.unwrap();
		responder_store
			.create_state_channel(
				channel.clone(),
				sc_protocol::commitments::SetupCommitment::new(
					multisig,
					addrs,
					Addr([0x55; 20]),
					vec![],
					domain(multisig),
					0,
				),
				sc_protocol::commitments::SetStateCommitment::new(
					channel.free_balance.identity.clone(),
					1,
					0,
					[0u8; 32],
					Addr([0x66; 20]),
				),
			)
			.await
			.unwrap();

		let network = MockNetwork::new();
		let initiator_io = Arc::new(network.handle("initiator"));
		let responder_io = Arc::new(network.handle("responder"));
		let initiator_engine =
			Engine::new(initiator_store.clone(), Arc::new(LocalSigner::new(sk_a)), initiator_io as Arc<dyn Io>);
		let responder_engine = Engine::new(
			responder_store.clone(),
			Arc::new(LocalSigner::new(sk_b)),
			responder_io.clone() as Arc<dyn Io>,
		);

		let challenge_registry = Addr([0x66; 20]);
		let responder_address = addrs[1];
		let initiator_address = addrs[0];

		let initiator_stage = UninstallInitiatorStage::new(
			&channel,
			identity_hash,
			CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			[100, 100],
			challenge_registry,
			responder_address,
			ProcessId(1),
			"initiator".into(),
			"responder".into(),
		)
		.unwrap();

		let responder_join = tokio::spawn(async move {
			// The responder side of Uninstall needs the initiator's signature
			// before it can construct its stage; pull it off the mock bus.
			let envelope = responder_io.recv().await.unwrap();

			let initiator_sig = envelope.custom_data.signature.expect("uninstall request carries a signature");
			let stage = UninstallResponderStage::new(
				&channel,
				identity_hash,
				CONVENTION_FOR_ETH_TOKEN_ADDRESS,
				[100, 100],
				challenge_registry,
				initiator_address,
				initiator_sig,
				ProcessId(1),
				"responder".into(),
				"initiator".into(),
			)
			.unwrap();

			let validator = TurnTakingValidator { version_number: 0 };
			responder_engine.run(multisig, stage, &validator).await.unwrap()
		});

		let validator = TurnTakingValidator { version_number: 0 };
		let initiator_output = initiator_engine.run(multisig, initiator_stage, &validator).await.unwrap();
		let responder_output = responder_join.await.unwrap();

		assert_eq!(initiator_output.identity_hash, identity_hash);
		assert_eq!(responder_output.identity_hash, identity_hash);
		assert!(initiator_output.free_balance_set_state.is_fully_signed());

		let initiator_channel = initiator_store.get_state_channel(multisig).await.unwrap().unwrap();
		let responder_channel = responder_store.get_state_channel(multisig).await.unwrap().unwrap();
		assert!(!initiator_channel.app_instances.contains_key(&identity_hash));
		assert!(!responder_channel.app_instances.contains_key(&identity_hash));
		assert_eq!(
			initiator_channel.free_balance.balance_of(CONVENTION_FOR_ETH_TOKEN_ADDRESS, 0),
			800
		);
	}
}
