//! The engine's JSON-RPC method surface (spec §6, SPEC §10): `chan_create`,
//! `chan_deposit`, `chan_proposeInstall`, `chan_install`, `chan_takeAction`,
//! `chan_update`, `chan_uninstall`, `chan_withdraw`, `chan_getState`,
//! `chan_getAppInstance`, plus schema-version registry queries, built on
//! `jsonrpsee`'s server macros.
//!
//! Every mutating method here does the same thing: load the current
//! [`StateChannel`] out of the store, build the matching
//! [`sc_protocol::runner::ProtocolStage`] from the request, and drive it
//! through [`Engine::run`]. The `SendAndWait` opcode inside that run is what
//! actually talks to the peer, over whatever [`crate::io::Io`] the engine was
//! built with — this module never reasons about the wire itself.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use jsonrpsee::{
	core::async_trait,
	proc_macros::rpc,
	types::error::{ErrorObject, ErrorObjectOwned},
};
use sc_protocol::{
	app::{AppInstance, EvmProvider},
	channel::StateChannel,
	commitments::{Commitment, MultisigDomain, WithdrawCommitment},
	errors::EngineError,
	identifiers::{Address, ExtendedPublicKey},
	middleware::{TurnTakingValidator, Validate},
	runner::{
		install::InstallInitiatorStage, propose::ProposeInitiatorStage, setup::SetupInitiatorStage,
		setup::SetupParams, take_action::TakeActionInitiatorStage, uninstall::UninstallInitiatorStage,
		update::UpdateInitiatorStage,
	},
	store::{Store, UserWithdrawal},
	wire::ProcessId,
};
use serde::{Deserialize, Serialize};

use crate::engine::Engine;

/// Every method here fails with a plain [`ErrorObjectOwned`] rather than a
/// richer error enum — there is exactly one error surface in this crate
/// ([`EngineError`]) and [`error_code`] is its one mapping to JSON-RPC.
pub type RpcResult<T> = Result<T, ErrorObjectOwned>;

const DOMAIN_NAME: &str = "Multisig";
const DOMAIN_VERSION: &str = "1";

/// Maps every [`EngineError`] variant to a fixed JSON-RPC error code (spec
/// §10, §13): one place callers can rely on instead of pattern-matching a
/// display string.
pub fn error_code(error: &EngineError) -> ErrorObjectOwned {
	let (code, message): (i32, String) = match error {
		EngineError::NotFound(m) => (-32001, m.clone()),
		EngineError::AlreadyExists(m) => (-32002, m.clone()),
		EngineError::InvariantViolation(m) => (-32003, m.clone()),
		EngineError::SignatureMismatch { expected, recovered } => {
			(-32004, format!("expected signer {expected}, recovered {recovered}"))
		}
		EngineError::ValidationRejected(m) => (-32005, m.clone()),
		EngineError::Timeout => (-32006, "timed out waiting for peer reply".into()),
		EngineError::StoreError(m) => (-32007, m.clone()),
		EngineError::ChainError(m) => (-32008, m.clone()),
	};
	ErrorObject::owned(code, message, None::<()>)
}

fn decode_hex(field: &str, s: &str) -> RpcResult<Vec<u8>> {
	hex::decode(s.strip_prefix("0x").unwrap_or(s))
		.map_err(|e| error_code(&EngineError::ValidationRejected(format!("{field}: invalid hex ({e})"))))
}

fn decode_address(field: &str, s: &str) -> RpcResult<Address> {
	crate::config::parse_address(s)
		.map_err(|e| error_code(&EngineError::ValidationRejected(format!("{field}: {e}"))))
}

fn require_channel(channel: Option<StateChannel>, multisig: Address) -> RpcResult<StateChannel> {
	channel.ok_or_else(|| error_code(&EngineError::NotFound(format!("channel {multisig}"))))
}

fn require_app(channel: &StateChannel, identity_hash: [u8; 32]) -> RpcResult<AppInstance> {
	channel
		.app_instances
		.get(&identity_hash)
		.cloned()
		.ok_or_else(|| error_code(&EngineError::NotFound(format!("app {}", hex::encode(identity_hash)))))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
	pub user_identifiers: [ExtendedPublicKeyDto; 2],
	pub initial_deposits: BTreeMap<String, [u128; 2]>,
	pub free_balance_interpreter_address: String,
	pub interpreter_params: String,
	pub domain_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedPublicKeyDto {
	pub public_key: String,
	pub chain_code: String,
}

impl ExtendedPublicKeyDto {
	fn into_domain(self) -> RpcResult<ExtendedPublicKey> {
		let public_key = decode_hex("public_key", &self.public_key)?;
		let chain_code = decode_hex("chain_code", &self.chain_code)?;
		let public_key: [u8; 33] = public_key
			.try_into()
			.map_err(|_| error_code(&EngineError::ValidationRejected("public_key must be 33 bytes".into())))?;
		let chain_code: [u8; 32] = chain_code
			.try_into()
			.map_err(|_| error_code(&EngineError::ValidationRejected("chain_code must be 32 bytes".into())))?;
		Ok(ExtendedPublicKey::new(public_key, chain_code))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositInstructions {
	pub multisig_address: String,
	pub amount: u128,
	pub token_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeInstallRequest {
	pub app_definition: String,
	pub default_timeout: u64,
	pub initial_state: String,
	pub initial_state_timeout: u64,
	pub responder: String,
	pub token_address: String,
	pub initiator_deposit: u128,
	pub responder_deposit: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
	pub multisig_address: String,
	pub app_identity_hash: String,
	pub interpreter_address: String,
	pub interpreter_params: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeActionRequest {
	pub multisig_address: String,
	pub app_identity_hash: String,
	pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
	pub multisig_address: String,
	pub app_identity_hash: String,
	pub new_state: String,
	pub new_state_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UninstallRequest {
	pub multisig_address: String,
	pub app_identity_hash: String,
	pub redistribution: [u128; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
	pub multisig_address: String,
	pub recipient: String,
	pub token_address: String,
	pub amount: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelView {
	pub multisig_address: String,
	pub schema_version: u32,
	pub app_instance_count: usize,
}

impl From<&StateChannel> for ChannelView {
	fn from(channel: &StateChannel) -> Self {
		Self {
			multisig_address: channel.multisig_address.to_string(),
			schema_version: channel.schema_version,
			app_instance_count: channel.app_instances.len(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInstanceView {
	pub identity_hash: String,
	pub latest_state: String,
	pub version_number: u64,
	pub state_timeout: u64,
}

impl From<&AppInstance> for AppInstanceView {
	fn from(app: &AppInstance) -> Self {
		Self {
			identity_hash: hex::encode(app.identity_hash()),
			latest_state: hex::encode(&app.latest_state),
			version_number: app.version_number,
			state_timeout: app.state_timeout,
		}
	}
}

#[rpc(server)]
pub trait ChanApi {
	#[method(name = "chan_create")]
	async fn create(&self, request: CreateChannelRequest) -> RpcResult<ChannelView>;

	#[method(name = "chan_deposit")]
	async fn deposit(&self, multisig_address: String, amount: u128) -> RpcResult<DepositInstructions>;

	#[method(name = "chan_proposeInstall")]
	async fn propose_install(&self, request: ProposeInstallRequest) -> RpcResult<String>;

	#[method(name = "chan_install")]
	async fn install(&self, request: InstallRequest) -> RpcResult<AppInstanceView>;

	#[method(name = "chan_takeAction")]
	async fn take_action(&self, request: TakeActionRequest) -> RpcResult<AppInstanceView>;

	#[method(name = "chan_update")]
	async fn update(&self, request: UpdateRequest) -> RpcResult<AppInstanceView>;

	#[method(name = "chan_uninstall")]
	async fn uninstall(&self, request: UninstallRequest) -> RpcResult<ChannelView>;

	#[method(name = "chan_withdraw")]
	async fn withdraw(&self, request: WithdrawRequest) -> RpcResult<String>;

	#[method(name = "chan_getState")]
	async fn get_state(&self, multisig_address: String) -> RpcResult<ChannelView>;

	#[method(name = "chan_getAppInstance")]
	async fn get_app_instance(
		&self,
		multisig_address: String,
		app_identity_hash: String,
	) -> RpcResult<AppInstanceView>;

	#[method(name = "chan_getSchemaVersion")]
	async fn get_schema_version(&self) -> RpcResult<u32>;

	#[method(name = "chan_updateSchemaVersion")]
	async fn update_schema_version(&self, new_version: u32) -> RpcResult<()>;
}

/// The concrete server: one [`Engine`] shared across every call, plus the
/// fixed chain/contract parameters every protocol run needs (spec §11
/// configuration). `local_address` is this node's own signer address, used
/// to resolve "the other participant" out of a channel's two owners.
pub struct ChanRpcServer {
	pub engine: Arc<Engine>,
	pub evm_provider: Arc<dyn EvmProvider>,
	pub local_address: Address,
	pub challenge_registry_address: Address,
	pub multisig_master_copy_address: Address,
	pub multisig_proxy_factory_address: Address,
	pub chain_id: u64,
	next_process_id: AtomicU64,
}

impl ChanRpcServer {
	pub fn new(
		engine: Arc<Engine>,
		evm_provider: Arc<dyn EvmProvider>,
		local_address: Address,
		challenge_registry_address: Address,
		multisig_master_copy_address: Address,
		multisig_proxy_factory_address: Address,
		chain_id: u64,
	) -> Self {
		Self {
			engine,
			evm_provider,
			local_address,
			challenge_registry_address,
			multisig_master_copy_address,
			multisig_proxy_factory_address,
			chain_id,
			next_process_id: AtomicU64::new(1),
		}
	}

	fn allocate_process_id(&self) -> ProcessId {
		ProcessId(self.next_process_id.fetch_add(1, Ordering::Relaxed))
	}

	fn peer_of(&self, owners: [Address; 2]) -> RpcResult<Address> {
		if owners[0] == self.local_address {
			Ok(owners[1])
		} else if owners[1] == self.local_address {
			Ok(owners[0])
		} else {
			Err(error_code(&EngineError::InvariantViolation(
				"local_address is not one of this channel's owners".into(),
			)))
		}
	}

	fn domain(&self, multisig_address: Address, salt_hex: &str) -> RpcResult<MultisigDomain> {
		let salt = decode_hex("domain_salt", salt_hex)?;
		let salt: [u8; 32] = salt
			.try_into()
			.map_err(|_| error_code(&EngineError::ValidationRejected("domain_salt must be 32 bytes".into())))?;
		Ok(MultisigDomain {
			name: DOMAIN_NAME,
			version: DOMAIN_VERSION,
			chain_id: self.chain_id,
			multisig_address,
			salt,
		})
	}

	fn default_domain(&self, multisig_address: Address) -> MultisigDomain {
		MultisigDomain {
			name: DOMAIN_NAME,
			version: DOMAIN_VERSION,
			chain_id: self.chain_id,
			multisig_address,
			salt: [0u8; 32],
		}
	}
}

#[async_trait]
impl ChanApiServer for ChanRpcServer {
	async fn create(&self, request: CreateChannelRequest) -> RpcResult<ChannelView> {
		let [id_a, id_b] = request.user_identifiers;
		let (user_identifiers, owners) =
			sc_protocol::identifiers::sort_participants([id_a.into_domain()?, id_b.into_domain()?]);

		let multisig_address = sc_protocol::identifiers::derive_multisig_address(
			owners,
			self.multisig_master_copy_address,
			self.multisig_proxy_factory_address,
		);

		let mut initial_deposits = std::collections::BTreeMap::new();
		for (token, amounts) in request.initial_deposits {
			initial_deposits.insert(decode_address("initial_deposits key", &token)?, amounts);
		}

		let domain = self.domain(multisig_address, &request.domain_salt)?;

		let params = SetupParams {
			multisig_address,
			owners,
			user_identifiers,
			initial_deposits,
			free_balance_interpreter_address: decode_address(
				"free_balance_interpreter_address",
				&request.free_balance_interpreter_address,
			)?,
			interpreter_params: decode_hex("interpreter_params", &request.interpreter_params)?,
			domain,
		};

		let peer_address = self.peer_of(owners)?;
		let stage = SetupInitiatorStage::new(
			params,
			self.challenge_registry_address,
			peer_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			peer_address.to_string(),
		);

		let validator = TurnTakingValidator { version_number: 0 };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		Ok(ChannelView::from(&output.channel))
	}

	async fn deposit(&self, multisig_address: String, amount: u128) -> RpcResult<DepositInstructions> {
		let multisig_address = decode_address("multisig_address", &multisig_address)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		Ok(DepositInstructions {
			multisig_address: channel.multisig_address.to_string(),
			amount,
			token_address: sc_protocol::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS.to_string(),
		})
	}

	async fn propose_install(&self, request: ProposeInstallRequest) -> RpcResult<String> {
		let responder = decode_address("responder", &request.responder)?;
		let token_address = decode_address("token_address", &request.token_address)?;
		let app_definition = decode_address("app_definition", &request.app_definition)?;

		let multisig_address = self.resolve_multisig(self.local_address, responder).await?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;

		let stage = ProposeInitiatorStage::new(
			channel.monotonic_num_proposed_apps,
			app_definition,
			request.default_timeout,
			decode_hex("initial_state", &request.initial_state)?,
			request.initial_state_timeout,
			self.local_address,
			responder,
			token_address,
			request.initiator_deposit,
			request.responder_deposit,
			self.challenge_registry_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			responder.to_string(),
		);

		let validator = TurnTakingValidator { version_number: 0 };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		Ok(hex::encode(output.proposal.identity_hash()))
	}

	async fn install(&self, request: InstallRequest) -> RpcResult<AppInstanceView> {
		let multisig_address = decode_address("multisig_address", &request.multisig_address)?;
		let identity_hash = identity_hash_from_hex(&request.app_identity_hash)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let proposal = channel
			.proposed_app_instances
			.get(&identity_hash)
			.cloned()
			.ok_or_else(|| error_code(&EngineError::NotFound("proposal not found".into())))?;
		let peer_address = self.peer_of(channel.multisig_owners)?;
		let domain = self.default_domain(multisig_address);

		let stage = InstallInitiatorStage::new(
			&channel,
			proposal,
			decode_address("interpreter_address", &request.interpreter_address)?,
			decode_hex("interpreter_params", &request.interpreter_params)?,
			domain,
			channel.monotonic_num_proposed_apps,
			self.challenge_registry_address,
			peer_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			peer_address.to_string(),
		)
		.map_err(|e| error_code(&e))?;

		let validator = TurnTakingValidator { version_number: 0 };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		Ok(AppInstanceView::from(&output.app))
	}

	async fn take_action(&self, request: TakeActionRequest) -> RpcResult<AppInstanceView> {
		let multisig_address = decode_address("multisig_address", &request.multisig_address)?;
		let identity_hash = identity_hash_from_hex(&request.app_identity_hash)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let app = require_app(&channel, identity_hash)?;
		let peer_address = self.peer_of(app.identity.participants)?;
		let provider = self.evm_provider.clone();

		let stage = TakeActionInitiatorStage::new(
			app.clone(),
			decode_hex("action", &request.action)?,
			self.local_address,
			peer_address,
			self.challenge_registry_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			peer_address.to_string(),
			provider,
		);

		let validator = TurnTakingValidator { version_number: app.version_number };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		Ok(AppInstanceView::from(&output.app))
	}

	async fn update(&self, request: UpdateRequest) -> RpcResult<AppInstanceView> {
		let multisig_address = decode_address("multisig_address", &request.multisig_address)?;
		let identity_hash = identity_hash_from_hex(&request.app_identity_hash)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let app = require_app(&channel, identity_hash)?;
		let peer_address = self.peer_of(app.identity.participants)?;

		let stage = UpdateInitiatorStage::new(
			app.clone(),
			decode_hex("new_state", &request.new_state)?,
			request.new_state_timeout,
			self.local_address,
			peer_address,
			self.challenge_registry_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			peer_address.to_string(),
		);

		let validator = TurnTakingValidator { version_number: app.version_number };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		Ok(AppInstanceView::from(&output.app))
	}

	async fn uninstall(&self, request: UninstallRequest) -> RpcResult<ChannelView> {
		let multisig_address = decode_address("multisig_address", &request.multisig_address)?;
		let identity_hash = identity_hash_from_hex(&request.app_identity_hash)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let peer_address = self.peer_of(channel.multisig_owners)?;
		let token_address = sc_protocol::channel::CONVENTION_FOR_ETH_TOKEN_ADDRESS;

		let stage = UninstallInitiatorStage::new(
			&channel,
			identity_hash,
			token_address,
			request.redistribution,
			self.challenge_registry_address,
			peer_address,
			self.allocate_process_id(),
			self.local_address.to_string(),
			peer_address.to_string(),
		)
		.map_err(|e| error_code(&e))?;

		let validator = TurnTakingValidator { version_number: 0 };
		let output = self.engine.run(multisig_address, stage, &validator as &dyn Validate).await.map_err(|e| error_code(&e))?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let _ = output;
		Ok(ChannelView::from(&channel))
	}

	/// Withdraw (spec §4.1 "Withdraw commitment"): unlike the six runner
	/// protocols this is not a peer exchange — it locally signs a
	/// conditional transfer out of the multisig and tracks it until the
	/// chain listener confirms it (spec §9), mirroring how `UserWithdrawal`
	/// is consumed by [`sc_protocol::store::Store::get_user_withdrawals`].
	async fn withdraw(&self, request: WithdrawRequest) -> RpcResult<String> {
		let multisig_address = decode_address("multisig_address", &request.multisig_address)?;
		let recipient = decode_address("recipient", &request.recipient)?;
		let token_address = decode_address("token_address", &request.token_address)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let domain = self.default_domain(multisig_address);
		let nonce = channel.free_balance.version_number;

		let mut commitment = WithdrawCommitment::new(
			multisig_address,
			channel.multisig_owners,
			recipient,
			token_address,
			request.amount,
			domain,
			nonce,
		);
		let digest = commitment.hash_to_sign();
		let local_sig = self.engine.signer.sign(digest);
		commitment.add_signatures(&[local_sig]).map_err(|e| error_code(&e))?;

		self.engine.store.save_withdrawal_commitment(multisig_address, commitment).await.map_err(|e| error_code(&e))?;
		self.engine
			.store
			.save_user_withdrawal(UserWithdrawal {
				multisig_address,
				recipient,
				token_address,
				amount: request.amount,
				nonce,
			})
			.await
			.map_err(|e| error_code(&e))?;

		Ok(hex::encode(digest))
	}

	async fn get_state(&self, multisig_address: String) -> RpcResult<ChannelView> {
		let multisig_address = decode_address("multisig_address", &multisig_address)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		Ok(ChannelView::from(&channel))
	}

	async fn get_app_instance(
		&self,
		multisig_address: String,
		app_identity_hash: String,
	) -> RpcResult<AppInstanceView> {
		let multisig_address = decode_address("multisig_address", &multisig_address)?;
		let identity_hash = identity_hash_from_hex(&app_identity_hash)?;
		let channel = require_channel(
			self.engine.store.get_state_channel(multisig_address).await.map_err(|e| error_code(&e))?,
			multisig_address,
		)?;
		let app = require_app(&channel, identity_hash)?;
		Ok(AppInstanceView::from(&app))
	}

	async fn get_schema_version(&self) -> RpcResult<u32> {
		self.engine.store.get_schema_version().await.map_err(|e| error_code(&e))
	}

	async fn update_schema_version(&self, new_version: u32) -> RpcResult<()> {
		self.engine.store.update_schema_version(new_version).await.map_err(|e| error_code(&e))
	}
}

impl ChanRpcServer {
	/// `ProposeInstallRequest` names a responder, not a multisig, since the
	/// channel might not be looked up by app identity yet; resolve it the
	/// same way the store does (spec §4.5 `get_state_channel_by_owners`).
	async fn resolve_multisig(&self, local: Address, peer: Address) -> RpcResult<Address> {
		let mut owners = [local, peer];
		owners.sort();
		let channel = self
			.engine
			.store
			.get_state_channel_by_owners(owners)
			.await
			.map_err(|e| error_code(&e))?;
		Ok(require_channel(channel, owners[0])?.multisig_address)
	}
}

fn identity_hash_from_hex(s: &str) -> RpcResult<[u8; 32]> {
	let bytes = decode_hex("app_identity_hash", s)?;
	bytes
		.try_into()
		.map_err(|_| error_code(&EngineError::ValidationRejected("app_identity_hash must be 32 bytes".into())))
}
