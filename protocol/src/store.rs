//! The Store capability interface the engine consumes (spec §4.5). This
//! crate only names the contract; concrete backends (`InMemoryStore`,
//! `RocksStore`) live in the node crate, which is the half of the system
//! allowed to depend on a persistence engine.

use async_trait::async_trait;

use crate::{
	app::AppInstance,
	channel::{Proposal, StateChannel},
	commitments::{ConditionalTransactionCommitment, SetStateCommitment, SetupCommitment, WithdrawCommitment},
	errors::Result,
	identifiers::Address,
};

/// A pending on-chain withdrawal the engine is tracking until it confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWithdrawal {
	pub multisig_address: Address,
	pub recipient: Address,
	pub token_address: Address,
	pub amount: u128,
	pub nonce: u64,
}

/// Every method here is one atomic unit: either the whole write lands, or
/// none of it does. Backends without native multi-key transactions must
/// implement the capture-and-revert scheme (§4.5): read and stash the prior
/// value of every key the write touches, attempt the writes, and on any
/// failure restore every stashed value before returning the error.
#[async_trait]
pub trait Store: Send + Sync {
	async fn get_state_channel(&self, multisig: Address) -> Result<Option<StateChannel>>;
	async fn get_state_channel_by_owners(&self, owners: [Address; 2]) -> Result<Option<StateChannel>>;
	async fn get_state_channel_by_app_identity_hash(
		&self,
		identity_hash: [u8; 32],
	) -> Result<Option<StateChannel>>;

	/// Atomically create the channel, its Setup commitment, and the initial
	/// free-balance SetState commitment. On failure, none of the three is
	/// observable afterward.
	async fn create_state_channel(
		&self,
		channel: StateChannel,
		setup_commitment: SetupCommitment,
		free_balance_set_state: SetStateCommitment,
	) -> Result<()>;

	/// Atomically create the proposal and its doubly-signed SetState
	/// commitment over the initial state, so the v1 commitment stays
	/// recoverable for the watcher across the whole `proposedAppInstances`
	/// lifetime, not just from Install onward.
	async fn create_app_proposal(
		&self,
		multisig: Address,
		proposal: Proposal,
		set_state: SetStateCommitment,
	) -> Result<()>;
	async fn remove_app_proposal(&self, multisig: Address, identity_hash: [u8; 32]) -> Result<()>;

	/// Atomically replace the proposal with an installed app, update the
	/// free balance, and persist the app's first-version SetState and its
	/// ConditionalTransaction commitment. Reverts every part on failure.
	async fn create_app_instance(
		&self,
		multisig: Address,
		app: AppInstance,
		new_free_balance: crate::channel::FreeBalance,
		free_balance_set_state: SetStateCommitment,
		conditional_transaction: ConditionalTransactionCommitment,
	) -> Result<()>;

	async fn update_app_instance(
		&self,
		multisig: Address,
		app: AppInstance,
		set_state: SetStateCommitment,
	) -> Result<()>;

	async fn remove_app_instance(
		&self,
		multisig: Address,
		identity_hash: [u8; 32],
		new_free_balance: crate::channel::FreeBalance,
		free_balance_set_state: SetStateCommitment,
	) -> Result<()>;

	async fn get_setup_commitment(&self, multisig: Address) -> Result<Option<SetupCommitment>>;
	async fn save_setup_commitment(&self, multisig: Address, commitment: SetupCommitment) -> Result<()>;

	/// `kind` distinguishes the single- and double-signed retention slots
	/// the open question in spec §9 calls for (`singly` / `doubly`); callers
	/// pass one of [`SetStateSlot`].
	async fn get_set_state_commitment(
		&self,
		identity_hash: [u8; 32],
		slot: SetStateSlot,
	) -> Result<Option<SetStateCommitment>>;
	async fn save_set_state_commitment(
		&self,
		identity_hash: [u8; 32],
		slot: SetStateSlot,
		commitment: SetStateCommitment,
	) -> Result<()>;

	async fn get_conditional_transaction_commitment(
		&self,
		identity_hash: [u8; 32],
	) -> Result<Option<ConditionalTransactionCommitment>>;
	async fn save_conditional_transaction_commitment(
		&self,
		identity_hash: [u8; 32],
		commitment: ConditionalTransactionCommitment,
	) -> Result<()>;

	async fn get_withdrawal_commitment(&self, multisig: Address) -> Result<Option<WithdrawCommitment>>;
	async fn save_withdrawal_commitment(
		&self,
		multisig: Address,
		commitment: WithdrawCommitment,
	) -> Result<()>;

	async fn get_user_withdrawals(&self, multisig: Address) -> Result<Vec<UserWithdrawal>>;
	async fn save_user_withdrawal(&self, withdrawal: UserWithdrawal) -> Result<()>;
	async fn remove_user_withdrawal(&self, multisig: Address, nonce: u64) -> Result<()>;

	async fn get_schema_version(&self) -> Result<u32>;
	/// Rejects a downgrade (spec §4.5): `new_version < current` is an error.
	async fn update_schema_version(&self, new_version: u32) -> Result<()>;
}

/// Which retention slot a SetState commitment occupies for a given app
/// (spec §9 open question): a single-signed commitment to enable
/// `progressState`, or the canonical double-signed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetStateSlot {
	Singly,
	Doubly,
}
