//! `Store` implementations (spec §4.5): an always-available in-memory
//! reference backend, and an optional RocksDB-backed one with a versioned
//! column-family layout.

use std::collections::HashMap;

use async_trait::async_trait;
use sc_protocol::{
	app::AppInstance,
	channel::{FreeBalance, Proposal, StateChannel},
	commitments::{ConditionalTransactionCommitment, SetStateCommitment, SetupCommitment, WithdrawCommitment},
	errors::{EngineError, Result},
	identifiers::Address,
	store::{SetStateSlot, Store, UserWithdrawal},
};
use tokio::sync::RwLock;

/// Everything the reference store holds, as one value so a failed write can
/// be discarded by simply dropping the clone it was attempted on (spec
/// §4.5's compensation scheme, applied at whole-store granularity since this
/// backend already keeps its entire state resident in memory).
#[derive(Debug, Clone, Default)]
struct Data {
	channels: HashMap<Address, StateChannel>,
	setup_commitments: HashMap<Address, SetupCommitment>,
	set_state_commitments: HashMap<([u8; 32], SetStateSlot), SetStateCommitment>,
	conditional_transactions: HashMap<[u8; 32], ConditionalTransactionCommitment>,
	withdrawal_commitments: HashMap<Address, WithdrawCommitment>,
	user_withdrawals: HashMap<(Address, u64), UserWithdrawal>,
	schema_version: u32,
}

/// The primary, always-available `Store` implementation: used by every unit
/// and integration test, and a valid single-node deployment target (spec
/// §4.5, §8 scenario 5).
#[derive(Default)]
pub struct InMemoryStore {
	data: RwLock<Data>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Run `f` against a private clone of the store's data; only swap the
	/// clone back in if `f` succeeds. A failing write is therefore never
	/// partially observable, regardless of how many maps it touches.
	async fn atomically<T>(&self, f: impl FnOnce(&mut Data) -> Result<T>) -> Result<T> {
		let mut guard = self.data.write().await;
		let mut attempt = guard.clone();
		let result = f(&mut attempt)?;
		*guard = attempt;
		Ok(result)
	}
}

#[async_trait]
impl Store for InMemoryStore {
	async fn get_state_channel(&self, multisig: Address) -> Result<Option<StateChannel>> {
		Ok(self.data.read().await.channels.get(&multisig).cloned())
	}

	async fn get_state_channel_by_owners(&self, owners: [Address; 2]) -> Result<Option<StateChannel>> {
		Ok(self
			.data
			.read()
			.await
			.channels
			.values()
			.find(|c| c.multisig_owners == owners)
			.cloned())
	}

	async fn get_state_channel_by_app_identity_hash(
		&self,
		identity_hash: [u8; 32],
	) -> Result<Option<StateChannel>> {
		Ok(self
			.data
			.read()
			.await
			.channels
			.values()
			.find(|c| {
				c.app_instances.contains_key(&identity_hash)
					|| c.proposed_app_instances.contains_key(&identity_hash)
			})
			.cloned())
	}

	async fn create_state_channel(
		&self,
		channel: StateChannel,
		setup_commitment: SetupCommitment,
		free_balance_set_state: SetStateCommitment,
	) -> Result<()> {
		let identity_hash = free_balance_set_state.identity.identity_hash();
		self.atomically(move |data| {
			if data.channels.contains_key(&channel.multisig_address) {
				return Err(EngineError::AlreadyExists(format!(
					"state channel {}",
					channel.multisig_address
				)));
			}
			data.setup_commitments.insert(channel.multisig_address, setup_commitment.clone());
			data.set_state_commitments
				.insert((identity_hash, SetStateSlot::Doubly), free_balance_set_state.clone());
			data.channels.insert(channel.multisig_address, channel.clone());
			Ok(())
		})
		.await
	}

	async fn create_app_proposal(
		&self,
		multisig: Address,
		proposal: Proposal,
		set_state: SetStateCommitment,
	) -> Result<()> {
		self.atomically(move |data| {
			let channel = data
				.channels
				.get(&multisig)
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			let next = channel.insert_proposal(proposal.clone())?;
			let identity_hash = proposal.identity_hash();
			data.channels.insert(multisig, next);
			data.set_state_commitments.insert((identity_hash, SetStateSlot::Doubly), set_state.clone());
			Ok(())
		})
		.await
	}

	async fn remove_app_proposal(&self, multisig: Address, identity_hash: [u8; 32]) -> Result<()> {
		self.atomically(move |data| {
			let channel = data
				.channels
				.get_mut(&multisig)
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			if channel.proposed_app_instances.remove(&identity_hash).is_none() {
				return Err(EngineError::NotFound(format!(
					"proposal {}",
					hex::encode(identity_hash)
				)));
			}
			Ok(())
		})
		.await
	}

	async fn create_app_instance(
		&self,
		multisig: Address,
		app: AppInstance,
		new_free_balance: FreeBalance,
		free_balance_set_state: SetStateCommitment,
		conditional_transaction: ConditionalTransactionCommitment,
	) -> Result<()> {
		let identity_hash = app.identity_hash();
		self.atomically(move |data| {
			let channel = data
				.channels
				.get_mut(&multisig)
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			channel.proposed_app_instances.remove(&identity_hash);
			channel.app_instances.insert(identity_hash, app.clone());
			channel.free_balance = new_free_balance.clone();

			data.set_state_commitments.insert(
				(new_free_balance.identity_hash(), SetStateSlot::Doubly),
				free_balance_set_state.clone(),
			);
			data.conditional_transactions.insert(identity_hash, conditional_transaction.clone());
			Ok(())
		})
		.await
	}

	async fn update_app_instance(
		&self,
		multisig: Address,
		app: AppInstance,
		set_state: SetStateCommitment,
	) -> Result<()> {
		let identity_hash = app.identity_hash();
		let slot = if set_state.is_fully_signed() { SetStateSlot::Doubly } else { SetStateSlot::Singly };
		self.atomically(move |data| {
			let channel = data
				.channels
				.get_mut(&multisig)
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			channel
				.app_instances
				.get(&identity_hash)
				.ok_or_else(|| EngineError::NotFound(format!("app {}", hex::encode(identity_hash))))?;
			channel.app_instances.insert(identity_hash, app.clone());
			data.set_state_commitments.insert((identity_hash, slot), set_state.clone());
			Ok(())
		})
		.await
	}

	async fn remove_app_instance(
		&self,
		multisig: Address,
		identity_hash: [u8; 32],
		new_free_balance: FreeBalance,
		free_balance_set_state: SetStateCommitment,
	) -> Result<()> {
		self.atomically(move |data| {
			let channel = data
				.channels
				.get_mut(&multisig)
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			if channel.app_instances.remove(&identity_hash).is_none() {
				return Err(EngineError::NotFound(format!("app {}", hex::encode(identity_hash))));
			}
			channel.free_balance = new_free_balance.clone();
			data.set_state_commitments.insert(
				(new_free_balance.identity_hash(), SetStateSlot::Doubly),
				free_balance_set_state.clone(),
			);
			data.conditional_transactions.remove(&identity_hash);
			Ok(())
		})
		.await
	}

	async fn get_setup_commitment(&self, multisig: Address) -> Result<Option<SetupCommitment>> {
		Ok(self.data.read().await.setup_commitments.get(&multisig).cloned())
	}

	async fn save_setup_commitment(&self, multisig: Address, commitment: SetupCommitment) -> Result<()> {
		self.atomically(move |data| {
			data.setup_commitments.insert(multisig, commitment.clone());
			Ok(())
		})
		.await
	}

	async fn get_set_state_commitment(
		&self,
		identity_hash: [u8; 32],
		slot: SetStateSlot,
	) -> Result<Option<SetStateCommitment>> {
		Ok(self.data.read().await.set_state_commitments.get(&(identity_hash, slot)).cloned())
	}

	async fn save_set_state_commitment(
		&self,
		identity_hash: [u8; 32],
		slot: SetStateSlot,
		commitment: SetStateCommitment,
	) -> Result<()> {
		self.atomically(move |data| {
			data.set_state_commitments.insert((identity_hash, slot), commitment.clone());
			Ok(())
		})
		.await
	}

	async fn get_conditional_transaction_commitment(
		&self,
		identity_hash: [u8; 32],
	) -> Result<Option<ConditionalTransactionCommitment>> {
		Ok(self.data.read().await.conditional_transactions.get(&identity_hash).cloned())
	}

	async fn save_conditional_transaction_commitment(
		&self,
		identity_hash: [u8; 32],
		commitment: ConditionalTransactionCommitment,
	) -> Result<()> {
		self.atomically(move |data| {
			data.conditional_transactions.insert(identity_hash, commitment.clone());
			Ok(())
		})
		.await
	}

	async fn get_withdrawal_commitment(&self, multisig: Address) -> Result<Option<WithdrawCommitment>> {
		Ok(self.data.read().await.withdrawal_commitments.get(&multisig).cloned())
	}

	async fn save_withdrawal_commitment(
		&self,
		multisig: Address,
		commitment: WithdrawCommitment,
	) -> Result<()> {
		self.atomically(move |data| {
			data.withdrawal_commitments.insert(multisig, commitment.clone());
			Ok(())
		})
		.await
	}

	async fn get_user_withdrawals(&self, multisig: Address) -> Result<Vec<UserWithdrawal>> {
		Ok(self
			.data
			.read()
			.await
			.user_withdrawals
			.values()
			.filter(|w| w.multisig_address == multisig)
			.cloned()
			.collect())
	}

	async fn save_user_withdrawal(&self, withdrawal: UserWithdrawal) -> Result<()> {
		self.atomically(move |data| {
			data.user_withdrawals
				.insert((withdrawal.multisig_address, withdrawal.nonce), withdrawal.clone());
			Ok(())
		})
		.await
	}

	async fn remove_user_withdrawal(&self, multisig: Address, nonce: u64) -> Result<()> {
		self.atomically(move |data| {
			if data.user_withdrawals.remove(&(multisig, nonce)).is_none() {
				return Err(EngineError::NotFound(format!(
					"withdrawal {multisig}/{nonce}"
				)));
			}
			Ok(())
		})
		.await
	}

	async fn get_schema_version(&self) -> Result<u32> {
		Ok(self.data.read().await.schema_version)
	}

	async fn update_schema_version(&self, new_version: u32) -> Result<()> {
		self.atomically(move |data| {
			if new_version < data.schema_version {
				return Err(EngineError::InvariantViolation(format!(
					"refusing schema downgrade from {} to {new_version}",
					data.schema_version
				)));
			}
			data.schema_version = new_version;
			Ok(())
		})
		.await
	}
}

#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksStore;

#[cfg(feature = "rocksdb-store")]
mod rocks {
	//! RocksDB-backed `Store` (spec §4.5's "ambient persistence" addition):
	//! one column family for versioned application data, one for metadata,
	//! atomic multi-key writes via `WriteBatch`.

	use std::path::Path;

	use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
	use serde::{de::DeserializeOwned, Serialize};

	use super::*;

	const DATA_COLUMN: &str = "data";
	const METADATA_COLUMN: &str = "metadata";
	const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

	const CHANNEL_PREFIX: &str = "channel/";
	const SETUP_COMMITMENT_PREFIX: &str = "setup/";
	const SET_STATE_SINGLY_PREFIX: &str = "set_state/singly/";
	const SET_STATE_DOUBLY_PREFIX: &str = "set_state/doubly/";
	const CONDITIONAL_TX_PREFIX: &str = "conditional/";
	const WITHDRAWAL_COMMITMENT_PREFIX: &str = "withdrawal/";
	const USER_WITHDRAWAL_PREFIX: &str = "user_withdrawal/";

	/// A transactional on-disk backend for single-node deployments (spec
	/// §4.5 names the `Store` capability surface; this is one concrete,
	/// durable implementation of it). Every `Store` method here opens a
	/// `WriteBatch`, so a multi-key write either lands completely or not at
	/// all — RocksDB's native guarantee replaces the in-memory backend's
	/// capture-and-clone scheme.
	pub struct RocksStore {
		db: DB,
	}

	impl RocksStore {
		pub fn open(path: &Path) -> anyhow::Result<Self> {
			let mut data_opts = Options::default();
			data_opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));

			let mut db_opts = Options::default();
			db_opts.create_if_missing(true);
			db_opts.create_missing_column_families(true);

			let cfs = vec![
				ColumnFamilyDescriptor::new(DATA_COLUMN, data_opts),
				ColumnFamilyDescriptor::new(METADATA_COLUMN, Options::default()),
			];
			let db = DB::open_cf_descriptors(&db_opts, path, cfs)?;
			Ok(Self { db })
		}

		fn data_cf(&self) -> &rocksdb::ColumnFamily {
			self.db.cf_handle(DATA_COLUMN).expect("data column family always exists")
		}

		fn metadata_cf(&self) -> &rocksdb::ColumnFamily {
			self.db.cf_handle(METADATA_COLUMN).expect("metadata column family always exists")
		}

		fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
			self.db
				.get_cf(self.data_cf(), key)
				.map_err(|e| EngineError::StoreError(e.to_string()))?
				.map(|bytes| {
					serde_json::from_slice(&bytes)
						.map_err(|e| EngineError::StoreError(format!("corrupt record at {key}: {e}")))
				})
				.transpose()
		}

		fn put_into_batch<T: Serialize>(&self, batch: &mut WriteBatch, key: &str, value: &T) -> Result<()> {
			let bytes = serde_json::to_vec(value)
				.map_err(|e| EngineError::StoreError(format!("failed to encode {key}: {e}")))?;
			batch.put_cf(self.data_cf(), key, bytes);
			Ok(())
		}

		fn write(&self, batch: WriteBatch) -> Result<()> {
			self.db.write(batch).map_err(|e| EngineError::StoreError(e.to_string()))
		}
	}

	#[async_trait]
	impl Store for RocksStore {
		async fn get_state_channel(&self, multisig: Address) -> Result<Option<StateChannel>> {
			self.get(&format!("{CHANNEL_PREFIX}{multisig}"))
		}

		async fn get_state_channel_by_owners(&self, owners: [Address; 2]) -> Result<Option<StateChannel>> {
			let prefix = self.db.prefix_iterator_cf(self.data_cf(), CHANNEL_PREFIX);
			for item in prefix {
				let (_, value) = item.map_err(|e| EngineError::StoreError(e.to_string()))?;
				let channel: StateChannel = serde_json::from_slice(&value)
					.map_err(|e| EngineError::StoreError(e.to_string()))?;
				if channel.multisig_owners == owners {
					return Ok(Some(channel));
				}
			}
			Ok(None)
		}

		async fn get_state_channel_by_app_identity_hash(
			&self,
			identity_hash: [u8; 32],
		) -> Result<Option<StateChannel>> {
			let prefix = self.db.prefix_iterator_cf(self.data_cf(), CHANNEL_PREFIX);
			for item in prefix {
				let (_, value) = item.map_err(|e| EngineError::StoreError(e.to_string()))?;
				let channel: StateChannel = serde_json::from_slice(&value)
					.map_err(|e| EngineError::StoreError(e.to_string()))?;
				if channel.app_instances.contains_key(&identity_hash)
					|| channel.proposed_app_instances.contains_key(&identity_hash)
				{
					return Ok(Some(channel));
				}
			}
			Ok(None)
		}

		async fn create_state_channel(
			&self,
			channel: StateChannel,
			setup_commitment: SetupCommitment,
			free_balance_set_state: SetStateCommitment,
		) -> Result<()> {
			if self.get_state_channel(channel.multisig_address).await?.is_some() {
				return Err(EngineError::AlreadyExists(format!(
					"state channel {}",
					channel.multisig_address
				)));
			}
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{}", channel.multisig_address), &channel)?;
			self.put_into_batch(
				&mut batch,
				&format!("{SETUP_COMMITMENT_PREFIX}{}", channel.multisig_address),
				&setup_commitment,
			)?;
			self.put_into_batch(
				&mut batch,
				&format!(
					"{SET_STATE_DOUBLY_PREFIX}{}",
					hex::encode(free_balance_set_state.identity.identity_hash())
				),
				&free_balance_set_state,
			)?;
			self.write(batch)
		}

		async fn create_app_proposal(
			&self,
			multisig: Address,
			proposal: Proposal,
			set_state: SetStateCommitment,
		) -> Result<()> {
			let channel = self
				.get_state_channel(multisig)
				.await?
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			let identity_hash = proposal.identity_hash();
			let next = channel.insert_proposal(proposal)?;
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{multisig}"), &next)?;
			self.put_into_batch(
				&mut batch,
				&format!("{SET_STATE_DOUBLY_PREFIX}{}", hex::encode(identity_hash)),
				&set_state,
			)?;
			self.write(batch)
		}

		async fn remove_app_proposal(&self, multisig: Address, identity_hash: [u8; 32]) -> Result<()> {
			let mut channel = self
				.get_state_channel(multisig)
				.await?
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			if channel.proposed_app_instances.remove(&identity_hash).is_none() {
				return Err(EngineError::NotFound(format!("proposal {}", hex::encode(identity_hash))));
			}
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{multisig}"), &channel)?;
			self.write(batch)
		}

		async fn create_app_instance(
			&self,
			multisig: Address,
			app: AppInstance,
			new_free_balance: FreeBalance,
			free_balance_set_state: SetStateCommitment,
			conditional_transaction: ConditionalTransactionCommitment,
		) -> Result<()> {
			let mut channel = self
				.get_state_channel(multisig)
				.await?
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			let identity_hash = app.identity_hash();
			channel.proposed_app_instances.remove(&identity_hash);
			channel.app_instances.insert(identity_hash, app);
			channel.free_balance = new_free_balance;

			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{multisig}"), &channel)?;
			self.put_into_batch(
				&mut batch,
				&format!(
					"{SET_STATE_DOUBLY_PREFIX}{}",
					hex::encode(channel.free_balance.identity_hash())
				),
				&free_balance_set_state,
			)?;
			self.put_into_batch(
				&mut batch,
				&format!("{CONDITIONAL_TX_PREFIX}{}", hex::encode(identity_hash)),
				&conditional_transaction,
			)?;
			self.write(batch)
		}

		async fn update_app_instance(
			&self,
			multisig: Address,
			app: AppInstance,
			set_state: SetStateCommitment,
		) -> Result<()> {
			let mut channel = self
				.get_state_channel(multisig)
				.await?
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			let identity_hash = app.identity_hash();
			channel
				.app_instances
				.get(&identity_hash)
				.ok_or_else(|| EngineError::NotFound(format!("app {}", hex::encode(identity_hash))))?;
			channel.app_instances.insert(identity_hash, app);

			let slot_prefix =
				if set_state.is_fully_signed() { SET_STATE_DOUBLY_PREFIX } else { SET_STATE_SINGLY_PREFIX };
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{multisig}"), &channel)?;
			self.put_into_batch(&mut batch, &format!("{slot_prefix}{}", hex::encode(identity_hash)), &set_state)?;
			self.write(batch)
		}

		async fn remove_app_instance(
			&self,
			multisig: Address,
			identity_hash: [u8; 32],
			new_free_balance: FreeBalance,
			free_balance_set_state: SetStateCommitment,
		) -> Result<()> {
			let mut channel = self
				.get_state_channel(multisig)
				.await?
				.ok_or_else(|| EngineError::NotFound(format!("state channel {multisig}")))?;
			if channel.app_instances.remove(&identity_hash).is_none() {
				return Err(EngineError::NotFound(format!("app {}", hex::encode(identity_hash))));
			}
			channel.free_balance = new_free_balance;

			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{CHANNEL_PREFIX}{multisig}"), &channel)?;
			self.put_into_batch(
				&mut batch,
				&format!(
					"{SET_STATE_DOUBLY_PREFIX}{}",
					hex::encode(channel.free_balance.identity_hash())
				),
				&free_balance_set_state,
			)?;
			batch.delete_cf(self.data_cf(), format!("{CONDITIONAL_TX_PREFIX}{}", hex::encode(identity_hash)));
			self.write(batch)
		}

		async fn get_setup_commitment(&self, multisig: Address) -> Result<Option<SetupCommitment>> {
			self.get(&format!("{SETUP_COMMITMENT_PREFIX}{multisig}"))
		}

		async fn save_setup_commitment(&self, multisig: Address, commitment: SetupCommitment) -> Result<()> {
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{SETUP_COMMITMENT_PREFIX}{multisig}"), &commitment)?;
			self.write(batch)
		}

		async fn get_set_state_commitment(
			&self,
			identity_hash: [u8; 32],
			slot: SetStateSlot,
		) -> Result<Option<SetStateCommitment>> {
			let prefix = match slot {
				SetStateSlot::Singly => SET_STATE_SINGLY_PREFIX,
				SetStateSlot::Doubly => SET_STATE_DOUBLY_PREFIX,
			};
			self.get(&format!("{prefix}{}", hex::encode(identity_hash)))
		}

		async fn save_set_state_commitment(
			&self,
			identity_hash: [u8; 32],
			slot: SetStateSlot,
			commitment: SetStateCommitment,
		) -> Result<()> {
			let prefix = match slot {
				SetStateSlot::Singly => SET_STATE_SINGLY_PREFIX,
				SetStateSlot::Doubly => SET_STATE_DOUBLY_PREFIX,
			};
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{prefix}{}", hex::encode(identity_hash)), &commitment)?;
			self.write(batch)
		}

		async fn get_conditional_transaction_commitment(
			&self,
			identity_hash: [u8; 32],
		) -> Result<Option<ConditionalTransactionCommitment>> {
			self.get(&format!("{CONDITIONAL_TX_PREFIX}{}", hex::encode(identity_hash)))
		}

		async fn save_conditional_transaction_commitment(
			&self,
			identity_hash: [u8; 32],
			commitment: ConditionalTransactionCommitment,
		) -> Result<()> {
			let mut batch = WriteBatch::default();
			self.put_into_batch(
				&mut batch,
				&format!("{CONDITIONAL_TX_PREFIX}{}", hex::encode(identity_hash)),
				&commitment,
			)?;
			self.write(batch)
		}

		async fn get_withdrawal_commitment(&self, multisig: Address) -> Result<Option<WithdrawCommitment>> {
			self.get(&format!("{WITHDRAWAL_COMMITMENT_PREFIX}{multisig}"))
		}

		async fn save_withdrawal_commitment(
			&self,
			multisig: Address,
			commitment: WithdrawCommitment,
		) -> Result<()> {
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &format!("{WITHDRAWAL_COMMITMENT_PREFIX}{multisig}"), &commitment)?;
			self.write(batch)
		}

		async fn get_user_withdrawals(&self, multisig: Address) -> Result<Vec<UserWithdrawal>> {
			let prefix = self.db.prefix_iterator_cf(self.data_cf(), USER_WITHDRAWAL_PREFIX);
			let mut out = Vec::new();
			for item in prefix {
				let (_, value) = item.map_err(|e| EngineError::StoreError(e.to_string()))?;
				let withdrawal: UserWithdrawal =
					serde_json::from_slice(&value).map_err(|e| EngineError::StoreError(e.to_string()))?;
				if withdrawal.multisig_address == multisig {
					out.push(withdrawal);
				}
			}
			Ok(out)
		}

		async fn save_user_withdrawal(&self, withdrawal: UserWithdrawal) -> Result<()> {
			let key = format!(
				"{USER_WITHDRAWAL_PREFIX}{}/{}",
				withdrawal.multisig_address, withdrawal.nonce
			);
			let mut batch = WriteBatch::default();
			self.put_into_batch(&mut batch, &key, &withdrawal)?;
			self.write(batch)
		}

		async fn remove_user_withdrawal(&self, multisig: Address, nonce: u64) -> Result<()> {
			let key = format!("{USER_WITHDRAWAL_PREFIX}{multisig}/{nonce}");
			if self.get::<UserWithdrawal>(&key)?.is_none() {
				return Err(EngineError::NotFound(format!("withdrawal {multisig}/{nonce}")));
			}
			let mut batch = WriteBatch::default();
			batch.delete_cf(self.data_cf(), key);
			self.write(batch)
		}

		async fn get_schema_version(&self) -> Result<u32> {
			let bytes = self
				.db
				.get_cf(self.metadata_cf(), SCHEMA_VERSION_KEY)
				.map_err(|e| EngineError::StoreError(e.to_string()))?;
			Ok(bytes.map(|b| u32::from_be_bytes(b.try_into().unwrap_or([0; 4]))).unwrap_or(0))
		}

		async fn update_schema_version(&self, new_version: u32) -> Result<()> {
			let current = self.get_schema_version().await?;
			if new_version < current {
				return Err(EngineError::InvariantViolation(format!(
					"refusing schema downgrade from {current} to {new_version}"
				)));
			}
			let mut batch = WriteBatch::default();
			batch.put_cf(self.metadata_cf(), SCHEMA_VERSION_KEY, new_version.to_be_bytes());
			self.write(batch)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sc_protocol::{
		app::AppIdentity,
		channel::{FreeBalance, CONVENTION_FOR_ETH_TOKEN_ADDRESS},
		commitments::{Commitment, MultisigDomain, MultisigOperation},
		identifiers::ExtendedPublicKey,
	};
	use std::collections::BTreeMap;

	fn extended_key(b: u8) -> ExtendedPublicKey {
		use secp256k1::{PublicKey, Secp256k1, SecretKey};
		let secp = Secp256k1::signing_only();
		let sk = SecretKey::from_slice(&[b; 32]).unwrap();
		let pk = PublicKey::from_secret_key(&secp, &sk);
		ExtendedPublicKey::new(pk.serialize(), [0u8; 32])
	}

	fn domain(multisig: Address) -> MultisigDomain {
		MultisigDomain {
			name: "StatechannelMultisig",
			version: "1",
			chain_id: 1,
			multisig_address: multisig,
			salt: [0u8; 32],
		}
	}

	fn fresh_channel() -> StateChannel {
		let a = extended_key(1);
		let b = extended_key(2);
		let (identifiers, addrs) = sc_protocol::identifiers::sort_participants([a, b]);
		StateChannel {
			multisig_address: Address([0x42; 20]),
			user_identifiers: identifiers,
			multisig_owners: addrs,
			free_balance: FreeBalance {
				identity: AppIdentity {
					channel_nonce: 0,
					participants: addrs,
					app_definition: Address([0; 20]),
					default_timeout: 0,
				},
				version_number: 1,
				state_timeout: 0,
				balances: {
					let mut m = BTreeMap::new();
					m.insert(CONVENTION_FOR_ETH_TOKEN_ADDRESS, [500u128, 500u128]);
					m
				},
			},
			app_instances: BTreeMap::new(),
			proposed_app_instances: BTreeMap::new(),
			monotonic_num_proposed_apps: 0,
			schema_version: 1,
		}
	}

	#[tokio::test]
	async fn create_state_channel_then_fetches_by_multisig_and_owners() {
		let store = InMemoryStore::new();
		let channel = fresh_channel();
		let setup = SetupCommitment::new(
			channel.multisig_address,
			channel.multisig_owners,
			Address([0x77; 20]),
			vec![],
			domain(channel.multisig_address),
			0,
		);
		let free_balance_set_state = SetStateCommitment::new(
			channel.free_balance.identity.clone(),
			1,
			0,
			[0u8; 32],
			Address([0x88; 20]),
		);

		store
			.create_state_channel(channel.clone(), setup, free_balance_set_state)
			.await
			.unwrap();

		let fetched = store.get_state_channel(channel.multisig_address).await.unwrap().unwrap();
		assert_eq!(fetched.multisig_address, channel.multisig_address);

		let by_owners =
			store.get_state_channel_by_owners(channel.multisig_owners).await.unwrap().unwrap();
		assert_eq!(by_owners.multisig_address, channel.multisig_address);
	}

	#[tokio::test]
	async fn duplicate_create_state_channel_is_rejected_and_leaves_original_intact() {
		let store = InMemoryStore::new();
		let channel = fresh_channel();
		let setup = SetupCommitment::new(
			channel.multisig_address,
			channel.multisig_owners,
			Address([0x77; 20]),
			vec![],
			domain(channel.multisig_address),
			0,
		);
		let free_balance_set_state = SetStateCommitment::new(
			channel.free_balance.identity.clone(),
			1,
			0,
			[0u8; 32],
			Address([0x88; 20]),
		);

		store
			.create_state_channel(channel.clone(), setup.clone(), free_balance_set_state.clone())
			.await
			.unwrap();

		let err = store
			.create_state_channel(channel.clone(), setup, free_balance_set_state)
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::AlreadyExists(_)));

		assert!(store.get_state_channel(channel.multisig_address).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn schema_downgrade_is_rejected() {
		let store = InMemoryStore::new();
		store.update_schema_version(3).await.unwrap();
		let err = store.update_schema_version(2).await.unwrap_err();
		assert!(matches!(err, EngineError::InvariantViolation(_)));
		assert_eq!(store.get_schema_version().await.unwrap(), 3);
	}

	/// Spec §8 scenario 5: a failed Install persist must leave the channel
	/// exactly as it was — proposal intact, app absent — not partially
	/// written. `atomically` only ever swaps in a clone once the whole
	/// closure succeeds, so a failing `create_app_instance` (here: the
	/// multisig never existed) cannot have written any of the four records
	/// it touches.
	#[tokio::test]
	async fn failed_install_persist_leaves_the_store_untouched() {
		let store = InMemoryStore::new();
		let channel = fresh_channel();
		let app_identity = AppIdentity {
			channel_nonce: 1,
			participants: channel.multisig_owners,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};
		let app = AppInstance {
			identity: app_identity,
			latest_state: vec![1, 2, 3],
			version_number: 1,
			state_timeout: 10,
			latest_action: None,
		};
		let free_balance_set_state = SetStateCommitment::new(
			channel.free_balance.identity.clone(),
			2,
			0,
			[0u8; 32],
			Address([0x88; 20]),
		);
		let conditional = ConditionalTransactionCommitment::new(
			channel.multisig_address,
			channel.multisig_owners,
			app.identity_hash(),
			Address([0x99; 20]),
			vec![],
			domain(channel.multisig_address),
			0,
		);

		let err = store
			.create_app_instance(
				channel.multisig_address,
				app,
				channel.free_balance.clone(),
				free_balance_set_state,
				conditional,
			)
			.await
			.unwrap_err();
		assert!(matches!(err, EngineError::NotFound(_)));

		assert!(store.get_state_channel(channel.multisig_address).await.unwrap().is_none());
	}

	/// Spec §3: the nonce the proposal is signed and keyed under must be the
	/// one `create_app_proposal` actually stores it at, and the doubly-signed
	/// SetState commitment built over the same identity hash must be
	/// recoverable right after Propose, not only from Install onward.
	#[tokio::test]
	async fn create_app_proposal_persists_under_the_allocated_nonce_with_its_commitment() {
		let store = InMemoryStore::new();
		let mut channel = fresh_channel();
		channel.monotonic_num_proposed_apps = 1;
		let setup = SetupCommitment::new(
			channel.multisig_address,
			channel.multisig_owners,
			Address([0x77; 20]),
			vec![],
			domain(channel.multisig_address),
			0,
		);
		let free_balance_set_state = SetStateCommitment::new(
			channel.free_balance.identity.clone(),
			1,
			0,
			[0u8; 32],
			Address([0x88; 20]),
		);
		store.create_state_channel(channel.clone(), setup, free_balance_set_state).await.unwrap();

		let identity = AppIdentity {
			channel_nonce: channel.monotonic_num_proposed_apps,
			participants: channel.multisig_owners,
			app_definition: Address([0xAA; 20]),
			default_timeout: 10,
		};
		let proposal = sc_protocol::channel::Proposal {
			identity,
			initial_state: vec![1, 2, 3],
			initial_state_timeout: 10,
			initiator: channel.multisig_owners[0],
			responder: channel.multisig_owners[1],
			token_address: CONVENTION_FOR_ETH_TOKEN_ADDRESS,
			initiator_deposit: 10,
			responder_deposit: 10,
		};
		let identity_hash = proposal.identity_hash();
		let commitment = SetStateCommitment::new(
			proposal.identity.clone(),
			1,
			proposal.initial_state_timeout,
			sc_protocol::crypto::keccak256(&proposal.initial_state),
			Address([0x88; 20]),
		);

		store.create_app_proposal(channel.multisig_address, proposal, commitment.clone()).await.unwrap();

		let fetched = store.get_state_channel(channel.multisig_address).await.unwrap().unwrap();
		assert!(fetched.proposed_app_instances.contains_key(&identity_hash));
		assert_eq!(fetched.monotonic_num_proposed_apps, 2);

		let stored_commitment = store
			.get_set_state_commitment(identity_hash, SetStateSlot::Doubly)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(stored_commitment.hash_to_sign(), commitment.hash_to_sign());
	}
}
