//! What a stage's `PERSIST` opcode asks the driver to write (spec §4.3,
//! §4.5). Each variant corresponds to one atomic [`crate::store::Store`]
//! call; the driver matches on this and forwards to the right method so
//! stages never need a `Store` handle of their own.

use crate::{
	app::AppInstance,
	channel::{FreeBalance, Proposal, StateChannel},
	commitments::{ConditionalTransactionCommitment, SetStateCommitment, SetupCommitment},
};

#[derive(Debug, Clone)]
pub enum PersistWrite {
	CreateStateChannel {
		channel: StateChannel,
		setup_commitment: SetupCommitment,
		free_balance_set_state: SetStateCommitment,
	},
	CreateAppProposal {
		proposal: Proposal,
		set_state: SetStateCommitment,
	},
	RemoveAppProposal {
		identity_hash: [u8; 32],
	},
	CreateAppInstance {
		app: AppInstance,
		new_free_balance: FreeBalance,
		free_balance_set_state: SetStateCommitment,
		conditional_transaction: ConditionalTransactionCommitment,
	},
	UpdateAppInstance {
		app: AppInstance,
		set_state: SetStateCommitment,
		/// `false` for a single-signed TakeAction step-5 checkpoint (spec
		/// §4.3 step 5); `true` for the canonical double-signed write.
		fully_signed: bool,
	},
	RemoveAppInstance {
		identity_hash: [u8; 32],
		new_free_balance: FreeBalance,
		free_balance_set_state: SetStateCommitment,
	},
}
