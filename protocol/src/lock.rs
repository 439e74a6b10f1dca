//! Per-channel serialization lock (spec §4.4, §5): a mapping
//! `multisigAddress -> mutex`, acquired in ascending address order so that
//! even a method requiring more than one lock can never deadlock against
//! another such method.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex},
};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::identifiers::Address;

/// Holds the acquired guards for the lifetime of a protocol run; dropping it
/// releases every lock in one place regardless of how many were acquired.
pub struct LockGuardSet {
	_guards: Vec<OwnedMutexGuard<()>>,
}

#[derive(Default)]
pub struct LockManager {
	locks: StdMutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl LockManager {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock_for(&self, address: Address) -> Arc<Mutex<()>> {
		let mut locks = self.locks.lock().expect("lock map mutex poisoned");
		locks.entry(address).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
	}

	/// Acquire the locks named by `addresses`, deduplicated and sorted
	/// ascending before acquisition (spec §4.4). All current engine methods
	/// name exactly one multisig, but the ordering holds for any future
	/// method that names more than one.
	pub async fn acquire(&self, addresses: &[Address]) -> LockGuardSet {
		let mut sorted: Vec<Address> = addresses.to_vec();
		sorted.sort();
		sorted.dedup();

		let mut guards = Vec::with_capacity(sorted.len());
		for address in sorted {
			let mutex = self.lock_for(address);
			guards.push(mutex.lock_owned().await);
		}
		LockGuardSet { _guards: guards }
	}
}
