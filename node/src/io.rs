//! The abstracted peer message bus (spec §6, §9): transport itself is a
//! non-goal (spec §1), so this crate only defines [`Io`] and an in-process
//! mock implementation — a shared registry of per-participant channels,
//! extended with request/reply matching for `IO_SEND_AND_WAIT`.
//!
//! The only suspension points a [`sc_protocol::runner::stage::ProtocolStage`]
//! ever yields are `IO_SEND` and `IO_SEND_AND_WAIT` (spec §4.3); nothing in
//! the protocol core subscribes to a standing stream. The driver side still
//! needs a way to notice an unsolicited inbound envelope that starts a
//! responder-side run, so [`MockIo::recv`] covers that without widening the
//! `Io` trait itself with a method no stage ever calls.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex},
	time::Duration,
};

use async_trait::async_trait;
use sc_protocol::{
	errors::{EngineError, Result},
	wire::Envelope,
};
use tokio::sync::{mpsc, Mutex};

/// `IO_SEND` / `IO_SEND_AND_WAIT` (spec §4.3): fire-and-forget send, or send
/// then suspend for a reply correlated by `process_id`.
#[async_trait]
pub trait Io: Send + Sync {
	async fn send(&self, envelope: Envelope) -> Result<()>;
	async fn send_and_wait(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope>;
}

type Registry = Arc<StdMutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>>;

/// The shared bus every [`MockIo`] handle is registered against, equivalent
/// to `NetworkInner`'s `clients` map. Construct one per test, then call
/// [`MockNetwork::handle`] once per participant identifier.
#[derive(Clone, Default)]
pub struct MockNetwork {
	registry: Registry,
}

impl MockNetwork {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `identifier` on the bus and return its `Io` handle. Panics
	/// if the identifier is already registered, matching `NetworkInner`'s
	/// "cannot insert the same validator more than once" invariant.
	pub fn handle(&self, identifier: impl Into<String>) -> MockIo {
		let identifier = identifier.into();
		let (sender, receiver) = mpsc::unbounded_channel();
		let mut registry = self.registry.lock().expect("mock network registry mutex poisoned");
		let replaced = registry.insert(identifier.clone(), sender).is_some();
		assert!(!replaced, "identifier {identifier} is already registered on this mock network");
		drop(registry);

		MockIo { identifier, registry: self.registry.clone(), inbox: Mutex::new(receiver) }
	}
}

/// One participant's view of a [`MockNetwork`]: sends look up the
/// recipient's channel in the shared registry; `send_and_wait` sends, then
/// drains its own inbox until an envelope with a matching `process_id`
/// arrives or the timeout elapses.
pub struct MockIo {
	identifier: String,
	registry: Registry,
	inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl MockIo {
	/// Pull the next unsolicited envelope addressed to this participant —
	/// how a responder-side driver notices a protocol run has started,
	/// before any stage object exists to issue opcodes of its own.
	pub async fn recv(&self) -> Result<Envelope> {
		let mut inbox = self.inbox.lock().await;
		inbox
			.recv()
			.await
			.ok_or_else(|| EngineError::InvariantViolation(format!("{}'s inbox closed", self.identifier)))
	}
}

#[async_trait]
impl Io for MockIo {
	async fn send(&self, envelope: Envelope) -> Result<()> {
		let sender = {
			let registry = self.registry.lock().expect("mock network registry mutex poisoned");
			registry
				.get(&envelope.to_identifier)
				.cloned()
				.ok_or_else(|| EngineError::NotFound(format!("peer {}", envelope.to_identifier)))?
		};
		sender
			.send(envelope)
			.map_err(|_| EngineError::InvariantViolation("peer channel closed".into()))
	}

	async fn send_and_wait(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
		let process_id = envelope.process_id;
		self.send(envelope).await?;

		let mut inbox = self.inbox.lock().await;
		let deadline = tokio::time::Instant::now() + timeout;
		loop {
			let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
			if remaining.is_zero() {
				return Err(EngineError::Timeout);
			}
			match tokio::time::timeout(remaining, inbox.recv()).await {
				Ok(Some(reply)) if reply.process_id == process_id => return Ok(reply),
				// A reply for a different, interleaved process run; not ours, keep waiting.
				Ok(Some(_stale)) => continue,
				Ok(None) => {
					return Err(EngineError::InvariantViolation(format!(
						"{}'s inbox closed while awaiting a reply",
						self.identifier
					)))
				}
				Err(_) => return Err(EngineError::Timeout),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use sc_protocol::{
		middleware::ProtocolName,
		wire::{CustomData, ProcessId},
	};

	fn envelope(process_id: u64, to: &str, from: &str) -> Envelope {
		Envelope {
			process_id: ProcessId(process_id),
			protocol: ProtocolName::TakeAction,
			seq: 0,
			to_identifier: to.into(),
			from_identifier: from.into(),
			params: serde_json::json!({}),
			custom_data: CustomData::default(),
			prev_message_received: None,
		}
	}

	#[tokio::test]
	async fn send_and_wait_returns_the_matching_reply() {
		let network = MockNetwork::new();
		let initiator = network.handle("initiator");
		let responder = network.handle("responder");

		let responder_task = tokio::spawn(async move {
			let request = responder.recv().await.unwrap();
			assert_eq!(request.process_id.0, 7);
			responder.send(envelope(7, "initiator", "responder")).await.unwrap();
		});

		let reply = initiator
			.send_and_wait(envelope(7, "responder", "initiator"), Duration::from_millis(200))
			.await
			.unwrap();
		assert_eq!(reply.process_id.0, 7);
		assert_eq!(reply.from_identifier, "responder");

		responder_task.await.unwrap();
	}

	#[tokio::test]
	async fn send_and_wait_ignores_replies_for_other_process_ids() {
		let network = MockNetwork::new();
		let initiator = network.handle("initiator");
		let responder = network.handle("responder");

		let responder_task = tokio::spawn(async move {
			let _stale = responder.recv().await.unwrap();
			responder.send(envelope(999, "initiator", "responder")).await.unwrap();
			let request = responder.recv().await.unwrap();
			responder.send(envelope(request.process_id.0, "initiator", "responder")).await.unwrap();
		});

		// Prime a stale reply under a different process id before the real request.
		initiator.send(envelope(999, "responder", "initiator")).await.unwrap();
		let reply = initiator
			.send_and_wait(envelope(42, "responder", "initiator"), Duration::from_millis(200))
			.await
			.unwrap();
		assert_eq!(reply.process_id.0, 42);

		responder_task.await.unwrap();
	}

	#[tokio::test]
	async fn send_and_wait_times_out_without_a_reply() {
		let network = MockNetwork::new();
		let initiator = network.handle("initiator");
		let _responder = network.handle("responder");

		let result = initiator
			.send_and_wait(envelope(1, "responder", "initiator"), Duration::from_millis(20))
			.await;
		assert!(matches!(result, Err(EngineError::Timeout)));
	}

	#[tokio::test]
	async fn send_to_unregistered_peer_is_not_found() {
		let network = MockNetwork::new();
		let initiator = network.handle("initiator");

		let result = initiator.send(envelope(1, "nobody", "initiator")).await;
		assert!(matches!(result, Err(EngineError::NotFound(_))));
	}
}
