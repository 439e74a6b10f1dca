//! Chain listener (spec §4.6): subscribes to `ChallengeUpdated` and
//! `StateProgressed` logs from the ChallengeRegistry contract, walking past
//! blocks in fixed-size chunks before handing off to a live poll: fetch past
//! logs over an HTTP range, then merge with polling for new ones, built on
//! `ethers` log filters.
//!
//! Listener registration (`attach`/`attachOnce`/`waitFor`/`detach`) is a thin
//! layer over a `tokio::sync::broadcast` channel: every parsed event is
//! published once, and each attached listener decides independently whether
//! it matches its own filter.

use std::sync::{
	atomic::{AtomicBool, AtomicU64, Ordering},
	Arc,
};

use async_trait::async_trait;
use ethabi::{Event as AbiEvent, EventParam, ParamType, RawLog};
use ethers::types::{BlockNumber, Filter, Log, H256};
use sc_protocol::{
	errors::{EngineError, Result},
	identifiers::Address,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default chunk size for `parseLogsFrom`'s block-range walk (spec §4.6).
pub const DEFAULT_CHUNK_SIZE: u64 = 30;

/// One decoded ChallengeRegistry log (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
	ChallengeUpdated {
		identity_hash: [u8; 32],
		status: u64,
		app_state_hash: [u8; 32],
		version_number: u64,
		finalizes_at: u64,
	},
	StateProgressed {
		identity_hash: [u8; 32],
		action: Vec<u8>,
		version_number: u64,
		timeout: u64,
		turn_taker: Address,
		signature: Vec<u8>,
	},
}

impl ChainEvent {
	pub fn identity_hash(&self) -> [u8; 32] {
		match self {
			ChainEvent::ChallengeUpdated { identity_hash, .. } => *identity_hash,
			ChainEvent::StateProgressed { identity_hash, .. } => *identity_hash,
		}
	}
}

fn challenge_updated_event() -> AbiEvent {
	AbiEvent {
		name: "ChallengeUpdated".into(),
		inputs: vec![
			EventParam { name: "identityHash".into(), kind: ParamType::FixedBytes(32), indexed: true },
			EventParam { name: "status".into(), kind: ParamType::Uint(8), indexed: false },
			EventParam { name: "appStateHash".into(), kind: ParamType::FixedBytes(32), indexed: false },
			EventParam { name: "versionNumber".into(), kind: ParamType::Uint(256), indexed: false },
			EventParam { name: "finalizesAt".into(), kind: ParamType::Uint(256), indexed: false },
		],
		anonymous: false,
	}
}

fn state_progressed_event() -> AbiEvent {
	AbiEvent {
		name: "StateProgressed".into(),
		inputs: vec![
			EventParam { name: "identityHash".into(), kind: ParamType::FixedBytes(32), indexed: true },
			EventParam { name: "action".into(), kind: ParamType::Bytes, indexed: false },
			EventParam { name: "versionNumber".into(), kind: ParamType::Uint(256), indexed: false },
			EventParam { name: "timeout".into(), kind: ParamType::Uint(256), indexed: false },
			EventParam { name: "turnTaker".into(), kind: ParamType::Address, indexed: false },
			EventParam { name: "signature".into(), kind: ParamType::Bytes, indexed: false },
		],
		anonymous: false,
	}
}

fn fixed_bytes_32(token: &ethabi::Token) -> Result<[u8; 32]> {
	let bytes = token
		.clone()
		.into_fixed_bytes()
		.ok_or_else(|| EngineError::ChainError("expected a fixed32 log parameter".into()))?;
	bytes
		.try_into()
		.map_err(|_| EngineError::ChainError("fixed32 log parameter was not 32 bytes".into()))
}

fn decode_challenge_updated(raw: RawLog) -> Result<ChainEvent> {
	let parsed = challenge_updated_event()
		.parse_log(raw)
		.map_err(|e| EngineError::ChainError(format!("failed to decode ChallengeUpdated: {e}")))?;
	let param = |name: &str| {
		parsed
			.params
			.iter()
			.find(|p| p.name == name)
			.map(|p| p.value.clone())
			.ok_or_else(|| EngineError::ChainError(format!("ChallengeUpdated missing field {name}")))
	};

	Ok(ChainEvent::ChallengeUpdated {
		identity_hash: fixed_bytes_32(&param("identityHash")?)?,
		status: param("status")?.into_uint().map(|v| v.as_u64()).unwrap_or_default(),
		app_state_hash: fixed_bytes_32(&param("appStateHash")?)?,
		version_number: param("versionNumber")?.into_uint().map(|v| v.as_u64()).unwrap_or_default(),
		finalizes_at: param("finalizesAt")?.into_uint().map(|v| v.as_u64()).unwrap_or_default(),
	})
}

fn decode_state_progressed(raw: RawLog) -> Result<ChainEvent> {
	let parsed = state_progressed_event()
		.parse_log(raw)
		.map_err(|e| EngineError::ChainError(format!("failed to decode StateProgressed: {e}")))?;
	let param = |name: &str| {
		parsed
			.params
			.iter()
			.find(|p| p.name == name)
			.map(|p| p.value.clone())
			.ok_or_else(|| EngineError::ChainError(format!("StateProgressed missing field {name}")))
	};

	let turn_taker = param("turnTaker")?
		.into_address()
		.ok_or_else(|| EngineError::ChainError("turnTaker was not an address".into()))?;

	Ok(ChainEvent::StateProgressed {
		identity_hash: fixed_bytes_32(&param("identityHash")?)?,
		action: param("action")?.into_bytes().unwrap_or_default(),
		version_number: param("versionNumber")?.into_uint().map(|v| v.as_u64()).unwrap_or_default(),
		timeout: param("timeout")?.into_uint().map(|v| v.as_u64()).unwrap_or_default(),
		turn_taker: Address(turn_taker.0),
		signature: param("signature")?.into_bytes().unwrap_or_default(),
	})
}

fn decode_log(log: &Log) -> Result<ChainEvent> {
	let topic0 = *log
		.topics
		.first()
		.ok_or_else(|| EngineError::ChainError("log carried no topics".into()))?;
	let raw = RawLog { topics: log.topics.clone(), data: log.data.to_vec() };

	if topic0 == challenge_updated_event().signature() {
		decode_challenge_updated(raw)
	} else if topic0 == state_progressed_event().signature() {
		decode_state_progressed(raw)
	} else {
		Err(EngineError::ChainError(format!("unrecognized log signature {topic0:?}")))
	}
}

/// The read-only chain access the listener needs; a thin seam over
/// `ethers::providers::Middleware` so tests can substitute
/// [`test_support::MockProvider`] for a live RPC endpoint.
#[async_trait]
pub trait LogProvider: Send + Sync {
	async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>>;
	async fn block_number(&self) -> Result<u64>;
}

#[async_trait]
impl LogProvider for ethers::providers::Provider<ethers::providers::Http> {
	async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
		ethers::providers::Middleware::get_logs(self, filter)
			.await
			.map_err(|e| EngineError::ChainError(e.to_string()))
	}

	async fn block_number(&self) -> Result<u64> {
		ethers::providers::Middleware::get_block_number(self)
			.await
			.map(|n| n.as_u64())
			.map_err(|e| EngineError::ChainError(e.to_string()))
	}
}

/// A cancellation handle returned by `attach`/`attachOnce` (spec §4.6, §5):
/// pass it to [`ChainListener::detach`] to stop that one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ctx(u64);

struct Subscription {
	ctx: Ctx,
	filter: Option<[u8; 32]>,
	once: bool,
	sender: broadcast::Sender<ChainEvent>,
}

/// Subscribes to a ChallengeRegistry's `ChallengeUpdated`/`StateProgressed`
/// logs (spec §4.6). `enable`/`disable` gate `parseLogsFrom`; listener
/// registration is independent of that gate so tests can attach before the
/// first poll.
pub struct ChainListener<P: LogProvider> {
	provider: Arc<P>,
	deployed_address: ethers::types::Address,
	chunk_size: u64,
	enabled: AtomicBool,
	next_ctx: AtomicU64,
	subscriptions: tokio::sync::Mutex<Vec<Subscription>>,
}

impl<P: LogProvider> ChainListener<P> {
	pub fn new(provider: Arc<P>, deployed_address: Address, chunk_size: u64) -> Self {
		Self {
			provider,
			deployed_address: deployed_address.0.into(),
			chunk_size: chunk_size.max(1),
			enabled: AtomicBool::new(false),
			next_ctx: AtomicU64::new(0),
			subscriptions: tokio::sync::Mutex::new(Vec::new()),
		}
	}

	pub fn enable(&self) {
		self.enabled.store(true, Ordering::SeqCst);
	}

	pub fn disable(&self) {
		self.enabled.store(false, Ordering::SeqCst);
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::SeqCst)
	}

	/// Walk `[starting_block, head]` in chunks of at most `chunk_size`
	/// blocks, decode every matching log, and publish it to every attached
	/// listener. Fails without publishing anything if `starting_block` is
	/// past the chain's current head (spec §4.6, scenario 6).
	pub async fn parse_logs_from(&self, starting_block: u64) -> Result<Vec<ChainEvent>> {
		let head = self.provider.block_number().await?;
		if starting_block > head {
			return Err(EngineError::ChainError(format!(
				"starting block {starting_block} is past the current head {head}"
			)));
		}

		let mut events = Vec::new();
		let mut from = starting_block;
		while from <= head {
			let to = (from + self.chunk_size - 1).min(head);
			debug!(from, to, "chain listener walking block chunk");

			let filter = Filter::new()
				.address(self.deployed_address)
				.from_block(BlockNumber::Number(from.into()))
				.to_block(BlockNumber::Number(to.into()));
			let logs = self.provider.get_logs(&filter).await?;

			for log in &logs {
				match decode_log(log) {
					Ok(event) => {
						info!(identity_hash = ?event.identity_hash(), "chain listener parsed event");
						self.publish(&event).await;
						events.push(event);
					}
					Err(e) => warn!(error = %e, "chain listener skipped an unparsable log"),
				}
			}

			if to == head {
				break;
			}
			from = to + 1;
		}

		Ok(events)
	}

	async fn publish(&self, event: &ChainEvent) {
		let mut subscriptions = self.subscriptions.lock().await;
		subscriptions.retain(|sub| {
			let matches = match sub.filter {
				Some(wanted) => wanted == event.identity_hash(),
				None => true,
			};
			if matches {
				let _ = sub.sender.send(event.clone());
				!sub.once
			} else {
				true
			}
		});
	}

	/// Register a standing listener, optionally filtered to one
	/// `identityHash`. Every published event from here on is delivered until
	/// [`ChainListener::detach`] is called with the returned [`Ctx`].
	pub async fn attach(&self, filter: Option<[u8; 32]>) -> (Ctx, broadcast::Receiver<ChainEvent>) {
		self.register(filter, false).await
	}

	/// Like [`ChainListener::attach`], but the registration is removed after
	/// its first delivered event.
	pub async fn attach_once(&self, filter: Option<[u8; 32]>) -> (Ctx, broadcast::Receiver<ChainEvent>) {
		self.register(filter, true).await
	}

	async fn register(&self, filter: Option<[u8; 32]>, once: bool) -> (Ctx, broadcast::Receiver<ChainEvent>) {
		let ctx = Ctx(self.next_ctx.fetch_add(1, Ordering::SeqCst));
		let (sender, receiver) = broadcast::channel(64);
		self.subscriptions.lock().await.push(Subscription { ctx, filter, once, sender });
		(ctx, receiver)
	}

	/// Attach, then wait up to `timeout` for one matching event.
	pub async fn wait_for(
		&self,
		filter: Option<[u8; 32]>,
		timeout: std::time::Duration,
	) -> Result<ChainEvent> {
		let (ctx, mut receiver) = self.attach_once(filter).await;
		let result = tokio::time::timeout(timeout, receiver.recv()).await;
		self.detach(ctx).await;
		match result {
			Ok(Ok(event)) => Ok(event),
			Ok(Err(_)) => Err(EngineError::ChainError("chain listener dropped before delivering an event".into())),
			Err(_) => Err(EngineError::Timeout),
		}
	}

	/// Remove a registration made by `attach`/`attach_once`. Idempotent: a
	/// `Ctx` that was already removed (or never registered) is a no-op.
	pub async fn detach(&self, ctx: Ctx) {
		self.subscriptions.lock().await.retain(|sub| sub.ctx != ctx);
	}
}

#[cfg(test)]
pub mod test_support {
	use super::*;
	use std::sync::Mutex as StdMutex;

	/// An in-memory [`LogProvider`] double: a fixed head height plus a flat
	/// list of logs, each tagged with the block it "occurred" in. No RPC
	/// endpoint required (spec §4.6).
	#[derive(Default)]
	pub struct MockProvider {
		head: StdMutex<u64>,
		logs: StdMutex<Vec<(u64, Log)>>,
	}

	impl MockProvider {
		pub fn new(head: u64) -> Self {
			Self { head: StdMutex::new(head), logs: StdMutex::new(Vec::new()) }
		}

		pub fn push_log(&self, block_number: u64, log: Log) {
			self.logs.lock().unwrap().push((block_number, log));
		}

		pub fn set_head(&self, head: u64) {
			*self.head.lock().unwrap() = head;
		}
	}

	#[async_trait]
	impl LogProvider for MockProvider {
		async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
			let (from, to) = match (&filter.block_option.get_from_block(), &filter.block_option.get_to_block()) {
				(Some(BlockNumber::Number(from)), Some(BlockNumber::Number(to))) => (from.as_u64(), to.as_u64()),
				_ => return Err(EngineError::ChainError("mock provider requires a numeric block range".into())),
			};
			Ok(self
				.logs
				.lock()
				.unwrap()
				.iter()
				.filter(|(block, _)| *block >= from && *block <= to)
				.map(|(_, log)| log.clone())
				.collect())
		}

		async fn block_number(&self) -> Result<u64> {
			Ok(*self.head.lock().unwrap())
		}
	}

	pub fn challenge_updated_log(identity_hash: [u8; 32]) -> Log {
		let tokens = [
			ethabi::Token::Uint(7u64.into()),
			ethabi::Token::FixedBytes(identity_hash.to_vec()),
			ethabi::Token::Uint(200u64.into()),
		];
		let data = ethabi::encode(&[tokens[0].clone(), tokens[1].clone(), tokens[2].clone()]);
		Log {
			topics: vec![challenge_updated_event().signature(), H256::from(identity_hash)],
			data: data.into(),
			..Default::default()
		}
	}
}
