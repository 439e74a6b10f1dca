//! Layered configuration (spec §11): a TOML file, environment variables, and
//! command-line flags, in that order of increasing precedence, covering this
//! node's RPC/EVM/store option surface.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use sc_protocol::identifiers::Address;
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "node/config/Default.toml";

#[derive(Parser, Clone, Debug)]
#[clap(name = "sc-node", about = "State-channel engine node")]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path")]
	pub config_path: Option<String>,

	#[clap(flatten)]
	pub rpc: RpcOptions,

	#[clap(flatten)]
	pub evm: EvmOptions,

	#[clap(flatten)]
	pub store: StoreOptions,

	#[clap(long = "signing-key-file", env = "SC_NODE_SIGNING_KEY_FILE")]
	pub signing_key_file: Option<String>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct RpcOptions {
	#[clap(long = "rpc-bind-address", env = "SC_NODE_RPC_BIND_ADDRESS")]
	pub bind_address: Option<String>,

	#[clap(long = "send-and-wait-timeout-secs", env = "SC_NODE_SEND_AND_WAIT_TIMEOUT_SECS")]
	pub send_and_wait_timeout_secs: Option<u64>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct EvmOptions {
	#[clap(long = "evm-rpc-endpoint", env = "SC_NODE_EVM_RPC_ENDPOINT")]
	pub rpc_endpoint: Option<String>,

	#[clap(long = "chain-id", env = "SC_NODE_CHAIN_ID")]
	pub chain_id: Option<u64>,

	#[clap(long = "challenge-registry-address", env = "SC_NODE_CHALLENGE_REGISTRY_ADDRESS")]
	pub challenge_registry_address: Option<String>,

	#[clap(long = "multisig-master-copy-address", env = "SC_NODE_MULTISIG_MASTER_COPY_ADDRESS")]
	pub multisig_master_copy_address: Option<String>,

	#[clap(long = "multisig-proxy-factory-address", env = "SC_NODE_MULTISIG_PROXY_FACTORY_ADDRESS")]
	pub multisig_proxy_factory_address: Option<String>,

	#[clap(long = "chain-listener-chunk-size", env = "SC_NODE_CHAIN_LISTENER_CHUNK_SIZE")]
	pub chain_listener_chunk_size: Option<u64>,

	#[clap(long = "chain-listener-poll-interval-ms", env = "SC_NODE_CHAIN_LISTENER_POLL_INTERVAL_MS")]
	pub chain_listener_poll_interval_ms: Option<u64>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct StoreOptions {
	/// `memory` or `rocksdb` (the latter only valid when built with the
	/// `rocksdb-store` feature).
	#[clap(long = "store-backend", env = "SC_NODE_STORE_BACKEND")]
	pub backend: Option<String>,

	#[clap(long = "store-path", env = "SC_NODE_STORE_PATH")]
	pub path: Option<String>,
}

#[cfg(test)]
impl Default for CommandLineOptions {
	fn default() -> Self {
		Self {
			config_path: None,
			rpc: RpcOptions::default(),
			evm: EvmOptions::default(),
			store: StoreOptions::default(),
			signing_key_file: None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcSettings {
	pub bind_address: String,
	pub send_and_wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmSettings {
	pub rpc_endpoint: String,
	pub chain_id: u64,
	pub challenge_registry_address: String,
	pub multisig_master_copy_address: String,
	pub multisig_proxy_factory_address: String,
	pub chain_listener_chunk_size: u64,
	pub chain_listener_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
	pub backend: String,
	pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
	pub rpc: RpcSettings,
	pub evm: EvmSettings,
	pub store: StoreSettings,
	pub signing_key_file: String,
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let config_path = opts.config_path.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
		let settings = Self::from_file_and_env(&config_path, opts)?;
		settings.validate()?;
		Ok(settings)
	}

	fn from_file_and_env(path: &str, opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut builder = Config::builder().add_source(File::with_name(path).required(false));
		builder = builder.add_source(Environment::with_prefix("SC_NODE").separator("__"));
		let mut settings: Settings = builder.build()?.try_deserialize()?;

		if let Some(bind_address) = opts.rpc.bind_address {
			settings.rpc.bind_address = bind_address;
		}
		if let Some(timeout) = opts.rpc.send_and_wait_timeout_secs {
			settings.rpc.send_and_wait_timeout_secs = timeout;
		}
		if let Some(endpoint) = opts.evm.rpc_endpoint {
			settings.evm.rpc_endpoint = endpoint;
		}
		if let Some(chain_id) = opts.evm.chain_id {
			settings.evm.chain_id = chain_id;
		}
		if let Some(addr) = opts.evm.challenge_registry_address {
			settings.evm.challenge_registry_address = addr;
		}
		if let Some(addr) = opts.evm.multisig_master_copy_address {
			settings.evm.multisig_master_copy_address = addr;
		}
		if let Some(addr) = opts.evm.multisig_proxy_factory_address {
			settings.evm.multisig_proxy_factory_address = addr;
		}
		if let Some(chunk_size) = opts.evm.chain_listener_chunk_size {
			settings.evm.chain_listener_chunk_size = chunk_size;
		}
		if let Some(poll_interval) = opts.evm.chain_listener_poll_interval_ms {
			settings.evm.chain_listener_poll_interval_ms = poll_interval;
		}
		if let Some(backend) = opts.store.backend {
			settings.store.backend = backend;
		}
		if let Some(store_path) = opts.store.path {
			settings.store.path = Some(store_path);
		}
		if let Some(key_file) = opts.signing_key_file {
			settings.signing_key_file = key_file;
		}

		Ok(settings)
	}

	/// Rejects configurations the engine cannot start with (spec §11): an
	/// unparseable contract address, or a `rocksdb` backend missing its path.
	fn validate(&self) -> Result<(), ConfigError> {
		parse_address(&self.evm.challenge_registry_address)
			.map_err(|e| ConfigError::Message(format!("evm.challenge_registry_address: {e}")))?;
		parse_address(&self.evm.multisig_master_copy_address)
			.map_err(|e| ConfigError::Message(format!("evm.multisig_master_copy_address: {e}")))?;
		parse_address(&self.evm.multisig_proxy_factory_address)
			.map_err(|e| ConfigError::Message(format!("evm.multisig_proxy_factory_address: {e}")))?;

		match self.store.backend.as_str() {
			"memory" => {}
			"rocksdb" if self.store.path.is_some() => {}
			"rocksdb" => {
				return Err(ConfigError::Message("store.path is required for the rocksdb backend".into()))
			}
			other => return Err(ConfigError::Message(format!("unknown store.backend {other:?}"))),
		}

		Ok(())
	}

	pub fn challenge_registry_address(&self) -> Address {
		parse_address(&self.evm.challenge_registry_address).expect("validated at construction")
	}

	pub fn multisig_master_copy_address(&self) -> Address {
		parse_address(&self.evm.multisig_master_copy_address).expect("validated at construction")
	}

	pub fn multisig_proxy_factory_address(&self) -> Address {
		parse_address(&self.evm.multisig_proxy_factory_address).expect("validated at construction")
	}
}

/// Parses a `0x`-prefixed 20-byte hex address, the wire format every address
/// field in `Settings` uses.
pub fn parse_address(s: &str) -> Result<Address, String> {
	let stripped = s.strip_prefix("0x").unwrap_or(s);
	let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
	let array: [u8; 20] =
		bytes.try_into().map_err(|v: Vec<u8>| format!("expected 20 bytes, got {}", v.len()))?;
	Ok(Address(array))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_opts() -> CommandLineOptions {
		let mut opts = CommandLineOptions::default();
		opts.config_path = Some("does-not-exist.toml".into());
		opts.rpc.bind_address = Some("127.0.0.1:9000".into());
		opts.rpc.send_and_wait_timeout_secs = Some(30);
		opts.evm.rpc_endpoint = Some("http://localhost:8545".into());
		opts.evm.chain_id = Some(1337);
		opts.evm.challenge_registry_address = Some("0x1111111111111111111111111111111111111111".into());
		opts.evm.multisig_master_copy_address = Some("0x2222222222222222222222222222222222222222".into());
		opts.evm.multisig_proxy_factory_address =
			Some("0x3333333333333333333333333333333333333333".into());
		opts.evm.chain_listener_chunk_size = Some(30);
		opts.evm.chain_listener_poll_interval_ms = Some(5_000);
		opts.store.backend = Some("memory".into());
		opts.signing_key_file = Some("/tmp/signing.key".into());
		opts
	}

	#[test]
	fn cli_flags_fill_in_a_config_file_that_does_not_exist() {
		let settings = Settings::new(base_opts()).unwrap();
		assert_eq!(settings.rpc.bind_address, "127.0.0.1:9000");
		assert_eq!(settings.evm.chain_id, 1337);
		assert_eq!(settings.store.backend, "memory");
	}

	#[test]
	fn rocksdb_backend_without_a_path_is_rejected() {
		let mut opts = base_opts();
		opts.store.backend = Some("rocksdb".into());
		opts.store.path = None;
		assert!(Settings::new(opts).is_err());
	}

	#[test]
	fn malformed_address_is_rejected() {
		let mut opts = base_opts();
		opts.evm.challenge_registry_address = Some("not-an-address".into());
		assert!(Settings::new(opts).is_err());
	}

	#[test]
	fn parse_address_round_trips_a_derived_address() {
		let addr = Address([0xAB; 20]);
		let parsed = parse_address(&format!("0x{}", hex::encode(addr.0))).unwrap();
		assert_eq!(parsed, addr);
	}
}
