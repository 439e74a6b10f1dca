//! `sc-node`: the binary entry point tying configuration, the store, the
//! signer, the mock peer bus, the chain listener, and the RPC server
//! together — settings first, then logging, then the long-running service
//! components.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use ethers::providers::{Http, Provider};
use jsonrpsee::server::ServerBuilder;
use sc_node::{
	config::{CommandLineOptions, Settings},
	engine::Engine,
	evm_provider::EthCallEvmProvider,
	io::MockNetwork,
	listener::ChainListener,
	rpc::ChanRpcServer,
	store::InMemoryStore,
};
use sc_protocol::crypto::{LocalSigner, Signer};
use secp256k1::SecretKey;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let opts = CommandLineOptions::parse();
	let settings = Settings::new(opts).context("loading configuration")?;

	tracing::info!(
		rpc_bind_address = %settings.rpc.bind_address,
		evm_rpc_endpoint = %settings.evm.rpc_endpoint,
		store_backend = %settings.store.backend,
		"starting sc-node"
	);

	let signer = Arc::new(load_signer(&settings.signing_key_file).context("loading signing key")?);
	tracing::info!(address = %signer.address(), "loaded signing key");

	let store: Arc<dyn sc_protocol::store::Store> = match settings.store.backend.as_str() {
		"memory" => Arc::new(InMemoryStore::new()),
		#[cfg(feature = "rocksdb-store")]
		"rocksdb" => {
			let path = settings.store.path.as_deref().expect("validated at config load");
			Arc::new(sc_node::store::RocksStore::open(Path::new(path)).context("opening rocksdb store")?)
		}
		#[cfg(not(feature = "rocksdb-store"))]
		"rocksdb" => anyhow::bail!("this binary was not built with the rocksdb-store feature"),
		other => anyhow::bail!("unknown store backend {other:?}"),
	};

	let network = MockNetwork::new();
	let io = Arc::new(network.handle(signer.address().to_string()));

	let engine = Arc::new(
		Engine::new(store, signer.clone(), io)
			.with_timeout(std::time::Duration::from_secs(settings.rpc.send_and_wait_timeout_secs)),
	);

	let provider = Arc::new(
		Provider::<Http>::try_from(settings.evm.rpc_endpoint.as_str()).context("constructing EVM RPC client")?,
	);
	let evm_provider = Arc::new(EthCallEvmProvider::new(provider.clone(), tokio::runtime::Handle::current()));
	let head_tracking_provider = provider.clone();

	let listener = Arc::new(ChainListener::new(
		provider,
		settings.challenge_registry_address(),
		settings.evm.chain_listener_chunk_size,
	));
	listener.enable();
	tokio::spawn({
		let listener = listener.clone();
		let poll_interval = std::time::Duration::from_millis(settings.evm.chain_listener_poll_interval_ms);
		async move {
			// `parse_logs_from` errors if `starting_block` is past the chain
			// head (spec §4.6 scenario 6), which is the steady state between
			// new blocks — so check the head first and only walk when
			// there's genuinely unprocessed range to cover.
			let mut next_block = 0u64;
			loop {
				match ethers::providers::Middleware::get_block_number(head_tracking_provider.as_ref()).await {
					Ok(head) => {
						let head = head.as_u64();
						if next_block <= head {
							match listener.parse_logs_from(next_block).await {
								Ok(_) => next_block = head + 1,
								Err(error) => tracing::warn!(%error, "chain listener poll failed"),
							}
						}
					}
					Err(error) => tracing::warn!(%error, "failed to read chain head"),
				}
				tokio::time::sleep(poll_interval).await;
			}
		}
	});

	let rpc_server = ChanRpcServer::new(
		engine,
		evm_provider,
		signer.address(),
		settings.challenge_registry_address(),
		settings.multisig_master_copy_address(),
		settings.multisig_proxy_factory_address(),
		settings.evm.chain_id,
	);

	let server = ServerBuilder::default()
		.build(&settings.rpc.bind_address)
		.await
		.with_context(|| format!("binding RPC server to {}", settings.rpc.bind_address))?;
	let _handle = server.start(rpc_server.into_rpc())?;
	tracing::info!(bind_address = %settings.rpc.bind_address, "RPC server listening");

	// The handle shuts the server down on drop; block here for the life of
	// the process rather than racing that drop against an open listener.
	std::future::pending::<()>().await;
	Ok(())
}

/// Reads a raw 32-byte secp256k1 secret key, hex-encoded with an optional
/// `0x` prefix, matching the convention `node::config::parse_address` uses
/// for every other key-material field.
fn load_signer(path: &str) -> Result<LocalSigner> {
	let contents = std::fs::read_to_string(path).with_context(|| format!("reading signing key file {path}"))?;
	let trimmed = contents.trim();
	let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
		.with_context(|| format!("signing key file {path} does not contain valid hex"))?;
	let secret_key = SecretKey::from_slice(&bytes).context("signing key file does not contain a valid secp256k1 scalar")?;
	Ok(LocalSigner::new(secret_key))
}
