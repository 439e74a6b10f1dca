//! The production [`EvmProvider`] (spec §4.2 `computeStateTransition`): an
//! `eth_call` against the app definition contract's `applyAction(bytes,
//! bytes) returns (bytes)`, trusting nothing but the returned bytes from
//! that call.
//!
//! [`ProtocolStage::resume`] is a synchronous boundary (spec §4.3) — no
//! opcode in the runner is `async` — so this bridges into the Tokio runtime
//! with [`Handle::block_on`] rather than making `apply_action` itself async.

use std::sync::Arc;

use ethabi::{Function, Param, ParamType, StateMutability, Token};
use ethers::providers::{Http, Middleware, Provider};
use sc_protocol::{app::EvmProvider, errors::EngineError, identifiers::Address};
use tokio::runtime::Handle;

/// `function applyAction(bytes calldata state, bytes calldata action) external view returns (bytes memory)`.
#[allow(deprecated)]
fn apply_action_function() -> Function {
	Function {
		name: "applyAction".into(),
		inputs: vec![
			Param { name: "state".into(), kind: ParamType::Bytes, internal_type: None },
			Param { name: "action".into(), kind: ParamType::Bytes, internal_type: None },
		],
		outputs: vec![Param { name: "".into(), kind: ParamType::Bytes, internal_type: None }],
		constant: None,
		state_mutability: StateMutability::View,
	}
}

pub struct EthCallEvmProvider {
	provider: Arc<Provider<Http>>,
	runtime: Handle,
}

impl EthCallEvmProvider {
	pub fn new(provider: Arc<Provider<Http>>, runtime: Handle) -> Self {
		Self { provider, runtime }
	}

	async fn call(&self, app_definition: Address, state: &[u8], action: &[u8]) -> Result<Vec<u8>, EngineError> {
		let function = apply_action_function();
		let calldata = function
			.encode_input(&[Token::Bytes(state.to_vec()), Token::Bytes(action.to_vec())])
			.map_err(|e| EngineError::ChainError(format!("encoding applyAction call: {e}")))?;

		let tx = ethers::types::TransactionRequest::new()
			.to(ethers::types::H160::from(app_definition.0))
			.data(calldata);

		let raw_output = self
			.provider
			.call(&tx.into(), None)
			.await
			.map_err(|e| EngineError::ChainError(format!("eth_call to applyAction failed: {e}")))?;

		let decoded = function
			.decode_output(&raw_output)
			.map_err(|e| EngineError::ChainError(format!("decoding applyAction output: {e}")))?;

		match decoded.into_iter().next() {
			Some(Token::Bytes(bytes)) => Ok(bytes),
			_ => Err(EngineError::ChainError("applyAction returned an unexpected shape".into())),
		}
	}
}

impl EvmProvider for EthCallEvmProvider {
	/// `block_in_place` hands this worker thread's other tasks off to the
	/// rest of the (multi-threaded) runtime for the duration of the call,
	/// rather than blocking them — `Handle::block_on` alone panics when
	/// invoked from inside a runtime worker.
	fn apply_action(&self, app_definition: Address, state: &[u8], action: &[u8]) -> Result<Vec<u8>, EngineError> {
		let runtime = self.runtime.clone();
		tokio::task::block_in_place(|| runtime.block_on(self.call(app_definition, state, action)))
	}
}
