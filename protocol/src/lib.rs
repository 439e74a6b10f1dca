//! Core off-chain state-channel protocol engine: a deterministic,
//! message-driven state machine that two counterparties run over a multisig
//! escrow contract, producing bit-exact signed commitments (Setup, SetState,
//! ConditionalTransaction, Withdraw).
//!
//! This crate has no I/O of its own. Signing, transport, persistence, and
//! chain RPC are all injected by the caller (the `node` crate); everything
//! here is pure data and pure state transitions, driven by the opcode
//! suspension points in [`runner`].

pub mod app;
pub mod channel;
pub mod commitments;
pub mod crypto;
pub mod errors;
pub mod identifiers;
pub mod lock;
pub mod middleware;
pub mod runner;
pub mod store;
pub mod wire;

pub use errors::{EngineError, Result};
