//! The five opcodes a [`super::stage::ProtocolStage`] may yield (spec §4.3)
//! and the results the driver resumes it with. Suspension points are
//! exactly `OP_SIGN`, `OP_VALIDATE`, `IO_SEND`, `IO_SEND_AND_WAIT`, and
//! `PERSIST` — nothing else pauses a protocol run.

use crate::{
	crypto::Signature,
	middleware::{RejectReason, ValidationContext},
	wire::Envelope,
};

/// An instruction yielded by a stage for the driver to carry out. The
/// protocol crate never executes these itself — it has no I/O, no signing
/// key, no store handle — it only describes what must happen next.
#[derive(Debug, Clone)]
pub enum Opcode {
	/// Sign with the local participant's key; the driver returns a
	/// [`OpcodeResult::Signed`].
	Sign { digest: [u8; 32] },
	/// Invoke application-supplied validation; the driver returns
	/// [`OpcodeResult::Validated`].
	Validate { ctx: ValidationContext },
	/// Fire-and-forget send to the peer named in the envelope.
	Send { envelope: Envelope },
	/// Send and suspend until a reply with matching `process_id` arrives, or
	/// the engine-level timeout fires.
	SendAndWait { envelope: Envelope },
	/// Atomically persist the given write; the driver's concrete payload
	/// lives outside this crate (it would otherwise require the protocol
	/// crate to know about `Store`'s associated record types directly).
	/// Instead each stage emits a [`crate::runner::persist::PersistWrite`]
	/// describing what to write, which the driver translates into `Store`
	/// calls.
	Persist { write: crate::runner::persist::PersistWrite },
}

/// What the driver resumes a stage with after carrying out an [`Opcode`].
#[derive(Debug, Clone)]
pub enum OpcodeResult {
	Signed(Signature),
	Validated(Option<RejectReason>),
	Sent,
	Received(Envelope),
	/// `IO_SEND_AND_WAIT` timed out before a matching reply arrived.
	TimedOut,
	Persisted,
	PersistFailed(String),
}
