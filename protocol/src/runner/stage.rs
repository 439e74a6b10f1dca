//! The `ProtocolStage` state machine (spec §9 design note): a stage is
//! driven by `init`, then resumed with the result of whatever opcode it
//! last yielded, until it reports `Done` or `Fail`.

use super::opcode::{Opcode, OpcodeResult};
use crate::errors::EngineError;

/// What a stage reports after `init` or `resume`: either one more opcode to
/// carry out, or a terminal result. There is no variant chaining one stage
/// into the next — each of the six protocols here is exactly two rounds
/// (spec §4.3), so a single stage object models the whole run instead of a
/// chain of stages.
pub enum StepOutcome<Output> {
	Yield(Opcode),
	Done(Output),
	Fail(EngineError),
}

/// One full protocol run (Initiator or Responder side of Setup, Propose,
/// Install, Update, TakeAction, or Uninstall). Implementations are pure
/// state machines: no I/O, no signing key, no store handle — the driver
/// (`node::engine::run_protocol`) supplies everything an opcode needs and
/// feeds the result back via `resume`.
pub trait ProtocolStage {
	type Output;

	fn init(&mut self) -> StepOutcome<Self::Output>;
	fn resume(&mut self, result: OpcodeResult) -> StepOutcome<Self::Output>;
}
