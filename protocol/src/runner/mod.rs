//! The protocol runner (spec §4.3, §9 design note): one [`stage::ProtocolStage`]
//! implementation per role per protocol, driven by a caller-supplied loop
//! that carries out each yielded [`opcode::Opcode`] and resumes the stage
//! with an [`opcode::OpcodeResult`]. No protocol here owns I/O, a signing
//! key, or a store handle directly — those live in the node crate's driver.

pub mod install;
pub mod opcode;
pub mod persist;
pub mod propose;
pub mod setup;
pub mod stage;
pub mod take_action;
pub mod uninstall;
pub mod update;

pub use opcode::{Opcode, OpcodeResult};
pub use persist::PersistWrite;
pub use stage::{ProtocolStage, StepOutcome};
