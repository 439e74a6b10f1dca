//! The peer wire message envelope (spec §6): opaque to the bus, meaningful
//! to the protocol runner. Transport (subjects, JSON encoding, the bus
//! itself) is a node-crate concern; this crate only defines the shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{crypto::Signature, middleware::ProtocolName};

/// Correlates every request/response pair within one protocol run. The
/// engine does not rely on transport ordering beyond matching replies to
/// their request by this id (spec §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomData {
	pub signature: Option<Signature>,
	/// A second signature carried alongside `signature` for protocols that
	/// bundle two digests into one wire round (Setup signs both the
	/// multisig Setup commitment and the initial free-balance SetState
	/// commitment in the same message exchange).
	pub free_balance_signature: Option<Signature>,
}

impl Serialize for Signature {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		let bytes = self.to_bytes();
		serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
	}
}

impl<'de> Deserialize<'de> for Signature {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		use serde::de::Error;
		let raw = String::deserialize(deserializer)?;
		let trimmed = raw.strip_prefix("0x").unwrap_or(&raw);
		let bytes = hex::decode(trimmed).map_err(D::Error::custom)?;
		if bytes.len() != 65 {
			return Err(D::Error::custom("signature must be 65 bytes"));
		}
		let mut r = [0u8; 32];
		let mut s = [0u8; 32];
		r.copy_from_slice(&bytes[..32]);
		s.copy_from_slice(&bytes[32..64]);
		Ok(Signature { r, s, v: bytes[64] })
	}
}

/// `{ processID, protocol, seq, toIdentifier, fromIdentifier, params,
/// customData, prevMessageReceived }` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub process_id: ProcessId,
	pub protocol: ProtocolName,
	pub seq: u32,
	pub to_identifier: String,
	pub from_identifier: String,
	pub params: Value,
	pub custom_data: CustomData,
	pub prev_message_received: Option<u64>,
}

impl Serialize for ProtocolName {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		let name = match self {
			ProtocolName::Setup => "Setup",
			ProtocolName::Propose => "Propose",
			ProtocolName::Install => "Install",
			ProtocolName::Update => "Update",
			ProtocolName::TakeAction => "TakeAction",
			ProtocolName::Uninstall => "Uninstall",
		};
		serializer.serialize_str(name)
	}
}

impl<'de> Deserialize<'de> for ProtocolName {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		use serde::de::Error;
		let raw = String::deserialize(deserializer)?;
		match raw.as_str() {
			"Setup" => Ok(ProtocolName::Setup),
			"Propose" => Ok(ProtocolName::Propose),
			"Install" => Ok(ProtocolName::Install),
			"Update" => Ok(ProtocolName::Update),
			"TakeAction" => Ok(ProtocolName::TakeAction),
			"Uninstall" => Ok(ProtocolName::Uninstall),
			other => Err(D::Error::custom(format!("unknown protocol name {other}"))),
		}
	}
}
