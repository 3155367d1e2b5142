//! # Framing
//!
//! Request/response correlation for the remote path. A `Call` carries a
//! sequence number chosen by the caller; the matching `Reply` echoes it.
//! Frames are JSON documents; the transport treats them as opaque bytes.

use serde::Deserialize;
use serde::Serialize;

use crate::envelope::Request;
use crate::envelope::Response;
use crate::error::Error;
use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case")]
pub enum Frame {
    Call { seq: u64, request: Request },
    Reply { seq: u64, response: Response },
}

impl Frame {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Call { seq, .. } | Self::Reply { seq, .. } => *seq,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Reads only the sequence number of a frame that may not fully decode,
/// so the receiver can still address an error reply.
pub fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let doc: serde_json::Value = serde_json::from_slice(bytes)?;
    doc.get("seq")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| Error::ProtocolViolation("frame has no sequence number".into()))
}
