//! Control frames exchanged as text messages on the data channel.
//!
//! The channel carries two kinds of traffic: JSON text frames for control
//! and raw binary frames for file chunks. Control is deliberately tiny, one
//! announcement up front and one terminal marker at the end.

use serde::{Deserialize, Serialize};

use crate::core::error::TransferError;

/// A JSON control frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// First frame on the channel: what is about to arrive.
    #[serde(rename = "metadata")]
    Metadata { name: String, size: u64 },
    /// Last frame on the channel: everything before it is the whole file.
    #[serde(rename = "EOF")]
    Eof,
}

pub fn encode(msg: &ControlMessage) -> Result<String, TransferError> {
    serde_json::to_string(msg)
        .map_err(|e| TransferError::protocol(format!("control frame encoding failed: {e}")))
}

/// Tolerant decode: `None` for text that is not a recognized control frame.
/// Peers only ever send the two frames above, so anything else is noise to
/// skip, not a reason to kill the session.
pub fn decode(text: &str) -> Option<ControlMessage> {
    serde_json::from_str(text).ok()
}
