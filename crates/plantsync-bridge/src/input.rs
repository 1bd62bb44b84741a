//! Newline-delimited JSON input used in place of a broker consumer
//!
//! Each line carries one message:
//!
//! ```json
//! {"kind": "shift_add",
//!  "asset": {"customer": "acme", "location": "plant-1", "equipment": "press-7"},
//!  "payload": {"startTimeUnixMs": 1000, "endTimeUnixMs": 2000}}
//! ```

use plantsync_common::{AssetIdentity, MessageKind};
use serde::Deserialize;
use thiserror::Error;

use crate::messages::RawMessage;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("malformed input line: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    UnknownKind(#[from] plantsync_common::CommonError),
}

#[derive(Debug, Deserialize)]
struct InputLine {
    kind: String,
    asset: AssetIdentity,
    payload: serde_json::Value,
}

/// Parse one line into a raw message. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<RawMessage>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: InputLine = serde_json::from_str(line)?;
    let kind: MessageKind = parsed.kind.parse()?;
    let payload = serde_json::to_vec(&parsed.payload)?;

    Ok(Some(RawMessage::new(kind, parsed.asset, payload)))
}
