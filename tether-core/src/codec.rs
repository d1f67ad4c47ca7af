//! Text codec between [`Envelope`]s and transport frames.

use crate::error::TetherError;
use crate::message::{Envelope, Inbound};

/// Largest frame accepted in either direction (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode an outbound envelope as a JSON text frame.
pub fn encode(envelope: &Envelope) -> Result<String, TetherError> {
    let text = serde_json::to_string(envelope)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(TetherError::Send(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            text.len()
        )));
    }
    Ok(text)
}

/// Decode an inbound text frame into a typed [`Inbound`].
pub fn decode(frame: &str) -> Result<Inbound, TetherError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TetherError::Protocol(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    let envelope: Envelope = serde_json::from_str(frame)?;
    Inbound::try_from(envelope)
}
