//! CloakChat wire protocol.
//!
//! Every message on the wire is a single newline-terminated UTF-8 JSON
//! object with three required keys: `version`, `type`, `timestamp`. The
//! broker routes these frames without ever decrypting their payloads.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod validate;

pub use codec::{FrameReader, ReadOutcome};
pub use envelope::{Frame, Payload, PromptAction, UserStatus};
pub use error::ProtoError;

/// Protocol version stamped into every frame.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default upper bound on a single frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Current wall-clock time as fractional UNIX seconds, the wire timestamp
/// format.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
