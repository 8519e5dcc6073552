//! Splitting and rebuilding routed multipart messages.
//!
//! An envelope is a stack of identity frames, each optionally followed by an
//! empty delimiter, in front of the body.

use bytes::Bytes;
use simac_frame::Multipart;

use crate::error::{MacError, Result};

/// Sent once by a backend right after it connects.
pub const BACKEND_READY: &[u8] = b"\x01";

/// Delivered by the broker to ask a backend to leave its serve loop.
pub const BACKEND_SHUTDOWN: &[u8] = b"\x02";

/// Pop the first frame as `head`, plus the empty delimiter right after it
/// if there is one. The rest is returned as `tail`, possibly empty.
pub fn unwrap(mut frames: Multipart) -> Result<(Bytes, Multipart)> {
    if frames.is_empty() {
        return Err(MacError::EmptyEnvelope);
    }
    let head = frames.remove(0);
    if frames.first().is_some_and(Bytes::is_empty) {
        frames.remove(0);
    }
    Ok((head, frames))
}

/// Push `head` and an empty delimiter in front of `tail`.
pub fn wrap(head: Bytes, tail: Multipart) -> Multipart {
    let mut frames = Multipart::with_capacity(tail.len() + 2);
    frames.push(head);
    frames.push(Bytes::new());
    frames.extend(tail);
    frames
}

/// Whether a message body is exactly the one-frame readiness sentinel.
pub fn is_ready(body: &[Bytes]) -> bool {
    matches!(body, [only] if only.as_ref() == BACKEND_READY)
}

/// Whether a message body is exactly the one-frame shutdown sentinel.
pub fn is_shutdown(body: &[Bytes]) -> bool {
    matches!(body, [only] if only.as_ref() == BACKEND_SHUTDOWN)
}
