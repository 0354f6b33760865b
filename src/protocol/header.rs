//! Per-frame header.

use serde::{Deserialize, Serialize};

/// Metadata preceding every body on the wire, in both directions.
///
/// Requests carry the target `Service.Method` and the caller's sequence
/// number. Responses echo both back; a non-empty `error` marks a failed call
/// and its body is the "invalid body" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target in `Service.Method` form.
    pub service_method: String,
    /// Client-assigned sequence number, echoed back in the response.
    pub seq: u64,
    /// Error text; empty means success.
    #[serde(default)]
    pub error: String,
}

impl Header {
    /// Header for an outgoing request.
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// Successful response header for this request.
    pub fn reply(&self) -> Self {
        Self {
            service_method: self.service_method.clone(),
            seq: self.seq,
            error: String::new(),
        }
    }

    /// Failed response header for this request.
    pub fn reply_error(&self, error: impl ToString) -> Self {
        Self {
            service_method: self.service_method.clone(),
            seq: self.seq,
            error: error.to_string(),
        }
    }

    /// Whether the header reports a failed call.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
