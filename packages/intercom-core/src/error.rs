//! Centralized error types for the intercom core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Recoverable kinds (`Encode`, `Decode`, `Send`, `Recv`, `MalformedPacket`)
//! are absorbed where they occur and surface only as counters and log lines;
//! arbitration and upload kinds propagate to the initiating caller; the
//! bind/init kinds are fatal at startup.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the intercom hub.
#[derive(Debug, Error)]
pub enum IntercomError {
    /// Opus encoder/decoder state could not be created. Fatal at startup.
    #[error("Codec init failed: {0}")]
    CodecInit(String),

    /// A PCM frame failed to encode. Recoverable: emit silence, count.
    #[error("Encode failed: {0}")]
    Encode(String),

    /// An Opus payload failed to decode. Recoverable: emit silence, count.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Packet shorter than the header or longer than the cap.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A transport socket could not be bound. Fatal at startup.
    #[error("Transport bind failed: {0}")]
    TransportBind(#[source] std::io::Error),

    /// The multicast group join failed. Fatal at startup.
    #[error("Multicast group join failed: {0}")]
    GroupJoin(#[source] std::io::Error),

    /// A datagram send failed. Soft: log and continue.
    #[error("Send failed: {0}")]
    Send(#[source] std::io::Error),

    /// A datagram receive failed. Soft: log, continue, back off if sustained.
    #[error("Recv failed: {0}")]
    Recv(#[source] std::io::Error),

    /// The channel is held by a speaker of equal or higher priority.
    #[error("Channel busy: held by {0}")]
    ArbiterBusy(String),

    /// Do-not-disturb rejected a non-emergency admission.
    #[error("Channel unavailable: do not disturb")]
    ArbiterDnd,

    /// TTS synthesis or connection failed. The channel is not held.
    #[error("TTS unavailable: {0}")]
    TtsUnavailable(String),

    /// Uploaded file is not a 16 kHz mono 16-bit PCM WAV.
    #[error("Bad WAV: {0}")]
    BadWav(String),

    /// Uploaded file exceeds the size cap.
    #[error("Upload too large: {0} bytes")]
    TooLarge(usize),

    /// The chime name is reserved.
    #[error("Chime name is reserved: {0}")]
    ReservedName(String),

    /// No chime with that name exists.
    #[error("Chime not found: {0}")]
    NotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Server configuration error (missing or unresolvable settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorCode for IntercomError {
    fn code(&self) -> &'static str {
        match self {
            Self::CodecInit(_) => "codec_init_failed",
            Self::Encode(_) => "encode_failed",
            Self::Decode(_) => "decode_failed",
            Self::MalformedPacket(_) => "malformed_packet",
            Self::TransportBind(_) => "transport_bind_failed",
            Self::GroupJoin(_) => "group_join_failed",
            Self::Send(_) => "send_failed",
            Self::Recv(_) => "recv_failed",
            Self::ArbiterBusy(_) => "busy",
            Self::ArbiterDnd => "dnd",
            Self::TtsUnavailable(_) => "tts_unavailable",
            Self::BadWav(_) => "bad_wav",
            Self::TooLarge(_) => "too_large",
            Self::ReservedName(_) => "reserved_name",
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntercomError {
    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadWav(_) | Self::MalformedPacket(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ReservedName(_) => StatusCode::FORBIDDEN,
            Self::ArbiterBusy(_) | Self::ArbiterDnd => StatusCode::CONFLICT,
            Self::TtsUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this kind must abort startup rather than be absorbed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CodecInit(_)
                | Self::TransportBind(_)
                | Self::GroupJoin(_)
                | Self::Configuration(_)
        )
    }
}

/// Convenient Result alias for application-wide operations.
pub type IntercomResult<T> = Result<T, IntercomError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for IntercomError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arbiter_errors_map_to_conflict() {
        assert_eq!(
            IntercomError::ArbiterBusy("node 0011aabbccdd0102".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(IntercomError::ArbiterDnd.code(), "dnd");
    }

    #[test]
    fn upload_errors_carry_their_codes() {
        assert_eq!(IntercomError::TooLarge(6_000_000).code(), "too_large");
        assert_eq!(
            IntercomError::ReservedName("doorbell".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            IntercomError::NotFound("gong".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn bind_kinds_are_fatal_send_kinds_are_not() {
        let bind = IntercomError::TransportBind(std::io::Error::other("in use"));
        let send = IntercomError::Send(std::io::Error::other("unreachable"));
        assert!(bind.is_fatal());
        assert!(!send.is_fatal());
    }
}
