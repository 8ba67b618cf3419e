use crate::messages::Status;

/// Errors surfaced to application callbacks and resource handlers.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoapError {
    /// Retransmission budget exhausted or the separate-response window elapsed.
    #[error("transmission timed out")]
    Timeout,
    /// Per-endpoint queue cap reached and the request was not force-admitted.
    #[error("too many requests queued for endpoint")]
    TooManyRequestsForEndpoint,
    /// Peer rejected or stopped answering an observed token.
    #[error("observation terminated")]
    ObservationTerminated,
    /// Peer answered a confirmable exchange with a reset.
    #[error("reset by peer")]
    Reset,
    /// A handler asked for a protocol-level error response.
    #[error("error response {0}")]
    Code(Status, Option<Vec<u8>>),
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(String),
    /// Terminal error delivered to every pending callback on endpoint stop.
    #[error("endpoint stopped")]
    Shutdown,
}

impl CoapError {
    pub fn code(status: Status) -> Self {
        CoapError::Code(status, None)
    }

    pub fn code_with_payload(status: Status, payload: impl Into<Vec<u8>>) -> Self {
        CoapError::Code(status, Some(payload.into()))
    }
}
