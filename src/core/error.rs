//! Transfer error taxonomy.
//!
//! Every failure a session can hit maps onto exactly one variant, named for
//! the stage that produced it. Hosts receive these stringified through
//! `SessionMessage::Failed`; none of them triggers an automatic retry.

use thiserror::Error;

/// Classified failure raised by a transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The rendezvous store rejected an operation or delivered a malformed
    /// payload.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Offer/answer or ICE processing failed before the channel opened.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// The data channel closed, stalled, or refused a send mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// The local file could not be opened or read.
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),

    /// The peer violated the channel protocol, e.g. duplicate metadata or a
    /// close before any payload arrived.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransferError {
    pub(crate) fn signaling(msg: impl Into<String>) -> Self {
        Self::Signaling(msg.into())
    }

    pub(crate) fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(msg.into())
    }

    pub(crate) fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_name_the_stage() {
        assert_eq!(
            TransferError::signaling("offer slot occupied").to_string(),
            "signaling error: offer slot occupied"
        );
        assert_eq!(
            TransferError::transport("data channel closed").to_string(),
            "transport error: data channel closed"
        );
        assert_eq!(
            TransferError::protocol("duplicate metadata frame").to_string(),
            "protocol violation: duplicate metadata frame"
        );
    }

    #[test]
    fn io_errors_convert_into_read() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.bin");
        let err: TransferError = io.into();
        assert!(matches!(err, TransferError::Read(_)));
        assert!(err.to_string().starts_with("read error:"));
    }
}
