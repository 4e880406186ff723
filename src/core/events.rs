//! Messages from transfer sessions to the hosting application.
//!
//! Sessions never touch a UI or a filesystem sink directly. Everything the
//! host needs to render, and the assembled file itself, flows through one
//! unbounded channel of [`SessionMessage`] values.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Which side of the transfer a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Notification emitted by a session for the hosting application.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// Human-readable phase description, e.g. "Looking for offer...".
    Status(String),
    /// Whole-percent progress, monotonic per session, floor semantics.
    Progress { role: Role, percent: u8 },
    /// Terminal success. Receivers carry the assembled file, senders `None`.
    Completed {
        role: Role,
        received: Option<ReceivedFile>,
    },
    /// Terminal failure with a classified reason string.
    Failed { role: Role, reason: String },
}

/// A fully reassembled inbound file, handed to the host on completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    /// Name announced by the peer, unsanitized.
    pub name: String,
    /// Payload bytes in arrival order.
    pub bytes: Bytes,
    /// Size declared in the metadata frame, if one arrived.
    pub expected_size: Option<u64>,
}

impl ReceivedFile {
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether every declared byte arrived. `false` when the declared size is
    /// unknown, so truncation is never reported as success silently.
    pub fn is_complete(&self) -> bool {
        self.expected_size
            .map_or(false, |expected| expected == self.len())
    }

    /// Peer-announced name reduced to a safe single path component.
    ///
    /// Strips directory separators, drops characters outside a conservative
    /// allowlist, and falls back to `"file"` when nothing survives.
    pub fn sanitized_name(&self) -> String {
        let base = self.name.rsplit(['/', '\\']).next().unwrap_or("");
        let clean: String = base
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        let clean = clean.trim().trim_matches('.');
        if clean.is_empty() {
            "file".to_string()
        } else {
            clean.to_string()
        }
    }
}

/// Channel over which a session reports to its host.
pub(crate) type HostSender = mpsc::UnboundedSender<SessionMessage>;

/// Forward a message to the host, ignoring a receiver that already hung up.
#[inline]
pub(crate) fn notify_host(tx: &HostSender, msg: SessionMessage) {
    let _ = tx.send(msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, payload: &[u8], expected: Option<u64>) -> ReceivedFile {
        ReceivedFile {
            name: name.to_string(),
            bytes: Bytes::copy_from_slice(payload),
            expected_size: expected,
        }
    }

    #[test]
    fn complete_only_when_declared_size_matches() {
        assert!(file("a.bin", b"12345", Some(5)).is_complete());
        assert!(!file("a.bin", b"123", Some(5)).is_complete());
        assert!(!file("a.bin", b"12345", None).is_complete());
        assert!(file("empty.bin", b"", Some(0)).is_complete());
    }

    #[test]
    fn sanitized_name_keeps_ordinary_names() {
        assert_eq!(file("report.pdf", b"", None).sanitized_name(), "report.pdf");
        assert_eq!(
            file("holiday photo-2.jpg", b"", None).sanitized_name(),
            "holiday photo-2.jpg"
        );
    }

    #[test]
    fn sanitized_name_strips_directory_components() {
        assert_eq!(
            file("../../etc/passwd", b"", None).sanitized_name(),
            "passwd"
        );
        assert_eq!(
            file("C:\\Users\\x\\doc.txt", b"", None).sanitized_name(),
            "doc.txt"
        );
    }

    #[test]
    fn sanitized_name_rejects_dot_only_and_empty_names() {
        assert_eq!(file("..", b"", None).sanitized_name(), "file");
        assert_eq!(file("", b"", None).sanitized_name(), "file");
        assert_eq!(file("///", b"", None).sanitized_name(), "file");
    }

    #[test]
    fn sanitized_name_drops_control_and_shell_characters() {
        assert_eq!(
            file("we$ird;na|me\0.bin", b"", None).sanitized_name(),
            "weirdname.bin"
        );
    }
}
