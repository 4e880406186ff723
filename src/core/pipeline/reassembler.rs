//! In-memory reassembly of an inbound file.
//!
//! The ordered channel delivers chunks in send order, so reassembly is plain
//! accumulation. Expected size and name come from the metadata frame;
//! everything observed is counted so a connection that dies early still
//! produces an accountable result.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::error::TransferError;
use crate::core::events::ReceivedFile;

#[derive(Debug, Default)]
pub struct Reassembler {
    file_name: Option<String>,
    announced: bool,
    expected: Option<u64>,
    fragments: Vec<Bytes>,
    received: u64,
    finalized: Option<ReceivedFile>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Early name from the offer payload. Display only; the metadata frame
    /// overrides it.
    pub fn hint_name(&mut self, name: String) {
        if !self.announced {
            self.file_name = Some(name);
        }
    }

    /// Record the metadata frame. A second frame on the same session is a
    /// peer bug and rejected.
    pub fn on_metadata(&mut self, name: String, size: u64) -> Result<(), TransferError> {
        if self.announced {
            return Err(TransferError::protocol("duplicate metadata frame"));
        }
        self.announced = true;
        self.file_name = Some(name);
        self.expected = Some(size);
        Ok(())
    }

    /// Append one binary chunk in arrival order.
    pub fn on_chunk(&mut self, chunk: Bytes) {
        if self.finalized.is_some() {
            warn!(
                event = "late_chunk_dropped",
                len = chunk.len(),
                "Chunk arrived after finalization"
            );
            return;
        }
        self.received += chunk.len() as u64;
        self.fragments.push(chunk);
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected
    }

    pub fn has_metadata(&self) -> bool {
        self.announced
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Assemble everything received so far into a [`ReceivedFile`].
    ///
    /// Idempotent: the first call concatenates and caches, later calls hand
    /// back the same file.
    pub fn finalize(&mut self) -> ReceivedFile {
        if let Some(file) = &self.finalized {
            return file.clone();
        }
        let mut buf = BytesMut::with_capacity(self.received as usize);
        for fragment in self.fragments.drain(..) {
            buf.extend_from_slice(&fragment);
        }
        let file = ReceivedFile {
            name: self.file_name.clone().unwrap_or_else(|| "file".to_string()),
            bytes: buf.freeze(),
            expected_size: self.expected,
        };
        debug!(
            event = "file_assembled",
            name = %file.name,
            received = file.len(),
            expected = ?file.expected_size,
            "Inbound file assembled"
        );
        self.finalized = Some(file.clone());
        file
    }
}
