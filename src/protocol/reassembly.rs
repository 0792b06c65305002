//! Chunk reassembly for multi-datagram artifacts

use std::collections::BTreeMap;

/// Result of inserting one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// More chunks are needed
    Pending { received: usize, total: u32 },
    /// Every index in `0..total` is present; the buffer has been cleared
    Complete(Vec<u8>),
}

/// Index-keyed accumulator for one artifact at a time
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: BTreeMap<u32, Vec<u8>>,
    expected_total: Option<u32>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk; completes once `total` distinct indices are held.
    ///
    /// `index` must be below `total` (the decoder rejects anything else).
    /// A repeated index replaces the earlier payload. A chunk announcing a
    /// different `total` than the one being collected starts a new artifact.
    pub fn insert(&mut self, index: u32, total: u32, payload: Vec<u8>) -> InsertOutcome {
        debug_assert!(index < total);

        if self.expected_total.is_some_and(|t| t != total) {
            tracing::warn!(
                "Chunk total changed from {:?} to {}, discarding {} buffered chunks",
                self.expected_total,
                total,
                self.chunks.len()
            );
            self.clear();
        }
        self.expected_total = Some(total);

        if self.chunks.insert(index, payload).is_some() {
            tracing::debug!("Duplicate chunk {} overwrote earlier payload", index);
        }

        if self.chunks.len() == total as usize {
            let size = self.chunks.values().map(Vec::len).sum();
            let mut artifact = Vec::with_capacity(size);
            for chunk in self.chunks.values() {
                artifact.extend_from_slice(chunk);
            }
            self.clear();
            InsertOutcome::Complete(artifact)
        } else {
            InsertOutcome::Pending {
                received: self.chunks.len(),
                total,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn expected_total(&self) -> Option<u32> {
        self.expected_total
    }

    /// Indices below the expected total that have not arrived yet
    pub fn missing(&self) -> Vec<u32> {
        match self.expected_total {
            Some(total) => (0..total).filter(|i| !self.chunks.contains_key(i)).collect(),
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.expected_total = None;
    }
}
