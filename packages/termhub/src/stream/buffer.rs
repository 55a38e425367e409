//! Bounded backlog for sessions without a live, focused delivery path.

use std::collections::VecDeque;

/// One decoded output chunk, tagged with the sequence number it was
/// assigned at production time. Eviction never renumbers chunks; the
/// resulting gaps are how clients detect loss.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedChunk {
    pub seq: u64,
    pub data: String,
}

/// FIFO ring bounded by both chunk count and total bytes. When either
/// limit is hit the oldest chunks are dropped first.
pub struct OutputBuffer {
    chunks: VecDeque<BufferedChunk>,
    bytes: usize,
    max_chunks: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_chunks,
            max_bytes,
        }
    }

    /// Append a chunk, evicting from the front as needed. Returns how
    /// many chunks were dropped to make room.
    pub fn push(&mut self, seq: u64, data: String) -> u64 {
        // A chunk larger than the byte budget can never be buffered.
        if data.len() > self.max_bytes {
            return 1;
        }

        self.bytes += data.len();
        self.chunks.push_back(BufferedChunk { seq, data });

        let mut dropped = 0;
        while self.chunks.len() > self.max_chunks || self.bytes > self.max_bytes {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.data.len();
                dropped += 1;
            } else {
                break;
            }
        }
        dropped
    }

    /// Take the whole backlog, oldest first.
    pub fn drain(&mut self) -> Vec<BufferedChunk> {
        self.bytes = 0;
        self.chunks.drain(..).collect()
    }

    /// Peek at the oldest chunk without removing it.
    pub fn front(&self) -> Option<&BufferedChunk> {
        self.chunks.front()
    }

    /// Remove and return the oldest chunk.
    pub fn pop_front(&mut self) -> Option<BufferedChunk> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.data.len();
        Some(chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserve_order() {
        let mut buf = OutputBuffer::new(10, 1024);
        buf.push(1, "a".to_string());
        buf.push(2, "b".to_string());
        buf.push(3, "c".to_string());

        let chunks = buf.drain();
        assert_eq!(
            chunks.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(buf.is_empty());
        assert_eq!(buf.byte_len(), 0);
    }

    #[test]
    fn chunk_cap_drops_oldest() {
        let mut buf = OutputBuffer::new(2, 1024);
        assert_eq!(buf.push(1, "a".to_string()), 0);
        assert_eq!(buf.push(2, "b".to_string()), 0);
        assert_eq!(buf.push(3, "c".to_string()), 1);

        let seqs: Vec<u64> = buf.drain().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn byte_cap_drops_oldest() {
        let mut buf = OutputBuffer::new(100, 10);
        assert_eq!(buf.push(1, "aaaa".to_string()), 0);
        assert_eq!(buf.push(2, "bbbb".to_string()), 0);
        // 12 bytes total; must drop seq 1 to get back under 10.
        assert_eq!(buf.push(3, "cccc".to_string()), 1);

        assert_eq!(buf.byte_len(), 8);
        let seqs: Vec<u64> = buf.drain().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn oversized_chunk_is_rejected_outright() {
        let mut buf = OutputBuffer::new(100, 10);
        buf.push(1, "ok".to_string());
        assert_eq!(buf.push(2, "x".repeat(11)), 1);

        // The existing backlog is untouched.
        let seqs: Vec<u64> = buf.drain().iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1]);
    }

    #[test]
    fn pop_front_tracks_bytes() {
        let mut buf = OutputBuffer::new(10, 1024);
        buf.push(1, "abcd".to_string());
        buf.push(2, "ef".to_string());
        assert_eq!(buf.front().unwrap().seq, 1);

        let first = buf.pop_front().unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(buf.byte_len(), 2);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn seq_gaps_survive_eviction() {
        let mut buf = OutputBuffer::new(2, 1024);
        buf.push(10, "a".to_string());
        buf.push(11, "b".to_string());
        buf.push(12, "c".to_string());

        // seq 10 is gone; 11 and 12 keep their original numbers.
        let chunks = buf.drain();
        assert_eq!(chunks[0].seq, 11);
        assert_eq!(chunks[1].seq, 12);
    }
}
