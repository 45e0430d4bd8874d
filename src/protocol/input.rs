//! Lazy input sequence handed to task functions.

use crate::error::{Result, WorkerError};
use crate::protocol::codec::{Frame, ReadExt, SpecialLength};
use crate::protocol::serde_mode::{Item, SerializedMode, decode_frame};
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::Read;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Single-pass iterator over the input frames of one task.
///
/// Each refill reads one frame from the live connection; a `Row` frame may
/// expand into several items, all yielded before the next read. The sequence
/// ends at `END_OF_DATA_SECTION` and cannot be restarted.
pub struct InputSequence<'a> {
    reader: &'a mut dyn Read,
    mode: SerializedMode,
    pending: VecDeque<Item>,
    stats: Rc<Cell<InputStats>>,
}

/// Counters collected while the sequence is consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    pub frames: usize,
    pub items: usize,
    pub read_time: Duration,
    pub finished: bool,
}

impl<'a> InputSequence<'a> {
    pub fn new(reader: &'a mut dyn Read, mode: SerializedMode) -> Self {
        Self {
            reader,
            mode,
            pending: VecDeque::new(),
            stats: Rc::new(Cell::new(InputStats::default())),
        }
    }

    pub fn stats(&self) -> InputStats {
        self.stats.get()
    }

    /// Shared view of the counters that outlives the sequence itself, which
    /// is moved into the task function.
    pub fn stats_handle(&self) -> Rc<Cell<InputStats>> {
        Rc::clone(&self.stats)
    }

    fn update_stats(&self, f: impl FnOnce(&mut InputStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Read the next frame into the pending buffer.
    ///
    /// Returns `false` once the end-of-data marker has been seen.
    fn refill(&mut self) -> Result<bool> {
        let started = Instant::now();
        let result = self.read_next_frame();
        let elapsed = started.elapsed();
        self.update_stats(|s| s.read_time += elapsed);
        result
    }

    fn read_next_frame(&mut self) -> Result<bool> {
        let first = match self.reader.read_frame()? {
            Frame::Data(payload) => Some(payload),
            Frame::Control(SpecialLength::Null) => None,
            Frame::Control(SpecialLength::EndOfDataSection) => {
                let stats = self.stats();
                debug!(
                    frames = stats.frames,
                    items = stats.items,
                    "END_OF_DATA_SECTION"
                );
                return Ok(false);
            }
            Frame::Control(other) => {
                return Err(WorkerError::protocol(format!(
                    "unexpected message length: {}",
                    other.code()
                )));
            }
        };

        let items = decode_frame(self.mode, first, &mut *self.reader)?;
        self.update_stats(|s| s.frames += 1);
        self.pending.extend(items);
        Ok(true)
    }
}

impl Iterator for InputSequence<'_> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                self.update_stats(|s| s.items += 1);
                return Some(Ok(item));
            }
            if self.stats().finished {
                return None;
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => {
                    self.update_stats(|s| s.finished = true);
                    return None;
                }
                Err(e) => {
                    // Stream is no longer in sync; nothing after this is readable.
                    self.update_stats(|s| s.finished = true);
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::WriteExt;
    use std::io::Cursor;

    #[test]
    fn test_string_frames_with_null() {
        let mut wire = Vec::new();
        wire.write_string("a").unwrap();
        wire.write_special(SpecialLength::Null).unwrap();
        wire.write_special(SpecialLength::EndOfDataSection).unwrap();
        wire.extend_from_slice(b"not input");

        let mut reader = Cursor::new(wire);
        let mut seq = InputSequence::new(&mut reader, SerializedMode::String);
        let items: Vec<Item> = seq.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(items, vec![Item::Text("a".into()), Item::Null]);

        let stats = seq.stats();
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.items, 2);
        assert!(stats.finished);
        drop(seq);

        // The sentinel is consumed, the bytes after it are not.
        assert_eq!(reader.position(), 4 + 1 + 4 + 4);
    }

    #[test]
    fn test_sequence_is_fused_after_end() {
        let mut wire = Vec::new();
        wire.write_special(SpecialLength::EndOfDataSection).unwrap();
        let mut reader = Cursor::new(wire);
        let mut seq = InputSequence::new(&mut reader, SerializedMode::None);
        assert!(seq.next().is_none());
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_unrecognised_sentinel_is_fatal() {
        let mut wire = Vec::new();
        wire.write_bytes(b"ok").unwrap();
        wire.write_special(SpecialLength::TimingData).unwrap();
        let mut reader = Cursor::new(wire);
        let mut seq = InputSequence::new(&mut reader, SerializedMode::None);

        assert_eq!(seq.next().unwrap().unwrap(), Item::Bytes(b"ok".to_vec()));
        let err = seq.next().unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_pairs_read_two_frames_each() {
        let mut wire = Vec::new();
        wire.write_bytes(b"k1").unwrap();
        wire.write_bytes(b"v1").unwrap();
        wire.write_special(SpecialLength::Null).unwrap();
        wire.write_bytes(b"v2").unwrap();
        wire.write_special(SpecialLength::EndOfDataSection).unwrap();

        let mut reader = Cursor::new(wire);
        let items: Vec<Item> = InputSequence::new(&mut reader, SerializedMode::Pair)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            items,
            vec![
                Item::Pair {
                    key: Some(b"k1".to_vec()),
                    value: Some(b"v1".to_vec())
                },
                Item::Pair {
                    key: None,
                    value: Some(b"v2".to_vec())
                },
            ]
        );
    }

    #[test]
    fn test_rows_yielded_before_next_read() {
        let batch = serde_pickle::Value::List(vec![
            serde_pickle::Value::I64(1),
            serde_pickle::Value::I64(2),
        ]);
        let payload =
            serde_pickle::value_to_vec(&batch, serde_pickle::SerOptions::new()).unwrap();

        let mut wire = Vec::new();
        wire.write_bytes(&payload).unwrap();
        // A truncated second frame: reading it would fail.
        wire.write_i32(100).unwrap();

        let mut reader = Cursor::new(wire);
        let mut seq = InputSequence::new(&mut reader, SerializedMode::Row);
        assert!(seq.next().unwrap().is_ok());
        assert!(seq.next().unwrap().is_ok());
        assert_eq!(seq.stats().frames, 1);
        assert!(seq.next().unwrap().is_err());
    }

    #[test]
    fn test_eof_before_end_marker() {
        let mut wire = Vec::new();
        wire.write_string("a").unwrap();
        let mut reader = Cursor::new(wire);
        let mut seq = InputSequence::new(&mut reader, SerializedMode::String);
        assert!(seq.next().unwrap().is_ok());
        assert!(matches!(
            seq.next().unwrap().unwrap_err(),
            WorkerError::ConnectionClosed
        ));
    }
}
