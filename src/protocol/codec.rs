//! Primitive framing for the orchestrator protocol.
//!
//! Integers are fixed-width, big-endian and signed. Variable-length values are
//! sent as an `i32` length followed by that many bytes. Negative lengths are
//! never sizes: they are control codes ([`SpecialLength`]).

use crate::error::{Result, WorkerError};
use bytes::{BufMut, BytesMut};
use std::io::{self, Read, Write};

/// Reserved negative lengths used as in-band control codes.
///
/// The values come from the orchestrator's own protocol definition and must
/// match byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpecialLength {
    /// Ends the input data, and precedes the accumulator section of the output.
    EndOfDataSection = -1,
    /// Reserved by the orchestrator for remote exceptions; never emitted here.
    ExceptionThrown = -2,
    /// Precedes the timing block at the end of a task.
    TimingData = -3,
    /// Closes the termination handshake.
    EndOfStream = -4,
    /// A null value in place of a frame.
    Null = -5,
}

impl SpecialLength {
    /// Wire value of this control code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Classify a negative length, if it is a recognised control code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::EndOfDataSection),
            -2 => Some(Self::ExceptionThrown),
            -3 => Some(Self::TimingData),
            -4 => Some(Self::EndOfStream),
            -5 => Some(Self::Null),
            _ => None,
        }
    }
}

/// Split index sent by the orchestrator to make the worker exit immediately.
pub const ABORT_SPLIT_INDEX: i32 = -1;

/// One length-prefixed unit read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A genuine payload (possibly empty).
    Data(Vec<u8>),
    /// A control code in place of a length. No payload bytes were consumed.
    Control(SpecialLength),
}

fn map_eof(e: io::Error) -> WorkerError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        WorkerError::ConnectionClosed
    } else {
        WorkerError::Io(e)
    }
}

/// Reading side of the codec, implemented for every [`Read`].
pub trait ReadExt: Read {
    /// Read a big-endian `i32`.
    fn read_i32(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf).map_err(map_eof)?;
        Ok(i32::from_be_bytes(buf))
    }

    /// Read a big-endian `i64`.
    fn read_i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf).map_err(map_eof)?;
        Ok(i64::from_be_bytes(buf))
    }

    /// Read exactly `len` payload bytes.
    fn read_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).map_err(map_eof)?;
        Ok(payload)
    }

    /// Complete a frame whose length prefix has already been read.
    ///
    /// Recognised control codes short-circuit without touching the stream;
    /// any other negative length is a protocol violation.
    fn read_frame_body(&mut self, length: i32) -> Result<Frame> {
        if length >= 0 {
            return Ok(Frame::Data(self.read_payload(length as usize)?));
        }
        SpecialLength::from_code(length)
            .map(Frame::Control)
            .ok_or_else(|| WorkerError::protocol(format!("unexpected length: {}", length)))
    }

    /// Read a length prefix and its payload.
    fn read_frame(&mut self) -> Result<Frame> {
        let length = self.read_i32()?;
        self.read_frame_body(length)
    }

    /// Read a length-prefixed byte string; `NULL` maps to `None`.
    fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_frame()? {
            Frame::Data(payload) => Ok(Some(payload)),
            Frame::Control(SpecialLength::Null) => Ok(None),
            Frame::Control(other) => Err(WorkerError::protocol(format!(
                "expected a byte string, got control code {:?}",
                other
            ))),
        }
    }

    /// Read a length-prefixed UTF-8 string; `NULL` maps to `None`.
    fn read_string(&mut self) -> Result<Option<String>> {
        match self.read_bytes()? {
            Some(payload) => Ok(Some(String::from_utf8(payload)?)),
            None => Ok(None),
        }
    }

    /// Read a string field that the protocol never sends as `NULL`.
    fn read_required_string(&mut self, field: &str) -> Result<String> {
        self.read_string()?
            .ok_or_else(|| WorkerError::protocol(format!("{} must not be null", field)))
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

/// Writing side of the codec, implemented for every [`Write`].
pub trait WriteExt: Write {
    /// Write a big-endian `i32`.
    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Write a big-endian `i64`.
    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    /// Write a control code in place of a length.
    fn write_special(&mut self, code: SpecialLength) -> Result<()> {
        self.write_i32(code.code())
    }

    /// Write a length-prefixed byte string.
    fn write_bytes(&mut self, payload: &[u8]) -> Result<()> {
        let length =
            i32::try_from(payload.len()).map_err(|_| WorkerError::FrameTooLarge(payload.len()))?;
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_i32(length);
        buf.put_slice(payload);
        self.write_all(&buf)?;
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string.
    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }
}

impl<W: Write + ?Sized> WriteExt for W {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_integers_are_big_endian() {
        let mut out = Vec::new();
        out.write_i32(1).unwrap();
        out.write_i64(-2).unwrap();
        assert_eq!(&out[..4], &[0, 0, 0, 1]);
        assert_eq!(&out[4..], &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]);

        let mut input = Cursor::new(out);
        assert_eq!(input.read_i32().unwrap(), 1);
        assert_eq!(input.read_i64().unwrap(), -2);
    }

    #[test]
    fn test_frame_consumes_exactly_declared_length() {
        for len in [0usize, 1, 7, 300] {
            let mut wire = Vec::new();
            wire.write_bytes(&vec![0xab; len]).unwrap();
            wire.extend_from_slice(b"tail");

            let mut input = Cursor::new(wire);
            let frame = input.read_frame().unwrap();
            assert_eq!(frame, Frame::Data(vec![0xab; len]));
            assert_eq!(input.position() as usize, 4 + len);
        }
    }

    #[test]
    fn test_sentinels_consume_no_payload() {
        for code in [
            SpecialLength::EndOfDataSection,
            SpecialLength::TimingData,
            SpecialLength::EndOfStream,
            SpecialLength::Null,
        ] {
            let mut wire = Vec::new();
            wire.write_special(code).unwrap();
            wire.extend_from_slice(b"next");

            let mut input = Cursor::new(wire);
            assert_eq!(input.read_frame().unwrap(), Frame::Control(code));
            assert_eq!(input.position(), 4);
        }
    }

    #[test]
    fn test_unknown_negative_length_is_protocol_error() {
        let mut input = Cursor::new((-42i32).to_be_bytes().to_vec());
        let err = input.read_frame().unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }

    #[test]
    fn test_string_roundtrip_and_null() {
        let mut wire = Vec::new();
        wire.write_string("héllo").unwrap();
        wire.write_special(SpecialLength::Null).unwrap();

        let mut input = Cursor::new(wire);
        assert_eq!(input.read_string().unwrap(), Some("héllo".to_string()));
        assert_eq!(input.read_string().unwrap(), None);
    }

    #[test]
    fn test_required_string_rejects_null() {
        let mut input = Cursor::new(SpecialLength::Null.code().to_be_bytes().to_vec());
        assert!(input.read_required_string("version").is_err());
    }

    #[test]
    fn test_truncated_stream_is_connection_closed() {
        let mut input = Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            input.read_i32().unwrap_err(),
            WorkerError::ConnectionClosed
        ));

        let mut wire = Vec::new();
        wire.write_i32(10).unwrap();
        wire.extend_from_slice(b"short");
        let mut input = Cursor::new(wire);
        assert!(matches!(
            input.read_frame().unwrap_err(),
            WorkerError::ConnectionClosed
        ));
    }

    #[test]
    fn test_special_length_codes() {
        assert_eq!(SpecialLength::EndOfDataSection.code(), -1);
        assert_eq!(SpecialLength::TimingData.code(), -3);
        assert_eq!(SpecialLength::EndOfStream.code(), -4);
        assert_eq!(SpecialLength::Null.code(), -5);
        assert_eq!(SpecialLength::from_code(-4), Some(SpecialLength::EndOfStream));
        assert_eq!(SpecialLength::from_code(-9), None);
        assert_eq!(SpecialLength::from_code(0), None);
    }
}
