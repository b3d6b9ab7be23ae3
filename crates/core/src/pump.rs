//! Length-prefixed, typed message stream.
//!
//! Wire format (big-endian):
//!
//! ```text
//! +----------+--------+------------------+
//! | length   | type   | payload          |
//! | 4 bytes  | 2 bytes| `length` bytes   |
//! +----------+--------+------------------+
//! ```
//!
//! Order is preserved per direction and partial reads are reassembled
//! transparently. Between a `StartCompression` and a `StopCompression`
//! control frame every payload travels as one zstd frame; the control
//! frames themselves stay uncompressed so the two sides can always resync.

use std::io::{Read, Write};

use crate::error::{Error, ErrorKind, Result};

/// Frame-type registry for the one-shot sync protocol and the control range
pub mod frame_type {
    pub const HANDSHAKE: u16 = 1;
    pub const FILE_INFO: u16 = 2;
    pub const DIR_INFO: u16 = 3;
    pub const DONE_ENUM: u16 = 4;
    pub const FILE_STATS: u16 = 5;
    pub const DELETED_PATHS: u16 = 6;
    pub const MISSING_INDICES: u16 = 7;
    pub const CHANGED_INDICES: u16 = 8;
    pub const FILE_DATA: u16 = 9;
    pub const SIGNATURES: u16 = 10;
    pub const DELTA: u16 = 11;
    pub const END_FILE: u16 = 12;
    pub const SUMMARY: u16 = 13;

    pub const START_COMPRESSION: u16 = 100;
    pub const STOP_COMPRESSION: u16 = 101;

    /// Error reply carrying an [`ErrorKind`](crate::ErrorKind) tag and message
    pub const ERROR: u16 = 0;
}

/// Frames larger than this are rejected as corrupt
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// One received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: u16,
    pub payload: Vec<u8>,
}

/// Typed, ordered message stream over any `Read + Write` transport
pub struct MessagePump<S> {
    stream: S,
    /// zstd level while the outbound compression window is open
    write_level: Option<i32>,
    /// whether the inbound stream is inside a compression window
    read_compressed: bool,
}

impl<S: Read + Write> MessagePump<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            write_level: None,
            read_compressed: false,
        }
    }

    /// Send one frame
    ///
    /// # Errors
    /// Propagates transport and compression failures
    pub fn send(&mut self, ty: u16, payload: &[u8]) -> Result<()> {
        let compressed;
        let body = match self.write_level {
            Some(level) if !is_control(ty) => {
                compressed = zstd::encode_all(payload, level)
                    .map_err(|e| Error::internal("zstd encode").with_source(e))?;
                &compressed[..]
            }
            _ => payload,
        };
        if body.len() as u64 > u64::from(MAX_FRAME_LEN) {
            return Err(Error::invalid_argument("frame too large"));
        }
        self.stream.write_all(&(body.len() as u32).to_be_bytes())?;
        self.stream.write_all(&ty.to_be_bytes())?;
        self.stream.write_all(body)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive the next frame. Compression-window control frames are applied
    /// and returned, so callers can observe phase changes.
    ///
    /// # Errors
    /// Returns `Aborted` on a truncated stream
    pub fn recv(&mut self) -> Result<Frame> {
        let mut header = [0u8; 6];
        self.stream.read_exact(&mut header)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let ty = u16::from_be_bytes([header[4], header[5]]);
        if len > MAX_FRAME_LEN {
            return Err(Error::aborted(format!("oversized frame ({len} bytes)")));
        }

        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload)?;

        match ty {
            frame_type::START_COMPRESSION => self.read_compressed = true,
            frame_type::STOP_COMPRESSION => self.read_compressed = false,
            _ if self.read_compressed => {
                payload = zstd::decode_all(&payload[..])
                    .map_err(|e| Error::aborted("zstd decode").with_source(e))?;
            }
            _ => {}
        }
        Ok(Frame { ty, payload })
    }

    /// Receive a frame, insisting on one specific type. Compression-window
    /// control frames are applied and skipped.
    ///
    /// # Errors
    /// Returns `Aborted` on a type mismatch; decodes a peer `ERROR` frame
    /// into its carried error
    pub fn expect(&mut self, ty: u16) -> Result<Vec<u8>> {
        loop {
            let frame = self.recv()?;
            if is_control(frame.ty) {
                continue;
            }
            if frame.ty == frame_type::ERROR {
                return Err(decode_error(&frame.payload));
            }
            if frame.ty != ty {
                return Err(Error::aborted(format!(
                    "expected frame type {ty}, got {}",
                    frame.ty
                )));
            }
            return Ok(frame.payload);
        }
    }

    /// Open the outbound compression window
    ///
    /// # Errors
    /// Propagates transport failures
    pub fn start_compression(&mut self, level: i32) -> Result<()> {
        self.send(frame_type::START_COMPRESSION, &[])?;
        self.write_level = Some(level);
        Ok(())
    }

    /// Close the outbound compression window
    ///
    /// # Errors
    /// Propagates transport failures
    pub fn stop_compression(&mut self) -> Result<()> {
        self.write_level = None;
        self.send(frame_type::STOP_COMPRESSION, &[])
    }

    /// Send an error reply
    ///
    /// # Errors
    /// Propagates transport failures
    pub fn send_error(&mut self, err: &Error) -> Result<()> {
        let mut payload = vec![err.kind().to_wire()];
        payload.extend_from_slice(err.message().as_bytes());
        self.send(frame_type::ERROR, &payload)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

fn is_control(ty: u16) -> bool {
    matches!(
        ty,
        frame_type::START_COMPRESSION | frame_type::STOP_COMPRESSION
    )
}

/// Decode a peer error frame
#[must_use]
pub fn decode_error(payload: &[u8]) -> Error {
    match payload.split_first() {
        Some((tag, message)) => Error::new(
            ErrorKind::from_wire(*tag),
            String::from_utf8_lossy(message).into_owned(),
        ),
        None => Error::internal("empty error frame"),
    }
}
