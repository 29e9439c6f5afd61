//! Length-field framing over the byte stream.
//!
//! The codec is a type-level capability set: `Connection` is generic
//! over a [`FramingCodec`] and monomorphizes the hot parse path. The
//! crate ships one concrete codec, [`FieldLenCodec`], whose 12-byte
//! header carries protocol, version, total length, sequence and
//! command fields in network byte order.

use crate::buffer::ByteBuffer;

/// Extracts and emits frames over a [`ByteBuffer`].
///
/// `peek_len` reports the total byte count (header included) the
/// current frame occupies, or `None` while the header itself is
/// incomplete. `read_frame` consumes exactly one complete frame from
/// the readable region, or nothing. `write_frame` serializes a frame
/// into one or more buffers appended to `out`; multiple buffers let
/// the send path gather-write a header and a large payload without
/// copying them together.
pub trait FramingCodec {
    type Frame;

    fn peek_len(buf: &ByteBuffer) -> Option<usize>;
    fn read_frame(buf: &mut ByteBuffer) -> Option<Self::Frame>;
    fn write_frame(frame: Self::Frame, out: &mut Vec<ByteBuffer>);
}

/// Wire payload kind carried in the header's proto field.
pub const PROTO_PROTOBUF: u8 = 0x10;
/// JSON payload marker.
pub const PROTO_JSON: u8 = 0x11;

/// Header size for [`FieldLenCodec`] frames.
pub const HEADER_LEN: usize = 12;

/// Largest payload a single frame can carry (the length field is u16
/// and counts the header).
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

/// Frame metadata: everything in the header except the length.
///
/// The command word packs a module id in the high 16 bits and the
/// per-module command in the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub proto: u8,
    pub version: u8,
    pub seq: u16,
    pub cmd: u32,
}

impl FrameInfo {
    pub fn new(proto: u8, version: u8, seq: u16, cmd: u32) -> Self {
        Self {
            proto,
            version,
            seq,
            cmd,
        }
    }

    /// Module id addressed by this frame.
    pub fn major_cmd(&self) -> u16 {
        (self.cmd >> 16) as u16
    }

    /// Command within the module.
    pub fn minor_cmd(&self) -> u16 {
        (self.cmd & 0xFFFF) as u16
    }
}

/// One decoded application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub info: FrameInfo,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame; payloads above [`MAX_PAYLOAD`] cannot be
    /// represented on the wire.
    pub fn new(info: FrameInfo, payload: Vec<u8>) -> Self {
        assert!(payload.len() <= MAX_PAYLOAD, "frame payload exceeds u16 length field");
        Self { info, payload }
    }
}

/// Generic length-field codec.
///
/// Header layout, network byte order:
///
/// ```text
/// offset 0  proto     u8
///        1  version   u8
///        2  length    u16   total bytes, header included
///        4  seq       u16
///        6  reserved  u16
///        8  cmd       u32
/// ```
pub struct FieldLenCodec;

impl FramingCodec for FieldLenCodec {
    type Frame = Frame;

    fn peek_len(buf: &ByteBuffer) -> Option<usize> {
        let readable = buf.readable();
        if readable.len() < HEADER_LEN {
            return None;
        }
        let total = u16::from_be_bytes([readable[2], readable[3]]) as usize;
        Some(total)
    }

    fn read_frame(buf: &mut ByteBuffer) -> Option<Frame> {
        let total = Self::peek_len(buf)?;
        if total < HEADER_LEN || buf.readable_len() < total {
            // runt length fields are unrecoverable mid-stream; they
            // surface as a stalled parse and the peer gets kicked by
            // the idle timer
            return None;
        }

        let readable = buf.readable();
        let info = FrameInfo {
            proto: readable[0],
            version: readable[1],
            seq: u16::from_be_bytes([readable[4], readable[5]]),
            cmd: u32::from_be_bytes([readable[8], readable[9], readable[10], readable[11]]),
        };
        let payload = readable[HEADER_LEN..total].to_vec();
        buf.mark_read(total);
        Some(Frame { info, payload })
    }

    fn write_frame(frame: Frame, out: &mut Vec<ByteBuffer>) {
        let total = HEADER_LEN + frame.payload.len();
        debug_assert!(total <= u16::MAX as usize);

        let mut header = [0u8; HEADER_LEN];
        header[0] = frame.info.proto;
        header[1] = frame.info.version;
        header[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        header[4..6].copy_from_slice(&frame.info.seq.to_be_bytes());
        header[8..12].copy_from_slice(&frame.info.cmd.to_be_bytes());

        out.push(ByteBuffer::from_slice(&header));
        if !frame.payload.is_empty() {
            out.push(ByteBuffer::from_vec(frame.payload));
        }
    }
}
