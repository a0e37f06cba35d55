//! The framed tlog wire protocol.
//!
//! Every message travels in a 4-byte big-endian length-prefixed frame. A
//! connection starts with one [HandshakeRequest]/[HandshakeResponse]
//! exchange; afterwards the client streams [Block]s and the server streams
//! [Response]s. Input limits are enforced at decode time: a frame is
//! rejected before any of its contents are interpreted.

use crate::{Digest, Error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use commonware_codec::{
    varint::UInt, DecodeExt, Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write,
};
use commonware_runtime::{Sink, Stream};

/// The current protocol version.
pub const VERSION: u32 = 1;

/// The oldest version this implementation still speaks.
pub const MIN_VERSION: u32 = 1;

/// Ceiling on any single frame.
pub const MAX_MESSAGE_SIZE: usize = 4 << 20;

/// Longest accepted vdisk identifier.
const MAX_VDISK_LEN: usize = 256;

/// The outcome of a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    Ok,
    InvalidRequest,
    InvalidVersion,
    InvalidVdisk,
    Internal,
}

impl HandshakeStatus {
    fn to_i8(self) -> i8 {
        match self {
            Self::Ok => 0,
            Self::InvalidRequest => -1,
            Self::InvalidVersion => -2,
            Self::InvalidVdisk => -3,
            Self::Internal => -4,
        }
    }

    fn from_i8(raw: i8) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(Self::Ok),
            -1 => Ok(Self::InvalidRequest),
            -2 => Ok(Self::InvalidVersion),
            -3 => Ok(Self::InvalidVdisk),
            -4 => Ok(Self::Internal),
            _ => Err(CodecError::Invalid("tlog::HandshakeStatus", "unknown value")),
        }
    }
}

/// The status of one or more received blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    RecvOk,
    FlushOk,
    RecvFailed,
    FlushFailed,
    Disconnected,
}

impl BlockStatus {
    fn to_i8(self) -> i8 {
        match self {
            Self::RecvOk => 1,
            Self::FlushOk => 2,
            Self::RecvFailed => -1,
            Self::FlushFailed => -2,
            Self::Disconnected => -3,
        }
    }

    fn from_i8(raw: i8) -> Result<Self, CodecError> {
        match raw {
            1 => Ok(Self::RecvOk),
            2 => Ok(Self::FlushOk),
            -1 => Ok(Self::RecvFailed),
            -2 => Ok(Self::FlushFailed),
            -3 => Ok(Self::Disconnected),
            _ => Err(CodecError::Invalid("tlog::BlockStatus", "unknown value")),
        }
    }
}

/// The operation a tlog block records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Set,
    Delete,
}

impl Operation {
    fn to_u8(self) -> u8 {
        match self {
            Self::Set => 1,
            Self::Delete => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, CodecError> {
        match raw {
            1 => Ok(Self::Set),
            2 => Ok(Self::Delete),
            _ => Err(CodecError::Invalid("tlog::Operation", "unknown value")),
        }
    }
}

/// Opens a connection: the client announces its version, the vdisk it
/// writes, and the first sequence it will send (used by the server to
/// detect restarts).
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeRequest {
    pub version: u32,
    pub vdisk: String,
    pub first_sequence: u64,
}

impl Write for HandshakeRequest {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        write_text(&self.vdisk, buf);
        self.first_sequence.write(buf);
    }
}

impl EncodeSize for HandshakeRequest {
    fn encode_size(&self) -> usize {
        self.version.encode_size() + text_size(&self.vdisk) + self.first_sequence.encode_size()
    }
}

impl Read for HandshakeRequest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let version = u32::read(buf)?;
        let vdisk = read_text(buf, MAX_VDISK_LEN)?;
        let first_sequence = u64::read(buf)?;
        Ok(Self {
            version,
            vdisk,
            first_sequence,
        })
    }
}

/// The server's verdict on a handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeResponse {
    pub version: u32,
    pub status: HandshakeStatus,
}

impl Write for HandshakeResponse {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        (self.status.to_i8() as u8).write(buf);
    }
}

impl EncodeSize for HandshakeResponse {
    fn encode_size(&self) -> usize {
        self.version.encode_size() + 1
    }
}

impl Read for HandshakeResponse {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let version = u32::read(buf)?;
        let status = HandshakeStatus::from_i8(u8::read(buf)? as i8)?;
        Ok(Self { version, status })
    }
}

/// One logged write.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub vdisk: String,
    pub sequence: u64,
    pub lba: u64,
    pub size: u64,
    pub hash: Digest,
    pub data: Bytes,
    pub timestamp: u64,
    pub operation: Operation,
}

impl Block {
    /// Whether the recorded hash matches the payload.
    pub fn verify(&self) -> bool {
        use commonware_cryptography::Hasher;
        commonware_cryptography::blake3::Blake3::hash(&self.data) == self.hash
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        write_text(&self.vdisk, buf);
        self.sequence.write(buf);
        self.lba.write(buf);
        self.size.write(buf);
        self.hash.write(buf);
        self.data.write(buf);
        self.timestamp.write(buf);
        self.operation.to_u8().write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        text_size(&self.vdisk)
            + self.sequence.encode_size()
            + self.lba.encode_size()
            + self.size.encode_size()
            + self.hash.encode_size()
            + self.data.encode_size()
            + self.timestamp.encode_size()
            + 1
    }
}

impl Read for Block {
    type Cfg = RangeCfg<usize>;

    fn read_cfg(buf: &mut impl Buf, max_data: &Self::Cfg) -> Result<Self, CodecError> {
        let vdisk = read_text(buf, MAX_VDISK_LEN)?;
        let sequence = u64::read(buf)?;
        let lba = u64::read(buf)?;
        let size = u64::read(buf)?;
        let hash = Digest::read(buf)?;
        let data = Bytes::read_cfg(buf, max_data)?;
        let timestamp = u64::read(buf)?;
        let operation = Operation::from_u8(u8::read(buf)?)?;
        Ok(Self {
            vdisk,
            sequence,
            lba,
            size,
            hash,
            data,
            timestamp,
            operation,
        })
    }
}

/// A status notification covering one or more sequences.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: BlockStatus,
    pub sequences: Vec<u64>,
}

impl Write for Response {
    fn write(&self, buf: &mut impl BufMut) {
        (self.status.to_i8() as u8).write(buf);
        UInt(self.sequences.len() as u64).write(buf);
        for sequence in &self.sequences {
            sequence.write(buf);
        }
    }
}

impl EncodeSize for Response {
    fn encode_size(&self) -> usize {
        let sequences: usize = self
            .sequences
            .iter()
            .map(|sequence| sequence.encode_size())
            .sum();
        1 + UInt(self.sequences.len() as u64).encode_size() + sequences
    }
}

impl Read for Response {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_sequences: &Self::Cfg) -> Result<Self, CodecError> {
        let status = BlockStatus::from_i8(u8::read(buf)? as i8)?;
        let count: u64 = UInt::<u64>::read(buf)?.into();
        let count = count as usize;
        if count > *max_sequences {
            return Err(CodecError::InvalidLength(count));
        }
        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            sequences.push(u64::read(buf)?);
        }
        Ok(Self { status, sequences })
    }
}

fn write_text(text: &str, buf: &mut impl BufMut) {
    UInt(text.len() as u64).write(buf);
    buf.put_slice(text.as_bytes());
}

fn text_size(text: &str) -> usize {
    UInt(text.len() as u64).encode_size() + text.len()
}

fn read_text(buf: &mut impl Buf, max: usize) -> Result<String, CodecError> {
    let len: u64 = UInt::<u64>::read(buf)?.into();
    let len = len as usize;
    if len > max {
        return Err(CodecError::InvalidLength(len));
    }
    if buf.remaining() < len {
        return Err(CodecError::EndOfBuffer);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| CodecError::Invalid("tlog::text", "not valid utf-8"))
}

/// Sends one message in a length-prefixed frame.
pub async fn send_msg<Si: Sink, M: Encode>(
    sink: &mut Si,
    message: &M,
    max_message_size: usize,
) -> Result<(), Error> {
    let encoded = message.encode();
    let len = encoded.len();
    if len == 0 || len > max_message_size {
        return Err(Error::FrameTooLarge(len));
    }
    let mut framed = BytesMut::with_capacity(4 + len);
    framed.put_u32(len as u32);
    framed.extend_from_slice(&encoded);
    sink.send(framed).await?;
    Ok(())
}

/// Receives one length-prefixed frame.
pub async fn recv_frame<St: Stream>(
    stream: &mut St,
    max_message_size: usize,
) -> Result<Bytes, Error> {
    let mut header = vec![0u8; 4];
    stream.recv(&mut header[..]).await?;
    let len = u32::from_be_bytes(header[..4].try_into().expect("4-byte header")) as usize;
    if len > max_message_size {
        return Err(Error::FrameTooLarge(len));
    }
    if len == 0 {
        return Err(Error::StreamClosed);
    }
    let mut frame = vec![0u8; len];
    stream.recv(&mut frame[..]).await?;
    Ok(Bytes::from(frame))
}

/// Receives and decodes a message with no decode configuration.
pub async fn recv_msg<St: Stream, M: Read<Cfg = ()>>(
    stream: &mut St,
    max_message_size: usize,
) -> Result<M, Error> {
    let frame = recv_frame(stream, max_message_size).await?;
    Ok(M::decode(frame)?)
}
