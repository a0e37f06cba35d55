//! Encoding and incremental decoding of the Redis wire protocol (RESP2).
//!
//! Commands are arrays of bulk strings; replies are one of the five RESP2
//! types. The decoder is incremental: it consumes complete replies from the
//! front of a buffer and reports how many more bytes are required when a
//! reply is still partial, so callers can read exactly as much as the
//! transport makes available.

use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};

/// A single command, ready to be encoded as a RESP array of bulk strings.
#[derive(Clone, Debug)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: &'static str) -> Self {
        Self {
            parts: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    /// Appends a raw argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.parts.push(arg.into());
        self
    }

    /// Appends an integer argument in its decimal form.
    pub fn arg_int(self, arg: u64) -> Self {
        self.arg(arg.to_string())
    }

    /// The number of bytes [Command::encode] will write.
    pub fn encode_size(&self) -> usize {
        let mut size = header_size(b'*', self.parts.len() as i64);
        for part in &self.parts {
            size += header_size(b'$', part.len() as i64) + part.len() + 2;
        }
        size
    }

    /// Encodes the command into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        write_header(buf, b'*', self.parts.len() as i64);
        for part in &self.parts {
            write_header(buf, b'$', part.len() as i64);
            buf.put_slice(part);
            buf.put_slice(b"\r\n");
        }
    }
}

fn header_size(_marker: u8, value: i64) -> usize {
    // marker + decimal digits + \r\n
    1 + value.to_string().len() + 2
}

fn write_header(buf: &mut BytesMut, marker: u8, value: i64) {
    buf.put_u8(marker);
    buf.put_slice(value.to_string().as_bytes());
    buf.put_slice(b"\r\n");
}

/// A decoded RESP2 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Converts an error reply into [Error::Reply], passing everything else
    /// through.
    pub fn into_result(self) -> Result<Self, Error> {
        match self {
            Self::Error(message) => Err(Error::Reply(message)),
            reply => Ok(reply),
        }
    }

    /// Interprets the reply as an optional byte string (`nil` maps to
    /// `None`).
    pub fn into_bytes(self) -> Result<Option<Bytes>, Error> {
        match self.into_result()? {
            Self::Bulk(bytes) => Ok(bytes),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Interprets the reply as an integer.
    pub fn into_int(self) -> Result<i64, Error> {
        match self.into_result()? {
            Self::Integer(value) => Ok(value),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Interprets the reply as an array of replies (`nil` maps to empty).
    pub fn into_array(self) -> Result<Vec<Reply>, Error> {
        match self.into_result()? {
            Self::Array(items) => Ok(items.unwrap_or_default()),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Asserts the reply indicates success (a simple string or an integer).
    pub fn into_ok(self) -> Result<(), Error> {
        match self.into_result()? {
            Self::Simple(_) | Self::Integer(_) => Ok(()),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Encodes the reply (used by the in-memory server).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Simple(message) => {
                buf.put_u8(b'+');
                buf.put_slice(message.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Error(message) => {
                buf.put_u8(b'-');
                buf.put_slice(message.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Integer(value) => {
                buf.put_u8(b':');
                buf.put_slice(value.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            Self::Bulk(Some(bytes)) => {
                write_header(buf, b'$', bytes.len() as i64);
                buf.put_slice(bytes);
                buf.put_slice(b"\r\n");
            }
            Self::Array(None) => buf.put_slice(b"*-1\r\n"),
            Self::Array(Some(items)) => {
                write_header(buf, b'*', items.len() as i64);
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

/// Outcome of attempting to decode a reply from a partial buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A full reply and the number of bytes it occupied.
    Complete(Reply, usize),
    /// At least this many more bytes are required.
    Incomplete(usize),
}

/// Attempts to decode one reply from the front of `buf`, without consuming.
pub fn decode(buf: &[u8]) -> Result<Decoded, Error> {
    match decode_at(buf, 0)? {
        DecodedAt::Complete(reply, end) => Ok(Decoded::Complete(reply, end)),
        DecodedAt::Incomplete(needed) => Ok(Decoded::Incomplete(needed)),
    }
}

enum DecodedAt {
    Complete(Reply, usize),
    Incomplete(usize),
}

fn decode_at(buf: &[u8], at: usize) -> Result<DecodedAt, Error> {
    let Some(&marker) = buf.get(at) else {
        return Ok(DecodedAt::Incomplete(1));
    };
    let Some((line, after_line)) = read_line(buf, at + 1) else {
        return Ok(DecodedAt::Incomplete(1));
    };
    match marker {
        b'+' => Ok(DecodedAt::Complete(
            Reply::Simple(ascii(line)?),
            after_line,
        )),
        b'-' => Ok(DecodedAt::Complete(Reply::Error(ascii(line)?), after_line)),
        b':' => Ok(DecodedAt::Complete(
            Reply::Integer(integer(line)?),
            after_line,
        )),
        b'$' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(DecodedAt::Complete(Reply::Bulk(None), after_line));
            }
            let len = len as usize;
            let end = after_line + len + 2;
            if buf.len() < end {
                return Ok(DecodedAt::Incomplete(end - buf.len()));
            }
            if &buf[after_line + len..end] != b"\r\n" {
                return Err(Error::Protocol("bulk string missing terminator".into()));
            }
            let bytes = Bytes::copy_from_slice(&buf[after_line..after_line + len]);
            Ok(DecodedAt::Complete(Reply::Bulk(Some(bytes)), end))
        }
        b'*' => {
            let len = integer(line)?;
            if len < 0 {
                return Ok(DecodedAt::Complete(Reply::Array(None), after_line));
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut cursor = after_line;
            for _ in 0..len {
                match decode_at(buf, cursor)? {
                    DecodedAt::Complete(item, next) => {
                        items.push(item);
                        cursor = next;
                    }
                    DecodedAt::Incomplete(needed) => return Ok(DecodedAt::Incomplete(needed)),
                }
            }
            Ok(DecodedAt::Complete(Reply::Array(Some(items)), cursor))
        }
        other => Err(Error::Protocol(format!(
            "unknown reply marker: 0x{other:02x}"
        ))),
    }
}

/// Reads a `\r\n`-terminated line starting at `from`, returning the line
/// contents and the offset just past the terminator.
fn read_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let rel = buf
        .get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")?;
    Some((&buf[from..from + rel], from + rel + 2))
}

fn ascii(line: &[u8]) -> Result<String, Error> {
    String::from_utf8(line.to_vec()).map_err(|_| Error::Protocol("non-utf8 line".into()))
}

fn integer(line: &[u8]) -> Result<i64, Error> {
    ascii(line)?
        .parse()
        .map_err(|_| Error::Protocol("malformed integer".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: &Command) -> BytesMut {
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        assert_eq!(buf.len(), command.encode_size());
        buf
    }

    #[test]
    fn test_command_encoding() {
        let command = Command::new("HSET")
            .arg("disk1")
            .arg_int(7u64)
            .arg(Bytes::from_static(b"\x00\x01"));
        assert_eq!(
            encoded(&command).as_ref(),
            b"*4\r\n$4\r\nHSET\r\n$5\r\ndisk1\r\n$1\r\n7\r\n$2\r\n\x00\x01\r\n"
        );
    }

    #[test]
    fn test_decode_simple_types() {
        let (reply, used) = match decode(b"+OK\r\n").unwrap() {
            Decoded::Complete(reply, used) => (reply, used),
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(reply, Reply::Simple("OK".into()));
        assert_eq!(used, 5);

        assert_eq!(
            decode(b":1234\r\n").unwrap(),
            Decoded::Complete(Reply::Integer(1234), 7)
        );
        assert_eq!(
            decode(b"-ERR boom\r\n").unwrap(),
            Decoded::Complete(Reply::Error("ERR boom".into()), 11)
        );
    }

    #[test]
    fn test_decode_bulk() {
        assert_eq!(
            decode(b"$5\r\nhello\r\n").unwrap(),
            Decoded::Complete(Reply::Bulk(Some(Bytes::from_static(b"hello"))), 11)
        );
        assert_eq!(
            decode(b"$-1\r\n").unwrap(),
            Decoded::Complete(Reply::Bulk(None), 5)
        );
        assert_eq!(
            decode(b"$0\r\n\r\n").unwrap(),
            Decoded::Complete(Reply::Bulk(Some(Bytes::new())), 6)
        );
    }

    #[test]
    fn test_decode_array() {
        let raw = b"*2\r\n$3\r\nfoo\r\n:42\r\n";
        assert_eq!(
            decode(raw).unwrap(),
            Decoded::Complete(
                Reply::Array(Some(vec![
                    Reply::Bulk(Some(Bytes::from_static(b"foo"))),
                    Reply::Integer(42),
                ])),
                raw.len()
            )
        );
        assert_eq!(
            decode(b"*-1\r\n").unwrap(),
            Decoded::Complete(Reply::Array(None), 5)
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(b"").unwrap(), Decoded::Incomplete(1));
        assert_eq!(decode(b"+OK").unwrap(), Decoded::Incomplete(1));
        // After the bulk header the decoder knows exactly what is missing.
        assert_eq!(decode(b"$5\r\nhel").unwrap(), Decoded::Incomplete(4));
        assert_eq!(decode(b"*2\r\n:1\r\n").unwrap(), Decoded::Incomplete(1));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(decode(b"?what\r\n"), Err(Error::Protocol(_))));
        assert!(matches!(decode(b":abc\r\n"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(
            Reply::Bulk(Some(Bytes::from_static(b"x")))
                .into_bytes()
                .unwrap(),
            Some(Bytes::from_static(b"x"))
        );
        assert_eq!(Reply::Bulk(None).into_bytes().unwrap(), None);
        assert_eq!(Reply::Integer(3).into_int().unwrap(), 3);
        assert!(Reply::Simple("OK".into()).into_ok().is_ok());
        assert!(matches!(
            Reply::Error("ERR nope".into()).into_ok(),
            Err(Error::Reply(_))
        ));
        assert!(matches!(
            Reply::Integer(1).into_bytes(),
            Err(Error::UnexpectedReply)
        ));
    }
}
