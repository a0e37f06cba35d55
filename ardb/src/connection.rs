//! A single client connection to an ardb server.

use crate::{
    resp::{self, Command, Decoded, Reply},
    Error,
};
use bytes::BytesMut;
use commonware_runtime::{Sink, Stream};

/// A connection speaking RESP2 over a runtime sink/stream pair.
///
/// The connection itself performs no retries: any transport or protocol
/// error poisons it and the caller is expected to drop it (the pool dials a
/// fresh one on the next acquire).
pub struct Connection<Si: Sink, St: Stream> {
    sink: Si,
    stream: St,
    /// Received bytes not yet consumed by the reply decoder.
    pending: BytesMut,
}

impl<Si: Sink, St: Stream> Connection<Si, St> {
    /// Wraps an established transport and selects `database` (when
    /// non-zero).
    pub async fn init(sink: Si, stream: St, database: u16) -> Result<Self, Error> {
        let mut connection = Self {
            sink,
            stream,
            pending: BytesMut::new(),
        };
        if database != 0 {
            connection
                .call(Command::new("SELECT").arg_int(database as u64))
                .await?
                .into_ok()?;
        }
        Ok(connection)
    }

    /// Sends one command and reads its reply.
    pub async fn call(&mut self, command: Command) -> Result<Reply, Error> {
        let mut buf = BytesMut::with_capacity(command.encode_size());
        command.encode(&mut buf);
        self.sink.send(buf).await?;
        self.read_reply().await
    }

    /// Sends a batch of commands in one write and reads a reply for each,
    /// in order.
    pub async fn pipeline(&mut self, commands: &[Command]) -> Result<Vec<Reply>, Error> {
        let size = commands.iter().map(Command::encode_size).sum();
        let mut buf = BytesMut::with_capacity(size);
        for command in commands {
            command.encode(&mut buf);
        }
        self.sink.send(buf).await?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(self.read_reply().await?);
        }
        Ok(replies)
    }

    /// Checks the server is alive.
    pub async fn probe(&mut self) -> Result<(), Error> {
        self.call(Command::new("PING")).await?.into_ok()
    }

    async fn read_reply(&mut self) -> Result<Reply, Error> {
        loop {
            match resp::decode(&self.pending)? {
                Decoded::Complete(reply, used) => {
                    let _ = self.pending.split_to(used);
                    return Ok(reply);
                }
                Decoded::Incomplete(needed) => {
                    // Reads are exact, so only ask for what is certainly
                    // outstanding. Header lines arrive a byte at a time off
                    // the transport's internal buffer; payloads in one read.
                    let mut read = vec![0u8; needed];
                    self.stream.recv(&mut read[..]).await?;
                    self.pending.extend_from_slice(&read);
                }
            }
        }
    }
}
