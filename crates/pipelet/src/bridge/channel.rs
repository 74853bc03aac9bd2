//! Line-oriented channel over one pipe pair.
//!
//! One channel is bound exclusively to one executor slot. Reads block until
//! a full line arrives; writes are flushed before returning so the peer
//! never observes a partial line.

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::{FatalError, ProtocolError};

/// Commands longer than this are malformed, not a reason to buffer forever.
const MAX_LINE_LENGTH: usize = 1 << 20;

/// Result of one read attempt on the inbound pipe.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete command line.
    Line(String),
    /// Undecodable input (non-UTF8, oversized). Recoverable: report and keep
    /// serving.
    Malformed(ProtocolError),
    /// Peer closed the pipe. Terminal for the slot.
    Closed,
}

pub struct PipeChannel {
    reader: FramedRead<Box<dyn AsyncRead + Send + Unpin>, LinesCodec>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl PipeChannel {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: FramedRead::new(
                Box::new(reader),
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            ),
            writer: Box::new(writer),
        }
    }

    /// Await the next command line.
    ///
    /// I/O failures other than decode errors are fatal for the slot.
    pub async fn read_command(&mut self) -> Result<ReadOutcome, FatalError> {
        match self.reader.next().await {
            None => Ok(ReadOutcome::Closed),
            Some(Ok(line)) => Ok(ReadOutcome::Line(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Ok(ReadOutcome::Malformed(
                ProtocolError::malformed(format!("line exceeds {MAX_LINE_LENGTH} bytes")),
            )),
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(ReadOutcome::Malformed(ProtocolError::malformed(
                    e.to_string(),
                )))
            }
            Some(Err(LinesCodecError::Io(e))) => Err(FatalError::Pipe(e)),
        }
    }

    /// Write one response line and flush. No partial lines are observable.
    pub async fn write_response(&mut self, line: &str) -> Result<(), FatalError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex, split};

    fn test_channel() -> (PipeChannel, tokio::io::DuplexStream) {
        let (ours, theirs) = duplex(4096);
        let (r, w) = split(ours);
        (PipeChannel::new(r, w), theirs)
    }

    #[tokio::test]
    async fn reads_full_lines() {
        let (mut ch, mut peer) = test_channel();
        peer.write_all(b"PING\nQUIT\n").await.unwrap();

        match ch.read_command().await.unwrap() {
            ReadOutcome::Line(l) => assert_eq!(l, "PING"),
            other => panic!("unexpected: {other:?}"),
        }
        match ch.read_command().await.unwrap() {
            ReadOutcome::Line(l) => assert_eq!(l, "QUIT"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_close_is_terminal() {
        let (mut ch, peer) = test_channel();
        drop(peer);
        assert!(matches!(
            ch.read_command().await.unwrap(),
            ReadOutcome::Closed
        ));
    }

    #[tokio::test]
    async fn invalid_utf8_is_recoverable() {
        let (mut ch, mut peer) = test_channel();
        peer.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        peer.write_all(b"PING\n").await.unwrap();

        assert!(matches!(
            ch.read_command().await.unwrap(),
            ReadOutcome::Malformed(_)
        ));
        // The channel keeps serving after the malformed line.
        match ch.read_command().await.unwrap() {
            ReadOutcome::Line(l) => assert_eq!(l, "PING"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn writes_are_whole_lines() {
        let (mut ch, peer) = test_channel();
        ch.write_response("PONG").await.unwrap();

        let mut lines = BufReader::new(peer).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PONG");
    }
}
