//! The duplex channel to the daemon.
//!
//! One reader and one writer, owned together. Both the dispatch loop and the
//! checkpoint round trip go through the same `Channel`, so requests can never
//! be read ahead or interleaved.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DecodeError, JsonLinesCodec};
use crate::bridge::protocol::{Request, Response, SequenceNumber};
use crate::worker::{DecodePolicy, WorkerConfig, WorkerError};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Channel {
    reader: FramedRead<Reader, JsonLinesCodec<Request>>,
    writer: FramedWrite<Writer, JsonLinesCodec<Response>>,
    decode_policy: DecodePolicy,
}

impl Channel {
    pub fn new<R, W>(reader: R, writer: W, config: &WorkerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FramedRead::new(
                Box::new(reader) as Reader,
                JsonLinesCodec::with_max_length(config.max_line_length),
            ),
            writer: FramedWrite::new(Box::new(writer) as Writer, JsonLinesCodec::new()),
            decode_policy: config.decode_policy,
        }
    }

    /// Read the next request.
    ///
    /// `Ok(None)` is end of stream. Undecodable lines are skipped or fatal
    /// depending on the configured [`DecodePolicy`]; I/O errors are always
    /// fatal.
    pub async fn next_request(&mut self) -> Result<Option<Request>, WorkerError> {
        self.read(None).await
    }

    /// Read the reply to an outstanding request whose acknowledgement action
    /// is `expected`.
    ///
    /// Like [`next_request`](Self::next_request), except that undecodable
    /// lines carrying an `action` tag are never skipped. Some other action (a
    /// `status` echo, say) means the two sides are out of step and is
    /// [`WorkerError::ProtocolDesync`]; the expected action with bad fields is
    /// [`WorkerError::MalformedReply`].
    pub async fn next_reply(&mut self, expected: &str) -> Result<Option<Request>, WorkerError> {
        self.read(Some(expected)).await
    }

    async fn read(&mut self, expected: Option<&str>) -> Result<Option<Request>, WorkerError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Ok(request))) => {
                    tracing::trace!(action = request.action(), "Request received");
                    return Ok(Some(request));
                }
                Some(Ok(Err(e))) => {
                    if let Some(expected) = expected
                        && let DecodeError::Malformed {
                            action: Some(action),
                            ..
                        } = &e
                    {
                        // A tagged line is the reply, readable or not.
                        if action != expected {
                            return Err(WorkerError::ProtocolDesync {
                                received: action.clone(),
                            });
                        }
                        return Err(WorkerError::MalformedReply(e));
                    }
                    match self.decode_policy {
                        DecodePolicy::Skip => {
                            tracing::warn!(error = %e, "Skipping undecodable line");
                        }
                        DecodePolicy::Fail => return Err(WorkerError::Decode(e)),
                    }
                }
                Some(Err(e)) => return Err(WorkerError::Io(e)),
                None => return Ok(None),
            }
        }
    }

    /// Acknowledge a handled request.
    pub async fn write_ack(&mut self, action: &str) -> Result<(), WorkerError> {
        tracing::trace!(action, "Sending status");
        self.writer.send(Response::status(action)).await?;
        Ok(())
    }

    /// Ask the daemon to checkpoint. `None` checkpoints everything delivered.
    pub async fn write_checkpoint_request(
        &mut self,
        position: Option<SequenceNumber>,
    ) -> Result<(), WorkerError> {
        tracing::trace!(?position, "Sending checkpoint request");
        self.writer.send(Response::checkpoint(position)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn channel_over(input: &str, config: &WorkerConfig) -> (Channel, tokio::io::DuplexStream) {
        let (writer, output) = tokio::io::duplex(64 * 1024);
        let channel = Channel::new(Cursor::new(input.as_bytes().to_vec()), writer, config);
        (channel, output)
    }

    #[tokio::test]
    async fn skips_malformed_lines_by_default() {
        let input = concat!(
            "{\"action\":\"initialize\",\"shardId\":\"s\"}\n",
            "{oops\n",
            "{\"action\":\"shutdown\"}\n",
        );
        let (mut channel, _output) = channel_over(input, &WorkerConfig::default());

        let first = channel.next_request().await.unwrap().unwrap();
        assert_eq!(first.action(), "initialize");
        let second = channel.next_request().await.unwrap().unwrap();
        assert_eq!(second.action(), "shutdown");
        assert!(channel.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_policy_surfaces_decode_errors() {
        let config = WorkerConfig {
            decode_policy: DecodePolicy::Fail,
            ..WorkerConfig::default()
        };
        let (mut channel, _output) = channel_over("{oops\n", &config);

        let err = channel.next_request().await.unwrap_err();
        assert!(matches!(err, WorkerError::Decode(_)));
    }

    #[tokio::test]
    async fn reply_read_treats_foreign_actions_as_desync() {
        let input = "{\"action\":\"status\",\"responseFor\":\"initialize\"}\n";
        let (mut channel, _output) = channel_over(input, &WorkerConfig::default());

        let err = channel.next_reply("checkpoint").await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::ProtocolDesync { ref received } if received == "status"
        ));
    }

    #[tokio::test]
    async fn reply_read_rejects_malformed_expected_reply() {
        let input = concat!(
            "{\"action\":\"checkpoint\",\"error\":{\"code\":1}}\n",
            "{\"action\":\"checkpoint\"}\n",
        );
        let (mut channel, _output) = channel_over(input, &WorkerConfig::default());

        let err = channel.next_reply("checkpoint").await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::MalformedReply(DecodeError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn reply_read_still_skips_garbage() {
        let input = "garbage\n{\"action\":\"checkpoint\"}\n";
        let (mut channel, _output) = channel_over(input, &WorkerConfig::default());

        let reply = channel.next_reply("checkpoint").await.unwrap().unwrap();
        assert_eq!(reply, Request::Checkpoint { error: None });
    }

    #[tokio::test]
    async fn request_read_skips_unknown_actions() {
        let input = concat!(
            "{\"action\":\"status\",\"responseFor\":\"initialize\"}\n",
            "{\"action\":\"shutdown\"}\n",
        );
        let (mut channel, _output) = channel_over(input, &WorkerConfig::default());

        let request = channel.next_request().await.unwrap().unwrap();
        assert_eq!(request.action(), "shutdown");
    }

    #[tokio::test]
    async fn end_of_stream_is_not_an_error() {
        let (mut channel, _output) = channel_over("", &WorkerConfig::default());
        assert!(channel.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_are_flushed_per_message() {
        let (mut channel, mut output) = channel_over("", &WorkerConfig::default());

        channel.write_ack("initialize").await.unwrap();
        channel
            .write_checkpoint_request(Some(SequenceNumber::from(17u64)))
            .await
            .unwrap();
        channel.write_checkpoint_request(None).await.unwrap();
        drop(channel);

        let mut written = String::new();
        output.read_to_string(&mut written).await.unwrap();
        assert_eq!(
            written,
            concat!(
                "{\"action\":\"status\",\"responseFor\":\"initialize\"}\n",
                "{\"action\":\"checkpoint\",\"checkpoint\":\"17\"}\n",
                "{\"action\":\"checkpoint\",\"checkpoint\":null}\n",
            )
        );
    }

    #[tokio::test]
    async fn write_to_closed_peer_is_fatal() {
        let (mut channel, output) = channel_over("", &WorkerConfig::default());
        drop(output);

        let err = channel.write_ack("initialize").await.unwrap_err();
        assert!(matches!(err, WorkerError::Io(_)));
    }
}
