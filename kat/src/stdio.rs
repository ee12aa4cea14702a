use crate::error::{AttachError, Channel, KubeError};
use crate::kube::traits::AttachedStreams;
use std::io::{self, Read};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Bytes buffered between a detached reader thread and its async side
const DETACHED_BUFFER: usize = 8 * 1024;

/// Failure of a pump: either already classified, or a transport error the
/// session attributes to its pod
#[derive(Debug)]
pub(crate) enum PumpError {
    Attach(AttachError),
    Transport(KubeError),
}

/// Copy one remote output channel into a local sink until the remote closes it
async fn drain<W>(
    remote: Option<Pin<Box<dyn AsyncRead + Send>>>,
    sink: &mut W,
    channel: Channel,
) -> Result<u64, AttachError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let Some(mut remote) = remote else {
        return Ok(0);
    };

    let copied = tokio::io::copy(&mut remote, sink)
        .await
        .map_err(|source| AttachError::StreamIo { channel, source })?;
    sink.flush()
        .await
        .map_err(|source| AttachError::StreamIo { channel, source })?;
    Ok(copied)
}

/// Move bytes between the caller's stdio and an attach stream.
///
/// Returns once the remote output channels have closed and the transport has
/// shut down. Caller input still pending at that point is dropped.
pub(crate) async fn pump<R, W, E>(
    streams: AttachedStreams,
    mut stdin: R,
    mut stdout: W,
    mut stderr: E,
    cancel: &CancellationToken,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    let AttachedStreams {
        stdin: remote_stdin,
        stdout: remote_stdout,
        stderr: remote_stderr,
        completion,
    } = streams;

    let input = async move {
        let Some(mut remote) = remote_stdin else {
            return Ok(0);
        };
        let sent = tokio::io::copy(&mut stdin, &mut remote)
            .await
            .map_err(|source| AttachError::StreamIo {
                channel: Channel::Stdin,
                source,
            })?;
        // EOF for the remote process (stdinOnce)
        remote.shutdown().await.map_err(|source| AttachError::StreamIo {
            channel: Channel::Stdin,
            source,
        })?;
        Ok::<u64, AttachError>(sent)
    };

    let output = async {
        tokio::try_join!(
            drain(remote_stdout, &mut stdout, Channel::Stdout),
            drain(remote_stderr, &mut stderr, Channel::Stderr),
        )
    };

    tokio::pin!(input);
    tokio::pin!(output);
    let mut input_done = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PumpError::Attach(AttachError::Cancelled)),
            sent = &mut input, if !input_done => {
                let sent = sent.map_err(PumpError::Attach)?;
                tracing::debug!("Sent {} bytes of stdin", sent);
                input_done = true;
            }
            received = &mut output => {
                let (out, err) = received.map_err(PumpError::Attach)?;
                tracing::debug!("Received {} bytes of stdout and {} bytes of stderr", out, err);
                break;
            }
        }
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(PumpError::Attach(AttachError::Cancelled)),
        finished = completion => finished.map_err(PumpError::Transport),
    }
}

/// Read a blocking source on a plain OS thread and expose it as an async
/// reader.
///
/// Unlike `tokio::io::stdin`, the thread is not part of the runtime's
/// blocking pool, so a read still parked on an idle terminal does not hold
/// up runtime shutdown. Must be called from within a Tokio runtime.
pub fn detached_reader<R>(mut source: R) -> io::Result<DuplexStream>
where
    R: Read + Send + 'static,
{
    let (mut tx, rx) = tokio::io::duplex(DETACHED_BUFFER);
    let handle = Handle::current();

    std::thread::Builder::new()
        .name("kat-stdin".to_string())
        .spawn(move || {
            let mut buf = [0u8; DETACHED_BUFFER];
            loop {
                let n = match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!("Detached reader stopped: {}", e);
                        break;
                    }
                };
                if handle.block_on(tx.write_all(&buf[..n])).is_err() {
                    // Reader side dropped
                    return;
                }
            }
            let _ = handle.block_on(tx.shutdown());
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    /// Sink whose every write fails
    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn streams(stdout: &'static [u8], stderr: &'static [u8]) -> AttachedStreams {
        AttachedStreams {
            stdin: Some(Box::pin(tokio::io::sink())),
            stdout: Some(Box::pin(stdout)),
            stderr: Some(Box::pin(stderr)),
            completion: async { Ok::<(), KubeError>(()) }.boxed(),
        }
    }

    #[tokio::test]
    async fn test_pump_copies_output_channels() {
        let mut out = Vec::new();
        let mut err = Vec::new();

        pump(
            streams(b"hello\n", b"warning\n"),
            &b"ignored"[..],
            &mut out,
            &mut err,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(out, b"hello\n");
        assert_eq!(err, b"warning\n");
    }

    #[tokio::test]
    async fn test_pump_reports_transport_failure() {
        let mut attached = streams(b"", b"");
        attached.completion =
            async { Err::<(), KubeError>(KubeError::Stream("connection reset".to_string())) }
                .boxed();

        let result = pump(
            attached,
            tokio::io::empty(),
            tokio::io::sink(),
            tokio::io::sink(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PumpError::Transport(KubeError::Stream(_)))
        ));
    }

    #[tokio::test]
    async fn test_pump_reports_stdin_error() {
        struct Broken;

        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Err(io::Error::other("terminal gone")))
            }
        }

        // Remote output never closes, so the stdin failure decides the outcome
        let (_keep_open, remote_stdout) = tokio::io::duplex(64);
        let attached = AttachedStreams {
            stdin: Some(Box::pin(tokio::io::sink())),
            stdout: Some(Box::pin(remote_stdout)),
            stderr: None,
            completion: async { Ok::<(), KubeError>(()) }.boxed(),
        };

        let result = pump(
            attached,
            Broken,
            tokio::io::sink(),
            tokio::io::sink(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PumpError::Attach(AttachError::StreamIo {
                channel: Channel::Stdin,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_pump_reports_stdout_sink_error() {
        let result = pump(
            streams(b"hello\n", b""),
            tokio::io::empty(),
            BrokenSink,
            tokio::io::sink(),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PumpError::Attach(AttachError::StreamIo {
                channel: Channel::Stdout,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_pump_reports_stderr_sink_error() {
        let result = pump(
            streams(b"", b"warning\n"),
            tokio::io::empty(),
            tokio::io::sink(),
            BrokenSink,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PumpError::Attach(AttachError::StreamIo {
                channel: Channel::Stderr,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_pump_cancelled_while_output_open() {
        let (_remote, remote_stdout) = tokio::io::duplex(64);
        let attached = AttachedStreams {
            stdin: Some(Box::pin(tokio::io::sink())),
            stdout: Some(Box::pin(remote_stdout)),
            stderr: None,
            completion: async { Ok::<(), KubeError>(()) }.boxed(),
        };
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(
            pump(
                attached,
                tokio::io::empty(),
                tokio::io::sink(),
                tokio::io::sink(),
                &cancel,
            ),
            async {
                tokio::task::yield_now().await;
                cancel.cancel();
            }
        );

        assert!(matches!(
            result,
            Err(PumpError::Attach(AttachError::Cancelled))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detached_reader_forwards_until_eof() {
        let mut reader = detached_reader(io::Cursor::new(b"echo hi\nexit\n".to_vec())).unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"echo hi\nexit\n");
    }
}
