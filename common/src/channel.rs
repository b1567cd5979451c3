//! The seam between the chat relay and whatever carries the encrypted bytes.
//!
//! Today the only backend is the OpenSSL subprocess in [`crate::tunnel`]; the
//! relay and the orchestrator only see [`SecureChannel`], so a native TLS
//! binding can replace it without touching either of them.

use std::{
    fmt,
    future::Future,
    io,
    sync::{Arc, OnceLock},
};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::TunnelError;

/// Why the transport was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    /// The operator typed `exit`
    LocalExit,
    /// The operator's input reached end of file
    InputClosed,
    /// The transport's output ended or failed
    PeerClosed,
    /// The process received Ctrl+C
    Interrupted,
}

impl TerminationCause {
    /// Whether the local side asked for the shutdown
    pub fn is_local(self) -> bool {
        !matches!(self, TerminationCause::PeerClosed)
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationCause::LocalExit => "local exit",
            TerminationCause::InputClosed => "local input closed",
            TerminationCause::PeerClosed => "peer closed",
            TerminationCause::Interrupted => "interrupted",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct TerminatorState {
    token: CancellationToken,
    cause: OnceLock<TerminationCause>,
}

/// Cloneable, idempotent stop switch for a channel.
///
/// The first call to [`Terminator::terminate`] records its cause and wakes
/// everything waiting in [`Terminator::terminated`]; later calls are no-ops.
#[derive(Debug, Clone, Default)]
pub struct Terminator {
    inner: Arc<TerminatorState>,
}

impl Terminator {
    /// A terminator that has not fired yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Returns `true` only for the call that fired.
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        let first = self.inner.cause.set(cause).is_ok();
        if first {
            info!(%cause, "Terminating transport");
        } else {
            debug!(%cause, "Transport already terminating");
        }
        self.inner.token.cancel();
        first
    }

    /// Cause recorded by the first [`Terminator::terminate`] call
    pub fn cause(&self) -> Option<TerminationCause> {
        self.inner.cause.get().copied()
    }

    /// Whether termination was requested
    pub fn is_terminated(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once termination has been requested
    pub async fn terminated(&self) {
        self.inner.token.cancelled().await;
    }
}

/// How a channel ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelExit {
    /// Exit code of the backend, `None` when it was killed by a signal
    pub code:  Option<i32>,
    /// Termination cause, if the session requested the stop
    pub cause: Option<TerminationCause>,
}

impl ChannelExit {
    /// Whether the backend failed without the local side asking it to stop
    pub fn is_unrequested_failure(&self) -> bool {
        let requested_locally = self.cause.is_some_and(TerminationCause::is_local);
        !requested_locally && self.code != Some(0)
    }
}

/// A mutually authenticated, line-oriented byte channel to one peer.
///
/// Establishing the channel (connect or accept) is the constructor's job;
/// afterwards the relay reads lines from [`SecureChannel::Reader`], writes lines
/// to [`SecureChannel::Writer`] and closes it through the [`Terminator`].
pub trait SecureChannel {
    /// Decrypted bytes from the peer
    type Reader: AsyncRead + Unpin + Send + 'static;
    /// Plaintext bytes to send to the peer
    type Writer: AsyncWrite + Unpin + Send + 'static;
    /// Human readable handshake/certificate information
    type Diagnostics: AsyncRead + Unpin + Send + 'static;

    /// Take the data halves. Fails if they were already taken.
    fn split(&mut self) -> Result<(Self::Reader, Self::Writer), TunnelError>;

    /// Take the diagnostic stream, if the backend provides one
    fn take_diagnostics(&mut self) -> Option<Self::Diagnostics>;

    /// Handle that closes the channel from any task
    fn terminator(&self) -> Terminator;

    /// Wait until the backend is gone
    fn closed(self) -> impl Future<Output = Result<ChannelExit, TunnelError>> + Send;
}

/// Read one line, replacing invalid UTF-8. Returns the number of bytes read;
/// `0` means end of stream.
pub async fn read_line<R>(reader: &mut R, line: &mut String) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    let read = reader.read_until(b'\n', &mut raw).await?;
    line.clear();
    line.push_str(&String::from_utf8_lossy(&raw));
    Ok(read)
}

/// Write `text` followed by a newline and flush immediately
pub async fn write_line<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory channel used to exercise the relay and the orchestrator.

    use tokio::io::{duplex, DuplexStream};

    use super::*;

    const BUFFER: usize = 64 * 1024;

    /// The far side of a [`MemoryChannel`]
    pub(crate) struct RemoteEnd {
        /// Bytes written here arrive on the channel's reader
        pub(crate) to_local:    DuplexStream,
        /// Bytes the relay forwarded to the peer
        pub(crate) from_local:  DuplexStream,
        /// Diagnostic lines for the extractor
        pub(crate) diagnostics: DuplexStream,
    }

    pub(crate) struct MemoryChannel {
        reader:      Option<DuplexStream>,
        writer:      Option<DuplexStream>,
        diagnostics: Option<DuplexStream>,
        terminator:  Terminator,
        exit_code:   Option<i32>,
    }

    impl MemoryChannel {
        pub(crate) fn pair() -> (Self, RemoteEnd) {
            let (reader, to_local) = duplex(BUFFER);
            let (writer, from_local) = duplex(BUFFER);
            let (diagnostics, remote_diagnostics) = duplex(BUFFER);
            let channel = Self {
                reader:      Some(reader),
                writer:      Some(writer),
                diagnostics: Some(diagnostics),
                terminator:  Terminator::new(),
                exit_code:   Some(0),
            };
            let remote = RemoteEnd {
                to_local,
                from_local,
                diagnostics: remote_diagnostics,
            };
            (channel, remote)
        }

        pub(crate) fn with_exit_code(mut self, code: Option<i32>) -> Self {
            self.exit_code = code;
            self
        }
    }

    impl SecureChannel for MemoryChannel {
        type Reader = DuplexStream;
        type Writer = DuplexStream;
        type Diagnostics = DuplexStream;

        fn split(&mut self) -> Result<(Self::Reader, Self::Writer), TunnelError> {
            let reader = self.reader.take().ok_or(TunnelError::IoSetup("stdout"))?;
            let writer = self.writer.take().ok_or(TunnelError::IoSetup("stdin"))?;
            Ok((reader, writer))
        }

        fn take_diagnostics(&mut self) -> Option<Self::Diagnostics> {
            self.diagnostics.take()
        }

        fn terminator(&self) -> Terminator {
            self.terminator.clone()
        }

        async fn closed(self) -> Result<ChannelExit, TunnelError> {
            self.terminator.terminated().await;
            Ok(ChannelExit {
                code:  self.exit_code,
                cause: self.terminator.cause(),
            })
        }
    }
}
