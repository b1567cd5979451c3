//! Duplex relay between the secure channel and the local operator.
//!
//! Two tasks run side by side until both have finished:
//!
//! - **inbound** reads lines from the transport and prints them with a
//!   timestamp and the current peer identity;
//! - **outbound** reads operator lines, echoes them locally and forwards them
//!   to the transport, flushing after every line.
//!
//! Neither task waits for the other. Whichever sees the end first fires the
//! [`Terminator`]; the other one runs into the closed stream on its next read
//! or write.

use std::io;

use chrono::Local;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::{
    channel::{read_line, write_line, TerminationCause, Terminator},
    config::DEFAULT_LOCAL_LABEL,
    extract::{IdentityExtractor, IdentitySlot},
};

/// Local command that ends the session; never sent to the peer
pub const EXIT_COMMAND: &str = "exit";

const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// Local wall-clock time in the chat display format
pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// `"<timestamp> <identity> :<line>"`, always newline terminated
pub fn format_inbound(timestamp: &str, identity: &str, line: &str) -> String {
    let mut text = format!("{timestamp} {identity} :{line}");
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

/// `"<timestamp> <label>: <line>"`, always newline terminated
pub fn format_outbound(timestamp: &str, label: &str, line: &str) -> String {
    format!("{timestamp} {label}: {line}\n")
}

/// How the inbound task ended
#[derive(Debug)]
pub enum InboundEnd {
    /// The transport output reached end of stream
    PeerClosed,
    /// Reading the transport output failed
    ReadError(io::Error),
}

/// How the outbound task ended
#[derive(Debug)]
pub enum OutboundEnd {
    /// The operator typed [`EXIT_COMMAND`]
    Exit,
    /// The operator's input reached end of file
    InputClosed,
    /// Reading the operator's input failed
    InputError(io::Error),
    /// The session was interrupted while waiting for input
    Interrupted,
    /// Forwarding a line to the transport failed
    WriteError(io::Error),
}

/// Outcome of one relay session
#[derive(Debug)]
pub struct RelayReport {
    /// How the inbound task ended
    pub inbound:        InboundEnd,
    /// How the outbound task ended
    pub outbound:       OutboundEnd,
    /// Lines displayed from the peer
    pub lines_received: u64,
    /// Lines forwarded to the peer
    pub lines_sent:     u64,
}

/// Local output shared by both relay tasks
struct Display<W> {
    out: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> Display<W> {
    fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    async fn show(&self, text: &str) {
        let mut out = self.out.lock().await;
        let written = match out.write_all(text.as_bytes()).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "Failed to write to local output");
        }
    }
}

/// Relay configuration for one session
#[derive(Debug, Clone)]
pub struct Relay {
    slot:        IdentitySlot,
    terminator:  Terminator,
    local_label: String,
    tap:         Option<IdentityExtractor>,
    banner:      bool,
}

impl Relay {
    /// Relay that shows `slot` next to inbound lines and stops the channel
    /// through `terminator`
    pub fn new(slot: IdentitySlot, terminator: Terminator) -> Self {
        Self {
            slot,
            terminator,
            local_label: DEFAULT_LOCAL_LABEL.to_string(),
            tap: None,
            banner: false,
        }
    }

    /// Label printed next to the operator's own lines
    pub fn with_local_label<S: Into<String>>(mut self, label: S) -> Self {
        self.local_label = label.into();
        self
    }

    /// Also look for certificate subjects in the data stream.
    ///
    /// OpenSSL prints its session summary, including the peer `subject=`,
    /// on standard output.
    pub fn with_identity_tap(mut self, extractor: IdentityExtractor) -> Self {
        self.tap = Some(extractor);
        self
    }

    /// Print the welcome text before relaying
    pub fn with_banner(mut self, banner: bool) -> Self {
        self.banner = banner;
        self
    }

    /// Relay until both directions have ended
    pub async fn run<TR, TW, LI, LO>(
        self,
        transport_out: TR,
        transport_in: TW,
        local_in: LI,
        local_out: LO,
    ) -> RelayReport
    where
        TR: AsyncRead + Unpin,
        TW: AsyncWrite + Unpin,
        LI: AsyncRead + Unpin,
        LO: AsyncWrite + Unpin,
    {
        let display = Display::new(local_out);
        if self.banner {
            display
                .show(&format!(
                    "\nWelcome to the secure chat!\nAvailable commands:\n- Type '{EXIT_COMMAND}' to close the connection\n\n"
                ))
                .await;
        }

        let ((inbound, lines_received), (outbound, lines_sent)) = tokio::join!(
            self.inbound(transport_out, &display),
            self.outbound(local_in, transport_in, &display),
        );

        info!(?inbound, ?outbound, lines_received, lines_sent, "Relay finished");
        RelayReport {
            inbound,
            outbound,
            lines_received,
            lines_sent,
        }
    }

    async fn inbound<R, W>(&self, transport_out: R, display: &Display<W>) -> (InboundEnd, u64)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(transport_out);
        let mut line = String::new();
        let mut received = 0;

        let end = loop {
            match read_line(&mut reader, &mut line).await {
                Ok(0) => {
                    display.show("Connection closed by peer\n").await;
                    break InboundEnd::PeerClosed;
                }
                Ok(_) => {
                    if let Some(tap) = &self.tap {
                        tap.observe(&line);
                    }
                    let text = format_inbound(&timestamp(), &self.slot.current(), &line);
                    display.show(&text).await;
                    received += 1;
                }
                Err(e) => {
                    display.show(&format!("Error reading from peer: {e}\n")).await;
                    break InboundEnd::ReadError(e);
                }
            }
        };

        debug!(?end, "Inbound relay ended");
        self.terminator.terminate(TerminationCause::PeerClosed);
        (end, received)
    }

    async fn outbound<R, T, W>(
        &self,
        local_in: R,
        mut transport_in: T,
        display: &Display<W>,
    ) -> (OutboundEnd, u64)
    where
        R: AsyncRead + Unpin,
        T: AsyncWrite + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(local_in);
        let mut line = String::new();
        let mut sent = 0;

        let end = loop {
            let read = tokio::select! {
                read = read_line(&mut reader, &mut line) => read,
                () = self.interrupted() => break OutboundEnd::Interrupted,
            };
            match read {
                Ok(0) => {
                    self.terminator.terminate(TerminationCause::InputClosed);
                    break OutboundEnd::InputClosed;
                }
                Ok(_) => {
                    let text = line.trim_end_matches(['\r', '\n']);
                    display
                        .show(&format_outbound(&timestamp(), &self.local_label, text))
                        .await;

                    if text.trim() == EXIT_COMMAND {
                        display.show("Exiting...\n").await;
                        self.terminator.terminate(TerminationCause::LocalExit);
                        break OutboundEnd::Exit;
                    }

                    if let Err(e) = write_line(&mut transport_in, text).await {
                        display.show(&format!("Error sending to peer: {e}\n")).await;
                        self.terminator.terminate(TerminationCause::PeerClosed);
                        break OutboundEnd::WriteError(e);
                    }
                    sent += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read local input");
                    self.terminator.terminate(TerminationCause::InputClosed);
                    break OutboundEnd::InputError(e);
                }
            }
        };

        debug!(?end, "Outbound relay ended");
        (end, sent)
    }

    /// Resolves once the session was interrupted. Any other cause leaves the
    /// pending input read alone.
    async fn interrupted(&self) {
        self.terminator.terminated().await;
        if self.terminator.cause() != Some(TerminationCause::Interrupted) {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use super::*;
    use crate::config::UpdatePolicy;

    const BUFFER: usize = 64 * 1024;

    /// Stand-in for the transport process: once terminated it stops
    /// producing output and returns everything the relay forwarded.
    fn fake_transport(
        terminator: &Terminator,
        to_local: DuplexStream,
        mut from_local: DuplexStream,
    ) -> tokio::task::JoinHandle<String> {
        let terminator = terminator.clone();
        tokio::spawn(async move {
            terminator.terminated().await;
            drop(to_local);
            let mut forwarded = String::new();
            from_local.read_to_string(&mut forwarded).await.unwrap();
            forwarded
        })
    }

    async fn read_display(mut display: DuplexStream) -> String {
        let mut text = String::new();
        display.read_to_string(&mut text).await.unwrap();
        text
    }

    #[test]
    fn test_format_inbound() {
        assert_eq!(
            format_inbound("2024.01.02 03:04:05", "alice", "hi\n"),
            "2024.01.02 03:04:05 alice :hi\n"
        );
        assert_eq!(
            format_inbound("2024.01.02 03:04:05", "alice", "no newline"),
            "2024.01.02 03:04:05 alice :no newline\n"
        );
    }

    #[test]
    fn test_format_outbound() {
        assert_eq!(
            format_outbound("2024.01.02 03:04:05", "You", "hello"),
            "2024.01.02 03:04:05 You: hello\n"
        );
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), "2006.01.02 15:04:05".len());
        assert_eq!(&ts[4..5], ".");
        assert_eq!(&ts[10..11], " ");
    }

    #[tokio::test]
    async fn test_hello_then_exit() {
        let terminator = Terminator::new();
        let (transport_out, to_local) = duplex(BUFFER);
        let (transport_in, from_local) = duplex(BUFFER);
        let (local_out, display) = duplex(BUFFER);
        let peer = fake_transport(&terminator, to_local, from_local);

        let report = Relay::new(IdentitySlot::new(), terminator.clone())
            .run(
                transport_out,
                transport_in,
                &b"hello\nexit\nnever sent\n"[..],
                local_out,
            )
            .await;

        assert_eq!(peer.await.unwrap(), "hello\n");
        assert!(matches!(report.outbound, OutboundEnd::Exit));
        assert!(matches!(report.inbound, InboundEnd::PeerClosed));
        assert_eq!(report.lines_sent, 1);
        assert_eq!(terminator.cause(), Some(TerminationCause::LocalExit));

        let shown = read_display(display).await;
        assert!(shown.contains(" You: hello\n"));
        assert!(shown.contains(" You: exit\n"));
        assert!(shown.contains("Exiting...\n"));
        assert!(!shown.contains("never sent"));
    }

    #[tokio::test]
    async fn test_exit_is_trimmed() {
        let terminator = Terminator::new();
        let (transport_out, to_local) = duplex(BUFFER);
        let (transport_in, from_local) = duplex(BUFFER);
        let peer = fake_transport(&terminator, to_local, from_local);

        let report = Relay::new(IdentitySlot::new(), terminator.clone())
            .run(transport_out, transport_in, &b"  exit \r\n"[..], tokio::io::sink())
            .await;

        assert_eq!(peer.await.unwrap(), "");
        assert!(matches!(report.outbound, OutboundEnd::Exit));
        assert_eq!(report.lines_sent, 0);
    }

    #[tokio::test]
    async fn test_peer_close_leaves_outbound_running() {
        let terminator = Terminator::new();
        let (transport_out, mut to_local) = duplex(BUFFER);
        let (transport_in, mut from_local) = duplex(BUFFER);
        let (local_in, mut operator) = duplex(BUFFER);
        let (local_out, display) = duplex(BUFFER);

        let slot = IdentitySlot::new();
        slot.update("alice", UpdatePolicy::FirstMatch);

        let relay = Relay::new(slot, terminator.clone());
        let session = tokio::spawn(relay.run(transport_out, transport_in, local_in, local_out));

        to_local.write_all(b"hi there\n").await.unwrap();
        drop(to_local);
        terminator.terminated().await;

        // The outbound task is still forwarding.
        operator.write_all(b"still here\n").await.unwrap();
        let mut forwarded = [0u8; 11];
        from_local.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded, b"still here\n");
        drop(operator);

        let report = session.await.unwrap();
        assert!(matches!(report.inbound, InboundEnd::PeerClosed));
        assert!(matches!(report.outbound, OutboundEnd::InputClosed));
        assert_eq!(report.lines_received, 1);
        assert_eq!(report.lines_sent, 1);
        assert_eq!(terminator.cause(), Some(TerminationCause::PeerClosed));

        let shown = read_display(display).await;
        assert!(shown.contains(" alice :hi there\n"));
        assert!(shown.contains("Connection closed by peer\n"));
    }

    #[tokio::test]
    async fn test_write_failure_ends_outbound() {
        let terminator = Terminator::new();
        let (transport_out, to_local) = duplex(BUFFER);
        let (transport_in, from_local) = duplex(BUFFER);
        drop(from_local);

        let (local_in, mut operator) = duplex(BUFFER);
        operator.write_all(b"lost\n").await.unwrap();

        let relay = Relay::new(IdentitySlot::new(), terminator.clone());
        let session = tokio::spawn(relay.run(transport_out, transport_in, local_in, tokio::io::sink()));

        terminator.terminated().await;
        drop(to_local);

        let report = session.await.unwrap();
        assert!(matches!(report.outbound, OutboundEnd::WriteError(_)));
        assert_eq!(report.lines_sent, 0);
        assert_eq!(terminator.cause(), Some(TerminationCause::PeerClosed));
        drop(operator);
    }

    #[tokio::test]
    async fn test_interrupt_stops_waiting_for_input() {
        let terminator = Terminator::new();
        let (transport_out, to_local) = duplex(BUFFER);
        let (transport_in, from_local) = duplex(BUFFER);
        let (local_in, _operator) = duplex(BUFFER);
        let peer = fake_transport(&terminator, to_local, from_local);

        let relay = Relay::new(IdentitySlot::new(), terminator.clone());
        let session = tokio::spawn(relay.run(transport_out, transport_in, local_in, tokio::io::sink()));

        terminator.terminate(TerminationCause::Interrupted);

        let report = session.await.unwrap();
        assert!(matches!(report.outbound, OutboundEnd::Interrupted));
        assert!(matches!(report.inbound, InboundEnd::PeerClosed));
        assert_eq!(peer.await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_identity_tap_updates_display() {
        let terminator = Terminator::new();
        let (transport_out, mut to_local) = duplex(BUFFER);
        let (transport_in, _from_local) = duplex(BUFFER);
        let (local_in, operator) = duplex(BUFFER);
        let (local_out, display) = duplex(BUFFER);

        let slot = IdentitySlot::new();
        let relay = Relay::new(slot.clone(), terminator.clone())
            .with_identity_tap(IdentityExtractor::new(slot.clone(), UpdatePolicy::FirstMatch))
            .with_local_label("Server")
            .with_banner(true);
        let session = tokio::spawn(relay.run(transport_out, transport_in, local_in, local_out));

        to_local
            .write_all(b"before\nsubject=CN = bob, O = Org\nafter\n")
            .await
            .unwrap();
        drop(to_local);
        drop(operator);

        let report = session.await.unwrap();
        assert_eq!(report.lines_received, 3);
        assert_eq!(slot.current(), "bob");

        let shown = read_display(display).await;
        assert!(shown.contains("Welcome to the secure chat!"));
        assert!(shown.contains(" unknown :before\n"));
        assert!(shown.contains(" bob :after\n"));
    }
}
