//! # AT Port
//!
//! A [`Channel`] over any byte stream speaking the AT line protocol.
//!
//! One task owns the stream. Commands are taken FIFO, one at a time: the
//! task writes `<cmd>\r`, skips the echo, collects information lines until a
//! final result code and resolves the caller. Lines the [`UrcTable`]
//! recognises are forwarded to the unsolicited stream instead, even while a
//! command is outstanding.
//!
//! A command that misses its deadline keeps the port draining: its late
//! echo, information lines and final result are discarded, and nothing else
//! is written until that final result arrives or one more timeout period
//! passes. A final result arriving while idle is discarded too.
//!
//! EOF or a read error ends the task: the pending command and every later
//! one fail with [`TransportError::DeviceRemoved`], and the unsolicited
//! stream closes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{AtReply, Channel, Event, FinalResult, Reply, Request};
use crate::error::TransportError;
use crate::urc::UrcTable;

struct PortRequest {
    cmd: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<Reply, TransportError>>,
}

struct Pending {
    cmd: String,
    lines: Vec<String>,
    first_line: bool,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<Result<Reply, TransportError>>,
}

/// What the port is waiting for.
enum Slot {
    Idle,
    Busy(Pending),
    /// A timed-out command whose answer may still arrive.
    Draining { cmd: String, until: Instant },
}

impl Slot {
    fn deadline(&self) -> Option<Instant> {
        match self {
            Slot::Idle => None,
            Slot::Busy(p) => Some(p.deadline),
            Slot::Draining { until, .. } => Some(*until),
        }
    }
}

/// Handle to an AT port task. Dropping it stops the task.
pub struct AtPort {
    tx: mpsc::Sender<PortRequest>,
    cancel: CancellationToken,
}

impl AtPort {
    /// Start the port task on `io`. Returns the port and its unsolicited
    /// event stream (bounded by `buffer`; overflow is dropped with a warning).
    pub fn spawn<T>(io: T, urcs: Arc<UrcTable>, buffer: usize) -> (Self, mpsc::Receiver<Event>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        tokio::spawn(io_task(io, urcs, rx, event_tx, cancel.clone()));
        (Self { tx, cancel }, event_rx)
    }
}

impl Drop for AtPort {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Channel for AtPort {
    async fn send(&self, request: Request, timeout: Duration) -> Result<Reply, TransportError> {
        let Request::At(cmd) = request else {
            return Err(TransportError::WriteFailure(
                "message requests cannot be sent on an AT port".into(),
            ));
        };
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PortRequest { cmd, timeout, reply })
            .await
            .map_err(|_| TransportError::DeviceRemoved)?;
        rx.await.map_err(|_| TransportError::DeviceRemoved)?
    }
}

async fn io_task<T>(
    io: T,
    urcs: Arc<UrcTable>,
    mut requests: mpsc::Receiver<PortRequest>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(io);
    let mut reader = BufReader::new(reader);
    // Survives cancelled reads: partial lines stay here.
    let mut buf = Vec::new();
    let mut slot = Slot::Idle;

    loop {
        let deadline = slot.deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    debug!("AT port closed");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();
                    slot = on_line(&line, slot, &urcs, &events);
                }
                Err(e) => {
                    warn!(error = %e, "AT port read failed");
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                slot = match std::mem::replace(&mut slot, Slot::Idle) {
                    Slot::Busy(p) => {
                        debug!(cmd = %p.cmd, "no final result before deadline");
                        let _ = p.reply.send(Err(TransportError::Timeout(p.timeout)));
                        Slot::Draining { cmd: p.cmd, until: Instant::now() + p.timeout }
                    }
                    Slot::Draining { cmd, .. } => {
                        debug!(%cmd, "late answer never came, port idle");
                        Slot::Idle
                    }
                    Slot::Idle => Slot::Idle,
                };
            }
            req = requests.recv(), if matches!(slot, Slot::Idle) => {
                let Some(req) = req else { break };
                trace!(cmd = %req.cmd, "write");
                let mut frame = req.cmd.clone().into_bytes();
                frame.push(b'\r');
                let written = async {
                    writer.write_all(&frame).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(cmd = %req.cmd, error = %e, "AT port write failed");
                    let _ = req.reply.send(Err(TransportError::WriteFailure(e.to_string())));
                    break;
                }
                slot = Slot::Busy(Pending {
                    cmd: req.cmd,
                    lines: Vec::new(),
                    first_line: true,
                    timeout: req.timeout,
                    deadline: Instant::now() + req.timeout,
                    reply: req.reply,
                });
            }
        }
    }

    if let Slot::Busy(p) = slot {
        let _ = p.reply.send(Err(TransportError::DeviceRemoved));
    }
    requests.close();
    while let Ok(req) = requests.try_recv() {
        let _ = req.reply.send(Err(TransportError::DeviceRemoved));
    }
}

fn on_line(line: &str, mut slot: Slot, urcs: &UrcTable, events: &mpsc::Sender<Event>) -> Slot {
    let line = line.trim();
    if line.is_empty() {
        return slot;
    }

    if let Slot::Busy(p) = &mut slot {
        let first = std::mem::replace(&mut p.first_line, false);
        if first && line == p.cmd {
            trace!(cmd = %p.cmd, "echo");
            return slot;
        }
    }

    if let Some(urc) = urcs.match_line(line) {
        trace!(kind = ?urc.kind, line, "unsolicited");
        forward(events, Event::Urc(urc));
        return slot;
    }

    let result = FinalResult::parse(line);
    match slot {
        Slot::Busy(mut p) => match result {
            Some(result) => {
                trace!(cmd = %p.cmd, ?result, lines = p.lines.len(), "final result");
                let _ = p.reply.send(Ok(Reply::At(AtReply {
                    lines: p.lines,
                    result,
                })));
                Slot::Idle
            }
            None => {
                p.lines.push(line.to_string());
                Slot::Busy(p)
            }
        },
        Slot::Draining { cmd, .. } if result.is_some() => {
            debug!(%cmd, line, "late final result discarded");
            Slot::Idle
        }
        Slot::Draining { cmd, until } => {
            trace!(%cmd, line, "late line discarded");
            Slot::Draining { cmd, until }
        }
        Slot::Idle if result.is_some() => {
            debug!(line, "final result with no command pending, discarded");
            Slot::Idle
        }
        Slot::Idle => {
            forward(events, Event::Line(line.to_string()));
            Slot::Idle
        }
    }
}

fn forward(events: &mpsc::Sender<Event>, event: Event) {
    if let Err(mpsc::error::TrySendError::Full(ev)) = events.try_send(event) {
        warn!(?ev, "unsolicited queue full, event dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Message;
    use crate::urc::UrcKind;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn port() -> (AtPort, mpsc::Receiver<Event>, DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let (port, events) = AtPort::spawn(client, Arc::new(UrcTable::standard()), 8);
        (port, events, server)
    }

    async fn read_cmd(server: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            server.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\r' {
                return String::from_utf8(out).unwrap();
            }
            out.push(byte[0]);
        }
    }

    const T: Duration = Duration::from_secs(2);

    // ─── Request / Response ─────────────────────────────────────────────

    #[tokio::test]
    async fn collects_lines_until_final_result() {
        let (port, _events, mut server) = port();
        let modem = tokio::spawn(async move {
            assert_eq!(read_cmd(&mut server).await, "AT+CGMM");
            server
                .write_all(b"AT+CGMM\r\r\n+CGMM: \"E3372\"\r\n\r\nOK\r\n")
                .await
                .unwrap();
            server
        });
        let r = port.send(Request::at("AT+CGMM"), T).await.unwrap();
        assert_eq!(r, Reply::At(AtReply::ok_with(["+CGMM: \"E3372\""])));
        modem.await.unwrap();
    }

    #[tokio::test]
    async fn error_codes_are_final() {
        let (port, _events, mut server) = port();
        tokio::spawn(async move {
            read_cmd(&mut server).await;
            server.write_all(b"\r\n+CME ERROR: 10\r\n").await.unwrap();
            read_cmd(&mut server).await;
            server.write_all(b"\r\nNO CARRIER\r\n").await.unwrap();
            std::future::pending::<()>().await;
        });
        let r = port.send(Request::at("AT+CPIN?"), T).await.unwrap();
        assert_eq!(r, Reply::At(AtReply::failed(FinalResult::CmeError(10))));
        let r = port.send(Request::at("ATD*99#"), T).await.unwrap();
        assert_eq!(r, Reply::At(AtReply::failed(FinalResult::NoCarrier)));
    }

    // ─── Unsolicited Lines ──────────────────────────────────────────────

    #[tokio::test]
    async fn urc_during_command_is_forwarded_not_collected() {
        let (port, mut events, mut server) = port();
        tokio::spawn(async move {
            read_cmd(&mut server).await;
            server
                .write_all(b"\r\n^SYSCFGEX: \"03\",3FFFFFFF,1,2,7FFFFFFFFFFFFFFF\r\n^RSSI: 17\r\n\r\nOK\r\n")
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });
        let r = port.send(Request::at("AT^SYSCFGEX?"), T).await.unwrap();
        let Reply::At(at) = r else { panic!("not an AT reply") };
        assert_eq!(at.lines.len(), 1);
        assert_eq!(at.result, FinalResult::Ok);

        match events.recv().await.unwrap() {
            Event::Urc(u) => {
                assert_eq!(u.kind, UrcKind::SignalQuality);
                assert_eq!(u.field_u32(0), Some(17));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_lines_are_forwarded() {
        let (_port, mut events, mut server) = port();
        server.write_all(b"\r\n+CREG: 1\r\nhello\r\n").await.unwrap();
        assert!(matches!(events.recv().await, Some(Event::Urc(u)) if u.kind == UrcKind::Registration));
        assert_eq!(events.recv().await, Some(Event::Line("hello".into())));
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_port() {
        let (port, mut events, mut server) = port();
        server.write_all(b"\r\nbad \xff byte\r\n").await.unwrap();
        assert_eq!(events.recv().await, Some(Event::Line("bad \u{fffd} byte".into())));

        tokio::spawn(async move {
            assert_eq!(read_cmd(&mut server).await, "AT");
            server.write_all(b"\r\nOK\r\n").await.unwrap();
            std::future::pending::<()>().await;
        });
        assert!(port.send(Request::at("AT"), T).await.is_ok());
    }

    // ─── Failure Modes ──────────────────────────────────────────────────

    #[tokio::test]
    async fn late_reply_after_timeout_is_discarded() {
        let (port, _events, mut server) = port();
        let (go, wait) = oneshot::channel::<()>();
        tokio::spawn(async move {
            assert_eq!(read_cmd(&mut server).await, "AT+SLOW");
            wait.await.unwrap();
            server
                .write_all(b"AT+SLOW\r\r\n+SLOW: 1\r\n\r\nOK\r\n")
                .await
                .unwrap();
            assert_eq!(read_cmd(&mut server).await, "AT+NEXT");
            server.write_all(b"AT+NEXT\r\r\nERROR\r\n").await.unwrap();
            std::future::pending::<()>().await;
        });
        let r = port.send(Request::at("AT+SLOW"), Duration::from_millis(50)).await;
        assert_eq!(r, Err(TransportError::Timeout(Duration::from_millis(50))));
        go.send(()).unwrap();
        // Sent straight away: held back until the late OK is consumed.
        let r = port.send(Request::at("AT+NEXT"), T).await.unwrap();
        assert_eq!(r, Reply::At(AtReply::failed(FinalResult::Error)));
    }

    #[tokio::test]
    async fn silent_command_drains_for_one_more_timeout() {
        let (port, _events, mut server) = port();
        let timeout = Duration::from_millis(100);
        let modem = tokio::spawn(async move {
            assert_eq!(read_cmd(&mut server).await, "AT+SLOW");
            let sent = tokio::time::Instant::now();
            assert_eq!(read_cmd(&mut server).await, "AT");
            let held = sent.elapsed();
            server.write_all(b"\r\nOK\r\n").await.unwrap();
            (held, server)
        });
        let r = port.send(Request::at("AT+SLOW"), timeout).await;
        assert_eq!(r, Err(TransportError::Timeout(timeout)));
        assert!(port.send(Request::at("AT"), T).await.is_ok());
        let (held, _server) = modem.await.unwrap();
        // Its timeout plus the drain period, less scheduling slack.
        assert!(held >= timeout * 3 / 2, "next command written after {held:?}");
    }

    #[tokio::test]
    async fn eof_is_device_removal() {
        let (port, mut events, mut server) = port();
        tokio::spawn(async move {
            read_cmd(&mut server).await;
            drop(server);
        });
        let r = port.send(Request::at("AT"), T).await;
        assert_eq!(r, Err(TransportError::DeviceRemoved));
        let r = port.send(Request::at("AT"), T).await;
        assert_eq!(r, Err(TransportError::DeviceRemoved));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn message_requests_are_rejected() {
        let (port, _events, _server) = port();
        let r = port
            .send(Request::Message(Message::new(0x02, 0x0022)), T)
            .await;
        assert!(matches!(r, Err(TransportError::WriteFailure(_))));
    }
}
