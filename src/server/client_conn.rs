//! Per-connection state for command server clients.
//!
//! Each accepted connection runs a read loop that parses request lines and
//! issues calls, plus a write task that drains replies. Call results are
//! produced on device worker threads and reach the socket through the
//! write task's channel, so the read loop never waits on a device.

use std::io::ErrorKind;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use super::protocol::{parse_args, Reply, Request};
use super::registry::DeviceRegistry;
use crate::device::{CallError, Registration};

/// Server-side state of one client connection.
pub(crate) struct ClientConn {
    peer: SocketAddr,
    registry: DeviceRegistry,
    reply_tx: UnboundedSender<String>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    /// Serve one accepted connection until the client leaves or `shutdown` fires.
    pub(crate) async fn serve(
        stream: TcpStream,
        peer: SocketAddr,
        registry: DeviceRegistry,
        max_packet: usize,
        shutdown: CancellationToken,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<String>();
        let mut write_handle = tokio::spawn(Self::write_loop(peer, write_half, reply_rx));

        let conn = Self {
            peer,
            registry,
            reply_tx,
        };
        let client_left = tokio::select! {
            () = conn.read_loop(read_half, max_packet) => true,
            () = shutdown.cancelled() => false,
        };
        // Handlers of calls still in flight hold their own senders; the
        // write loop ends once those have replied.
        drop(conn);

        if client_left {
            tokio::select! {
                _ = &mut write_handle => {}
                () = shutdown.cancelled() => write_handle.abort(),
            }
        } else {
            log::debug!("[CommandServer] closing {peer} for shutdown");
            write_handle.abort();
        }
        log::info!("[CommandServer] closed connection from {peer}");
    }

    /// Read loop: one request per line, or per read if no newline is sent.
    async fn read_loop(&self, mut reader: OwnedReadHalf, max_packet: usize) {
        let mut buf = vec![0u8; max_packet.max(1)];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[..n]);
                    for line in text.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
                        log::debug!("[CommandServer] {} sent \"{line}\"", self.peer);
                        if let Some(reply) = self.dispatch(line) {
                            log::debug!("[CommandServer] instant reply to {}: \"{reply}\"", self.peer);
                            if self.reply_tx.send(reply.to_string()).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => break,
                Err(e) => {
                    log::warn!("[CommandServer] read error from {}: {e}", self.peer);
                    break;
                }
            }
        }
    }

    /// Handle one request line.
    ///
    /// Returns the synchronous reply, or `None` when the call was queued and
    /// its result will be written later.
    fn dispatch(&self, line: &str) -> Option<Reply> {
        let request = Request::parse(line);

        let Some(device) = self.registry.get(request.device) else {
            return Some(Reply::UnknownDevice {
                device: request.device.to_string(),
                known: self.registry.names(),
            });
        };
        if device.is_dummy() {
            return Some(Reply::NotConnected);
        }
        let Some(method) = request.method else {
            return Some(Reply::Ok);
        };

        let args = match parse_args(request.args) {
            Ok(args) => args,
            Err(token) => return Some(Reply::BadKeyword { token }),
        };

        let id = match device.call(method, args.clone()) {
            Ok(id) => id,
            Err(error) => {
                return Some(Reply::Rejected {
                    device: request.device.to_string(),
                    method: method.to_string(),
                    args,
                    error,
                })
            }
        };

        let reply_tx = self.reply_tx.clone();
        let peer = self.peer;
        let registration = device.on_result(id, move |outcome| {
            let reply = Reply::Outcome(outcome).to_string();
            log::debug!("[CommandServer] delayed reply to {peer}: \"{reply}\"");
            // The client may have left while the call was queued.
            let _ = reply_tx.send(reply);
        });
        match registration {
            Registration::Evicted => Some(Reply::Outcome(Err(CallError::Evicted))),
            Registration::Pending | Registration::Completed => None,
        }
    }

    /// Write loop: sends queued replies in order until every sender is gone.
    async fn write_loop(peer: SocketAddr, mut writer: OwnedWriteHalf, mut reply_rx: UnboundedReceiver<String>) {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = writer.write_all(reply.as_bytes()).await {
                log::warn!("[CommandServer] write error to {peer}: {e}");
                break;
            }
        }
    }
}
