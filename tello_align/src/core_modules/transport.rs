// THEORY:
// The `transport` module is the seam between the flight logic and the vehicle.
// Everything above it talks in typed `Command`s; everything below it is bytes in
// datagrams.
//
// Key architectural principles:
// 1.  **Two delivery classes**: `send` is synchronous fire-and-forget, used for
//     `rc` joystick samples. It never waits, so the alignment loop can call it
//     once per frame. `request` sends and then awaits exactly one reply
//     datagram, used for mode setup, takeoff/land and diagnostics.
// 2.  **One outstanding request**: replies carry no correlation id, so requests
//     are serialized behind an async mutex and stale datagrams are drained before
//     a new request goes out.
// 3.  **No retries**: a failure is handed back to the caller untouched.
// 4.  **Keep-alive**: the vehicle drops out of SDK mode after a few seconds of
//     silence, so a background task re-sends `command` on a fixed interval. On
//     the UDP link it is an ordinary request that takes the request lock, and a
//     tick is skipped while another request is outstanding. It is independent
//     of the alignment loop and never touches controller state.

use crate::core_modules::command::Command;
use crate::config::LinkConfig;
use crate::error::TransportError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const MAX_REPLY_BYTES: usize = 1024;

/// A channel that delivers text commands to the vehicle.
pub trait CommandLink: Send + Sync + 'static {
    /// Fire-and-forget delivery. Returns as soon as the datagram is handed to the OS.
    fn send(&self, command: &Command) -> Result<(), TransportError>;

    /// Sends `command` and waits for the single reply datagram.
    fn request(
        &self,
        command: &Command,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// One keep-alive beat. `Ok(false)` means the beat was skipped because the
    /// link was busy.
    fn keep_alive(&self) -> impl Future<Output = Result<bool, TransportError>> + Send {
        async move { self.send(&Command::Command).map(|()| true) }
    }
}

fn check_reply(command: &Command, reply: String) -> Result<String, TransportError> {
    if reply.starts_with("error") {
        Err(TransportError::Rejected {
            command: command.to_string(),
            reply,
        })
    } else {
        Ok(reply)
    }
}

/// UDP link to a real vehicle.
pub struct UdpLink {
    socket: UdpSocket,
    /// Duplicate of `socket` used for synchronous fire-and-forget sends.
    send_socket: std::net::UdpSocket,
    peer: SocketAddr,
    response_timeout: Duration,
    request_lock: tokio::sync::Mutex<()>,
}

impl UdpLink {
    pub async fn bind(config: &LinkConfig) -> Result<Self, TransportError> {
        let std_socket = std::net::UdpSocket::bind(("0.0.0.0", config.local_port))?;
        std_socket.set_nonblocking(true)?;
        let send_socket = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(local = ?socket.local_addr()?, peer = %config.drone_addr, "udp link bound");
        Ok(Self {
            socket,
            send_socket,
            peer: config.drone_addr,
            response_timeout: config.response_timeout(),
            request_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Throws away any datagram already queued on the socket.
    fn drain_stale_replies(&self) {
        let mut buf = [0u8; MAX_REPLY_BYTES];
        while let Ok((len, _)) = self.socket.try_recv_from(&mut buf) {
            debug!(reply = %String::from_utf8_lossy(&buf[..len]).trim(), "discarded stale reply");
        }
    }

    /// Sends `command` and reads its reply. The caller holds `request_lock`.
    async fn exchange(&self, command: &Command) -> Result<String, TransportError> {
        self.drain_stale_replies();

        let text = command.to_string();
        self.socket.send_to(text.as_bytes(), self.peer).await?;
        debug!(command = %text, "sent, awaiting reply");

        let mut buf = [0u8; MAX_REPLY_BYTES];
        let received = tokio::time::timeout(self.response_timeout, async {
            loop {
                let (len, from) = self.socket.recv_from(&mut buf).await?;
                if from.ip() == self.peer.ip() {
                    return Ok::<usize, io::Error>(len);
                }
                debug!(%from, "ignored datagram from unexpected peer");
            }
        })
        .await;

        let len = match received {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::NoResponse {
                    command: text,
                    timeout_ms: self.response_timeout.as_millis() as u64,
                });
            }
        };
        let reply = String::from_utf8_lossy(&buf[..len]).trim().to_string();
        debug!(command = %text, %reply, "reply");
        check_reply(command, reply)
    }
}

impl CommandLink for UdpLink {
    fn send(&self, command: &Command) -> Result<(), TransportError> {
        let text = command.to_string();
        self.send_socket.send_to(text.as_bytes(), self.peer)?;
        debug!(command = %text, "sent");
        Ok(())
    }

    async fn request(&self, command: &Command) -> Result<String, TransportError> {
        let _guard = self.request_lock.lock().await;
        self.exchange(command).await
    }

    async fn keep_alive(&self) -> Result<bool, TransportError> {
        let Ok(_guard) = self.request_lock.try_lock() else {
            return Ok(false);
        };
        self.exchange(&Command::Command).await.map(|_| true)
    }
}

/// A link that records every command and answers `ok`. Used for dry runs
/// without a vehicle and as the command sink in tests.
#[derive(Default)]
pub struct RecordingLink {
    history: Mutex<Vec<Command>>,
    disconnected: AtomicBool,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<Command> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the `rc` commands, in the order they were sent.
    pub fn rc_history(&self) -> Vec<crate::core_modules::command::RcIntent> {
        self.history()
            .into_iter()
            .filter_map(|command| match command {
                Command::Rc(rc) => Some(rc),
                _ => None,
            })
            .collect()
    }

    /// Simulates losing the radio link: every later command fails.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    fn record(&self, command: &Command) -> Result<(), TransportError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        debug!(command = %command, "recorded");
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.clone());
        Ok(())
    }
}

impl CommandLink for RecordingLink {
    fn send(&self, command: &Command) -> Result<(), TransportError> {
        self.record(command)
    }

    async fn request(&self, command: &Command) -> Result<String, TransportError> {
        self.record(command)?;
        Ok("ok".to_string())
    }
}

/// Handle to the background keep-alive task. The task stops when this is dropped.
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn<L: CommandLink>(link: Arc<L>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the session opener already said hello.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match link.keep_alive().await {
                    Ok(true) => {}
                    Ok(false) => debug!("link busy, keep-alive skipped"),
                    Err(e) => warn!(error = %e, "keep-alive failed"),
                }
            }
        });
        Self { task }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}
