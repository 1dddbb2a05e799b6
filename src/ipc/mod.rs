//! Single-instance coordination over a fixed local TCP port.
//!
//! The first process to bind the listener is the machine's server for the
//! life of that binding; every later launch fails to bind, dials the port
//! instead and forwards its request. Trust is same-machine identity only:
//! every message carries the sender's machine id and a mismatch drops the
//! connection without a reply.
//!
//! Framing is one complete JSON record per write, consumed as a single
//! read into a fixed buffer. A message larger than the buffer, or two
//! messages coalesced into one read, would be misparsed. Observed payloads
//! are tiny (a path and a couple of integers) so this is kept as-is; a
//! length prefix would be required before trusting bigger peers.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::queue::PendingQueue;

pub const COORDINATOR_ADDR: &str = "127.0.0.1:17717";
/// Short enough that a missing server does not make startup drag; a dial
/// timeout means "no server present, assume the server role".
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(500);
const READ_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Ok,
    Close,
    OpenFile,
    GotoLine,
    GotoColumn,
}

/// One coordination protocol message, sent as a single write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCall {
    pub msg_type: MsgType,
    pub machine_id: u64,
    pub args: Vec<serde_json::Value>,
}

/// Stable same-machine identity: the first 8 hardware-address bytes of the
/// first administratively-up interface, folded big-endian into a u64.
/// Locally administered addresses (second-lowest bit of the first octet
/// set) are skipped because they are not stable identifiers. 0 when no
/// interface qualifies.
pub fn machine_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        linux_machine_id().unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn linux_machine_id() -> Option<u64> {
    let mut names: Vec<_> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    names.sort();

    for path in names {
        let flags = std::fs::read_to_string(path.join("flags")).unwrap_or_default();
        let flags = u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).unwrap_or(0);
        // IFF_UP
        if flags & 0x1 == 0 {
            continue;
        }
        let address = std::fs::read_to_string(path.join("address")).unwrap_or_default();
        let bytes: Vec<u8> = address
            .trim()
            .split(':')
            .filter_map(|octet| u8::from_str_radix(octet, 16).ok())
            .collect();
        if bytes.is_empty() || bytes.iter().all(|b| *b == 0) {
            continue;
        }
        if bytes[0] & 0x02 != 0 {
            continue;
        }
        let mut id = 0u64;
        for byte in bytes.iter().take(8) {
            id = (id << 8) | u64::from(*byte);
        }
        return Some(id);
    }
    None
}

fn encode(call: &RemoteCall) -> Option<Vec<u8>> {
    match serde_json::to_vec(call) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(%err, "failed to encode coordination message");
            None
        }
    }
}

/// Listener side. Owns the call queue; connection readers append,
/// the application thread drains once per tick.
pub struct Server {
    local_addr: SocketAddr,
    machine_id: u64,
    calls: Arc<PendingQueue<RemoteCall>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Bind the fixed coordination port. Failure means another instance
    /// already owns the server role (or the port is unusable) and is
    /// fatal for the server path.
    pub fn bind() -> Result<Self> {
        Self::bind_with(COORDINATOR_ADDR, machine_id())
    }

    pub fn bind_with(addr: &str, machine_id: u64) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(Error::Startup)?;
        let local_addr = listener.local_addr().map_err(Error::Startup)?;
        debug!(%local_addr, "coordination server listening");

        let calls = Arc::new(PendingQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_calls = Arc::clone(&calls);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::Builder::new()
            .name("coordinator-accept".into())
            .spawn(move || {
                accept_loop(listener, machine_id, accept_calls, accept_shutdown)
            })
            .map_err(Error::Startup)?;

        Ok(Self {
            local_addr,
            machine_id,
            calls,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn machine_id(&self) -> u64 {
        self.machine_id
    }

    /// Queued remote calls. Main thread only, once per tick.
    pub fn drain(&self) -> Vec<RemoteCall> {
        self.calls.drain()
    }

    /// Stop accepting and join the accept thread. Connection readers for
    /// already-accepted peers finish on their own. The blocking accept is
    /// woken with a throwaway connection; if that dial fails the thread is
    /// detached so shutdown stays bounded by the dial timeout.
    pub fn close(mut self) {
        self.shutdown.store(true, Ordering::Release);
        match TcpStream::connect_timeout(&self.local_addr, DIAL_TIMEOUT) {
            Ok(_) => {
                if let Some(thread) = self.accept_thread.take() {
                    let _ = thread.join();
                }
            }
            Err(err) => {
                warn!(%err, "could not wake the accept thread, detaching it");
                drop(self.accept_thread.take());
            }
        }
        debug!("coordination server closed");
    }
}

fn accept_loop(
    listener: TcpListener,
    machine_id: u64,
    calls: Arc<PendingQueue<RemoteCall>>,
    shutdown: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match stream {
            Ok(stream) => {
                let calls = Arc::clone(&calls);
                let spawned = thread::Builder::new()
                    .name("coordinator-conn".into())
                    .spawn(move || handle_connection(stream, machine_id, &calls));
                if let Err(err) = spawned {
                    warn!(%err, "failed to spawn connection handler");
                }
            }
            Err(err) => {
                // One bad accept drops that peer, never the server.
                warn!(%err, "accept failed");
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    machine_id: u64,
    calls: &PendingQueue<RemoteCall>,
) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".into());
    trace!(peer, "client connected");

    let reply_with = |msg_type: MsgType| {
        encode(&RemoteCall {
            msg_type,
            machine_id,
            args: Vec::new(),
        })
    };

    loop {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                trace!(peer, "client disconnected");
                return;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(peer, %err, "failed to read client data");
                return;
            }
        };
        let call: RemoteCall = match serde_json::from_slice(&buf[..n]) {
            Ok(call) => call,
            Err(err) => {
                // Malformed peer: drop silently, no reply.
                warn!(peer, %err, "dropping client after malformed message");
                return;
            }
        };
        if call.machine_id != machine_id {
            // Stale or untrusted peer. No reply.
            warn!(peer, "rejected call: peer is not running on this machine");
            return;
        }
        match call.msg_type {
            MsgType::Close => {
                if let Some(reply) = reply_with(MsgType::Close) {
                    let _ = stream.write_all(&reply);
                }
                trace!(peer, "client closed the session");
                return;
            }
            _ => {
                calls.push(call);
                let Some(reply) = reply_with(MsgType::Ok) else { return };
                if let Err(err) = stream.write_all(&reply) {
                    warn!(peer, %err, "failed to acknowledge call");
                    return;
                }
            }
        }
    }
}

/// Dialing side, used by later launches to forward their request into the
/// running instance. Short-lived: one connection, a few calls, close.
pub struct Client {
    stream: TcpStream,
    machine_id: u64,
}

impl Client {
    /// Dial the coordination port with a bounded timeout. An error here
    /// (including timeout) means no server is present and the caller
    /// should assume the server role itself.
    pub fn connect() -> Result<Self> {
        Self::connect_with(COORDINATOR_ADDR, machine_id())
    }

    pub fn connect_with(addr: &str, machine_id: u64) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(Error::Transport)?
            .next()
            .ok_or_else(|| Error::Validation(format!("unresolvable address {addr}")))?;
        let stream = TcpStream::connect_timeout(&addr, DIAL_TIMEOUT)?;
        Ok(Self { stream, machine_id })
    }

    /// One write, one blocking read, identity-checked. The read carries no
    /// timeout; acceptable only because the forwarding process never
    /// renders and exits right after.
    pub fn call(&mut self, msg_type: MsgType, args: Vec<serde_json::Value>) -> bool {
        debug!(?msg_type, "sending signal");
        let Some(payload) = encode(&RemoteCall {
            msg_type,
            machine_id: self.machine_id,
            args,
        }) else {
            return false;
        };
        if let Err(err) = self.stream.write_all(&payload) {
            warn!(%err, "failed to send signal");
            return false;
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let n = match self.stream.read(&mut buf) {
            Ok(0) => {
                warn!("server dropped the connection");
                return false;
            }
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "failed to read response");
                return false;
            }
        };
        let reply: RemoteCall = match serde_json::from_slice(&buf[..n]) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(%err, "failed to decode response");
                return false;
            }
        };
        if reply.machine_id != self.machine_id {
            warn!("rejected reply: connected server is not running on this machine");
            return false;
        }
        match reply.msg_type {
            // Server acknowledged our close and hung up.
            MsgType::Close => {
                let _ = self.stream.shutdown(Shutdown::Both);
                true
            }
            MsgType::Ok => true,
            other => {
                warn!(?other, "server sent a non-OK response");
                false
            }
        }
    }

    pub fn close(mut self) {
        if self.call(MsgType::Close, Vec::new()) {
            trace!("disconnected from server");
        } else {
            warn!("server did not acknowledge close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_TYPES: [MsgType; 5] = [
        MsgType::Ok,
        MsgType::Close,
        MsgType::OpenFile,
        MsgType::GotoLine,
        MsgType::GotoColumn,
    ];

    #[test]
    fn remote_call_round_trips_for_every_message_type() {
        for msg_type in ALL_TYPES {
            let call = RemoteCall {
                msg_type,
                machine_id: 0xa1b2c3,
                args: vec![json!("foo.txt"), json!(12)],
            };
            let encoded = serde_json::to_vec(&call).unwrap();
            let decoded: RemoteCall = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded.msg_type, msg_type);
            assert_eq!(decoded.machine_id, call.machine_id);
            assert_eq!(decoded.args, call.args);
        }
    }

    #[test]
    fn machine_id_is_stable() {
        assert_eq!(machine_id(), machine_id());
    }

    #[test]
    fn valid_call_is_queued_and_acknowledged() {
        let server = Server::bind_with("127.0.0.1:0", 42).unwrap();
        let addr = server.local_addr().to_string();

        let mut client = Client::connect_with(&addr, 42).unwrap();
        assert!(client.call(MsgType::OpenFile, vec![json!("foo.txt")]));

        // The record is queued before the acknowledgement is written, so
        // a successful call implies it is already drainable.
        let calls = server.drain();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].msg_type, MsgType::OpenFile);
        assert_eq!(calls[0].machine_id, 42);
        assert_eq!(calls[0].args, vec![json!("foo.txt")]);

        client.close();
        server.close();
    }

    #[test]
    fn forged_identity_is_dropped_without_queuing() {
        let server = Server::bind_with("127.0.0.1:0", 42).unwrap();
        let addr = server.local_addr().to_string();

        let mut client = Client::connect_with(&addr, 43).unwrap();
        assert!(!client.call(MsgType::OpenFile, vec![json!("foo.txt")]));
        assert!(server.drain().is_empty());

        server.close();
    }

    #[test]
    fn close_is_acknowledged_with_close() {
        let server = Server::bind_with("127.0.0.1:0", 7).unwrap();
        let addr = server.local_addr().to_string();

        let client = Client::connect_with(&addr, 7).unwrap();
        client.close();
        assert!(server.drain().is_empty());
        server.close();
    }

    #[test]
    fn close_returns_within_the_dial_bound() {
        let server = Server::bind_with("127.0.0.1:0", 9).unwrap();
        let started = std::time::Instant::now();
        server.close();
        // Bounded even when nothing else ever connects: one wake-up dial
        // plus the accept thread observing the shutdown flag.
        assert!(started.elapsed() < DIAL_TIMEOUT * 4);
    }

    #[test]
    fn dial_timeout_reports_no_server() {
        // Nothing listens here; the caller takes the server role.
        assert!(Client::connect_with("127.0.0.1:1", 1).is_err());
    }
}
