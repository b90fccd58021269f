//! Readiness-driven TCP echo server.
//!
//! Single thread, single loop: the poller reports which sockets are ready,
//! and each readiness event is dispatched to the handler registered for it.
//! Handlers run to completion one at a time, so there is no locking anywhere.
//!
//! The registration table is a slab whose key doubles as the poll token.
//! Exactly one entry exists per live socket (the listener included), and an
//! entry never outlives its socket: removal deregisters, shuts down the
//! write side, and drops the stream in one step.

use crate::config::Config;
use crate::limits::PlatformLimits;
use crate::poller::{Poller, Ready};
use crate::sockopt::SocketPolicy;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed per-read cap. Longer payloads are echoed across multiple read
/// events; no reassembly is attempted because echo has no message framing.
const READ_CAP: usize = 1024;

/// Readiness events drained per wait call.
const EVENT_CAPACITY: usize = 256;

/// Accept queue size when the config leaves it unset.
const DEFAULT_BACKLOG: i32 = 128;

/// A registration table entry: the thing to do when its socket is ready.
enum Handler {
    Acceptor(Acceptor),
    Echo(EchoConn),
}

/// Outcome of one handler invocation, applied by the loop driver.
enum Action {
    /// Nothing to change; the registration stays.
    Keep,
    /// New connections to install in the table.
    Accepted(Vec<(TcpStream, SocketAddr)>),
    /// Peer performed an orderly close; tear the connection down.
    Close,
}

impl Handler {
    fn handle(&mut self, ready: &Ready) -> io::Result<Action> {
        if !ready.readable {
            return Ok(Action::Keep);
        }
        match self {
            Handler::Acceptor(acceptor) => Ok(acceptor.accept_ready()),
            Handler::Echo(conn) => conn.echo_ready(),
        }
    }
}

/// Accept-side handler for the listening socket.
struct Acceptor {
    listener: TcpListener,
    /// Immutable option policy applied to every accepted connection.
    policy: SocketPolicy,
}

impl Acceptor {
    /// Accept every connection pending on this readiness notification.
    /// Registrations are edge-triggered: connections left in the queue
    /// would not be re-reported until another client arrives, so the
    /// queue must be drained to WouldBlock here.
    fn accept_ready(&mut self) -> Action {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    self.policy.apply(&SockRef::from(&stream));
                    accepted.push((stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Transient accept failure; the listener registration
                    // stays and already-accepted connections still count.
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }

        if accepted.is_empty() {
            Action::Keep
        } else {
            Action::Accepted(accepted)
        }
    }
}

/// Per-connection echo handler.
struct EchoConn {
    stream: TcpStream,
    peer: SocketAddr,
}

impl EchoConn {
    /// Read and echo until the socket has no more buffered data. Each read
    /// is capped at `READ_CAP` and echoed in full before the next one; the
    /// edge-triggered registration means bytes left unread here would never
    /// be re-reported. A zero-length read is the peer's orderly close.
    fn echo_ready(&mut self) -> io::Result<Action> {
        let mut buf = [0u8; READ_CAP];
        loop {
            let n = match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!(peer = %self.peer, "no data from peer");
                    return Ok(Action::Close);
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Action::Keep)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            debug!(peer = %self.peer, bytes = n, "recv");
            self.write_all_blocking(&buf[..n])?;
            debug!(peer = %self.peer, bytes = n, "sent");
        }
    }

    /// Write the whole slice before returning to the loop. The stream is
    /// non-blocking, so WouldBlock is retried in place: a peer that never
    /// drains its receive buffer stalls this callback, and with it the
    /// single loop thread. Known single-thread head-of-line limitation.
    fn write_all_blocking(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match self.stream.write(data) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                }
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Parse a `host:port` listen address. An empty host means any local
/// address, so `":9999"` binds the IPv4 wildcard.
fn parse_listen(listen: &str) -> io::Result<SocketAddr> {
    let normalized = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };
    normalized
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// The echo server: poller, registration table, and the listening socket
/// (held as the table's acceptor entry).
pub struct Server {
    poller: Poller,
    table: Slab<Handler>,
    local_addr: SocketAddr,
    poll_timeout: Option<Duration>,
}

impl Server {
    /// Create, configure, bind, and listen, then register the listener for
    /// accept readiness. Bind, listen, and registration failures are fatal
    /// and propagate; option failures were already logged and skipped.
    pub fn bind(config: &Config, limits: &dyn PlatformLimits) -> io::Result<Server> {
        let addr = parse_listen(&config.listen)?;

        let socket = Socket::new(
            match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            },
            Type::STREAM,
            Some(Protocol::TCP),
        )?;

        config.policy.apply(&socket);
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let backlog = config.backlog.unwrap_or(DEFAULT_BACKLOG);
        socket.listen(backlog)?;
        match limits.somaxconn() {
            Some(somaxconn) => debug!(backlog, somaxconn, "accept queue size"),
            None => debug!(backlog, "accept queue size"),
        }
        if let Some(max_syn) = limits.max_syn_backlog() {
            debug!(max_syn_queue_size = max_syn, "SYN queue limit");
        }

        let mut listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, "server address");

        let poller = Poller::new(EVENT_CAPACITY)?;
        let mut table = Slab::new();
        let entry = table.vacant_entry();
        let listener_key = entry.key();
        poller.register(&mut listener, Token(listener_key), Interest::READABLE)?;
        entry.insert(Handler::Acceptor(Acceptor {
            listener,
            policy: config.policy.clone(),
        }));

        Ok(Server {
            poller,
            table,
            local_addr,
            poll_timeout: config.poll_timeout,
        })
    }

    /// Address the listener actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live client connections in the registration table.
    pub fn connections(&self) -> usize {
        self.table.len() - 1
    }

    /// Serve until a fatal loop error. The listener and poller are released
    /// on every exit path when `self` drops.
    pub fn run(mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "serving");
        loop {
            self.run_once()?;
        }
    }

    /// One wait/dispatch cycle. Returns the number of readiness events
    /// dispatched (zero on timeout).
    pub fn run_once(&mut self) -> io::Result<usize> {
        let batch = self.poller.wait(self.poll_timeout)?;
        let dispatched = batch.len();
        for ready in &batch {
            self.dispatch(ready)?;
        }
        Ok(dispatched)
    }

    fn dispatch(&mut self, ready: &Ready) -> io::Result<()> {
        let key = ready.token.0;
        // An earlier event in this batch may have removed the entry.
        let Some(handler) = self.table.get_mut(key) else {
            return Ok(());
        };

        match handler.handle(ready) {
            Ok(Action::Keep) => Ok(()),
            Ok(Action::Accepted(connections)) => {
                for (stream, peer) in connections {
                    self.install(stream, peer)?;
                }
                Ok(())
            }
            Ok(Action::Close) => {
                self.remove(key, true);
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "connection error, abandoning");
                self.remove(key, false);
                Ok(())
            }
        }
    }

    /// Register a freshly accepted connection for read readiness. A failed
    /// registration is fatal: it means the poller itself is broken.
    fn install(&mut self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let entry = self.table.vacant_entry();
        let token = Token(entry.key());
        self.poller.register(&mut stream, token, Interest::READABLE)?;
        entry.insert(Handler::Echo(EchoConn { stream, peer }));
        debug!(%peer, token = token.0, "connection registered");
        Ok(())
    }

    /// Drop a connection's table entry: deregister, shut down the write
    /// side, release the socket.
    fn remove(&mut self, key: usize, orderly: bool) {
        if let Some(Handler::Echo(mut conn)) = self.table.try_remove(key) {
            self.poller.deregister(&mut conn.stream);
            let _ = conn.stream.shutdown(Shutdown::Write);
            debug!(peer = %conn.peer, orderly, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::UnknownLimits;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Instant;

    fn test_server() -> Server {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            backlog: None,
            poll_timeout: Some(Duration::from_millis(50)),
            policy: SocketPolicy::demo(),
            log_level: "debug".to_string(),
        };
        Server::bind(&config, &UnknownLimits).unwrap()
    }

    /// Drive the loop on the test thread until `cond` holds.
    fn pump_until(server: &mut Server, cond: impl Fn(&Server) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond(server) {
            server.run_once().unwrap();
            assert!(Instant::now() < deadline, "condition not reached in time");
        }
    }

    #[test]
    fn test_echo_identity() {
        let mut server = test_server();
        let addr = server.local_addr();

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello\n").unwrap();

            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello\n");

            // Orderly close from the client side; the server answers EOF.
            stream.shutdown(Shutdown::Write).unwrap();
            let mut rest = [0u8; 1];
            assert_eq!(stream.read(&mut rest).unwrap(), 0);
        });

        pump_until(&mut server, |_| client.is_finished());
        client.join().unwrap();

        // The closed connection must leave no registration behind.
        pump_until(&mut server, |s| s.connections() == 0);
    }

    #[test]
    fn test_echo_beyond_read_cap() {
        let mut server = test_server();
        let addr = server.local_addr();

        let payload: Vec<u8> = (0..4 * READ_CAP).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(&payload).unwrap();

            // Echoed back across several reads, order preserved.
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed).unwrap();
            echoed
        });

        pump_until(&mut server, |_| client.is_finished());
        assert_eq!(client.join().unwrap(), expected);
    }

    #[test]
    fn test_two_clients_no_cross_talk() {
        let mut server = test_server();
        let addr = server.local_addr();

        let spawn_client = |msg: &'static [u8]| {
            thread::spawn(move || {
                let mut stream = std::net::TcpStream::connect(addr).unwrap();
                stream.write_all(msg).unwrap();
                let mut buf = vec![0u8; msg.len()];
                stream.read_exact(&mut buf).unwrap();
                buf
            })
        };

        let a = spawn_client(b"aaaa-from-client-a");
        let b = spawn_client(b"bbbb-from-client-b");

        pump_until(&mut server, |_| a.is_finished() && b.is_finished());
        assert_eq!(a.join().unwrap(), b"aaaa-from-client-a");
        assert_eq!(b.join().unwrap(), b"bbbb-from-client-b");
    }

    #[test]
    fn test_close_removes_registration() {
        let mut server = test_server();
        let addr = server.local_addr();

        let stream = std::net::TcpStream::connect(addr).unwrap();
        pump_until(&mut server, |s| s.connections() == 1);

        drop(stream);
        pump_until(&mut server, |s| s.connections() == 0);
    }

    #[test]
    fn test_burst_buffered_before_first_poll() {
        let mut server = test_server();
        let addr = server.local_addr();

        let payload: Vec<u8> = (0..4 * READ_CAP).map(|i| (i % 251) as u8).collect();

        // The whole burst (and the FIN) sits in the server's receive buffer
        // before the first dispatch, so it produces a single readiness edge
        // that must be drained completely.
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(&payload).unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        thread::sleep(Duration::from_millis(200));

        pump_until(&mut server, |s| s.connections() == 0);

        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload);

        let mut rest = [0u8; 1];
        assert_eq!(stream.read(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_two_connections_pending_on_one_edge() {
        let mut server = test_server();
        let addr = server.local_addr();

        // Both connections queue on the listener before the first dispatch;
        // one readiness edge must accept them both.
        let c1 = std::net::TcpStream::connect(addr).unwrap();
        let c2 = std::net::TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(200));

        pump_until(&mut server, |s| s.connections() == 2);

        drop(c1);
        drop(c2);
        pump_until(&mut server, |s| s.connections() == 0);
    }

    #[test]
    fn test_empty_host_binds_wildcard() {
        let config = Config {
            listen: ":0".to_string(),
            backlog: None,
            poll_timeout: Some(Duration::from_millis(50)),
            policy: SocketPolicy::demo(),
            log_level: "debug".to_string(),
        };
        let server = Server::bind(&config, &UnknownLimits).unwrap();
        assert!(server.local_addr().ip().is_unspecified());
        assert_ne!(server.local_addr().port(), 0);
    }

    #[test]
    fn test_parse_listen_rejects_garbage() {
        assert!(parse_listen("not-an-address").is_err());
        assert_eq!(
            parse_listen(":7777").unwrap(),
            "0.0.0.0:7777".parse().unwrap()
        );
    }

    #[test]
    fn test_abrupt_reset_is_nonfatal() {
        let mut server = test_server();
        let addr = server.local_addr();

        let stream = std::net::TcpStream::connect(addr).unwrap();
        pump_until(&mut server, |s| s.connections() == 1);

        // RST instead of FIN: linger with zero timeout aborts the
        // connection. The server must log, abandon, and keep serving.
        SockRef::from(&stream)
            .set_linger(Some(Duration::from_secs(0)))
            .unwrap();
        drop(stream);
        pump_until(&mut server, |s| s.connections() == 0);

        // Loop still serves new clients afterwards.
        let mut next = std::net::TcpStream::connect(addr).unwrap();
        let done = thread::spawn(move || {
            next.write_all(b"still alive").unwrap();
            let mut buf = [0u8; 11];
            next.read_exact(&mut buf).unwrap();
            buf
        });
        pump_until(&mut server, |_| done.is_finished());
        assert_eq!(&done.join().unwrap(), b"still alive");
    }
}
