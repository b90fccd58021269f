//! Timeout-mode echo client.
//!
//! One round-trip against a running echo server: connect with a connect
//! timeout, apply recv/send timeouts and socket options, send a payload,
//! and read until the full echo has come back. Backs the `probe` subcommand
//! and the server's integration tests.

use crate::limits;
use crate::sockopt::SocketPolicy;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Client-side policy: the three timeout knobs plus the same option surface
/// the server applies to its sockets.
#[derive(Debug, Clone, Default)]
pub struct ClientPolicy {
    /// Connect timeout; `None` leaves it to the kernel's SYN retry budget.
    pub connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub options: SocketPolicy,
}

/// Perform one echo round-trip, returning the echoed bytes.
pub fn probe(addr: SocketAddr, payload: &[u8], policy: &ClientPolicy) -> io::Result<Vec<u8>> {
    if policy.connect_timeout.is_none() {
        // Without an explicit timeout the kernel's SYN retransmit schedule
        // bounds the connect; report what that ceiling is.
        if let Some(retries) = limits::detect().syn_retries() {
            debug!(
                syn_retries = retries,
                ceiling_secs = limits::max_connect_timeout(retries).as_secs(),
                "kernel max connect timeout"
            );
        }
    }

    let mut stream = match policy.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    debug!(peer = %addr, "connected");

    policy.options.apply(&SockRef::from(&stream));
    stream.set_read_timeout(policy.recv_timeout)?;
    stream.set_write_timeout(policy.send_timeout)?;

    stream.write_all(payload)?;
    debug!(bytes = payload.len(), "sent");

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed)?;
    debug!(bytes = echoed.len(), "recv");

    let _ = stream.shutdown(Shutdown::Write);
    Ok(echoed)
}
