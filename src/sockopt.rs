//! Socket option configuration.
//!
//! A `SocketPolicy` names the options to apply to a socket; `apply` sets each
//! requested option through socket2 and reads the effective value back for
//! logging. Options the platform rejects are skipped, never fatal: the kernel
//! is free to clamp buffer sizes or refuse an option, and the read-back shows
//! what actually took effect.
//!
//! The same policy value is applied to the listening socket at bind time and
//! to every accepted connection, so there is no per-connection mutable option
//! state anywhere in the process.

use serde::Deserialize;
use socket2::{Socket, TcpKeepalive};
use std::time::Duration;
use tracing::debug;

/// Requested socket options. `None` leaves the platform default in place.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SocketPolicy {
    /// SO_REUSEADDR: allow rebinding an address still in TIME-WAIT.
    #[serde(default)]
    pub reuse_address: Option<bool>,
    /// SO_REUSEPORT: allow multiple listeners on one address for
    /// kernel-level accept distribution.
    #[serde(default)]
    pub reuse_port: Option<bool>,
    /// TCP_NODELAY: disable Nagle's send coalescing.
    #[serde(default)]
    pub nodelay: Option<bool>,
    /// TCP_QUICKACK: disable delayed ACKs (Linux only, skipped elsewhere).
    #[serde(default)]
    pub quickack: Option<bool>,
    /// Seconds an idle connection waits before the first keepalive probe.
    #[serde(default)]
    pub keepalive_idle: Option<u64>,
    /// Probes sent before the peer is declared dead.
    #[serde(default)]
    pub keepalive_count: Option<u32>,
    /// Seconds between keepalive probes.
    #[serde(default)]
    pub keepalive_interval: Option<u64>,
    /// SO_RCVBUF in bytes (clamped by the kernel to its configured maximum).
    #[serde(default)]
    pub recv_buffer: Option<usize>,
    /// SO_SNDBUF in bytes.
    #[serde(default)]
    pub send_buffer: Option<usize>,
}

impl Default for SocketPolicy {
    fn default() -> Self {
        Self {
            reuse_address: None,
            reuse_port: None,
            nodelay: None,
            quickack: None,
            keepalive_idle: None,
            keepalive_count: None,
            keepalive_interval: None,
            recv_buffer: None,
            send_buffer: None,
        }
    }
}

impl SocketPolicy {
    /// Policy used when no configuration is supplied; mirrors the options the
    /// crate exists to demonstrate.
    pub fn demo() -> Self {
        Self {
            reuse_address: Some(true),
            reuse_port: Some(true),
            nodelay: Some(true),
            quickack: Some(true),
            keepalive_idle: Some(1800),
            keepalive_count: Some(9),
            keepalive_interval: Some(15),
            recv_buffer: None,
            send_buffer: None,
        }
    }

    /// Apply every requested option to `sock`, logging the effective value
    /// read back after each one. Never fails: a rejected or unsupported
    /// option is logged and skipped.
    pub fn apply(&self, sock: &Socket) {
        self.apply_reuse(sock);
        self.apply_nodelay(sock);
        self.apply_quickack(sock);
        self.apply_keepalive(sock);
        self.apply_buffers(sock);
    }

    fn apply_reuse(&self, sock: &Socket) {
        if let Some(on) = self.reuse_address {
            if let Err(e) = sock.set_reuse_address(on) {
                debug!(error = %e, "SO_REUSEADDR not applied, skipped");
            }
        }
        match sock.reuse_address() {
            Ok(v) => debug!(reuse_address = v, "effective SO_REUSEADDR"),
            Err(e) => debug!(error = %e, "SO_REUSEADDR read-back failed"),
        }

        #[cfg(unix)]
        {
            if let Some(on) = self.reuse_port {
                if let Err(e) = sock.set_reuse_port(on) {
                    debug!(error = %e, "SO_REUSEPORT not applied, skipped");
                }
            }
            match sock.reuse_port() {
                Ok(v) => debug!(reuse_port = v, "effective SO_REUSEPORT"),
                Err(e) => debug!(error = %e, "SO_REUSEPORT read-back failed"),
            }
        }
        #[cfg(not(unix))]
        if self.reuse_port.is_some() {
            debug!("SO_REUSEPORT unsupported on this platform, skipped");
        }
    }

    fn apply_nodelay(&self, sock: &Socket) {
        if let Some(on) = self.nodelay {
            if let Err(e) = sock.set_nodelay(on) {
                debug!(error = %e, "TCP_NODELAY not applied, skipped");
            }
        }
        match sock.nodelay() {
            Ok(v) => debug!(nodelay = v, "effective TCP_NODELAY"),
            Err(e) => debug!(error = %e, "TCP_NODELAY read-back failed"),
        }
    }

    fn apply_quickack(&self, sock: &Socket) {
        #[cfg(target_os = "linux")]
        {
            if let Some(on) = self.quickack {
                if let Err(e) = sock.set_quickack(on) {
                    debug!(error = %e, "TCP_QUICKACK not applied, skipped");
                }
            }
            match sock.quickack() {
                Ok(v) => debug!(quickack = v, "effective TCP_QUICKACK"),
                Err(e) => debug!(error = %e, "TCP_QUICKACK read-back failed"),
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = sock;
            if self.quickack.is_some() {
                debug!("TCP_QUICKACK unsupported on this platform, skipped");
            }
        }
    }

    fn apply_keepalive(&self, sock: &Socket) {
        let requested = self.keepalive_idle.is_some()
            || self.keepalive_count.is_some()
            || self.keepalive_interval.is_some();

        if requested {
            let mut ka = TcpKeepalive::new();
            if let Some(idle) = self.keepalive_idle {
                ka = ka.with_time(Duration::from_secs(idle));
            }
            if let Some(interval) = self.keepalive_interval {
                ka = ka.with_interval(Duration::from_secs(interval));
            }
            #[cfg(any(target_os = "linux", target_os = "macos"))]
            if let Some(count) = self.keepalive_count {
                ka = ka.with_retries(count);
            }
            if let Err(e) = sock.set_tcp_keepalive(&ka) {
                debug!(error = %e, "SO_KEEPALIVE not applied, skipped");
            }
        }

        match sock.keepalive() {
            Ok(v) => debug!(keepalive = v, "effective SO_KEEPALIVE"),
            Err(e) => debug!(error = %e, "SO_KEEPALIVE read-back failed"),
        }
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if let Ok(t) = sock.keepalive_time() {
                debug!(idle_secs = t.as_secs(), "effective keepalive idle time");
            }
            if let Ok(i) = sock.keepalive_interval() {
                debug!(interval_secs = i.as_secs(), "effective keepalive interval");
            }
            if let Ok(r) = sock.keepalive_retries() {
                debug!(retries = r, "effective keepalive retries");
            }
        }
    }

    fn apply_buffers(&self, sock: &Socket) {
        if let Some(size) = self.recv_buffer {
            if let Err(e) = sock.set_recv_buffer_size(size) {
                debug!(error = %e, "SO_RCVBUF not applied, skipped");
            }
        }
        match sock.recv_buffer_size() {
            Ok(v) => debug!(recv_buffer = v, "effective SO_RCVBUF"),
            Err(e) => debug!(error = %e, "SO_RCVBUF read-back failed"),
        }

        if let Some(size) = self.send_buffer {
            if let Err(e) = sock.set_send_buffer_size(size) {
                debug!(error = %e, "SO_SNDBUF not applied, skipped");
            }
        }
        match sock.send_buffer_size() {
            Ok(v) => debug!(send_buffer = v, "effective SO_SNDBUF"),
            Err(e) => debug!(error = %e, "SO_SNDBUF read-back failed"),
        }
    }
}
