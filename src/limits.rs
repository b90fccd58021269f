//! Kernel networking limits.
//!
//! The listen backlog, socket buffer sizes, and connect timeouts are all
//! clamped or governed by kernel tunables. `PlatformLimits` exposes the ones
//! this crate reports at startup; on Linux they come from `/proc/sys/net`,
//! elsewhere every accessor returns `None` and the caller just logs less.
//! The server loop itself never branches on platform identity.

use std::path::Path;
use std::time::Duration;

/// Read-only view of kernel networking tunables.
pub trait PlatformLimits {
    /// Maximum accept queue size (`somaxconn`).
    fn somaxconn(&self) -> Option<u32>;
    /// Maximum SYN queue size (`tcp_max_syn_backlog`).
    fn max_syn_backlog(&self) -> Option<u32>;
    /// Maximum SO_RCVBUF the kernel will grant (`rmem_max`).
    fn max_recv_buffer(&self) -> Option<usize>;
    /// Maximum SO_SNDBUF the kernel will grant (`wmem_max`).
    fn max_send_buffer(&self) -> Option<usize>;
    /// Maximum auto-tuned TCP receive buffer (`tcp_rmem`, third field).
    fn max_tcp_recv_buffer(&self) -> Option<usize>;
    /// Maximum auto-tuned TCP send buffer (`tcp_wmem`, third field).
    fn max_tcp_send_buffer(&self) -> Option<usize>;
    /// Active-open SYN retransmit count (`tcp_syn_retries`).
    fn syn_retries(&self) -> Option<u32>;
    /// Passive-open SYN/ACK retransmit count (`tcp_synack_retries`).
    fn synack_retries(&self) -> Option<u32>;
}

/// Limits read from `/proc/sys/net` on Linux.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub struct ProcLimits;

/// Fallback for platforms without a readable tunable surface.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub struct UnknownLimits;

impl PlatformLimits for UnknownLimits {
    fn somaxconn(&self) -> Option<u32> {
        None
    }
    fn max_syn_backlog(&self) -> Option<u32> {
        None
    }
    fn max_recv_buffer(&self) -> Option<usize> {
        None
    }
    fn max_send_buffer(&self) -> Option<usize> {
        None
    }
    fn max_tcp_recv_buffer(&self) -> Option<usize> {
        None
    }
    fn max_tcp_send_buffer(&self) -> Option<usize> {
        None
    }
    fn syn_retries(&self) -> Option<u32> {
        None
    }
    fn synack_retries(&self) -> Option<u32> {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
impl ProcLimits {
    fn read_value<T: std::str::FromStr>(path: &str) -> Option<T> {
        std::fs::read_to_string(Path::new(path))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// `tcp_rmem`/`tcp_wmem` hold three whitespace-separated values:
    /// min, default, max.
    fn read_third_field(path: &str) -> Option<usize> {
        std::fs::read_to_string(Path::new(path))
            .ok()?
            .split_whitespace()
            .nth(2)?
            .parse()
            .ok()
    }
}

impl PlatformLimits for ProcLimits {
    fn somaxconn(&self) -> Option<u32> {
        Self::read_value("/proc/sys/net/core/somaxconn")
    }

    fn max_syn_backlog(&self) -> Option<u32> {
        Self::read_value("/proc/sys/net/ipv4/tcp_max_syn_backlog")
    }

    fn max_recv_buffer(&self) -> Option<usize> {
        Self::read_value("/proc/sys/net/core/rmem_max")
    }

    fn max_send_buffer(&self) -> Option<usize> {
        Self::read_value("/proc/sys/net/core/wmem_max")
    }

    fn max_tcp_recv_buffer(&self) -> Option<usize> {
        Self::read_third_field("/proc/sys/net/ipv4/tcp_rmem")
    }

    fn max_tcp_send_buffer(&self) -> Option<usize> {
        Self::read_third_field("/proc/sys/net/ipv4/tcp_wmem")
    }

    fn syn_retries(&self) -> Option<u32> {
        Self::read_value("/proc/sys/net/ipv4/tcp_syn_retries")
    }

    fn synack_retries(&self) -> Option<u32> {
        Self::read_value("/proc/sys/net/ipv4/tcp_synack_retries")
    }
}

/// Limits implementation for the running platform.
pub fn detect() -> Box<dyn PlatformLimits> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcLimits)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UnknownLimits)
    }
}

/// Worst-case connect timeout implied by `retries` SYN retransmits.
///
/// Each retransmit doubles the previous wait starting at 2 seconds, on top
/// of the initial 1-second timeout: 1 + 2 + 4 + ... = 2^(retries+1) - 1.
pub fn max_connect_timeout(retries: u32) -> Duration {
    let mut secs: u64 = 1;
    for attempt in 1..=retries {
        secs += 1u64 << attempt;
    }
    Duration::from_secs(secs)
}
