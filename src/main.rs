//! echoplex: a readiness-driven TCP echo server
//!
//! A single-threaded echo server built on OS readiness selection, plus a
//! timeout-mode client for poking at it:
//! - Echo server loop: accept and echo callbacks dispatched from one poll loop
//! - Socket option surface: reuse, nodelay, quickack, keepalive, buffer sizes
//! - Kernel limit introspection with effective values logged at debug level
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod limits;
mod poller;
mod server;
mod sockopt;

use clap::Parser;
use config::{CliArgs, Mode, ProbeArgs, ServeArgs};
use limits::PlatformLimits;
use std::net::ToSocketAddrs;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    match args.mode.unwrap_or_else(|| Mode::Serve(ServeArgs::default())) {
        Mode::Serve(serve_args) => run_serve(serve_args),
        Mode::Probe(probe_args) => run_probe(probe_args),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::resolve(args)?;
    init_logging(&config.log_level);

    info!(
        listen = %config.listen,
        backlog = ?config.backlog,
        poll_timeout = ?config.poll_timeout,
        "Starting echoplex server"
    );

    let limits = limits::detect();
    log_kernel_limits(limits.as_ref());

    let server = server::Server::bind(&config, limits.as_ref())?;
    server.run()?;
    Ok(())
}

fn run_probe(args: ProbeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_level);

    let addr = args
        .addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("no address resolved for '{}'", args.addr))?;

    let policy = client::ClientPolicy {
        connect_timeout: Some(Duration::from_millis(args.connect_timeout_ms)),
        recv_timeout: Some(Duration::from_millis(args.io_timeout_ms)),
        send_timeout: Some(Duration::from_millis(args.io_timeout_ms)),
        options: sockopt::SocketPolicy {
            nodelay: Some(true),
            ..sockopt::SocketPolicy::default()
        },
    };

    info!(%addr, bytes = args.message.len(), "probing");
    let echoed = client::probe(addr, args.message.as_bytes(), &policy)?;
    if echoed != args.message.as_bytes() {
        return Err("echoed bytes differ from the payload sent".into());
    }
    info!(bytes = echoed.len(), "echo verified");
    Ok(())
}

/// Report the kernel tunables that clamp what the socket options can ask for.
fn log_kernel_limits(limits: &dyn PlatformLimits) {
    if let Some(v) = limits.somaxconn() {
        debug!(somaxconn = v, "kernel max accept queue");
    }
    if let Some(v) = limits.max_syn_backlog() {
        debug!(tcp_max_syn_backlog = v, "kernel max SYN queue");
    }
    if let Some(v) = limits.max_recv_buffer() {
        debug!(rmem_max = v, "kernel max recv buffer");
    }
    if let Some(v) = limits.max_send_buffer() {
        debug!(wmem_max = v, "kernel max send buffer");
    }
    if let Some(v) = limits.max_tcp_recv_buffer() {
        debug!(tcp_rmem_max = v, "kernel max TCP recv buffer");
    }
    if let Some(v) = limits.max_tcp_send_buffer() {
        debug!(tcp_wmem_max = v, "kernel max TCP send buffer");
    }
    if let Some(v) = limits.synack_retries() {
        debug!(
            tcp_synack_retries = v,
            accept_ceiling_secs = limits::max_connect_timeout(v).as_secs(),
            "kernel SYN/ACK retry budget"
        );
    }
}
