//! Readiness multiplexer.
//!
//! Thin wrapper around `mio::Poll` (epoll on Linux, kqueue on BSD/macOS).
//! Callers register sources under a token, then `wait` drains one batch of
//! readiness events at a time. Which source a token maps to is the caller's
//! business; the server keeps that table in a slab keyed by token.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;
use tracing::debug;

/// One readiness event drained from the poll.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub token: Token,
    pub readable: bool,
}

/// Wrapper owning the OS readiness primitive and its event buffer.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Register an open source under `token` for `interest`. Registering a
    /// source that already has an entry replaces it.
    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self.poll.registry().register(source, token, interest) {
            Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.reregister(source, token, interest)
            }
            other => other,
        }
    }

    /// Replace the registration of an already-registered source.
    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a source's registration. A source that was never registered
    /// (or is already gone) makes this a logged no-op.
    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) {
        if let Err(e) = self.poll.registry().deregister(source) {
            debug!(error = %e, "deregister was a no-op");
        }
    }

    /// Block until at least one registered source is ready or `timeout`
    /// elapses. `None` blocks indefinitely, `Some(ZERO)` polls and returns.
    /// The whole pending batch is drained into the returned vec.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            // A signal landing mid-poll is not an error, just an empty batch.
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }

        Ok(self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_wait_zero_timeout_polls() {
        let mut poller = Poller::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        poller
            .register(&mut listener, Token(0), Interest::READABLE)
            .unwrap();

        let batch = poller.wait(Some(Duration::ZERO)).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_accept_readiness_reported() {
        let mut poller = Poller::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        poller
            .register(&mut listener, Token(7), Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let batch = poller.wait(Some(Duration::from_millis(100))).unwrap();
            if let Some(ready) = batch.first() {
                assert_eq!(ready.token, Token(7));
                assert!(ready.readable);
                break;
            }
            assert!(Instant::now() < deadline, "no readiness within deadline");
        }
    }

    #[test]
    fn test_register_replaces_existing_entry() {
        let mut poller = Poller::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        poller
            .register(&mut listener, Token(1), Interest::READABLE)
            .unwrap();
        // Second registration of the same source replaces the first; events
        // must surface under the new token.
        poller
            .register(&mut listener, Token(2), Interest::READABLE)
            .unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let batch = poller.wait(Some(Duration::from_millis(100))).unwrap();
            if let Some(ready) = batch.first() {
                assert_eq!(ready.token, Token(2));
                break;
            }
            assert!(Instant::now() < deadline, "no readiness within deadline");
        }
    }

    #[test]
    fn test_deregister_unregistered_is_noop() {
        let poller = Poller::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        // Never registered; must not panic or error out.
        poller.deregister(&mut listener);
    }
}
