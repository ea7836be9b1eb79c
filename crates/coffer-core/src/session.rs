//! Backend sessions.
//!
//! A [`Connection`] owns a backend handle and counts the sessions cloned from it. Every
//! operation works on its own [`Session`]; streaming operations hold a [`SessionLease`],
//! which also releases its session when the governing token is cancelled.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Long-lived backend handle shared by one or more buckets.
#[derive(Debug, Clone)]
pub struct Connection<H> {
    target: String,
    handle: H,
    open: Arc<AtomicUsize>,
}

impl<H> Connection<H>
where
    H: Clone + Send + Sync + 'static,
{
    pub fn new(target: impl Into<String>, handle: H) -> Self {
        Self {
            target: target.into(),
            handle,
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Human readable description of what this connection talks to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Number of sessions cloned from this connection and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Clone a session for a single operation. Released on drop.
    pub fn session(&self) -> Session<H> {
        self.open.fetch_add(1, Ordering::AcqRel);
        Session {
            handle: self.handle.clone(),
            open: Arc::clone(&self.open),
            released: AtomicBool::new(false),
        }
    }

    /// Clone a session for a streaming operation bound to `ctx`.
    ///
    /// The session is released when the lease finishes, when the lease is dropped,
    /// or when `ctx` is cancelled, whichever happens first.
    pub fn lease(&self, ctx: &CancellationToken) -> SessionLease<H> {
        let session = Arc::new(self.session());
        let token = ctx.child_token();

        let monitor = token.clone();
        let guard = Arc::clone(&session);
        tokio::spawn(async move {
            monitor.cancelled().await;
            if guard.release() {
                trace!("Session released by cancellation");
            }
        });

        SessionLease { session, token }
    }
}

/// A cloned backend handle accounted against its connection.
#[derive(Debug)]
pub struct Session<H> {
    handle: H,
    open: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl<H> Session<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Release the session. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.open.fetch_sub(1, Ordering::AcqRel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<H> Drop for Session<H> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A session tied to a cancellation token for the lifetime of a stream or iterator.
#[derive(Debug)]
pub struct SessionLease<H> {
    session: Arc<Session<H>>,
    token: CancellationToken,
}

impl<H> SessionLease<H> {
    pub fn handle(&self) -> &H {
        self.session.handle()
    }

    /// Child of the operation's token. Cancelled once the lease ends.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// End the lease and release its session now.
    pub fn finish(&self) {
        self.token.cancel();
        self.session.release();
    }

    pub fn is_released(&self) -> bool {
        self.session.is_released()
    }
}

impl<H> Drop for SessionLease<H> {
    fn drop(&mut self) {
        self.finish();
    }
}
