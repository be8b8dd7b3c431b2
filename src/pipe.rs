//! In-process listener fed by hand
//!
//! [`PipeListener`] looks like a listening socket to whoever calls
//! [`PipeListener::accept`], but its connections are injected one at a time
//! through [`PipeListener::submit`]. The hand-off is a rendezvous: `submit`
//! only returns once an `accept` call has taken the connection.

use std::fmt;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::listener::{wait_closed, CloseListener};

/// Returned by every operation on a closed pipe listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeClosed;

impl fmt::Display for PipeClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipe listener closed")
    }
}

impl std::error::Error for PipeClosed {}

impl From<PipeClosed> for crate::error::GatewayError {
    fn from(_: PipeClosed) -> Self {
        crate::error::GatewayError::PipeClosed
    }
}

struct Handoff<C> {
    conn: C,
    taken: oneshot::Sender<()>,
}

/// Single-slot rendezvous between connection producers and one accept loop.
pub struct PipeListener<C> {
    tx: mpsc::Sender<Handoff<C>>,
    rx: Mutex<mpsc::Receiver<Handoff<C>>>,
    closed: watch::Sender<bool>,
}

impl<C: Send> PipeListener<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Hand `conn` to the accept side.
    ///
    /// Waits until a pending or future [`accept`](Self::accept) receives the
    /// connection. Fails immediately if the listener is already closed, and
    /// fails (dropping the connection) if it closes while waiting.
    pub async fn submit(&self, conn: C) -> Result<(), PipeClosed> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(PipeClosed);
        }

        let (taken, taken_rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return Err(PipeClosed),
            sent = self.tx.send(Handoff { conn, taken }) => {
                sent.map_err(|_| PipeClosed)?;
            }
        }

        tokio::select! {
            biased;
            ack = taken_rx => ack.map_err(|_| PipeClosed),
            _ = wait_closed(&mut closed) => {
                self.discard_pending();
                Err(PipeClosed)
            }
        }
    }

    /// Wait for the next submitted connection.
    ///
    /// The only error is [`PipeClosed`]; accept loops can treat it as a
    /// normal end of service.
    pub async fn accept(&self) -> Result<C, PipeClosed> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => {
                    drain(&mut rx);
                    return Err(PipeClosed);
                }
                handoff = rx.recv() => {
                    let Some(Handoff { conn, taken }) = handoff else {
                        return Err(PipeClosed);
                    };
                    // The submitter only gives up once the pipe is closed.
                    if taken.send(()).is_ok() {
                        return Ok(conn);
                    }
                }
            }
        }
    }

    /// Close the pipe. Idempotent; the first call wakes every blocked
    /// `accept` and `submit` with [`PipeClosed`].
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.discard_pending();
    }

    /// Drop a connection left in the slot by a submitter that raced `close`.
    ///
    /// A blocked `accept` holds the receiver; it drains the slot itself once
    /// it sees the close.
    fn discard_pending(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            drain(&mut rx);
        }
    }
}

fn drain<C>(rx: &mut mpsc::Receiver<Handoff<C>>) {
    while rx.try_recv().is_ok() {}
}

impl<C: Send> Default for PipeListener<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Send> CloseListener for PipeListener<C> {
    fn close(&self) -> std::io::Result<()> {
        PipeListener::close(self);
        Ok(())
    }
}
