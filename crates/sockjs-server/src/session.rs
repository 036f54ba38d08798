use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sockjs_core::SessionError;
use tokio::sync::{mpsc, Notify};

/// Close code used when the application handler returns or the server
/// evicts an idle session.
pub const CLOSE_GO_AWAY: u16 = 3000;
pub const CLOSE_GO_AWAY_REASON: &str = "Go away!";

/// Close code used when the network side of a session is lost.
pub const CLOSE_INTERRUPTED: u16 = 1002;
pub const CLOSE_INTERRUPTED_REASON: &str = "Connection interrupted";

/// Lifecycle of one logical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// The next thing an attached receiver must write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Pending outbound payloads, drained as one batch.
    Flush(Vec<String>),
    /// No traffic for a full heartbeat interval.
    Heartbeat,
    /// The session is going away; deliver this and stop.
    Close { code: u16, reason: String },
}

struct Inner {
    state: SessionState,
    outbound: VecDeque<String>,
    attached: bool,
    close_reason: Option<(u16, String)>,
    last_activity: Instant,
    inbound_tx: Option<mpsc::Sender<String>>,
    // Held until the application task spawns on the first attach.
    inbound_rx: Option<mpsc::Receiver<String>>,
}

/// One logical bidirectional channel, shared by every HTTP request that
/// carries its id. All mutation happens under the inner mutex; the attached
/// receiver waits on `notify` for outbound traffic or close.
pub struct Session {
    id: String,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Session {
    pub fn new(id: impl Into<String>, max_inbound_queue: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(max_inbound_queue);
        Arc::new(Self {
            id: id.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                outbound: VecDeque::new(),
                attached: false,
                close_reason: None,
                last_activity: Instant::now(),
                inbound_tx: Some(inbound_tx),
                inbound_rx: Some(inbound_rx),
            }),
            notify: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Install the calling request as the session's receiver. At most one
    /// receiver exists at any instant; a concurrent second attach fails
    /// without disturbing the first. A closed session still attaches so the
    /// close frame can be replayed.
    pub fn attach(self: &Arc<Self>) -> Result<ReceiverGuard, SessionError> {
        let mut inner = self.inner.lock();
        if inner.attached {
            return Err(SessionError::AlreadyAttached);
        }
        inner.attached = true;
        inner.last_activity = Instant::now();
        let opened = if inner.state == SessionState::Connecting {
            inner.state = SessionState::Open;
            true
        } else {
            false
        };
        Ok(ReceiverGuard {
            session: Arc::clone(self),
            opened,
        })
    }

    /// Queue one outbound payload, delivered FIFO to whichever receiver is
    /// or next becomes attached.
    pub fn send(&self, payload: impl Into<String>) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Err(SessionError::Closed);
            }
            inner.outbound.push_back(payload.into());
            inner.last_activity = Instant::now();
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Forward client-posted payloads to the application, preserving post
    /// order across any number of send-class requests.
    pub async fn receive(&self, payloads: Vec<String>) -> Result<(), SessionError> {
        let tx = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return Err(SessionError::Closed);
            }
            inner.last_activity = Instant::now();
            inner.inbound_tx.clone()
        };
        let Some(tx) = tx else {
            return Err(SessionError::Closed);
        };
        for payload in payloads {
            if tx.send(payload).await.is_err() {
                return Err(SessionError::Closed);
            }
        }
        Ok(())
    }

    /// Begin teardown. The close frame goes to the current receiver, or to
    /// the next one to attach. Only the first close reason sticks.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.close_reason.is_some() {
                return;
            }
            inner.close_reason = Some((code, reason.to_string()));
            if inner.state != SessionState::Closed {
                inner.state = SessionState::Closing;
            }
            inner.last_activity = Instant::now();
            // Ends the application's recv() once the queue drains.
            inner.inbound_tx = None;
        }
        self.notify.notify_one();
    }

    /// Time since the last real traffic, or None while a receiver is
    /// attached. Heartbeats do not count as traffic.
    pub fn idle_for(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.attached {
            None
        } else {
            Some(inner.last_activity.elapsed())
        }
    }

    pub(crate) fn take_inbound_rx(&self) -> Option<mpsc::Receiver<String>> {
        self.inner.lock().inbound_rx.take()
    }
}

/// Exclusive hold on a session's receiver slot. Dropping it detaches, so a
/// cancelled request task (client abort, rotation, timeout) always releases
/// the slot while leaving buffered state intact.
pub struct ReceiverGuard {
    session: Arc<Session>,
    opened: bool,
}

impl ReceiverGuard {
    /// True when this attach performed the Connecting → Open transition;
    /// the binder emits the Open frame first and spawns the application
    /// handler exactly once.
    pub fn just_opened(&self) -> bool {
        self.opened
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the next frame-worthy event: queued messages (drained as one
    /// batch), the close handoff, or a heartbeat after `heartbeat` elapses
    /// with no traffic. Pending messages flush before any close frame.
    ///
    /// Cancel-safe: the queue is only drained on the synchronous path just
    /// before returning.
    pub async fn next_event(&self, heartbeat: Duration) -> SessionEvent {
        loop {
            // Register interest before checking state so a send racing this
            // check still wakes us.
            let notified = self.session.notify.notified();
            {
                let mut inner = self.session.inner.lock();
                if !inner.outbound.is_empty() {
                    let batch = inner.outbound.drain(..).collect();
                    return SessionEvent::Flush(batch);
                }
                if let Some((code, reason)) = inner.close_reason.clone() {
                    inner.state = SessionState::Closed;
                    return SessionEvent::Close { code, reason };
                }
            }
            if tokio::time::timeout(heartbeat, notified).await.is_err() {
                return SessionEvent::Heartbeat;
            }
        }
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        inner.attached = false;
        inner.last_activity = Instant::now();
    }
}

/// Application-facing side of a session, handed to the accept callback once
/// the session opens.
pub struct SessionHandle {
    session: Arc<Session>,
    inbound: mpsc::Receiver<String>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        self.session.id()
    }

    /// Next payload posted by the client, in post order. Returns None once
    /// the session closes.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn send(&self, payload: impl Into<String>) -> Result<(), SessionError> {
        self.session.send(payload)
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.session.close(code, reason);
    }
}

/// Application entry point, invoked once per accepted session.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, session: SessionHandle);
}

/// Hand the session to the application. When the handler returns, the
/// session is closed the way the client expects a finished server to close.
pub(crate) fn spawn_app_task(session: &Arc<Session>, handler: Arc<dyn SessionHandler>) {
    let Some(inbound) = session.take_inbound_rx() else {
        return;
    };
    let handle = SessionHandle {
        session: Arc::clone(session),
        inbound,
    };
    let session = Arc::clone(session);
    tokio::spawn(async move {
        tracing::debug!(session_id = %session.id(), "Session handler started");
        handler.handle(handle).await;
        session.close(CLOSE_GO_AWAY, CLOSE_GO_AWAY_REASON);
        tracing::debug!(session_id = %session.id(), "Session handler finished");
    });
}
