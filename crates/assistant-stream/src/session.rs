use std::sync::Arc;

use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ConversationTurn, DomainEvent, ToolStreamRequest};
use crate::state::{SessionId, SessionState, StreamStatus, Transition};
use crate::transport::{ChatTransport, StreamTransport, ToolTransport};

/// Controller for the chat stream.
pub type ChatStream = StreamController<ChatTransport>;
/// Controller for the tool stream.
pub type ToolStream = StreamController<ToolTransport>;

/// Handle used to cancel one session from anywhere.
///
/// Cancelling flips the session to `idle` under the state lock before the
/// run task is signalled, so nothing the task still has buffered can land
/// afterwards.
pub struct AbortHandle<E> {
    session_id: SessionId,
    state: watch::Sender<SessionState<E>>,
    tx: watch::Sender<bool>,
}

impl<E> Clone for AbortHandle<E> {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<E: DomainEvent> AbortHandle<E> {
    /// Requests cancellation. Calling it again is a no-op.
    pub fn abort(&self) {
        let cancelled = self
            .state
            .send_if_modified(|state| state.cancel(self.session_id));
        if cancelled {
            let kind = E::KIND;
            info!(session_id = %self.session_id, kind = %kind, "stream session cancelled");
        }
        self.tx.send_replace(true);
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

struct ActiveSession<E> {
    abort: AbortHandle<E>,
    task: Option<JoinHandle<()>>,
}

/// Caller-owned handle for one logical stream.
///
/// At most one transport is live per controller: [`StreamController::start`]
/// cancels the previous session and waits for its run task to release the
/// connection before opening a new one. Observers follow the state through
/// [`StreamController::subscribe`]; the subscription survives restarts.
pub struct StreamController<T: StreamTransport> {
    transport: Arc<T>,
    state: watch::Sender<SessionState<T::Event>>,
    active: Option<ActiveSession<T::Event>>,
}

impl<T: StreamTransport> StreamController<T> {
    pub fn new(transport: T) -> Self {
        let (state, _) = watch::channel(SessionState::new());
        Self {
            transport: Arc::new(transport),
            state,
            active: None,
        }
    }

    /// Receiver that observes every state change, across restarts.
    pub fn subscribe(&self) -> watch::Receiver<SessionState<T::Event>> {
        self.state.subscribe()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SessionState<T::Event> {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> StreamStatus {
        self.state.borrow().status()
    }

    /// Abort handle of the current session, if one was started.
    pub fn abort_handle(&self) -> Option<AbortHandle<T::Event>> {
        self.active.as_ref().map(|active| active.abort.clone())
    }

    /// Tears down any previous session and starts a fresh one.
    pub async fn start(&mut self, request: T::Request) -> SessionId {
        self.teardown().await;

        let session_id = SessionId::new_v4();
        self.state.send_modify(|state| state.begin(session_id));
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort = AbortHandle {
            session_id,
            state: self.state.clone(),
            tx: abort_tx,
        };
        let kind = T::Event::KIND;
        info!(session_id = %session_id, kind = %kind, "starting stream session");
        let task = tokio::spawn(run_session(
            self.transport.clone(),
            request,
            session_id,
            self.state.clone(),
            abort_rx,
        ));
        self.active = Some(ActiveSession {
            abort,
            task: Some(task),
        });
        session_id
    }

    /// Cancels the current session and waits for its transport to close.
    ///
    /// Idempotent; an idle controller stays idle and its log is untouched.
    pub async fn cancel(&mut self) {
        self.teardown().await;
    }

    /// Waits until the current session's run task has finished and returns
    /// the resulting state.
    pub async fn wait(&mut self) -> SessionState<T::Event> {
        if let Some(task) = self.active.as_mut().and_then(|active| active.task.take()) {
            if let Err(err) = task.await {
                warn!(error = %err, "stream session task failed");
            }
        }
        self.snapshot()
    }

    async fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.abort.abort();
        if let Some(task) = active.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "stream session task failed during teardown");
            }
        }
    }
}

impl StreamController<ChatTransport> {
    /// Starts (or restarts) the chat stream.
    pub async fn restart(&mut self) -> SessionId {
        self.start(()).await
    }
}

impl StreamController<ToolTransport> {
    /// Starts (or restarts) the tool stream with `conversation`.
    pub async fn generate(&mut self, conversation: Vec<ConversationTurn>) -> SessionId {
        self.start(ToolStreamRequest::new(conversation)).await
    }
}

impl<T: StreamTransport> Drop for StreamController<T> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.abort.abort();
            if let Some(task) = active.task {
                task.abort();
            }
        }
    }
}

async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn update<E: DomainEvent>(
    state: &watch::Sender<SessionState<E>>,
    modify: impl FnOnce(&mut SessionState<E>) -> Transition,
) -> Transition {
    let mut transition = Transition::Ignored;
    state.send_if_modified(|state| {
        transition = modify(state);
        transition.is_applied()
    });
    transition
}

async fn run_session<T: StreamTransport>(
    transport: Arc<T>,
    request: T::Request,
    session_id: SessionId,
    state: watch::Sender<SessionState<T::Event>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let kind = T::Event::KIND;
    let opened = tokio::select! {
        biased;
        _ = aborted(&mut abort_rx) => return,
        opened = transport.open(request) => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(failure) => {
            warn!(session_id = %session_id, kind = %kind, error = %failure, "stream failed to open");
            update(&state, |s| s.fail(session_id, failure));
            return;
        }
    };
    update(&state, |s| s.mark_connected(session_id));

    let mut seq = 0_u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = aborted(&mut abort_rx) => return,
            next = stream.next() => next,
        };
        let transition = match next {
            Some(Ok(event)) => {
                debug!(session_id = %session_id, kind = %kind, seq, "stream event");
                seq = seq.saturating_add(1);
                update(&state, |s| s.apply(session_id, event))
            }
            Some(Err(failure)) => {
                warn!(session_id = %session_id, kind = %kind, error = %failure, "stream failed");
                update(&state, |s| s.fail(session_id, failure))
            }
            None => {
                let transition = update(&state, |s| s.finish(session_id));
                if transition.is_applied() {
                    warn!(session_id = %session_id, kind = %kind, "stream ended before completion");
                }
                transition
            }
        };
        match transition {
            Transition::Applied(StreamStatus::Completed) => break,
            Transition::Applied(StreamStatus::Error) | Transition::Ignored => {
                info!(session_id = %session_id, kind = %kind, events = seq, "stream session ended");
                return;
            }
            Transition::Applied(_) => {}
        }
    }

    drop(stream);
    info!(session_id = %session_id, kind = %kind, events = seq, "stream session completed");
    let metric = tokio::select! {
        biased;
        _ = aborted(&mut abort_rx) => return,
        metric = transport.after_completion() => metric,
    };
    if let Some(metric) = metric {
        update(&state, |s| s.record_slo(session_id, metric));
    }
}
