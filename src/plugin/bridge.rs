//! Host/runtime bridge
//!
//! The sandbox engine is single-threaded, so it lives on a dedicated worker
//! thread with its own current-thread tokio runtime. The host talks to it
//! through [`BridgeClient`]:
//!
//! ```text
//!  callers ──execute/ping──▶ router task ──HostMessage──▶ worker thread
//!     ▲                          │                           │
//!     └──── PendingCalls ◀───────┴──────RuntimeMessage───────┘
//! ```
//!
//! The router buffers requests until the worker reports `ready`, matches every
//! response to its waiter by id, and rejects all outstanding requests when the
//! worker reports a lifecycle failure or goes away.

use futures::future::poll_fn;
use serde_json::Value;
use std::collections::VecDeque;
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capability::HostServices;
use super::pending::PendingCalls;
use super::protocol::{ErrorKind, ExecutePayload, HostMessage, RequestId, RuntimeMessage};
use super::sandbox::{SandboxEngine, STALLED_MESSAGE};
use crate::core::error::{HostError, Result};

/// Per-call limits
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Give up after this long; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Abandon the call when this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Lifecycle of the execution runtime as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Ready,
    Failed(String),
    Closed,
}

/// Host side of the bridge
pub struct BridgeClient {
    requests: mpsc::UnboundedSender<HostMessage>,
    pending: PendingCalls,
    state: watch::Receiver<BridgeState>,
}

impl BridgeClient {
    /// Start a sandbox worker thread and connect to it
    ///
    /// Must be called from within a tokio runtime; the router runs as a task on it.
    pub fn spawn(services: HostServices) -> Result<Self> {
        let (to_worker, inbound) = mpsc::unbounded_channel::<HostMessage>();
        let (outbound, from_worker) = mpsc::unbounded_channel::<RuntimeMessage>();

        thread::Builder::new()
            .name("extension-host-sandbox".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create sandbox runtime: {}", e);
                        let _ = outbound.send(RuntimeMessage::fatal(format!(
                            "failed to create sandbox runtime: {}",
                            e
                        )));
                        return;
                    }
                };

                let local = LocalSet::new();
                local.block_on(&rt, run_worker(services, inbound, outbound));
                info!("Sandbox worker stopped");
            })
            .map_err(|e| HostError::InitializationError(format!("Failed to spawn sandbox thread: {}", e)))?;

        Ok(Self::connect(to_worker, from_worker))
    }

    /// Connect to a runtime reachable through the given channels
    pub fn connect(
        to_worker: mpsc::UnboundedSender<HostMessage>,
        from_worker: mpsc::UnboundedReceiver<RuntimeMessage>,
    ) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(BridgeState::Starting);
        let pending = PendingCalls::new();

        tokio::spawn(route(request_rx, from_worker, to_worker, pending.clone(), state_tx));

        Self {
            requests,
            pending,
            state,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    /// Wait until the runtime reported `ready`
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != BridgeState::Starting)
            .await
            .map(|s| (*s).clone())
            .unwrap_or(BridgeState::Closed);

        match reached {
            BridgeState::Ready => Ok(()),
            BridgeState::Failed(reason) => Err(HostError::InitializationError(reason)),
            BridgeState::Closed | BridgeState::Starting => Err(HostError::BridgeClosed(
                "execution runtime exited before it was ready".to_string(),
            )),
        }
    }

    /// Run one plugin method in the sandbox
    pub async fn execute(&self, payload: ExecutePayload, options: CallOptions) -> Result<Value> {
        let (id, reply) = self.pending.register();
        let _guard = self.pending.guard(id);

        debug!(%id, method = %payload.method_name, "Dispatching plugin call");
        self.send(HostMessage::Execute { id, payload })?;

        self.await_reply(id, reply, &options).await?.into_result()
    }

    /// Round-trip a ping through the runtime
    pub async fn ping(&self, options: CallOptions) -> Result<Duration> {
        let started = Instant::now();
        let (id, reply) = self.pending.register();
        let _guard = self.pending.guard(id);

        self.send(HostMessage::Ping { id })?;
        self.await_reply(id, reply, &options).await?.into_result()?;

        Ok(started.elapsed())
    }

    /// Requests still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn send(&self, message: HostMessage) -> Result<()> {
        self.requests
            .send(message)
            .map_err(|_| HostError::BridgeClosed("execution runtime is not running".to_string()))
    }

    async fn await_reply(
        &self,
        id: RequestId,
        reply: oneshot::Receiver<RuntimeMessage>,
        options: &CallOptions,
    ) -> Result<RuntimeMessage> {
        let deadline = async {
            match options.timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            message = reply => message.map_err(|_| {
                HostError::BridgeClosed("execution runtime dropped the request".to_string())
            }),
            _ = deadline => {
                let after = options.timeout.unwrap_or_default();
                warn!(%id, ?after, "Plugin call timed out");
                self.abandon(id);
                Err(HostError::BridgeTimeoutError { id, after })
            }
            _ = cancelled => {
                debug!(%id, "Plugin call cancelled by caller");
                self.abandon(id);
                Err(HostError::Cancelled(id))
            }
        }
    }

    /// Stop waiting for `id` and tell the runtime its outcome is unwanted
    fn abandon(&self, id: RequestId) {
        self.pending.remove(id);
        let _ = self.requests.send(HostMessage::Cancel { id });
    }
}

async fn route(
    mut requests: mpsc::UnboundedReceiver<HostMessage>,
    mut responses: mpsc::UnboundedReceiver<RuntimeMessage>,
    to_worker: mpsc::UnboundedSender<HostMessage>,
    pending: PendingCalls,
    state: watch::Sender<BridgeState>,
) {
    let mut queued: VecDeque<HostMessage> = VecDeque::new();
    let mut ready = false;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(HostMessage::Cancel { .. }) if failure.is_some() => {}
                Some(message) if failure.is_some() => {
                    let reason = failure.clone().unwrap_or_default();
                    pending.complete(message.id(), RuntimeMessage::fatal(reason));
                }
                Some(message) if ready => {
                    if to_worker.send(message).is_err() {
                        debug!("Worker channel closed while forwarding a request");
                    }
                }
                Some(message) => queued.push_back(message),
                None => {
                    debug!("Bridge client dropped, stopping router");
                    break;
                }
            },
            response = responses.recv() => match response {
                Some(RuntimeMessage::Ready) => {
                    ready = true;
                    state.send_replace(BridgeState::Ready);
                    info!(queued = queued.len(), "Execution runtime ready");
                    for message in queued.drain(..) {
                        let _ = to_worker.send(message);
                    }
                }
                Some(RuntimeMessage::Error { id: None, error, .. }) => {
                    error!(error = %error, "Execution runtime lifecycle failure");
                    queued.clear();
                    let rejected = pending.fail_all(&error);
                    if rejected > 0 {
                        warn!(rejected, "Rejected outstanding plugin calls");
                    }
                    state.send_replace(BridgeState::Failed(error.clone()));
                    failure = Some(error);
                }
                Some(message) => {
                    if let Some(id) = message.correlation_id() {
                        pending.complete(id, message);
                    }
                }
                None => {
                    let rejected = pending.fail_all("execution runtime exited");
                    warn!(rejected, "Execution runtime channel closed");
                    if !matches!(*state.borrow(), BridgeState::Failed(_)) {
                        state.send_replace(BridgeState::Closed);
                    }
                    break;
                }
            },
        }
    }
}

enum WorkerStep {
    Inbound(Option<HostMessage>),
    EventLoop(Option<Result<()>>),
}

async fn run_worker(
    services: HostServices,
    mut inbound: mpsc::UnboundedReceiver<HostMessage>,
    outbound: mpsc::UnboundedSender<RuntimeMessage>,
) {
    let mut engine = match SandboxEngine::new(services) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start sandbox engine: {}", e);
            let _ = outbound.send(RuntimeMessage::fatal(e.to_string()));
            return;
        }
    };

    if outbound.send(RuntimeMessage::Ready).is_err() {
        return;
    }

    loop {
        let step = if engine.has_inflight() {
            tokio::select! {
                message = inbound.recv() => WorkerStep::Inbound(message),
                outcome = poll_fn(|cx| match engine.poll_event_loop(cx) {
                    Poll::Ready(outcome) => Poll::Ready(Some(outcome)),
                    Poll::Pending if engine.has_settled() => Poll::Ready(None),
                    Poll::Pending => Poll::Pending,
                }) => WorkerStep::EventLoop(outcome),
            }
        } else {
            WorkerStep::Inbound(inbound.recv().await)
        };

        let idle = match step {
            WorkerStep::Inbound(None) => break,
            WorkerStep::Inbound(Some(message)) => {
                handle_request(&mut engine, message, &outbound);
                None
            }
            WorkerStep::EventLoop(None) => None,
            WorkerStep::EventLoop(Some(Ok(()))) => Some(STALLED_MESSAGE.to_string()),
            WorkerStep::EventLoop(Some(Err(e))) => {
                error!("Sandbox event loop failed: {}", e);
                Some(e.to_string())
            }
        };

        let mut settled = engine.take_settled();
        if let Some(reason) = idle {
            settled.extend(engine.fail_inflight(&reason));
        }
        for settlement in settled {
            if outbound.send(settlement.into_message()).is_err() {
                return;
            }
        }
    }
}

fn handle_request(
    engine: &mut SandboxEngine,
    message: HostMessage,
    outbound: &mpsc::UnboundedSender<RuntimeMessage>,
) {
    match message {
        HostMessage::Execute { id, payload } => {
            if let Err(e) = engine.begin(id.0, &payload) {
                let _ = outbound.send(rejection(id, e));
            }
        }
        HostMessage::Ping { id } => {
            let _ = outbound.send(RuntimeMessage::Pong { id });
        }
        HostMessage::Cancel { id } => engine.cancel(id.0),
    }
}

fn rejection(id: RequestId, error: HostError) -> RuntimeMessage {
    match error {
        HostError::ExportContractError(message) => {
            RuntimeMessage::failure(id, ErrorKind::ExportContract, message, None)
        }
        HostError::MethodNotFoundError(message) => {
            RuntimeMessage::failure(id, ErrorKind::MethodNotFound, message, None)
        }
        HostError::ExecutionError { message, stack } => {
            RuntimeMessage::failure(id, ErrorKind::Execution, message, stack)
        }
        other => RuntimeMessage::failure(id, ErrorKind::Execution, other.to_string(), None),
    }
}
