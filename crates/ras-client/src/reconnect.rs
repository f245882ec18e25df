//! Automatic reconnection.
//!
//! A single actor task owns the in-flight flag. Controllers also share a
//! [`SingleFlight`] lock, process-wide unless given their own, so at most one
//! reconnection runs at a time. Triggers that arrive while one is running
//! return [`SkipReason::InFlight`] immediately instead of queueing.
//!
//! Entry conditions, checked on every trigger:
//! - not already connected
//! - credentials are stored
//! - the user has not explicitly disconnected

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use ras_common::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time;
use tracing::{debug, info, warn};

use crate::credentials::CredentialRepository;
use crate::orchestrator::{Connected, Orchestrator};
use crate::types::{ConnectPurpose, ConnectionContext, ProgressSink};

/// Persisted "the user pressed disconnect" flag.
pub trait IntentStore: Send + Sync {
    fn is_disconnect_intended(&self) -> bool;
    fn set_disconnect_intended(&self, intended: bool) -> ras_common::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryIntentStore {
    intended: AtomicBool,
}

impl MemoryIntentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IntentStore for MemoryIntentStore {
    fn is_disconnect_intended(&self) -> bool {
        self.intended.load(Ordering::SeqCst)
    }

    fn set_disconnect_intended(&self, intended: bool) -> ras_common::Result<()> {
        self.intended.store(intended, Ordering::SeqCst);
        Ok(())
    }
}

/// Marker-file store: the flag is set while the file exists.
#[derive(Debug)]
pub struct FileIntentStore {
    path: PathBuf,
    cached: AtomicBool,
}

impl FileIntentStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let cached = AtomicBool::new(path.exists());
        Self { path, cached }
    }
}

impl IntentStore for FileIntentStore {
    fn is_disconnect_intended(&self) -> bool {
        self.cached.load(Ordering::SeqCst)
    }

    fn set_disconnect_intended(&self, intended: bool) -> ras_common::Result<()> {
        if intended {
            std::fs::write(&self.path, b"1")?;
        } else {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.cached.store(intended, Ordering::SeqCst);
        Ok(())
    }
}

/// Try-lock held for the duration of a reconnection attempt.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight(Arc<AtomicBool>);

impl SingleFlight {
    /// A lock private to the controllers it is handed to.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock every controller uses unless given another.
    pub fn process() -> Self {
        static PROCESS: OnceLock<SingleFlight> = OnceLock::new();
        PROCESS.get_or_init(SingleFlight::new).clone()
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What the controller drives.
#[async_trait]
pub trait ReconnectService: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn reconnect(&self) -> ras_common::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Foreground,
    ConnectionError,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InFlight,
    AlreadyConnected,
    NoCredentials,
    UserDisconnected,
    ControllerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Succeeded,
    Failed { kind: &'static str, reason: String },
    Skipped(SkipReason),
}

impl ReconnectOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    Started {
        trigger: Trigger,
    },
    Finished {
        trigger: Trigger,
        outcome: ReconnectOutcome,
    },
    Skipped {
        trigger: Trigger,
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    InFlight(Trigger),
}

enum Command {
    Foreground,
    ConnectionError(String),
    Attempt {
        trigger: Trigger,
        reply: Option<oneshot::Sender<ReconnectOutcome>>,
    },
    Finished {
        trigger: Trigger,
        outcome: ReconnectOutcome,
        reply: Option<oneshot::Sender<ReconnectOutcome>>,
    },
    SetIntent {
        intended: bool,
        reply: oneshot::Sender<ras_common::Result<()>>,
    },
    Shutdown,
}

pub struct ReconnectController {
    service: Arc<dyn ReconnectService>,
    credentials: Arc<dyn CredentialRepository>,
    intent: Arc<dyn IntentStore>,
    settle_delay: Duration,
    single_flight: SingleFlight,
}

impl ReconnectController {
    pub fn new(
        service: Arc<dyn ReconnectService>,
        credentials: Arc<dyn CredentialRepository>,
        intent: Arc<dyn IntentStore>,
    ) -> Self {
        Self {
            service,
            credentials,
            intent,
            settle_delay: Duration::from_secs(1),
            single_flight: SingleFlight::process(),
        }
    }

    /// Replace the process-wide lock.
    pub fn with_single_flight(mut self, lock: SingleFlight) -> Self {
        self.single_flight = lock;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Start the actor. It stops on [`ReconnectHandle::shutdown`] or when
    /// every handle is dropped.
    pub fn spawn(self) -> ReconnectHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReconnectState::Idle);
        let (events, _) = broadcast::channel(32);

        let actor = Actor {
            controller: self,
            tx: tx.downgrade(),
            in_flight: None,
            seen_foreground: false,
            state: state_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(rx));

        ReconnectHandle {
            tx,
            state: state_rx,
            events,
        }
    }
}

#[derive(Clone)]
pub struct ReconnectHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ReconnectState>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl ReconnectHandle {
    pub async fn attempt(&self, trigger: Trigger) -> ReconnectOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Attempt {
            trigger,
            reply: Some(reply_tx),
        };
        if self.tx.send(command).is_err() {
            return ReconnectOutcome::Skipped(SkipReason::ControllerStopped);
        }
        reply_rx
            .await
            .unwrap_or(ReconnectOutcome::Skipped(SkipReason::ControllerStopped))
    }

    /// True only if a reconnection ran and succeeded.
    pub async fn attempt_reconnect(&self) -> bool {
        self.attempt(Trigger::Manual).await.succeeded()
    }

    /// The first call after startup is ignored.
    pub fn on_app_foreground(&self) {
        let _ = self.tx.send(Command::Foreground);
    }

    /// Schedules an attempt after the settle delay.
    pub fn on_connection_error(&self, reason: impl Into<String>) {
        let _ = self.tx.send(Command::ConnectionError(reason.into()));
    }

    /// Record that the user disconnected on purpose; automatic attempts stop.
    pub async fn user_disconnected(&self) -> ras_common::Result<()> {
        self.set_intent(true).await
    }

    /// Clear the disconnect intent and connect now.
    pub async fn user_connect(&self) -> ReconnectOutcome {
        if let Err(e) = self.set_intent(false).await {
            warn!("failed to clear disconnect intent: {}", e);
            return ReconnectOutcome::Failed {
                kind: e.kind(),
                reason: e.to_string(),
            };
        }
        self.attempt(Trigger::Manual).await
    }

    async fn set_intent(&self, intended: bool) -> ras_common::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::SetIntent {
                intended,
                reply: reply_tx,
            })
            .map_err(|_| Error::unknown("reconnect controller stopped"))?;
        reply_rx
            .await
            .map_err(|_| Error::unknown("reconnect controller stopped"))?
    }

    pub fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct Actor {
    controller: ReconnectController,
    tx: mpsc::WeakUnboundedSender<Command>,
    in_flight: Option<Trigger>,
    seen_foreground: bool,
    state: watch::Sender<ReconnectState>,
    events: broadcast::Sender<ReconnectEvent>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Foreground => {
                    if !self.seen_foreground {
                        self.seen_foreground = true;
                        debug!("ignoring startup foreground event");
                        continue;
                    }
                    self.start(Trigger::Foreground, None);
                }
                Command::ConnectionError(reason) => {
                    info!(
                        "connection error ({}), reconnecting in {:?}",
                        reason, self.controller.settle_delay
                    );
                    self.schedule_after_settle();
                }
                Command::Attempt { trigger, reply } => self.start(trigger, reply),
                Command::Finished {
                    trigger,
                    outcome,
                    reply,
                } => {
                    self.in_flight = None;
                    self.state.send_replace(ReconnectState::Idle);
                    match &outcome {
                        ReconnectOutcome::Succeeded => info!("reconnected ({:?})", trigger),
                        other => warn!("reconnection failed ({:?}): {:?}", trigger, other),
                    }
                    // Reply only once idle so the caller's next trigger is not skipped.
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome.clone());
                    }
                    let _ = self.events.send(ReconnectEvent::Finished { trigger, outcome });
                }
                Command::SetIntent { intended, reply } => {
                    let result = self.controller.intent.set_disconnect_intended(intended);
                    if result.is_ok() {
                        debug!("disconnect intent set to {}", intended);
                    }
                    let _ = reply.send(result);
                }
                Command::Shutdown => break,
            }
        }
        debug!("reconnect controller stopped");
    }

    fn blocked_by(&self) -> Option<SkipReason> {
        let controller = &self.controller;
        if controller.service.is_connected() {
            Some(SkipReason::AlreadyConnected)
        } else if !controller.credentials.has_credentials() {
            Some(SkipReason::NoCredentials)
        } else if controller.intent.is_disconnect_intended() {
            Some(SkipReason::UserDisconnected)
        } else {
            None
        }
    }

    fn start(&mut self, trigger: Trigger, reply: Option<oneshot::Sender<ReconnectOutcome>>) {
        let single_flight = &self.controller.single_flight;
        let mut blocked = if self.in_flight.is_some() || single_flight.is_held() {
            Some(SkipReason::InFlight)
        } else {
            self.blocked_by()
        };
        if blocked.is_none() && !single_flight.try_acquire() {
            blocked = Some(SkipReason::InFlight);
        }
        if let Some(reason) = blocked {
            debug!("reconnect ({:?}) skipped: {:?}", trigger, reason);
            let _ = self.events.send(ReconnectEvent::Skipped { trigger, reason });
            if let Some(reply) = reply {
                let _ = reply.send(ReconnectOutcome::Skipped(reason));
            }
            return;
        }

        self.in_flight = Some(trigger);
        self.state.send_replace(ReconnectState::InFlight(trigger));
        let _ = self.events.send(ReconnectEvent::Started { trigger });
        info!("reconnecting ({:?})", trigger);

        let service = self.controller.service.clone();
        let guard = FinishGuard {
            tx: self.tx.clone(),
            single_flight: single_flight.clone(),
            trigger,
            outcome: None,
            reply,
        };
        tokio::spawn(async move {
            let mut guard = guard;
            let outcome = match service.reconnect().await {
                Ok(()) => ReconnectOutcome::Succeeded,
                Err(e) => ReconnectOutcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                },
            };
            guard.outcome = Some(outcome);
        });
    }

    fn schedule_after_settle(&self) {
        let tx = self.tx.clone();
        let delay = self.controller.settle_delay;
        tokio::spawn(async move {
            time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::Attempt {
                    trigger: Trigger::ConnectionError,
                    reply: None,
                });
            }
        });
    }
}

/// Releases the lock and reports completion even if the attempt task is torn
/// down early. The caller is answered by the actor after it goes idle, or
/// directly if the actor is gone.
struct FinishGuard {
    tx: mpsc::WeakUnboundedSender<Command>,
    single_flight: SingleFlight,
    trigger: Trigger,
    outcome: Option<ReconnectOutcome>,
    reply: Option<oneshot::Sender<ReconnectOutcome>>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(ReconnectOutcome::Failed {
            kind: "unknown",
            reason: "reconnection task aborted".into(),
        });
        self.single_flight.release();

        let finished = Command::Finished {
            trigger: self.trigger,
            outcome,
            reply: self.reply.take(),
        };
        let undelivered = match self.tx.upgrade() {
            Some(tx) => tx.send(finished).err().map(|e| e.0),
            None => Some(finished),
        };
        if let Some(Command::Finished {
            outcome,
            reply: Some(reply),
            ..
        }) = undelivered
        {
            let _ = reply.send(outcome);
        }
    }
}

/// [`ReconnectService`] backed by the orchestrator. Established transports
/// are handed to the session layer through `sessions`.
pub struct OrchestratorReconnectService {
    orchestrator: Arc<Orchestrator>,
    credentials: Arc<dyn CredentialRepository>,
    sessions: mpsc::Sender<Connected>,
    connected: Arc<AtomicBool>,
    progress: ProgressSink,
}

impl OrchestratorReconnectService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        credentials: Arc<dyn CredentialRepository>,
        sessions: mpsc::Sender<Connected>,
    ) -> Self {
        Self {
            orchestrator,
            credentials,
            sessions,
            connected: Arc::new(AtomicBool::new(false)),
            progress: ProgressSink::disabled(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// Called by the session layer for a session it established itself.
    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Called by the session layer when its transport goes away.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReconnectService for OrchestratorReconnectService {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> ras_common::Result<()> {
        let ctx = {
            let credentials = self
                .credentials
                .get_credentials()
                .ok_or(Error::NoCredentials)?;
            ConnectionContext::from_credentials(
                &credentials,
                ConnectPurpose::Reconnect,
                self.progress.clone(),
            )
        };

        let connected = self.orchestrator.connect(ctx).await?;
        self.connected.store(true, Ordering::SeqCst);
        if self.sessions.send(connected).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(Error::unknown("session layer is gone"));
        }
        Ok(())
    }
}
