//! One live pump connection: reader thread plus a single consumer task
//! that owns the state machine and is the only writer.
pub mod reader;

pub use reader::{ReaderEvent, ReaderExit, ReaderSettings, ReaderThread};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, LinkConfig};
use crate::protocol::{Command, LineFramer, Message};
use crate::pump::{
    Applied, CommandDispatcher, Emission, Intent, PumpState, PumpStateMachine, RunProgress, RunUpdate, SessionParameters,
    Transition,
};
use crate::transport::{DeviceHandle, LinkInfo};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    #[error("Intent queue full")]
    Busy,

    #[error("Failed to start reader thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything a UI needs to render the current screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSnapshot {
    pub state: PumpState,
    pub params: SessionParameters,
    pub run: Option<RunProgress>,
    pub connected: bool,
    pub link: Option<LinkInfo>,
    pub updated_at: DateTime<Utc>,
}

impl Default for PumpSnapshot {
    fn default() -> Self {
        Self {
            state: PumpState::default(),
            params: SessionParameters::default(),
            run: None,
            connected: false,
            link: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PumpEvent {
    StateChanged(Transition),
    ParametersChanged(SessionParameters),
    RunStarted(RunProgress),
    RunProgress(RunProgress),
    RunFinished,
    CommandSent(Command),
    CommandFailed { command: Command, error: String },
    Disconnected(String),
}

/// How the consumer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Requested,
    LinkLost(String),
    HandlesDropped,
}

#[derive(Debug)]
enum SessionCommand {
    Intent(Intent),
    Shutdown,
}

/// Cloneable front for the UI layer: intents in, snapshots and events out.
#[derive(Clone, Debug)]
pub struct PumpHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    events_tx: broadcast::Sender<PumpEvent>,
    snapshot_rx: watch::Receiver<Arc<PumpSnapshot>>,
}

impl PumpHandle {
    pub fn subscribe_events(&self) -> broadcast::Receiver<PumpEvent> {
        self.events_tx.subscribe()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<Arc<PumpSnapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> Arc<PumpSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub async fn send_intent(&self, intent: Intent) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::Intent(intent))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Non-async entry point for UI callbacks.
    pub fn try_send_intent(&self, intent: Intent) -> Result<()> {
        self.cmd_tx.try_send(SessionCommand::Intent(intent)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                log::warn!("Intent queue full, dropping {:?}", intent);
                SessionError::Busy
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }
}

/// Owns the running session. Dropping it without `shutdown` leaves the
/// consumer to stop once every `PumpHandle` is gone.
pub struct PumpSession {
    handle: PumpHandle,
    task: JoinHandle<SessionEnd>,
}

impl PumpSession {
    /// Starts the reader thread and the consumer task. Must be called from
    /// within a tokio runtime. An invalid `config` is rejected and `device`
    /// is closed.
    pub fn start(device: DeviceHandle, config: &LinkConfig) -> Result<Self> {
        config.validate()?;
        let link = device.info().clone();
        let transport = device.transport();
        let (reader_tx, reader_rx) = mpsc::channel(config.session.message_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.session.intent_capacity);
        let (events_tx, _events_rx) = broadcast::channel(config.session.event_capacity);

        let initial = PumpSnapshot { connected: true, link: Some(link.clone()), ..PumpSnapshot::default() };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));

        let reader = ReaderThread::spawn(
            transport.clone(),
            LineFramer::new(config.line_deadline(), config.framing.max_line_bytes),
            ReaderSettings {
                chunk_timeout: config.chunk_timeout(transport.kind()),
                max_consecutive_errors: config.session.max_consecutive_read_errors,
            },
            reader_tx,
        )?;

        log::info!("Pump session started on {}", link.identifier);
        let consumer = Consumer {
            device,
            link,
            machine: PumpStateMachine::new(),
            dispatcher: CommandDispatcher::new(config.repeat_period()),
            events_tx: events_tx.clone(),
            snapshot_tx,
        };
        let task = tokio::spawn(consumer.run(reader, reader_rx, cmd_rx));

        Ok(Self { handle: PumpHandle { cmd_tx, events_tx, snapshot_rx }, task })
    }

    pub fn handle(&self) -> PumpHandle {
        self.handle.clone()
    }

    /// Stops the reader, closes the transport and waits for both.
    pub async fn shutdown(self) -> SessionEnd {
        let _ = self.handle.cmd_tx.send(SessionCommand::Shutdown).await;
        match self.task.await {
            Ok(end) => end,
            Err(e) => {
                log::error!("Pump session task failed: {}", e);
                SessionEnd::LinkLost(e.to_string())
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Consumer {
    device: DeviceHandle,
    link: LinkInfo,
    machine: PumpStateMachine,
    dispatcher: CommandDispatcher,
    events_tx: broadcast::Sender<PumpEvent>,
    snapshot_tx: watch::Sender<Arc<PumpSnapshot>>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Consumer {
    async fn run(
        mut self,
        reader: ReaderThread,
        mut reader_rx: mpsc::Receiver<ReaderEvent>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ) -> SessionEnd {
        let end = loop {
            let deadline = self.dispatcher.next_deadline();
            tokio::select! {
                event = reader_rx.recv() => match event {
                    Some(ReaderEvent::Message(message)) => self.on_message(message),
                    Some(ReaderEvent::Disconnected(reason)) => break SessionEnd::LinkLost(reason),
                    None => break SessionEnd::LinkLost("reader stopped".into()),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Intent(intent)) => {
                        if let Some(reason) = self.on_intent(intent) {
                            break SessionEnd::LinkLost(reason);
                        }
                    }
                    Some(SessionCommand::Shutdown) => break SessionEnd::Requested,
                    None => break SessionEnd::HandlesDropped,
                },
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Some(command) = self.dispatcher.tick(&mut self.machine, now()) {
                        self.publish_parameters();
                        if let Some(reason) = self.write(command) {
                            break SessionEnd::LinkLost(reason);
                        }
                    }
                }
            }
        };

        self.dispatcher.cancel();
        reader.stop();
        // unblocks a reader parked on a full channel
        drop(reader_rx);
        let exit = tokio::task::spawn_blocking(move || reader.join())
            .await
            .unwrap_or_else(|e| ReaderExit::Failed(e.to_string()));
        self.device.close();
        log::info!("Pump session on {} ended: {:?} (reader {:?})", self.link.identifier, end, exit);

        self.publish(false);
        if let SessionEnd::LinkLost(reason) = &end {
            let _ = self.events_tx.send(PumpEvent::Disconnected(reason.clone()));
        }
        end
    }

    fn on_message(&mut self, message: Message) {
        let applied = self.machine.apply(message);
        if let Some(transition) = applied.transition {
            self.dispatcher.cancel();
            log::info!("Pump state {:?} -> {:?}", transition.from, transition.to);
            let _ = self.events_tx.send(PumpEvent::StateChanged(transition));
        }
        if applied.parameters_changed {
            let _ = self.events_tx.send(PumpEvent::ParametersChanged(*self.machine.parameters()));
        }
        match applied.run {
            Some(RunUpdate::Started(run)) => {
                let _ = self.events_tx.send(PumpEvent::RunStarted(run));
            }
            Some(RunUpdate::Updated(run)) => {
                let _ = self.events_tx.send(PumpEvent::RunProgress(run));
            }
            Some(RunUpdate::Finished) => {
                let _ = self.events_tx.send(PumpEvent::RunFinished);
            }
            None => {}
        }
        if applied != Applied::default() {
            self.publish(true);
        }
    }

    /// Returns a reason when the write showed the link is gone.
    fn on_intent(&mut self, intent: Intent) -> Option<String> {
        let before = *self.machine.parameters();
        let emission = self.dispatcher.handle(intent, &mut self.machine, now());
        if *self.machine.parameters() != before {
            self.publish_parameters();
        }
        let Emission { command, .. } = emission?;
        self.write(command)
    }

    fn write(&mut self, command: Command) -> Option<String> {
        log::debug!("TX {:?} ({:?})", command.as_byte() as char, command);
        match self.device.write(&[command.as_byte()]) {
            Ok(()) => {
                let _ = self.events_tx.send(PumpEvent::CommandSent(command));
                None
            }
            Err(e) => {
                log::warn!("Dropping command {:?}: {}", command, e);
                let _ = self.events_tx.send(PumpEvent::CommandFailed { command, error: e.to_string() });
                e.is_fatal().then(|| e.to_string())
            }
        }
    }

    fn publish_parameters(&self) {
        let _ = self.events_tx.send(PumpEvent::ParametersChanged(*self.machine.parameters()));
        self.publish(true);
    }

    fn publish(&self, connected: bool) {
        let snapshot = PumpSnapshot {
            state: self.machine.state(),
            params: *self.machine.parameters(),
            run: self.machine.run().copied(),
            connected,
            link: Some(self.link.clone()),
            updated_at: Utc::now(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
