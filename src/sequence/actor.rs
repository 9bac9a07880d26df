//! Async owner of the sequence controller.
//!
//! The actor is the single execution context for every state transition. Its
//! loop selects over three sources:
//!
//! - [`ControlCommand`]s from collaborators (via [`SequenceHandle`])
//! - [`LinkEvent`]s from the link reader tasks
//! - the controller's next deadline
//!
//! Because deadlines are popped on this task, a stop request and a timer expiry
//! are always serialized.

use super::controller::{ControllerSettings, SequenceController};
use super::state::SequenceStatus;
use crate::alarms::AlarmCatalog;
use crate::error::{AppResult, PrealignError};
use crate::hardware::{
    connect_vision, open_serial_async, DynLink, LinkEvent, LinkKind, SerialSettings, StreamLink,
    VisionEndpoint,
};
use crate::messages::ControlCommand;
use crate::notify::NotificationSink;
use crate::protocol::CommandTable;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

/// Default command channel capacity.
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Task that owns the controller and both links.
pub struct SequenceActor {
    controller: SequenceController,
    serial: Arc<StreamLink>,
    vision: Arc<StreamLink>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl SequenceActor {
    /// Build an actor with closed links.
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        catalog: Arc<dyn AlarmCatalog>,
        table: CommandTable,
        settings: ControllerSettings,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let serial = Arc::new(StreamLink::new(LinkKind::Serial, link_tx.clone(), sink.clone()));
        let vision = Arc::new(StreamLink::new(LinkKind::Vision, link_tx, sink.clone()));
        let controller = SequenceController::new(
            serial.clone(),
            vision.clone(),
            sink,
            catalog,
            table,
            settings,
        );
        Self {
            controller,
            serial,
            vision,
            link_events: Some(link_rx),
        }
    }

    /// Spawn the actor on the current runtime.
    pub fn spawn(self) -> (SequenceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (SequenceHandle { tx }, task)
    }

    /// Run until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) {
        let Some(mut link_events) = self.link_events.take() else {
            return;
        };
        info!("Sequence actor started");

        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(ControlCommand::Shutdown { response }) => {
                            self.shutdown();
                            let _ = response.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(event) = link_events.recv() => self.handle_link_event(event),

                _ = wait_for(deadline) => self.controller.tick(Instant::now()),
            }
        }

        info!("Sequence actor stopped");
    }

    fn handle_command(&mut self, command: ControlCommand) {
        debug!(?command, "Control command");
        let now = Instant::now();
        match command {
            ControlCommand::Start {
                total_cycles,
                response,
            } => {
                let _ = response.send(self.controller.start(total_cycles, now));
            }
            ControlCommand::Stop { response } => {
                self.controller.stop(now);
                let _ = response.send(());
            }
            ControlCommand::EmergencyStop { response } => {
                let _ = response.send(self.controller.emergency_stop(now));
            }
            ControlCommand::Clear { response } => {
                let _ = response.send(self.controller.clear(now));
            }
            ControlCommand::Reset { response } => {
                let _ = response.send(self.controller.reset());
            }
            ControlCommand::UpdateTotalCycles {
                total_cycles,
                response,
            } => {
                let _ = response.send(self.controller.update_total_cycles(total_cycles));
            }
            ControlCommand::SendCommand { name, response } => {
                let _ = response.send(self.controller.send_named(&name, now));
            }
            ControlCommand::SendRaw {
                link,
                text,
                response,
            } => {
                let result = match link {
                    LinkKind::Serial => self.controller.send_raw(&text, now),
                    LinkKind::Vision => self.controller.send_vision_raw(&text),
                };
                let _ = response.send(result);
            }
            ControlCommand::Attach {
                link,
                stream,
                label,
                response,
            } => {
                self.link(link).attach(stream, label);
                let _ = response.send(());
            }
            ControlCommand::Detach { link, response } => {
                self.link(link).detach();
                self.controller.on_link_closed(link, now);
                let _ = response.send(());
            }
            ControlCommand::Status { response } => {
                let _ = response.send(self.controller.status(now));
            }
            ControlCommand::Shutdown { response } => {
                self.shutdown();
                let _ = response.send(());
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        match event {
            LinkEvent::SerialLine(line) => self.controller.on_serial_line(&line, now),
            LinkEvent::VisionReply(reply) => self.controller.on_vision_reply(&reply, now),
            LinkEvent::Closed(kind) => self.controller.on_link_closed(kind, now),
        }
    }

    fn link(&self, kind: LinkKind) -> &StreamLink {
        match kind {
            LinkKind::Serial => &self.serial,
            LinkKind::Vision => &self.vision,
        }
    }

    fn shutdown(&mut self) {
        self.controller.stop(Instant::now());
        self.serial.detach();
        self.vision.detach();
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Cloneable async front end to a running [`SequenceActor`].
#[derive(Clone, Debug)]
pub struct SequenceHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl SequenceHandle {
    async fn request<T>(
        &self,
        (command, rx): (ControlCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PrealignError::ControllerUnavailable)?;
        rx.await.map_err(|_| PrealignError::ControllerUnavailable)
    }

    /// Start a sequence.
    pub async fn start(&self, total_cycles: u32) -> AppResult<()> {
        self.request(ControlCommand::start(total_cycles)).await?
    }

    /// Stop the sequence.
    pub async fn stop(&self) -> AppResult<()> {
        self.request(ControlCommand::stop()).await
    }

    /// Emergency stop.
    pub async fn emergency_stop(&self) -> AppResult<()> {
        self.request(ControlCommand::emergency_stop()).await?
    }

    /// Clear the device and the alarm latch.
    pub async fn clear(&self) -> AppResult<()> {
        self.request(ControlCommand::clear()).await?
    }

    /// Zero the cycle state.
    pub async fn reset(&self) -> AppResult<()> {
        self.request(ControlCommand::reset()).await?
    }

    /// Change the requested number of cycles.
    pub async fn update_total_cycles(&self, total_cycles: u32) -> AppResult<()> {
        self.request(ControlCommand::update_total_cycles(total_cycles))
            .await?
    }

    /// Send a table command by name.
    pub async fn send_command(&self, name: &str) -> AppResult<()> {
        self.request(ControlCommand::send_command(name)).await?
    }

    /// Send raw text on a link.
    pub async fn send_raw(&self, link: LinkKind, text: &str) -> AppResult<()> {
        self.request(ControlCommand::send_raw(link, text)).await?
    }

    /// Controller snapshot.
    pub async fn status(&self) -> AppResult<SequenceStatus> {
        self.request(ControlCommand::status()).await
    }

    /// Hand an already-open stream to a link.
    pub async fn attach(&self, link: LinkKind, stream: DynLink, label: &str) -> AppResult<()> {
        self.request(ControlCommand::attach(link, stream, label))
            .await
    }

    /// Open the serial port and attach it.
    pub async fn connect_serial(&self, settings: &SerialSettings) -> AppResult<()> {
        let stream = open_serial_async(settings).await?;
        self.attach(LinkKind::Serial, stream, &settings.port).await
    }

    /// Connect to the vision system and attach the socket.
    pub async fn connect_vision(&self, endpoint: &VisionEndpoint) -> AppResult<()> {
        let stream = connect_vision(endpoint).await?;
        self.attach(LinkKind::Vision, Box::new(stream), &endpoint.address())
            .await
    }

    /// Close a link.
    pub async fn disconnect(&self, link: LinkKind) -> AppResult<()> {
        self.request(ControlCommand::detach(link)).await
    }

    /// Stop everything and end the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(ControlCommand::shutdown()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::EmptyCatalog;
    use crate::notify::RecordingSink;
    use crate::sequence::SequenceStep;

    fn spawn_actor() -> (SequenceHandle, JoinHandle<()>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let actor = SequenceActor::new(
            sink.clone(),
            Arc::new(EmptyCatalog),
            CommandTable::standard(),
            ControllerSettings::default(),
        );
        let (handle, task) = actor.spawn();
        (handle, task, sink)
    }

    #[tokio::test]
    async fn start_without_links_is_rejected() {
        let (handle, _task, _sink) = spawn_actor();
        let err = handle.start(3).await.unwrap_err();
        assert!(matches!(err, PrealignError::TransportUnavailable(LinkKind::Serial)));
        assert_eq!(handle.status().await.unwrap().step, SequenceStep::Idle);
    }

    #[tokio::test]
    async fn shutdown_ends_the_actor() {
        let (handle, task, _sink) = spawn_actor();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.status().await,
            Err(PrealignError::ControllerUnavailable)
        ));
    }

    #[tokio::test]
    async fn dropping_every_handle_ends_the_actor() {
        let (handle, task, _sink) = spawn_actor();
        drop(handle);
        task.await.unwrap();
    }
}
