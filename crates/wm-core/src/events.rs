use std::io;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wm_infra::logs::LineConsumer;
use wm_infra::types::MachineState;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineEventType {
    Creating,
    Running,
    Error,
    Destroying,
    Destroyed,
}

/// Machine lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatusEvent {
    pub event_type: MachineEventType,
    pub machine_id: String,
    pub workspace_id: String,
    pub machine_name: String,
    pub dev: bool,
    pub error: Option<String>,
}

impl MachineStatusEvent {
    pub fn new(event_type: MachineEventType, state: &MachineState) -> Self {
        Self {
            event_type,
            machine_id: state.id.clone(),
            workspace_id: state.workspace_id.clone(),
            machine_name: state.name.clone(),
            dev: state.dev,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessEventType {
    Started,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineProcessEvent {
    pub event_type: ProcessEventType,
    pub machine_id: String,
    pub process_id: u32,
    pub error: Option<String>,
}

impl MachineProcessEvent {
    pub fn new(event_type: ProcessEventType, machine_id: &str, process_id: u32) -> Self {
        Self {
            event_type,
            machine_id: machine_id.to_string(),
            process_id,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Out-of-band termination reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStateKind {
    Oom,
    Die,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateEvent {
    pub machine_id: String,
    pub kind: InstanceStateKind,
}

/// One line written to a named output channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub channel: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    MachineStatus(MachineStatusEvent),
    Process(MachineProcessEvent),
    InstanceState(InstanceStateEvent),
    Output(OutputLine),
}

impl From<MachineStatusEvent> for Event {
    fn from(e: MachineStatusEvent) -> Self {
        Self::MachineStatus(e)
    }
}

impl From<MachineProcessEvent> for Event {
    fn from(e: MachineProcessEvent) -> Self {
        Self::Process(e)
    }
}

impl From<InstanceStateEvent> for Event {
    fn from(e: InstanceStateEvent) -> Self {
        Self::InstanceState(e)
    }
}

impl From<OutputLine> for Event {
    fn from(e: OutputLine) -> Self {
        Self::Output(e)
    }
}

/// In-process publish/subscribe bus.
///
/// Events are delivered to every subscriber in publish order. Slow
/// subscribers lag (and are told so) instead of blocking publishers.
/// Instance state events are also fanned out on a feed of their own, so
/// output lines cannot push them out of a lagging receiver.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    instance_states: broadcast::Sender<InstanceStateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (instance_states, _) = broadcast::channel(capacity);
        Self { tx, instance_states }
    }

    /// Publishes `event`; having no subscribers is not an error.
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        tracing::trace!(?event, "publishing event");
        if let Event::InstanceState(state) = &event {
            let _ = self.instance_states.send(state.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Only the OOM/DIE reports of backends.
    pub fn subscribe_instance_states(&self) -> broadcast::Receiver<InstanceStateEvent> {
        self.instance_states.subscribe()
    }
}

/// Tees log lines onto a named output channel of the bus.
pub struct ChannelLineConsumer {
    bus: EventBus,
    channel: String,
}

impl ChannelLineConsumer {
    pub fn new(bus: EventBus, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }
}

impl LineConsumer for ChannelLineConsumer {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.bus.publish(OutputLine {
            channel: self.channel.clone(),
            line: line.to_string(),
        });
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(MachineProcessEvent::new(ProcessEventType::Started, "m1", 1));
        bus.publish(MachineProcessEvent::new(ProcessEventType::Stopped, "m1", 1));

        let types: Vec<ProcessEventType> = [rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|e| match e {
                Event::Process(p) => p.event_type,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(types, vec![ProcessEventType::Started, ProcessEventType::Stopped]);
    }

    #[tokio::test]
    async fn channel_consumer_publishes_output_lines() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let consumer = ChannelLineConsumer::new(bus.clone(), "ws1:default:dev");
        consumer.write_line("hello").unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::Output(OutputLine {
                channel: "ws1:default:dev".into(),
                line: "hello".into(),
            })
        );
    }

    #[tokio::test]
    async fn instance_states_survive_an_output_flood() {
        let bus = EventBus::new(16);
        let mut all = bus.subscribe();
        let mut states = bus.subscribe_instance_states();

        bus.publish(InstanceStateEvent {
            machine_id: "m1".into(),
            kind: InstanceStateKind::Die,
        });
        let consumer = ChannelLineConsumer::new(bus.clone(), "out");
        for i in 0..100 {
            consumer.write_line(&format!("line {i}")).unwrap();
        }

        assert!(matches!(
            all.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let state = states.recv().await.unwrap();
        assert_eq!(state.machine_id, "m1");
        assert_eq!(state.kind, InstanceStateKind::Die);
        assert!(states.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_event_tag() {
        let event = Event::from(InstanceStateEvent {
            machine_id: "m1".into(),
            kind: InstanceStateKind::Oom,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "instance_state");
        assert_eq!(json["machine_id"], "m1");
        assert_eq!(json["kind"], "OOM");
    }
}
