//! Message Router
//!
//! Moves telemetry off the network context and onto consumer contexts.
//!
//! ```text
//! session worker ──[TelemetryMessage]──► router task ──► SlotTable (watch)
//!                                          │   ▲
//!                 RouterHandle ─[control]──┘   └── TopicStateIndex (watch)
//!                                          │
//!                                          └──[TelemetryEvent]──► consumer channels
//! ```
//!
//! The router task is the only writer of the slot table. Messages are
//! handled one at a time in arrival order, so per-topic order is kept.
//! Unmapped topics and undecodable payloads are dropped and only logged.

use super::refresh::RefreshReport;
use super::topic_state::{decode, Reading, SlotId, TopicStateIndex};
use crate::mqtt::error::RefreshFailed;
use crate::mqtt::message_manager::TelemetryMessage;
use crate::registry::DeviceKind;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type RefreshOutcome = Result<RefreshReport, RefreshFailed>;

#[derive(Debug, Clone, PartialEq)]
pub struct SlotReading {
    pub epoch: u64,
    pub topic: String,
    pub reading: Reading,
    pub received_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Reading { slot: SlotId, reading: SlotReading },
    RefreshResult(RefreshOutcome),
}

/// Last known value of one slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub topic: String,
    pub kind: DeviceKind,
    pub latest: Option<(Reading, DateTime<Local>)>,
}

/// Consumer-visible readings, one entry per slot of the current index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotTable {
    pub epoch: u64,
    pub slots: Vec<SlotView>,
}

impl SlotTable {
    /// New table for `index`; devices that survived keep their last reading
    fn rebuild(index: &TopicStateIndex, previous: &SlotTable) -> Self {
        let carried: HashMap<&str, &SlotView> =
            previous.slots.iter().map(|v| (v.topic.as_str(), v)).collect();

        let slots = index
            .slots()
            .map(|(_, entry)| SlotView {
                topic: entry.topic.clone(),
                kind: entry.path.device_kind,
                latest: carried.get(entry.topic.as_str()).and_then(|v| v.latest),
            })
            .collect();

        Self {
            epoch: index.epoch(),
            slots,
        }
    }

    pub fn get(&self, slot: SlotId) -> Option<&SlotView> {
        self.slots.get(slot.0)
    }
}

/// Callbacks of a telemetry consumer, run on the consumer's own task
pub trait TelemetryConsumer: Send + 'static {
    fn on_reading(&mut self, slot: SlotId, reading: &SlotReading);

    fn on_refresh_result(&mut self, result: &RefreshOutcome);
}

/// Drives `consumer` until its channel closes, then hands it back
pub fn spawn_consumer<C: TelemetryConsumer>(
    mut events: mpsc::Receiver<TelemetryEvent>,
    mut consumer: C,
) -> JoinHandle<C> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TelemetryEvent::Reading { slot, reading } => consumer.on_reading(slot, &reading),
                TelemetryEvent::RefreshResult(result) => consumer.on_refresh_result(&result),
            }
        }
        consumer
    })
}

#[derive(Debug)]
enum RouterControl {
    Register(mpsc::Sender<TelemetryEvent>),
    RefreshResult(RefreshOutcome),
}

#[derive(Clone)]
pub struct RouterHandle {
    control: mpsc::UnboundedSender<RouterControl>,
    table: watch::Receiver<SlotTable>,
}

impl RouterHandle {
    /// New consumer channel; closed right away if the router is gone
    pub fn register(&self, capacity: usize) -> mpsc::Receiver<TelemetryEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        if self.control.send(RouterControl::Register(tx)).is_err() {
            warn!("Router is gone, consumer channel closed");
        }
        rx
    }

    pub(crate) fn report_refresh(&self, result: RefreshOutcome) {
        if self.control.send(RouterControl::RefreshResult(result)).is_err() {
            debug!("Router is gone, refresh result not delivered");
        }
    }

    pub fn table(&self) -> watch::Receiver<SlotTable> {
        self.table.clone()
    }

    pub fn snapshot(&self) -> SlotTable {
        self.table.borrow().clone()
    }
}

pub struct MessageRouter {
    inbound: mpsc::Receiver<TelemetryMessage>,
    control: mpsc::UnboundedReceiver<RouterControl>,
    index: watch::Receiver<Arc<TopicStateIndex>>,
    listeners: Vec<mpsc::Sender<TelemetryEvent>>,
    table: watch::Sender<SlotTable>,
}

enum Wake {
    Stop,
    Message(TelemetryMessage),
    Control(RouterControl),
    IndexChanged,
    IndexClosed,
}

impl MessageRouter {
    pub fn new(
        inbound: mpsc::Receiver<TelemetryMessage>,
        index: watch::Receiver<Arc<TopicStateIndex>>,
    ) -> (Self, RouterHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let initial = SlotTable::rebuild(&index.borrow(), &SlotTable::default());
        let (table_tx, table_rx) = watch::channel(initial);

        let router = Self {
            inbound,
            control: control_rx,
            index,
            listeners: Vec::new(),
            table: table_tx,
        };
        let handle = RouterHandle {
            control: control_tx,
            table: table_rx,
        };
        (router, handle)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Message router started");
        let mut index_open = true;

        loop {
            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Stop,
                msg = self.inbound.recv() => msg.map_or(Wake::Stop, Wake::Message),
                Some(ctl) = self.control.recv() => Wake::Control(ctl),
                changed = self.index.changed(), if index_open => {
                    if changed.is_ok() { Wake::IndexChanged } else { Wake::IndexClosed }
                }
            };

            match wake {
                Wake::Stop => break,
                Wake::Message(msg) => self.dispatch(msg),
                Wake::Control(RouterControl::Register(tx)) => {
                    debug!("Consumer registered ({} total)", self.listeners.len() + 1);
                    self.listeners.push(tx);
                }
                Wake::Control(RouterControl::RefreshResult(result)) => {
                    self.broadcast(TelemetryEvent::RefreshResult(result));
                }
                Wake::IndexChanged => self.sync_table(),
                Wake::IndexClosed => index_open = false,
            }
        }

        info!("Message router stopped");
    }

    fn current_index(&self) -> Arc<TopicStateIndex> {
        self.index.borrow().clone()
    }

    /// Rebuilds the slot table when the index epoch moved on
    fn sync_table(&mut self) {
        let index = self.current_index();
        self.table.send_if_modified(|table| {
            if table.epoch == index.epoch() {
                return false;
            }
            debug!("Slot table rebuilt for epoch {}", index.epoch());
            let rebuilt = SlotTable::rebuild(&index, table);
            *table = rebuilt;
            true
        });
    }

    fn dispatch(&mut self, msg: TelemetryMessage) {
        self.sync_table();
        let index = self.current_index();

        let Some(slot) = index.resolve(&msg.topic) else {
            debug!("Dropping message on unmapped topic {}", msg.topic);
            return;
        };
        let Some(entry) = index.slot(slot) else {
            return;
        };

        let reading = match decode(entry.path.device_kind, &msg.payload) {
            Ok(reading) => reading,
            Err(e) => {
                debug!("Dropping message on {}: {}", msg.topic, e);
                return;
            }
        };

        self.table.send_modify(|table| {
            if let Some(view) = table.slots.get_mut(slot.0) {
                view.latest = Some((reading, msg.received_at));
            }
        });

        let event = TelemetryEvent::Reading {
            slot,
            reading: SlotReading {
                epoch: index.epoch(),
                topic: msg.topic,
                reading,
                received_at: msg.received_at,
            },
        };
        self.broadcast(event);
    }

    fn broadcast(&mut self, event: TelemetryEvent) {
        self.listeners.retain(|listener| match listener.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Consumer queue full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Consumer went away");
                false
            }
        });
    }
}
