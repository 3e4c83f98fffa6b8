//! # Telemetry Module
//!
//! The Device Telemetry Bus: turns the registry's sensor list into live
//! subscriptions and the broker's message stream into per-device readings.
//!
//! ## Module Architecture
//!
//! ```text
//! telemetry/
//! ├── topic_resolver.rs - Device list to subscription set
//! ├── topic_state.rs    - Topic schema, slot index and payload decoding
//! ├── router.rs         - Dispatch task, slot table and consumer channels
//! └── refresh.rs        - Refresh cycle and its coordinator
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! DeviceRegistry ──► refresh ──► SessionHandle ⇄ broker
//!                       │              │
//!                       ▼              ▼
//!              TopicStateIndex ──► MessageRouter ──► consumers
//! ```
//!
//! [`TelemetryBus`] owns every task involved. It is constructed explicitly
//! and handed around by reference; dropping it without calling
//! [`TelemetryBus::shutdown`] leaves the tasks to end with the runtime.

pub mod refresh;
pub mod router;
pub mod topic_resolver;
pub mod topic_state;

use crate::config::BusConfig;
use crate::mqtt::command::DeviceCommand;
use crate::mqtt::config::{MqttConfig, MqttConfigError};
use crate::mqtt::error::PublishError;
use crate::mqtt::mqtt_handler::{SessionHandle, SessionState, SessionStatus};
use crate::mqtt::transport::BrokerTransport;
use crate::registry::{DeviceRecord, DeviceRegistry};
use bytes::Bytes;
use refresh::{RefreshCoordinator, RefreshHandle, RefreshSettings};
use router::{
    spawn_consumer, MessageRouter, RefreshOutcome, RouterHandle, SlotTable, TelemetryConsumer,
    TelemetryEvent,
};
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use topic_state::TopicStateIndex;
use tracing::{debug, info};

pub struct TelemetryBus {
    session: SessionHandle,
    refresh: RefreshHandle,
    router: RouterHandle,
    index: watch::Receiver<Arc<TopicStateIndex>>,
    publish_qos: QoS,
    consumer_capacity: usize,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TelemetryBus {
    /// Starts the session worker, router and refresh coordinator
    ///
    /// Nothing is connected until the first refresh.
    pub fn spawn<T: BrokerTransport>(
        mqtt: &MqttConfig,
        bus: &BusConfig,
        registry: Arc<dyn DeviceRegistry>,
        transport: T,
    ) -> Result<Self, MqttConfigError> {
        let settings = RefreshSettings {
            options: mqtt.connect_options()?,
            subscribe_qos: mqtt.subscribe_qos()?,
            min_interval: bus.min_refresh_interval(),
        };
        let publish_qos = mqtt.publish_qos()?;
        let shutdown = CancellationToken::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(bus.router_capacity.max(1));
        let (session, session_task) = SessionHandle::spawn(transport, inbound_tx, shutdown.clone());

        let (index_tx, index_rx) = watch::channel(Arc::new(TopicStateIndex::empty()));
        let (router, router_handle) = MessageRouter::new(inbound_rx, index_rx.clone());
        let router_task = tokio::spawn(router.run(shutdown.clone()));

        let (refresh, refresh_task) = RefreshCoordinator::spawn(
            session.clone(),
            registry,
            settings,
            index_tx,
            router_handle.clone(),
            shutdown.clone(),
        );

        info!("Telemetry bus started for {}", mqtt.broker_url);
        Ok(Self {
            session,
            refresh,
            router: router_handle,
            index: index_rx,
            publish_qos,
            consumer_capacity: bus.consumer_capacity,
            shutdown,
            tasks: vec![session_task, router_task, refresh_task],
        })
    }

    /// Runs a refresh and waits for its outcome
    ///
    /// If the request gets coalesced into a later cycle, that cycle's
    /// outcome is returned.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresh.refresh().await
    }

    /// Queues a refresh without waiting; returns its epoch
    pub fn request_refresh(&self) -> u64 {
        self.refresh.request()
    }

    pub async fn refresh_outcome(&self, epoch: u64) -> RefreshOutcome {
        self.refresh.outcome(epoch).await
    }

    /// New consumer channel carrying readings and refresh results
    pub fn events(&self) -> mpsc::Receiver<TelemetryEvent> {
        self.router.register(self.consumer_capacity)
    }

    /// Registers `consumer` and drives it on its own task
    pub fn attach<C: TelemetryConsumer>(&self, consumer: C) -> JoinHandle<C> {
        spawn_consumer(self.events(), consumer)
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(), PublishError> {
        self.session
            .publish(topic, payload.into(), self.publish_qos)
            .await
    }

    /// Sends `command` to an actuator on its own topic
    pub async fn publish_command(
        &self,
        record: &DeviceRecord,
        command: &DeviceCommand,
    ) -> Result<(), PublishError> {
        let payload = command.encode_for(record)?;
        debug!("Sending {:?} to {}", command, record.topic);
        self.session
            .publish(&record.topic, payload, self.publish_qos)
            .await
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn watch_session_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Latest reading per slot of the current index
    pub fn readings(&self) -> SlotTable {
        self.router.snapshot()
    }

    pub fn watch_readings(&self) -> watch::Receiver<SlotTable> {
        self.router.table()
    }

    pub fn index(&self) -> Arc<TopicStateIndex> {
        self.index.borrow().clone()
    }

    /// Disconnects, stops every task and waits for them
    pub async fn shutdown(self) {
        info!("Shutting down telemetry bus");
        self.session.disconnect().await;
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                debug!("Bus task ended abnormally: {}", e);
            }
        }
    }
}
