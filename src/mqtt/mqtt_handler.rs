//! Session Manager
//!
//! Owns the single broker connection. All network I/O runs on one worker
//! task that owns the [`BrokerTransport`]; callers talk to it through a
//! cloneable [`SessionHandle`] with an action/response pattern:
//!
//! ```text
//! SessionHandle ──[SessionAction + oneshot]──► worker ──► BrokerTransport
//!                                                │  ▲
//!        TelemetryMessage ◄── router queue ◄─────┘  └── TransportEvent (pump task)
//! ```
//!
//! State transitions are published on a `watch` channel:
//!
//! ```text
//! Disconnected ──► Refreshing ──► Connecting ──► Connected
//!      ▲   ▲                          │             │
//!      │   └──────── (failure) ───────┘             │
//!      └──────────── disconnect / link lost ────────┘
//! ```

use super::config::{BrokerAddress, ConnectOptions};
use super::error::{ConnectError, PublishError, SubscribeError};
use super::message_manager::TelemetryMessage;
use super::transport::{BrokerTransport, TransportEvent};
use bytes::Bytes;
use chrono::{DateTime, Local};
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

macro_rules! respond {
    ($response_tx:expr, $result:expr) => {
        if $response_tx.send($result).is_err() {
            debug!("Session caller went away before the response");
        }
    };
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Refreshing,
}

/// Counters for the session; never reset
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub messages_received: usize,
    pub messages_published: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Proof of a live session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connected {
    pub broker: BrokerAddress,
    pub client_id: String,
}

#[derive(Debug)]
enum SessionAction {
    Connect {
        options: ConnectOptions,
        response_tx: oneshot::Sender<Result<Connected, ConnectError>>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        response_tx: oneshot::Sender<Result<(), SubscribeError>>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        response_tx: oneshot::Sender<Result<(), PublishError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
}

/// Cloneable front of the session worker
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionAction>,
    state: Arc<watch::Sender<SessionState>>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Spawns the worker that owns `transport`
    ///
    /// Inbound publishes are forwarded to `router` with `try_send`; when the
    /// router queue is full the message is dropped.
    pub fn spawn<T: BrokerTransport>(
        transport: T,
        router: mpsc::Sender<TelemetryMessage>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let state = Arc::new(watch::Sender::new(SessionState::Disconnected));
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let worker = SessionWorker {
            transport,
            actions: rx,
            events: None,
            state: state.clone(),
            status: status_tx,
            router,
            connected: None,
            subscriptions: HashMap::new(),
        };
        let task = tokio::spawn(worker.run(shutdown));

        (
            Self {
                tx,
                state,
                status: status_rx,
            },
            task,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Change notifications for the session state
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Connects unless an attempt is already in flight
    ///
    /// A second call while `Connecting` is rejected with
    /// [`ConnectError::AlreadyInProgress`]; it never starts a second transport
    /// attempt. Calling while `Connected` returns the live session.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Connected, ConnectError> {
        let mut in_flight = false;
        self.state.send_if_modified(|state| match state {
            SessionState::Disconnected | SessionState::Refreshing => {
                *state = SessionState::Connecting;
                true
            }
            SessionState::Connecting => {
                in_flight = true;
                false
            }
            SessionState::Connected => false,
        });
        if in_flight {
            warn!("Connect rejected, another attempt is in flight");
            return Err(ConnectError::AlreadyInProgress);
        }

        let (response_tx, response_rx) = oneshot::channel();
        let action = SessionAction::Connect {
            options,
            response_tx,
        };
        if self.tx.send(action).await.is_err() {
            self.state.send_replace(SessionState::Disconnected);
            return Err(ConnectError::SessionClosed);
        }
        response_rx.await.map_err(|_| ConnectError::SessionClosed)?
    }

    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SubscribeError> {
        let (response_tx, response_rx) = oneshot::channel();
        let action = SessionAction::Subscribe {
            topic: topic.to_string(),
            qos,
            response_tx,
        };
        self.tx
            .send(action)
            .await
            .map_err(|_| SubscribeError::SessionClosed)?;
        response_rx.await.map_err(|_| SubscribeError::SessionClosed)?
    }

    /// At-most-once, best effort; nothing is queued while disconnected
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let (response_tx, response_rx) = oneshot::channel();
        let action = SessionAction::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            response_tx,
        };
        self.tx
            .send(action)
            .await
            .map_err(|_| PublishError::SessionClosed)?;
        response_rx.await.map_err(|_| PublishError::SessionClosed)?
    }

    /// Idempotent; safe from any state
    pub async fn disconnect(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(SessionAction::Disconnect { response_tx })
            .await
            .is_err()
            || response_rx.await.is_err()
        {
            self.state.send_replace(SessionState::Disconnected);
        }
    }

    /// Marks the start of a refresh cycle; only valid while disconnected
    pub(crate) fn mark_refreshing(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                *state = SessionState::Refreshing;
                true
            } else {
                false
            }
        })
    }

    /// Ends a refresh cycle that gave up before connecting
    pub(crate) fn abandon_refresh(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Refreshing {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
    }
}

struct SessionWorker<T> {
    transport: T,
    actions: mpsc::Receiver<SessionAction>,
    /// Inbound queue of the current link; replaced on every connect
    events: Option<mpsc::Receiver<TransportEvent>>,
    state: Arc<watch::Sender<SessionState>>,
    status: watch::Sender<SessionStatus>,
    router: mpsc::Sender<TelemetryMessage>,
    connected: Option<Connected>,
    subscriptions: HashMap<String, QoS>,
}

enum Wake {
    Shutdown,
    Action(Option<SessionAction>),
    Event(Option<TransportEvent>),
}

async fn next_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl<T: BrokerTransport> SessionWorker<T> {
    async fn run(mut self, shutdown: CancellationToken) {
        info!("Session worker started");
        loop {
            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                action = self.actions.recv() => Wake::Action(action),
                event = next_event(&mut self.events) => Wake::Event(event),
            };

            match wake {
                Wake::Shutdown | Wake::Action(None) => break,
                Wake::Action(Some(action)) => self.handle_action(action).await,
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Event(None) => self.handle_events_closed().await,
            }
        }

        self.teardown().await;
        info!("Session worker stopped");
    }

    async fn handle_action(&mut self, action: SessionAction) {
        match action {
            SessionAction::Connect {
                options,
                response_tx,
            } => {
                let result = self.connect(options).await;
                respond!(response_tx, result);
            }
            SessionAction::Subscribe {
                topic,
                qos,
                response_tx,
            } => {
                let result = self.subscribe(topic, qos).await;
                respond!(response_tx, result);
            }
            SessionAction::Publish {
                topic,
                payload,
                qos,
                response_tx,
            } => {
                let result = self.publish(&topic, payload, qos).await;
                respond!(response_tx, result);
            }
            SessionAction::Disconnect { response_tx } => {
                self.teardown().await;
                respond!(response_tx, ());
            }
        }
    }

    async fn connect(&mut self, options: ConnectOptions) -> Result<Connected, ConnectError> {
        if let Some(connected) = &self.connected {
            debug!("Already connected to {}", connected.broker);
            return Ok(connected.clone());
        }

        let (events_tx, events_rx) = mpsc::channel(options.event_capacity);
        match self.transport.connect(&options, events_tx).await {
            Ok(()) => {
                let connected = Connected {
                    broker: options.address.clone(),
                    client_id: options.client_id.clone(),
                };
                info!("Connected to {} with client ID {}", connected.broker, connected.client_id);
                self.events = Some(events_rx);
                self.subscriptions.clear();
                self.connected = Some(connected.clone());
                self.touch();
                self.state.send_replace(SessionState::Connected);
                Ok(connected)
            }
            Err(e) => {
                error!("Connect to {} failed: {}", options.address, e);
                self.status.send_modify(|s| s.last_error = Some(e.to_string()));
                self.state.send_replace(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self, topic: String, qos: QoS) -> Result<(), SubscribeError> {
        if self.connected.is_none() {
            return Err(SubscribeError::NotConnected);
        }
        if self.subscriptions.get(&topic) == Some(&qos) {
            debug!("Already subscribed to {} at {:?}", topic, qos);
            return Ok(());
        }

        debug!("Subscribing to topic \"{}\" qos {:?}", topic, qos);
        self.transport.subscribe(&topic, qos).await?;
        self.subscriptions.insert(topic, qos);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        if self.connected.is_none() {
            debug!("Publish to {} dropped, no live session", topic);
            return Err(PublishError::NotConnected);
        }

        debug!("Publishing to topic \"{}\" qos {:?}", topic, qos);
        self.transport.publish(topic, payload, qos).await?;
        self.status.send_modify(|s| s.messages_published += 1);
        self.touch();
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(msg) => {
                self.status.send_modify(|s| s.messages_received += 1);
                self.touch();
                if let Err(e) = self.router.try_send(msg) {
                    warn!("Router queue rejected message: {}", e);
                }
            }
            TransportEvent::ConnectionLost(reason) => {
                warn!("Session lost: {}", reason);
                self.status.send_modify(|s| s.last_error = Some(reason));
                self.teardown().await;
            }
        }
    }

    /// The pump dropped its sender; without a notice that still means the link is gone
    async fn handle_events_closed(&mut self) {
        self.events = None;
        if self.connected.is_none() {
            debug!("Transport event queue closed");
            return;
        }
        warn!("Transport event queue closed while connected");
        self.status
            .send_modify(|s| s.last_error = Some("transport event queue closed".to_string()));
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.transport.disconnect().await;
        self.events = None;
        self.subscriptions.clear();
        if self.connected.take().is_some() {
            info!("Session closed");
        }
        self.state.send_if_modified(|state| {
            let changed = *state != SessionState::Disconnected;
            *state = SessionState::Disconnected;
            changed
        });
    }

    fn touch(&self) {
        self.status.send_modify(|s| s.last_activity = Some(Local::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::MqttConfig;
    use crate::mqtt::mock_transport::MockBroker;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        MqttConfig::default().connect_options().unwrap()
    }

    fn spawn(broker: &MockBroker) -> (SessionHandle, mpsc::Receiver<TelemetryMessage>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        let (handle, _task) = SessionHandle::spawn(broker.transport(), router_tx, CancellationToken::new());
        (handle, router_rx)
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let broker = MockBroker::new();
        let (session, _rx) = spawn(&broker);

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect(options()).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(broker.disconnects(), 1);
    }

    #[tokio::test]
    async fn concurrent_connects_make_one_attempt() {
        let broker = MockBroker::new();
        broker.set_connect_delay(Duration::from_millis(50));
        let (session, _rx) = spawn(&broker);

        let (a, b) = tokio::join!(session.connect(options()), session.connect(options()));

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        assert!(a == Err(ConnectError::AlreadyInProgress) || b == Err(ConnectError::AlreadyInProgress));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn failed_connect_ends_disconnected() {
        let broker = MockBroker::new();
        broker.fail_next_connect(ConnectError::Unreachable("no route".into()));
        let (session, _rx) = spawn(&broker);

        let err = session.connect(options()).await.unwrap_err();
        assert_eq!(err, ConnectError::Unreachable("no route".into()));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.status().last_error.is_some());
    }

    #[tokio::test]
    async fn subscribe_requires_a_session_and_dedupes() {
        let broker = MockBroker::new();
        let (session, _rx) = spawn(&broker);

        assert_eq!(
            session.subscribe("wifi/humidity/22", QoS::ExactlyOnce).await,
            Err(SubscribeError::NotConnected)
        );

        session.connect(options()).await.unwrap();
        session.subscribe("wifi/humidity/22", QoS::ExactlyOnce).await.unwrap();
        session.subscribe("wifi/humidity/22", QoS::ExactlyOnce).await.unwrap();
        assert_eq!(broker.subscribed_topics(), vec!["wifi/humidity/22".to_string()]);
    }

    #[tokio::test]
    async fn publish_is_not_queued_while_disconnected() {
        let broker = MockBroker::new();
        let (session, _rx) = spawn(&broker);

        let payload = Bytes::from_static(b"{\"switch\":\"ON\"}");
        assert_eq!(
            session.publish("wifi/switch/5", payload.clone(), QoS::AtMostOnce).await,
            Err(PublishError::NotConnected)
        );

        session.connect(options()).await.unwrap();
        assert!(broker.published().is_empty());
        session.publish("wifi/switch/5", payload, QoS::AtMostOnce).await.unwrap();
        assert_eq!(broker.published().len(), 1);
        assert_eq!(session.status().messages_published, 1);
    }

    #[tokio::test]
    async fn inbound_messages_reach_the_router_queue() {
        let broker = MockBroker::new();
        let (session, mut router_rx) = spawn(&broker);
        session.connect(options()).await.unwrap();
        session.subscribe("wifi/temperature/17", QoS::AtMostOnce).await.unwrap();

        assert!(broker.deliver("wifi/temperature/17", r#"{"temperature": 21.0}"#));
        let msg = tokio::time::timeout(Duration::from_secs(1), router_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.topic, "wifi/temperature/17");
    }

    #[tokio::test]
    async fn lost_link_moves_to_disconnected() {
        let broker = MockBroker::new();
        let (session, _rx) = spawn(&broker);
        let mut state = session.watch_state();
        session.connect(options()).await.unwrap();

        broker.drop_link();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == SessionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(
            session.subscribe("wifi/temperature/17", QoS::AtMostOnce).await,
            Err(SubscribeError::NotConnected)
        );
    }

    #[tokio::test]
    async fn lost_link_with_full_event_queue_still_disconnects() {
        let broker = MockBroker::new();
        let (session, _rx) = spawn(&broker);
        let mut state = session.watch_state();
        let options = ConnectOptions {
            event_capacity: 1,
            ..options()
        };
        session.connect(options.clone()).await.unwrap();
        assert!(broker.is_connected());

        // the notice of the drop has no room left in the queue
        assert!(broker.inject("wifi/temperature/17", r#"{"temperature": 20.0}"#));
        broker.drop_link();

        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == SessionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(session.status().last_error.is_some());

        session.connect(options).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn full_router_queue_does_not_stall_the_worker() {
        let broker = MockBroker::new();
        let (router_tx, _router_rx) = mpsc::channel(1);
        let (session, _task) =
            SessionHandle::spawn(broker.transport(), router_tx, CancellationToken::new());
        session.connect(options()).await.unwrap();
        session.subscribe("wifi/temperature/17", QoS::AtMostOnce).await.unwrap();

        for _ in 0..5 {
            assert!(broker.deliver("wifi/temperature/17", r#"{"temperature": 20.0}"#));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let payload = Bytes::from_static(b"{\"switch\":\"OFF\"}");
        tokio::time::timeout(
            Duration::from_secs(1),
            session.publish("wifi/switch/5", payload, QoS::AtMostOnce),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(session.status().messages_received, 5);
        assert_eq!(broker.published().len(), 1);
    }
}
