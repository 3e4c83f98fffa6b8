//! Scripted in-process broker used by the tests

use super::config::ConnectOptions;
use super::error::{ConnectError, PublishError, SubscribeError};
use super::message_manager::TelemetryMessage;
use super::transport::{BrokerTransport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::QoS;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockState {
    connect_attempts: usize,
    connect_delay: Duration,
    connect_script: VecDeque<ConnectError>,
    rejected_topics: HashSet<String>,
    subscribed: Vec<(String, QoS)>,
    published: Vec<(String, Bytes, QoS)>,
    events: Option<mpsc::Sender<TransportEvent>>,
    disconnects: usize,
}

/// Shared view of the fake broker; hand out transports with [`MockBroker::transport`]
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
        }
    }

    pub fn fail_next_connect(&self, err: ConnectError) {
        self.state().connect_script.push_back(err);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    pub fn reject_topic(&self, topic: &str) {
        self.state().rejected_topics.insert(topic.to_string());
    }

    pub fn connect_attempts(&self) -> usize {
        self.state().connect_attempts
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state().events.is_some()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state().subscribed.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn published(&self) -> Vec<(String, Bytes, QoS)> {
        self.state().published.clone()
    }

    /// Delivers a publish the way the broker would: only on a live link and
    /// only for subscribed topics. Returns whether it was handed over.
    pub fn deliver(&self, topic: &str, payload: &'static str) -> bool {
        let state = self.state();
        let Some(events) = &state.events else {
            return false;
        };
        if !state.subscribed.iter().any(|(t, _)| t == topic) {
            return false;
        }
        events
            .try_send(TransportEvent::Message(TelemetryMessage::from_topic(
                topic.to_string(),
                payload,
            )))
            .is_ok()
    }

    /// Pushes a publish onto the live link whether or not it was subscribed,
    /// like a message still in flight from before a resubscribe
    pub fn inject(&self, topic: &str, payload: &'static str) -> bool {
        let state = self.state();
        let Some(events) = &state.events else {
            return false;
        };
        events
            .try_send(TransportEvent::Message(TelemetryMessage::from_topic(
                topic.to_string(),
                payload,
            )))
            .is_ok()
    }

    /// Simulates the network dropping the link
    pub fn drop_link(&self) {
        let mut state = self.state();
        state.subscribed.clear();
        if let Some(events) = state.events.take() {
            let _ = events.try_send(TransportEvent::ConnectionLost("link dropped".into()));
        }
    }
}

pub struct MockTransport {
    broker: MockBroker,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn connect(
        &mut self,
        _options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), ConnectError> {
        let delay = {
            let mut state = self.broker.state();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.broker.state();
        if let Some(err) = state.connect_script.pop_front() {
            return Err(err);
        }
        state.subscribed.clear();
        state.events = Some(events);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SubscribeError> {
        let mut state = self.broker.state();
        if state.events.is_none() {
            return Err(SubscribeError::NotConnected);
        }
        if state.rejected_topics.contains(topic) {
            return Err(SubscribeError::BrokerRejected(topic.to_string()));
        }
        state.subscribed.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let mut state = self.broker.state();
        if state.events.is_none() {
            return Err(PublishError::NotConnected);
        }
        state.published.push((topic.to_string(), payload, qos));
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.broker.state();
        if state.events.take().is_some() {
            state.disconnects += 1;
        }
        state.subscribed.clear();
    }
}
