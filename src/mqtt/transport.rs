//! Transport seam between the session worker and the network
//!
//! The session worker is the only caller; it owns exactly one transport and
//! drives it strictly sequentially. Inbound traffic comes back through the
//! [`TransportEvent`] channel handed over on connect, from a separate pump
//! task that must never wait on a consumer.

use super::config::ConnectOptions;
use super::error::{ConnectError, PublishError, SubscribeError};
use super::message_manager::TelemetryMessage;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::io;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(TelemetryMessage),
    /// The link dropped without being asked to
    ConnectionLost(String),
}

#[async_trait]
pub trait BrokerTransport: Send + 'static {
    /// Opens the link and returns once the broker acknowledged the session
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), ConnectError>;

    /// Subscribes and waits for the broker's verdict
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SubscribeError>;

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError>;

    /// Releases the link; a no-op when there is none
    async fn disconnect(&mut self);
}

/// Subscribe traffic seen by the pump, in wire order
#[derive(Debug)]
enum SubscribeProgress {
    Sent(u16),
    Acked(SubAck),
}

struct Link {
    client: AsyncClient,
    subacks: mpsc::Receiver<SubscribeProgress>,
    shutdown: CancellationToken,
    pump: JoinHandle<()>,
    subscribe_timeout: Duration,
}

/// Production transport on top of rumqttc
#[derive(Default)]
pub struct RumqttTransport {
    link: Option<Link>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerTransport for RumqttTransport {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), ConnectError> {
        self.disconnect().await;

        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.address.host.clone(),
            options.address.port,
        );
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, options.event_capacity);

        info!("Connecting to broker {} as {}", options.address, options.client_id);
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(other) => debug!("Pre-ConnAck event: {:?}", other),
                    Err(e) => return Err(map_connection_error(e)),
                }
            }
        };

        let ack = match tokio::time::timeout(options.connect_timeout, handshake).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                error!("Connect to {} failed: {}", options.address, e);
                return Err(e);
            }
            Err(_) => {
                error!("Connect to {} timed out after {:?}", options.address, options.connect_timeout);
                return Err(ConnectError::Timeout);
            }
        };
        debug!("ConnAck received: {:?}", ack);

        let (suback_tx, subacks) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(pump_events(event_loop, events, suback_tx, shutdown.clone()));

        self.link = Some(Link {
            client,
            subacks,
            shutdown,
            pump,
            subscribe_timeout: options.subscribe_timeout,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SubscribeError> {
        let link = self.link.as_mut().ok_or(SubscribeError::NotConnected)?;

        // traffic of earlier timed-out requests must not answer this one
        while link.subacks.try_recv().is_ok() {}

        link.client
            .subscribe(topic, qos)
            .await
            .map_err(|_| SubscribeError::NotConnected)?;

        // The first Subscribe on the wire after the drain is ours, unless an
        // older request had not been written yet when it timed out.
        let verdict = tokio::time::timeout(link.subscribe_timeout, async {
            let mut pkid = None;
            while let Some(progress) = link.subacks.recv().await {
                match progress {
                    SubscribeProgress::Sent(sent) if pkid.is_none() => pkid = Some(sent),
                    SubscribeProgress::Sent(_) => {}
                    SubscribeProgress::Acked(ack) if Some(ack.pkid) == pkid => return Some(ack),
                    SubscribeProgress::Acked(ack) => {
                        debug!("Ignoring SubAck {} of an earlier subscribe", ack.pkid)
                    }
                }
            }
            None
        })
        .await;

        match verdict {
            Ok(Some(ack)) if suback_granted(&ack) => Ok(()),
            Ok(Some(_)) => Err(SubscribeError::BrokerRejected(topic.to_string())),
            Ok(None) => Err(SubscribeError::NotConnected),
            Err(_) => {
                warn!("No SubAck for {} within {:?}", topic, link.subscribe_timeout);
                Err(SubscribeError::BrokerRejected(topic.to_string()))
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), PublishError> {
        let link = self.link.as_ref().ok_or(PublishError::NotConnected)?;
        link.client
            .publish(topic, qos, false, payload.to_vec())
            .await
            .map_err(|_| PublishError::NotConnected)
    }

    async fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        if let Err(e) = link.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        link.shutdown.cancel();
        if let Err(e) = link.pump.await {
            warn!("Event pump ended abnormally: {}", e);
        }
        info!("Broker link released");
    }
}

/// Network side of the link: forwards publishes and SubAcks
async fn pump_events(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    subacks: mpsc::Sender<SubscribeProgress>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => None,
            polled = event_loop.poll() => Some(polled),
        };

        match polled {
            None => {
                flush_disconnect(&mut event_loop).await;
                break;
            }
            Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                let msg = TelemetryMessage::from_topic(publish.topic, publish.payload);
                if let Err(e) = events.try_send(TransportEvent::Message(msg)) {
                    warn!("Dropping inbound message: {}", e);
                }
            }
            Some(Ok(Event::Outgoing(Outgoing::Subscribe(pkid)))) => {
                if subacks.try_send(SubscribeProgress::Sent(pkid)).is_err() {
                    debug!("Nobody waiting for Subscribe {}", pkid);
                }
            }
            Some(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                if subacks.try_send(SubscribeProgress::Acked(ack)).is_err() {
                    debug!("Nobody waiting for SubAck");
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("Broker connection lost: {}", e);
                if let Err(err) = events.try_send(TransportEvent::ConnectionLost(e.to_string())) {
                    // the worker still sees the queue close
                    warn!("Link loss notice not queued: {}", err);
                }
                break;
            }
        }
    }
}

async fn flush_disconnect(event_loop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("Disconnect not flushed within {:?}", DISCONNECT_FLUSH);
    }
}

fn suback_granted(ack: &SubAck) -> bool {
    ack.return_codes
        .iter()
        .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
}

fn map_connection_error(err: ConnectionError) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(code) => ConnectError::Refused(format!("{:?}", code)),
        ConnectionError::NetworkTimeout => ConnectError::Timeout,
        ConnectionError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            ConnectError::Refused(e.to_string())
        }
        ConnectionError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ConnectError::Timeout,
        other => ConnectError::Unreachable(other.to_string()),
    }
}
