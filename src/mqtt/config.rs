use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqttConfigError {
    #[error("invalid broker address {0:?}")]
    InvalidAddress(String),

    #[error("invalid QoS level {0}, expected 0, 1 or 2")]
    InvalidQos(u8),
}

/// Broker session settings as stored in the `[mqtt]` config section
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// `tcp://host:port`, `mqtt://host:port` or bare `host[:port]`
    pub broker_url: String,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub subscribe_qos: u8,
    pub publish_qos: u8,
    /// Capacity of the transport's inbound event queue
    pub event_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: format!("tcp://localhost:{}", DEFAULT_PORT),
            client_id: "dormlink".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 5,
            connect_timeout_ms: 5_000,
            subscribe_timeout_ms: 3_000,
            subscribe_qos: 2,
            publish_qos: 1,
            event_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn subscribe_qos(&self) -> Result<QoS, MqttConfigError> {
        qos_from_level(self.subscribe_qos)
    }

    pub fn publish_qos(&self) -> Result<QoS, MqttConfigError> {
        qos_from_level(self.publish_qos)
    }

    /// Everything a connect attempt needs, validated
    pub fn connect_options(&self) -> Result<ConnectOptions, MqttConfigError> {
        let address = BrokerAddress::parse(&self.broker_url)?;
        let credentials = self.username.as_ref().map(|user| Credentials {
            username: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        });

        Ok(ConnectOptions {
            address,
            credentials,
            client_id: self.client_id.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            subscribe_timeout: Duration::from_millis(self.subscribe_timeout_ms),
            event_capacity: self.event_capacity.max(1),
        })
    }

    pub fn validate(&self) -> Result<(), MqttConfigError> {
        self.connect_options()?;
        self.subscribe_qos()?;
        self.publish_qos()?;
        Ok(())
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, MqttConfigError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttConfigError::InvalidQos(other)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(url: &str) -> Result<Self, MqttConfigError> {
        let invalid = || MqttConfigError::InvalidAddress(url.to_string());

        let rest = url.trim();
        let rest = rest
            .strip_prefix("tcp://")
            .or_else(|| rest.strip_prefix("mqtt://"))
            .unwrap_or(rest);
        let rest = rest.trim_end_matches('/');

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// keep passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: BrokerAddress,
    pub credentials: Option<Credentials>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub event_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("tcp://115.159.98.171:1883", "115.159.98.171", 1883)]
    #[case("mqtt://broker.local:8883", "broker.local", 8883)]
    #[case("broker.local", "broker.local", DEFAULT_PORT)]
    #[case("localhost:1884/", "localhost", 1884)]
    fn parses_broker_urls(#[case] url: &str, #[case] host: &str, #[case] port: u16) {
        let address = BrokerAddress::parse(url).unwrap();
        assert_eq!(address.host, host);
        assert_eq!(address.port, port);
    }

    #[rstest]
    #[case("")]
    #[case("tcp://:1883")]
    #[case("tcp://host:notaport")]
    #[case("tcp://host/path:1883")]
    fn rejects_bad_broker_urls(#[case] url: &str) {
        assert!(BrokerAddress::parse(url).is_err());
    }

    #[test]
    fn qos_levels_are_bounded() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(qos_from_level(3), Err(MqttConfigError::InvalidQos(3)));
    }

    #[test]
    fn credentials_require_a_username() {
        let mut config = MqttConfig::default();
        assert!(config.connect_options().unwrap().credentials.is_none());

        config.username = Some("dorm".into());
        let creds = config.connect_options().unwrap().credentials.unwrap();
        assert_eq!(creds.username, "dorm");
        assert_eq!(creds.password, "");
        assert!(format!("{:?}", creds).contains("***"));
    }
}
