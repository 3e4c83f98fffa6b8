//! Topic Resolver: device list in, subscription set out

use crate::registry::DeviceRecord;
use std::collections::HashSet;

/// Ordered, duplicate-free set of topics to subscribe
///
/// Order follows the registry so slot numbering is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicSet {
    topics: Vec<String>,
}

impl TopicSet {
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.topics
    }
}

/// Sensor topics of `records`, first occurrence wins
pub fn resolve(records: &[DeviceRecord]) -> TopicSet {
    let mut seen = HashSet::new();
    let topics = records
        .iter()
        .filter(|r| r.is_sensor)
        .map(|r| r.topic.as_str())
        .filter(|topic| seen.insert(*topic))
        .map(str::to_string)
        .collect();
    TopicSet { topics }
}
