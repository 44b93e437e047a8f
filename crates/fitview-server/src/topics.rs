//! Replayable topic store.
//!
//! Every topic keeps a bounded log of [`TopicRecord`]s. Publishing appends
//! to the log and broadcasts the record to every connected client while
//! holding the store's write lock, so the broadcast order always matches
//! log order. A connecting client is subscribed under the same lock and
//! receives the latest record of each non-empty topic, so it sees neither
//! gaps nor duplicates between the replay and the live stream.
//!
//! Ephemeral events (`fit_progress`) go through the same broadcast channel
//! but are never retained or replayed.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use fitview_core::config::TopicConfig;
use fitview_types::{Topic, TopicRecord};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// Names of ephemeral, non-retained events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushEvent {
    /// Periodic progress of the running fit.
    FitProgress,
}

/// A frame pushed to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PushFrame {
    /// A retained topic record: `{"topic": ..., "contents": {...}}`.
    Topic {
        /// Topic the record was published on.
        topic: Topic,
        /// The record.
        contents: TopicRecord,
    },
    /// An ephemeral event: `{"event": ..., "payload": ...}`.
    Event {
        /// Event name.
        event: PushEvent,
        /// Event payload.
        payload: serde_json::Value,
    },
}

/// Topic logs plus the broadcast channel that feeds clients.
#[derive(Debug)]
pub struct TopicStore {
    logs: RwLock<BTreeMap<Topic, VecDeque<TopicRecord>>>,
    tx: broadcast::Sender<PushFrame>,
    retention: usize,
}

impl TopicStore {
    /// Create an empty store.
    pub fn new(config: &TopicConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            logs: RwLock::new(BTreeMap::new()),
            tx,
            retention: config.retention.max(1),
        }
    }

    /// Append `message` to `topic`, trim the log to the retention limit,
    /// and broadcast the new record. Returns the stored record.
    pub async fn publish(&self, topic: Topic, message: serde_json::Value) -> TopicRecord {
        let mut logs = self.logs.write().await;
        let record = TopicRecord {
            message,
            timestamp: timestamp_now(),
        };
        let log = logs.entry(topic).or_default();
        log.push_back(record.clone());
        while log.len() > self.retention {
            log.pop_front();
        }
        // send only fails when nobody is subscribed.
        let receivers = self
            .tx
            .send(PushFrame::Topic {
                topic,
                contents: record.clone(),
            })
            .unwrap_or(0);
        debug!(%topic, receivers, retained = log.len(), "Published topic record");
        record
    }

    /// Broadcast an ephemeral event. Returns the number of receivers.
    pub async fn emit(&self, event: PushEvent, payload: serde_json::Value) -> usize {
        let _logs = self.logs.read().await;
        self.tx
            .send(PushFrame::Event { event, payload })
            .unwrap_or(0)
    }

    /// The most recent `max_num` records of `topic`, oldest first, or all
    /// of them when `max_num` is `None`.
    pub async fn messages(&self, topic: Topic, max_num: Option<usize>) -> Vec<TopicRecord> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(&topic) else {
            return Vec::new();
        };
        let skip = max_num.map_or(0, |max| log.len().saturating_sub(max));
        log.iter().skip(skip).cloned().collect()
    }

    /// Subscribe a new client: returns the latest record of each non-empty
    /// topic and a receiver for everything published afterwards.
    pub async fn connect(&self) -> (Vec<PushFrame>, broadcast::Receiver<PushFrame>) {
        let logs = self.logs.read().await;
        let rx = self.tx.subscribe();
        let replay = logs
            .iter()
            .filter_map(|(topic, log)| {
                log.back().map(|record| PushFrame::Topic {
                    topic: *topic,
                    contents: record.clone(),
                })
            })
            .collect();
        (replay, rx)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Decimal seconds since the Unix epoch with six fractional digits.
fn timestamp_now() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}
