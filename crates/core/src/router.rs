//! RTP router (spec §4.12): the producer/consumer bipartite graph, SSRC
//! recovery across reconnects, and the data-channel pub/sub side-channel.
//! One router per connection; cross-worker producer sharing is out of
//! scope (spec §4.12 "the router is per-thread").

use std::collections::{HashMap, HashSet};

use qrpc_protocol::MediaPath;

/// `{rid, rtp_rollover_counter, try_complement}` keyed by SSRC (spec §3).
#[derive(Debug, Clone)]
pub struct SsrcRecoveryEntry {
    pub rid: String,
    pub rtp_rollover_counter: u32,
    pub try_complement: bool,
}

#[derive(Default)]
pub struct Router {
    producer_to_consumers: HashMap<String, HashSet<String>>,
    consumer_to_producer: HashMap<String, String>,
    ssrc_recovery: HashMap<u32, SsrcRecoveryEntry>,

    /// `label -> publisher stream id` (spec §4.12 "Pub/sub over data
    /// channels").
    publishers: HashMap<String, String>,
    /// `publisher stream id -> subscriber stream ids`.
    subscribers: HashMap<String, HashSet<String>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_producer(&mut self, producer_id: impl Into<String>, consumer_id: impl Into<String>) {
        let producer_id = producer_id.into();
        let consumer_id = consumer_id.into();
        self.producer_to_consumers
            .entry(producer_id.clone())
            .or_default()
            .insert(consumer_id.clone());
        self.consumer_to_producer.insert(consumer_id, producer_id);
    }

    pub fn unsubscribe_consumer(&mut self, consumer_id: &str) -> Option<String> {
        let producer_id = self.consumer_to_producer.remove(consumer_id)?;
        if let Some(set) = self.producer_to_consumers.get_mut(&producer_id) {
            set.remove(consumer_id);
        }
        Some(producer_id)
    }

    pub fn consumers_of(&self, producer_id: &str) -> impl Iterator<Item = &String> {
        self.producer_to_consumers.get(producer_id).into_iter().flatten()
    }

    pub fn producer_of(&self, consumer_id: &str) -> Option<&String> {
        self.consumer_to_producer.get(consumer_id)
    }

    /// Detaches every consumer of a manually closed producer and returns
    /// the `$syscall` control frame each one's data channel should receive
    /// (spec §4.12 "Manual producer close").
    pub fn close_producer(&mut self, producer_id: &str, media_path: &MediaPath) -> Vec<(String, serde_json::Value)> {
        let Some(consumer_ids) = self.producer_to_consumers.remove(producer_id) else {
            return Vec::new();
        };
        let frame = serde_json::json!({
            "fn": "close_track",
            "args": { "path": media_path.to_string() },
        });
        let mut notifications = Vec::with_capacity(consumer_ids.len());
        for consumer_id in consumer_ids {
            self.consumer_to_producer.remove(&consumer_id);
            notifications.push((consumer_id, frame.clone()));
        }
        notifications
    }

    pub fn insert_recovery(&mut self, ssrc: u32, entry: SsrcRecoveryEntry) {
        self.ssrc_recovery.insert(ssrc, entry);
    }

    /// Spec §4.12 step 2 / §8 "Recovery of a RID-less packet": if `ssrc`
    /// has a recovery entry with `try_complement` set and the inbound
    /// packet carried no RID, returns the RID to inject and clears the
    /// flag so it fires at most once.
    pub fn recover_rid(&mut self, ssrc: u32, packet_rid_present: bool) -> Option<String> {
        let entry = self.ssrc_recovery.get_mut(&ssrc)?;
        if packet_rid_present || !entry.try_complement {
            return None;
        }
        entry.try_complement = false;
        Some(entry.rid.clone())
    }

    pub fn publish(&mut self, label: impl Into<String>, publisher_stream_id: impl Into<String>) {
        self.publishers.insert(label.into(), publisher_stream_id.into());
    }

    pub fn subscribe_label(&mut self, label: &str, subscriber_stream_id: impl Into<String>) -> bool {
        let Some(publisher_stream_id) = self.publishers.get(label).cloned() else {
            return false;
        };
        self.subscribers.entry(publisher_stream_id).or_default().insert(subscriber_stream_id.into());
        true
    }

    /// Every subscriber stream id that should receive a publisher's send
    /// on `publisher_stream_id`.
    pub fn fanout(&self, publisher_stream_id: &str) -> impl Iterator<Item = &String> {
        self.subscribers.get(publisher_stream_id).into_iter().flatten()
    }
}
