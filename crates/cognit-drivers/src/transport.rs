use std::sync::Mutex;

use anyhow::Result;
use serde_json::{Value, json};

use crate::TransportDriver;
use crate::dedupe::{ReplyCache, idempotency_key};

const REPLY_CACHE_CAPACITY: usize = 256;

/// One delivered outbox message, as observed by subscribers.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub channel: String,
    pub message: Value,
}

/// In-memory transport: delivered messages land in an append-only outbox.
/// Subscribers (the WebSocket push channel) poll snapshots by offset, so
/// in-order observation per channel comes for free.
pub struct OutboxTransport {
    inner: Mutex<Inner>,
}

struct Inner {
    outbox: Vec<OutboxEntry>,
    seen: ReplyCache,
}

impl OutboxTransport {
    pub fn new() -> Self {
        OutboxTransport {
            inner: Mutex::new(Inner {
                outbox: Vec::new(),
                seen: ReplyCache::new(REPLY_CACHE_CAPACITY),
            }),
        }
    }

    /// Snapshot of every delivered message from `offset` onward, with the
    /// next offset to poll from.
    pub fn since(&self, offset: usize) -> (Vec<OutboxEntry>, usize) {
        let inner = self.inner.lock().expect("outbox lock");
        let entries = inner.outbox.get(offset..).unwrap_or(&[]).to_vec();
        (entries, inner.outbox.len())
    }

    /// Snapshot filtered to one channel.
    pub fn channel_messages(&self, channel: &str) -> Vec<Value> {
        let inner = self.inner.lock().expect("outbox lock");
        inner
            .outbox
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbox lock").outbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OutboxTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportDriver for OutboxTransport {
    fn emit(&self, frame: &Value) -> Result<Value> {
        let key = idempotency_key(frame);
        let mut inner = self.inner.lock().expect("outbox lock");
        if let Some(reply) = inner.seen.get(&key) {
            tracing::debug!(idempotency_key = %key, "coalescing duplicate transport emit");
            return Ok(reply);
        }

        let channel = frame
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or("default")
            .to_string();
        let messages: Vec<Value> = frame
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|m| m.iter().filter(|x| x.is_object()).cloned().collect())
            .unwrap_or_default();

        for message in &messages {
            inner.outbox.push(OutboxEntry {
                channel: channel.clone(),
                message: message.clone(),
            });
        }
        tracing::debug!(channel = %channel, delivered = messages.len(), "transport emit");

        let reply = json!({
            "type": "transport",
            "ok": true,
            "channel": channel,
            "messages": messages,
        });
        inner.seen.put(&key, reply.clone());
        Ok(reply)
    }
}
