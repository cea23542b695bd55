//! Cross-process transport for bus envelopes.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// A serialized envelope as it travels between processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub envelope: String,
}

#[async_trait]
pub trait BusTransport: Send + Sync + std::fmt::Debug {
    async fn publish(&self, channel: &str, envelope: String) -> Result<()>;

    /// Messages on channels matching `pattern` (`*` suffix is a prefix match).
    fn subscribe(&self, pattern: &str) -> BoxStream<'static, TransportMessage>;
}

/// Transport channel name for a run-scoped bus channel.
pub fn transport_channel(run_id: &str, channel: &str) -> String {
    format!("run:{run_id}:{channel}")
}

pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// In-process fan-out over a broadcast channel. Every bus attached to the
/// same loopback sees every other bus's envelopes, like a shared broker.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    tx: broadcast::Sender<TransportMessage>,
}

impl LoopbackTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BusTransport for LoopbackTransport {
    async fn publish(&self, channel: &str, envelope: String) -> Result<()> {
        // No receivers is not an error for a broker.
        let _ = self.tx.send(TransportMessage {
            channel: channel.to_string(),
            envelope,
        });
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> BoxStream<'static, TransportMessage> {
        let pattern = pattern.to_string();
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |message| {
                let matched = message
                    .ok()
                    .filter(|m| pattern_matches(&pattern, &m.channel));
                futures::future::ready(matched)
            })
            .boxed()
    }
}
