//! Named, capacity-bounded output channels

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error raised when publishing to a channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Channel '{0}' is full")]
    Full(String),

    #[error("Channel '{0}' is closed")]
    Closed(String),
}

/// Publish-only sink for pipeline outputs
///
/// `publish` never blocks.
pub trait OutputChannel: Send + Sync {
    fn name(&self) -> &str;

    fn publish(&self, value: Value) -> Result<(), PublishError>;
}

/// Output channel over a bounded tokio mpsc queue
#[derive(Debug, Clone)]
pub struct BoundedChannel {
    name: String,
    sender: mpsc::Sender<Value>,
}

impl BoundedChannel {
    /// Create a channel and the receiver its values are delivered to.
    /// A capacity of zero is raised to one.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                sender,
            },
            receiver,
        )
    }
}

impl OutputChannel for BoundedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, value: Value) -> Result<(), PublishError> {
        self.sender.try_send(value).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PublishError::Full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => PublishError::Closed(self.name.clone()),
        })
    }
}

/// Output channels by name
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn OutputChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under its own name, replacing any previous one
    pub fn register(&self, channel: Arc<dyn OutputChannel>) {
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.name().to_string(), channel);
    }

    /// Create and register a bounded channel, returning its receiver
    pub fn create_bounded(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Value> {
        let (channel, receiver) = BoundedChannel::new(name, capacity);
        self.register(Arc::new(channel));
        receiver
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OutputChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.names())
            .finish()
    }
}
