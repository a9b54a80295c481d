//! Key and channel naming.
//!
//! All generated names live under a configurable prefix so applications can
//! share one Redis. Key structure:
//! - `{prefix}q:{queue}` - request queue (list)
//! - `{prefix}n:{queue}` - request-notification channel (pub/sub)
//! - `{prefix}r:{request_id}` - response channel (pub/sub)
//! - `{prefix}c:{channel}` - user pub/sub channel

/// Builds queue, channel, and response-channel names under a fixed prefix.
///
/// Participants capture the prefix once at construction; changing the
/// process-wide defaults afterwards does not affect open participants.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The request queue list for a queue name.
    pub fn queue(&self, queue_name: &str) -> String {
        format!("{}q:{}", self.prefix, queue_name)
    }

    /// The wake-up notification channel for a queue name.
    pub fn notifications(&self, queue_name: &str) -> String {
        format!("{}n:{}", self.prefix, queue_name)
    }

    /// The response channel for a request id.
    pub fn response(&self, request_id: &str) -> String {
        format!("{}r:{}", self.prefix, request_id)
    }

    /// The user pub/sub channel for a channel name.
    pub fn channel(&self, channel_name: &str) -> String {
        format!("{}c:{}", self.prefix, channel_name)
    }
}
