//! Chat transports. A transport turns incoming messages into `Request`s for
//! the executor and delivers the `Reply`s it produces.

pub mod console;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::request::Reply;

/// Delivers replies back to wherever the request came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, reply: Reply);
}

/// Keeps every reply in memory.
#[derive(Default)]
pub struct CollectingSink {
    replies: Mutex<Vec<Reply>>,
}

impl CollectingSink {
    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReplySink for CollectingSink {
    async fn send(&self, reply: Reply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push(reply);
        }
    }
}
