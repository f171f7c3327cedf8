//! Replication Transport
//!
//! Request/response delivery between nodes. The HTTP implementation lives
//! in `network`; tests wire nodes together in-process.

use async_trait::async_trait;

use super::protocol::Message;
use crate::error::Result;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `peer` and return the raw reply
    async fn send(&self, peer: &str, message: Message) -> Result<Message>;

    /// Send and check the reply belongs to the same command
    async fn call(&self, peer: &str, message: Message) -> Result<Message> {
        let command = message.command();
        self.send(peer, message).await?.expect(command)
    }

    /// Best-effort call. On success the reply replaces `message` and
    /// `true` is returned; on failure `message` is left untouched.
    async fn try_call(&self, peer: &str, message: &mut Message) -> bool {
        match self.call(peer, message.clone()).await {
            Ok(reply) => {
                *message = reply;
                true
            }
            Err(e) => {
                tracing::debug!("{} to {} failed: {}", message.command(), peer, e);
                false
            }
        }
    }
}
