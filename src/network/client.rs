//! Network Client
//!
//! reqwest-based `Transport`: one POST per call, message as a base64
//! bincode body, command id and shared secret as headers.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::WolfKvConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::replication::protocol::{COMMAND_HEADER, ERROR_CODE_HEADER, SECRET_HEADER};
use crate::replication::{Message, Transport};

pub struct HttpTransport {
    client: reqwest::Client,
    shared_secret: String,
}

impl HttpTransport {
    pub fn new(shared_secret: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            shared_secret: shared_secret.into(),
        })
    }

    pub fn from_config(config: &WolfKvConfig) -> Result<Self> {
        Self::new(config.cluster.shared_secret.clone(), config.request_timeout())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, peer: &str, message: Message) -> Result<Message> {
        let command = message.command();
        let url = format!("{}{}", peer.trim_end_matches('/'), command.endpoint().path());
        let body = message.to_base64()?;

        let response = self
            .client
            .post(&url)
            .header(COMMAND_HEADER, command.as_u32().to_string())
            .header(SECRET_HEADER, &self.shared_secret)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transport(peer, e))?;

        let status = response.status();
        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .map(ErrorCode::from_u32);

        let text = response
            .text()
            .await
            .map_err(|e| Error::transport(peer, e))?;

        if !status.is_success() || code.is_some() {
            tracing::debug!("{} to {} failed with HTTP {}", command, peer, status);
            return Err(Error::Remote {
                code: code.unwrap_or(ErrorCode::Unknown),
                message: if text.is_empty() {
                    format!("HTTP {}", status)
                } else {
                    text
                },
            });
        }

        Message::from_base64(&text)
    }
}
