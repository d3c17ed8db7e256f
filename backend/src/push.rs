//! Device push delivery. The trait boundary exists so the notification
//! pipeline can be exercised with a recording fake; the real implementation
//! posts legacy-API payloads to FCM.

use async_trait::async_trait;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("push rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), PushError>;
}

pub struct FcmClient {
    http: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl FcmClient {
    pub fn new(endpoint: &str, server_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            server_key: server_key.to_string(),
        }
    }
}

#[async_trait]
impl PushGateway for FcmClient {
    async fn send(&self, token: &str, message: &PushMessage) -> Result<(), PushError> {
        let payload = json!({
            "to": token,
            "notification": {
                "title": message.title,
                "body": message.body,
            },
            "data": message.data,
        });
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PushError::Rejected(format!("status {}", response.status())));
        }
        Ok(())
    }
}
