//! Submission backend
//!
//! Chain-mutating requests go through a relay server that answers with the
//! transaction it sent, or with an error message.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::types::Epoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Post,
    Comment,
    Vote,
    Airdrop,
    UserStateTransition,
    SignUp,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Post => "post",
            Endpoint::Comment => "comment",
            Endpoint::Vote => "vote",
            Endpoint::Airdrop => "airdrop",
            Endpoint::UserStateTransition => "userStateTransition",
            Endpoint::SignUp => "signup",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.path()) }
}

/// Backend answer to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmissionResponse {
    pub transaction: Option<String>,
    pub error: Option<String>,
    pub epoch: Option<Epoch>,
    /// Identifier of the created post or comment, when any
    #[serde(default, alias = "postId", alias = "commentId")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub transaction_id: String,
    pub epoch: Option<Epoch>,
    pub id: Option<String>,
}

impl SubmissionResponse {
    /// An `error` field wins over a transaction; a response with neither is a rejection too.
    pub fn into_receipt(self) -> Result<SubmissionReceipt> {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Err(Error::Submission(error));
        }
        let transaction_id = self
            .transaction
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Submission("response carries no transaction".into()))?;
        Ok(SubmissionReceipt { transaction_id, epoch: self.epoch, id: self.id })
    }
}

#[async_trait]
pub trait SubmissionBackend: Send + Sync {
    async fn submit(&self, endpoint: Endpoint, payload: Value) -> Result<SubmissionReceipt>;
}

#[derive(Clone)]
pub struct HttpSubmissionBackend {
    base: String,
    client: Client,
}

impl HttpSubmissionBackend {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(config.request_timeout_secs)).build()?;
        Ok(Self { base: config.url.trim_end_matches('/').to_string(), client })
    }

    pub fn url(&self, endpoint: Endpoint) -> String { format!("{}/api/{}", self.base, endpoint.path()) }
}

#[async_trait]
impl SubmissionBackend for HttpSubmissionBackend {
    async fn submit(&self, endpoint: Endpoint, payload: Value) -> Result<SubmissionReceipt> {
        let url = self.url(endpoint);
        debug!(%url, "submitting");
        let resp = self.client.post(&url).json(&payload).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        // The server reports rejections as JSON bodies, often with a 4xx status.
        match serde_json::from_str::<SubmissionResponse>(&text) {
            Ok(body) => body.into_receipt(),
            Err(_) if !status.is_success() => {
                Err(Error::Submission(format!("{endpoint} failed {status} {text}")))
            }
            Err(e) => Err(Error::Decode(format!("{endpoint}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let backend = HttpSubmissionBackend::new(&ServerConfig {
            url: "http://localhost:3001/".into(),
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(backend.url(Endpoint::UserStateTransition), "http://localhost:3001/api/userStateTransition");
        assert_eq!(backend.url(Endpoint::SignUp), "http://localhost:3001/api/signup");
    }

    #[test]
    fn test_error_field_wins() {
        let body: SubmissionResponse =
            serde_json::from_str(r#"{"transaction":"0x1","error":"bad proof"}"#).unwrap();
        assert!(matches!(body.into_receipt(), Err(Error::Submission(msg)) if msg == "bad proof"));
    }

    #[test]
    fn test_receipt_fields() {
        let body: SubmissionResponse =
            serde_json::from_str(r#"{"transaction":"0xab","epoch":4,"postId":"p1"}"#).unwrap();
        let receipt = body.into_receipt().unwrap();
        assert_eq!(receipt.transaction_id, "0xab");
        assert_eq!(receipt.epoch, Some(4));
        assert_eq!(receipt.id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_missing_transaction_is_rejection() {
        let body: SubmissionResponse = serde_json::from_str("{}").unwrap();
        assert!(matches!(body.into_receipt(), Err(Error::Submission(_))));
    }
}
