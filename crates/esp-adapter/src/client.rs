//! Uniform send interface (C7 step 5): every provider
//! adapter implements `EspClient`, returning the same normalized
//! `SendOutcome` regardless of how the underlying HTTP API shapes its
//! response. Grounded on `smtp_dispatcher.rs`'s attempt/response loop,
//! generalized from an SMTP `Response` to this enum.
use async_trait::async_trait;
use bounce_classify::SendErrorCategory;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub from_name: String,
    pub from_address: String,
    pub reply_address: Option<String>,
    pub to_address: String,
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    /// Correlates the request with the queue row, independent of
    /// whatever message id the provider assigns on success.
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SendOutcome {
    Ok { provider_message_id: String },
    Error {
        category: SendErrorCategory,
        provider_reason: String,
    },
}

impl SendOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

#[async_trait]
pub trait EspClient: Send + Sync {
    /// Provider name as it appears in `sending_profiles.provider` and in
    /// bounce-classifier rule selection.
    fn provider(&self) -> &'static str;

    async fn send(&self, request: &SendRequest) -> SendOutcome;
}
