//! An SES-style adapter targeting the `SendEmail` v2 JSON API. Request
//! signing (SigV4) is out of scope for this crate — `SesClient` expects a
//! pre-signing `reqwest::Client` (built by its caller with a signing
//! middleware, the way the rest of this codebase layers cross-cutting
//! concerns onto a plain `reqwest::Client` rather than baking auth into
//! the adapter itself).
use crate::client::{EspClient, SendOutcome, SendRequest};
use async_trait::async_trait;
use bounce_classify::BounceClassifier;
use serde_json::json;
use std::sync::Arc;

pub struct SesClient {
    http: reqwest::Client,
    endpoint: String,
    classifier: Arc<BounceClassifier>,
}

impl SesClient {
    pub fn new(http: reqwest::Client, endpoint: String, classifier: Arc<BounceClassifier>) -> Self {
        Self { http, endpoint, classifier }
    }

    fn body(&self, request: &SendRequest) -> serde_json::Value {
        let from = match &request.reply_address {
            Some(reply) => json!({ "FromEmailAddress": request.from_address, "ReplyToAddresses": [reply] }),
            None => json!({ "FromEmailAddress": request.from_address }),
        };
        json!({
            "FromEmailAddress": from["FromEmailAddress"],
            "ReplyToAddresses": from.get("ReplyToAddresses"),
            "Destination": { "ToAddresses": [request.to_address] },
            "Content": {
                "Simple": {
                    "Subject": { "Data": request.subject },
                    "Body": {
                        "Html": request.html_body.as_ref().map(|h| json!({ "Data": h })),
                        "Text": request.text_body.as_ref().map(|t| json!({ "Data": t })),
                    }
                }
            },
            "EmailTags": [{ "Name": "message_id", "Value": request.message_id }],
        })
    }
}

#[async_trait]
impl EspClient for SesClient {
    fn provider(&self) -> &'static str {
        "ses"
    }

    async fn send(&self, request: &SendRequest) -> SendOutcome {
        let response = match self
            .http
            .post(format!("{}/v2/email/outbound-emails", self.endpoint))
            .json(&self.body(request))
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                return SendOutcome::Error {
                    category: self.classifier.classify(0, None, &err.to_string()),
                    provider_reason: err.to_string(),
                }
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let provider_message_id = body["MessageId"].as_str().unwrap_or(&request.message_id).to_string();
            return SendOutcome::Ok { provider_message_id };
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let error_type = body["__type"].as_str();
        let message = body["message"].as_str().unwrap_or("unknown ses error").to_string();

        SendOutcome::Error {
            category: self.classifier.classify(status, error_type, &message),
            provider_reason: message,
        }
    }
}
