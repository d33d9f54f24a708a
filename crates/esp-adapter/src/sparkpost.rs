//! A SparkPost-style adapter: POSTs a `transmissions` JSON body and reads
//! back a JSON error envelope carrying a numeric `error_code` used for
//! bounce classification.
use crate::client::{EspClient, SendOutcome, SendRequest};
use async_trait::async_trait;
use bounce_classify::BounceClassifier;
use serde_json::json;
use std::sync::Arc;

pub struct SparkPostClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    classifier: Arc<BounceClassifier>,
}

impl SparkPostClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String, classifier: Arc<BounceClassifier>) -> Self {
        Self { http, base_url, api_key, classifier }
    }

    fn body(&self, request: &SendRequest) -> serde_json::Value {
        json!({
            "content": {
                "from": { "name": request.from_name, "email": request.from_address },
                "reply_to": request.reply_address,
                "subject": request.subject,
                "html": request.html_body,
                "text": request.text_body,
            },
            "recipients": [{ "address": { "email": request.to_address } }],
            "metadata": { "message_id": request.message_id },
        })
    }
}

#[async_trait]
impl EspClient for SparkPostClient {
    fn provider(&self) -> &'static str {
        "sparkpost"
    }

    async fn send(&self, request: &SendRequest) -> SendOutcome {
        let response = match self
            .http
            .post(format!("{}/api/v1/transmissions", self.base_url))
            .header("Authorization", &self.api_key)
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
            let provider_message_id = body["results"]["id"]
                .as_str()
                .unwrap_or(&request.message_id)
                .to_string();
            return SendOutcome::Ok { provider_message_id };
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let first_error = &body["errors"][0];
        let error_code = first_error["code"].as_str();
        let message = first_error["message"].as_str().unwrap_or("unknown sparkpost error").to_string();

        SendOutcome::Error {
            category: self.classifier.classify(status, error_code, &message),
            provider_reason: message,
        }
    }
}
