//! Test double for `EspClient`, used by the dispatch crate's and
//! integration tests' scenario fixtures instead of wiring up wiremock for
//! every call site. Mirrors the teacher's in-memory test transports
//! (e.g. `smtp_server.rs` test harness) in spirit: a client that returns
//! scripted/deterministic outcomes instead of talking over the network.
use crate::client::{EspClient, SendOutcome, SendRequest};
use async_trait::async_trait;
use bounce_classify::SendErrorCategory;
use std::sync::Mutex;

/// What `MockEsp::send` should do with the next request it receives.
#[derive(Debug, Clone)]
pub enum Scripted {
    Accept,
    Fail(SendErrorCategory, String),
}

pub struct MockEsp {
    provider: &'static str,
    script: Mutex<Vec<Scripted>>,
    received: Mutex<Vec<SendRequest>>,
}

impl MockEsp {
    /// A client that accepts every send.
    pub fn accepting(provider: &'static str) -> Self {
        Self {
            provider,
            script: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        }
    }

    /// A client that plays back `script` in order, one entry per call to
    /// `send`; panics if more sends happen than the script covers.
    pub fn scripted(provider: &'static str, script: Vec<Scripted>) -> Self {
        Self {
            provider,
            script: Mutex::new(script),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<SendRequest> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EspClient for MockEsp {
    fn provider(&self) -> &'static str {
        self.provider
    }

    async fn send(&self, request: &SendRequest) -> SendOutcome {
        self.received.lock().unwrap().push(request.clone());

        let mut script = self.script.lock().unwrap();
        let next = if script.is_empty() {
            Scripted::Accept
        } else {
            script.remove(0)
        };

        match next {
            Scripted::Accept => SendOutcome::Ok {
                provider_message_id: format!("mock-{}", request.message_id),
            },
            Scripted::Fail(category, reason) => SendOutcome::Error {
                category,
                provider_reason: reason,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn request() -> SendRequest {
        SendRequest {
            from_name: "Acme".to_string(),
            from_address: "news@acme.example".to_string(),
            reply_address: None,
            to_address: "jane@example.com".to_string(),
            subject: "Hello".to_string(),
            html_body: Some("<p>hi</p>".to_string()),
            text_body: Some("hi".to_string()),
            message_id: "queue-item-1".to_string(),
        }
    }

    #[tokio::test]
    async fn accepting_client_always_succeeds() {
        let mock = MockEsp::accepting("sparkpost");
        let outcome = mock.send(&request()).await;
        assert!(outcome.is_ok());
        assert_eq!(mock.received().len(), 1);
    }

    #[tokio::test]
    async fn scripted_client_plays_back_in_order() {
        let mock = MockEsp::scripted(
            "sparkpost",
            vec![
                Scripted::Fail(SendErrorCategory::SoftBounce, "mailbox full".to_string()),
                Scripted::Accept,
            ],
        );
        assert!(!mock.send(&request()).await.is_ok());
        assert!(mock.send(&request()).await.is_ok());
    }
}
