//! `multipart/report` (RFC 5965) ARF feedback report parsing (spec.md
//! §4.8). Grounded directly on the teacher's `message::rfc5965::ARFReport`
//! walk — multipart/report → message/feedback-report headers, with
//! message/rfc822 as a recipient fallback — written fresh here against
//! `mailparse` directly rather than depending on the teacher's `message`
//! crate (whose `Cargo.toml` still expects the retired Lua-config API).
use crate::event::{parse_campaign_id, NormalizedEvent, WebhookEventType};
use mailparse::{parse_headers, parse_mail};
use std::collections::HashMap;

fn headers_by_lowercase_name(part: &[u8]) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let (headers, _) = parse_headers(part)?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for hdr in headers {
        out.entry(hdr.get_key_ref().to_ascii_lowercase())
            .or_default()
            .push(hdr.get_value_utf8()?);
    }
    Ok(out)
}

fn first<'a>(map: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(|v| v.first()).map(String::as_str)
}

/// Returns `Ok(None)` when the body isn't a feedback-report multipart at
/// all (so the caller can fall through to another parser), and an error
/// only when it claims to be one but is malformed.
pub fn parse_arf(body: &[u8]) -> anyhow::Result<Option<NormalizedEvent>> {
    let mail = parse_mail(body)?;

    if mail.ctype.mimetype != "multipart/report" {
        return Ok(None);
    }
    if mail.ctype.params.get("report-type").map(String::as_str) != Some("feedback-report") {
        return Ok(None);
    }

    let mut rfc822_to: Option<String> = None;
    for part in &mail.subparts {
        if part.ctype.mimetype == "message/rfc822" || part.ctype.mimetype == "text/rfc822-headers" {
            if let Ok(headers) = headers_by_lowercase_name(part.raw_bytes) {
                rfc822_to = first(&headers, "to").map(str::to_string);
            }
        }
    }

    for part in &mail.subparts {
        if part.ctype.mimetype == "message/feedback-report" {
            let body = part.get_body()?;
            let fields = headers_by_lowercase_name(body.as_bytes())?;

            let feedback_type = first(&fields, "feedback-type").unwrap_or("abuse");
            let event_type = match feedback_type {
                "abuse" | "fraud" | "virus" | "other" => WebhookEventType::SpamComplaint,
                "unsubscribe" => WebhookEventType::Unsubscribe,
                _ => WebhookEventType::SpamComplaint,
            };

            let recipient = first(&fields, "original-rcpt-to")
                .map(|s| s.trim_start_matches('<').trim_end_matches('>').to_string())
                .or(rfc822_to)
                .ok_or_else(|| anyhow::anyhow!("feedback report has no recipient"))?;

            let campaign_id = first(&fields, "x-campaign-id").and_then(parse_campaign_id);
            let reason = first(&fields, "reported-domain").map(|d| format!("reported by {d}"));

            return Ok(Some(NormalizedEvent {
                event_type,
                recipient,
                reason,
                bounce_class: None,
                error_code: None,
                campaign_id,
            }));
        }
    }

    anyhow::bail!("multipart/report is missing its message/feedback-report part")
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &[u8] = b"From: feedback@isp.example\r\n\
Content-Type: multipart/report; report-type=feedback-report; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain\r\n\
\r\n\
This is an email abuse report.\r\n\
--b1\r\n\
Content-Type: message/feedback-report\r\n\
\r\n\
Feedback-Type: abuse\r\n\
User-Agent: SomeGenerator/1.0\r\n\
Version: 1\r\n\
Original-Rcpt-To: <user@example.com>\r\n\
Reported-Domain: example.com\r\n\
X-Campaign-ID: 11111111-1111-1111-1111-111111111111\r\n\
\r\n\
--b1\r\n\
Content-Type: message/rfc822\r\n\
\r\n\
From: sender@example.net\r\n\
To: user@example.com\r\n\
Subject: hello\r\n\
\r\n\
body\r\n\
--b1--\r\n";

    #[test]
    fn parses_feedback_report_with_campaign_id() {
        let event = parse_arf(SAMPLE).unwrap().unwrap();
        assert_eq!(event.recipient, "user@example.com");
        assert_eq!(event.event_type, WebhookEventType::SpamComplaint);
        assert!(event.campaign_id.is_some());
    }

    #[test]
    fn non_report_body_returns_none() {
        let plain = b"Content-Type: text/plain\r\n\r\nhello\r\n";
        assert!(parse_arf(plain).unwrap().is_none());
    }
}
