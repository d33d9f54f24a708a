//! Provider-specific body shapes: SparkPost-style batched
//! JSON, the SES SNS envelope, Mailgun's v2 JSON and legacy form-encoded
//! webhooks, plus a generic-JSON fallback that maps by field name for any
//! provider not specifically handled.
use crate::event::{parse_campaign_id, NormalizedEvent, WebhookEventType};
use serde_json::Value;

fn str_field<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| v.get(k).and_then(Value::as_str))
}

/// SparkPost batches multiple `{"msys": {"message_event": {...}}}`
/// envelopes in a single JSON array.
pub fn parse_sparkpost(body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let root: Value = serde_json::from_slice(body)?;
    let entries = root.as_array().cloned().unwrap_or_else(|| vec![root]);

    let mut out = Vec::new();
    for entry in entries {
        let Some(msg) = entry.get("msys").and_then(|m| m.get("message_event")) else {
            continue;
        };
        let Some(recipient) = str_field(msg, &["rcpt_to"]).map(str::to_string) else {
            continue;
        };
        let bounce_class = str_field(msg, &["bounce_class"]).map(str::to_string);
        let event_type = match str_field(msg, &["type"]).unwrap_or("") {
            "bounce" => {
                if bounce_class.as_deref() == Some("20") {
                    WebhookEventType::SoftBounce
                } else {
                    WebhookEventType::HardBounce
                }
            }
            "out_of_band" | "policy_rejection" => WebhookEventType::HardBounce,
            "spam_complaint" => WebhookEventType::SpamComplaint,
            "list_unsubscribe" | "link_unsubscribe" => WebhookEventType::Unsubscribe,
            "delay" => WebhookEventType::Deferred,
            _ => continue,
        };
        out.push(NormalizedEvent {
            event_type,
            recipient,
            reason: str_field(msg, &["reason"]).map(str::to_string),
            bounce_class,
            error_code: str_field(msg, &["error_code"]).map(str::to_string),
            campaign_id: str_field(msg, &["campaign_id"]).and_then(parse_campaign_id),
        });
    }
    Ok(out)
}

/// `{"Type": "Notification", "Message": "<json-encoded-string>"}`, where
/// the inner `Message` carries `notificationType: Bounce|Complaint` plus
/// the recipient list.
pub fn parse_ses_sns(body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let envelope: Value = serde_json::from_slice(body)?;
    let Some(message_str) = envelope.get("Message").and_then(Value::as_str) else {
        anyhow::bail!("SES SNS envelope missing Message field");
    };
    let inner: Value = serde_json::from_str(message_str)?;

    let notification_type = inner
        .get("notificationType")
        .or_else(|| inner.get("eventType"))
        .and_then(Value::as_str)
        .unwrap_or("");

    let mut out = Vec::new();
    match notification_type {
        "Bounce" => {
            let bounce = inner.get("bounce").cloned().unwrap_or(Value::Null);
            let hard = bounce.get("bounceType").and_then(Value::as_str) == Some("Permanent");
            let recipients = bounce
                .get("bouncedRecipients")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for r in recipients {
                let Some(email) = r.get("emailAddress").and_then(Value::as_str) else {
                    continue;
                };
                out.push(NormalizedEvent {
                    event_type: if hard {
                        WebhookEventType::HardBounce
                    } else {
                        WebhookEventType::SoftBounce
                    },
                    recipient: email.to_string(),
                    reason: r.get("diagnosticCode").and_then(Value::as_str).map(str::to_string),
                    bounce_class: bounce.get("bounceSubType").and_then(Value::as_str).map(str::to_string),
                    error_code: None,
                    campaign_id: None,
                });
            }
        }
        "Complaint" => {
            let complaint = inner.get("complaint").cloned().unwrap_or(Value::Null);
            let recipients = complaint
                .get("complainedRecipients")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for r in recipients {
                let Some(email) = r.get("emailAddress").and_then(Value::as_str) else {
                    continue;
                };
                out.push(NormalizedEvent {
                    event_type: WebhookEventType::SpamComplaint,
                    recipient: email.to_string(),
                    reason: None,
                    bounce_class: None,
                    error_code: None,
                    campaign_id: None,
                });
            }
        }
        other => anyhow::bail!("unsupported SES notification type: {other}"),
    }
    Ok(out)
}

/// Mailgun's v2 webhook body: `{"event-data": {"event": ..., "recipient":
/// ..., "severity": ..., "delivery-status": {...}, "user-variables": {...}}}`.
pub fn parse_mailgun_json(body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let root: Value = serde_json::from_slice(body)?;
    let data = root.get("event-data").cloned().unwrap_or(root);

    let recipient = data
        .get("recipient")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("mailgun payload missing recipient"))?
        .to_string();

    let event = data.get("event").and_then(Value::as_str).unwrap_or("");
    let severity = data.get("severity").and_then(Value::as_str);
    let event_type = match event {
        "failed" if severity == Some("permanent") => WebhookEventType::HardBounce,
        "failed" => WebhookEventType::SoftBounce,
        "complained" => WebhookEventType::SpamComplaint,
        "unsubscribed" => WebhookEventType::Unsubscribe,
        "rejected" => WebhookEventType::Throttle,
        _ => anyhow::bail!("unsupported mailgun event: {event}"),
    };

    let status = data.get("delivery-status").cloned().unwrap_or(Value::Null);
    let campaign_id = data
        .get("user-variables")
        .and_then(|v| v.get("campaign_id"))
        .and_then(Value::as_str)
        .and_then(parse_campaign_id);

    Ok(vec![NormalizedEvent {
        event_type,
        recipient,
        reason: status.get("message").and_then(Value::as_str).map(str::to_string),
        bounce_class: severity.map(str::to_string),
        error_code: status.get("code").map(|c| c.to_string()),
        campaign_id,
    }])
}

/// Mailgun's legacy `application/x-www-form-urlencoded` webhook body.
pub fn parse_mailgun_form(body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let fields: std::collections::HashMap<String, String> =
        url::form_urlencoded::parse(body).into_owned().collect();

    let recipient = fields
        .get("recipient")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("mailgun form payload missing recipient"))?;
    let event_type = match fields.get("event").map(String::as_str).unwrap_or("") {
        "bounced" => WebhookEventType::HardBounce,
        "dropped" => WebhookEventType::SoftBounce,
        "complained" => WebhookEventType::SpamComplaint,
        "unsubscribed" => WebhookEventType::Unsubscribe,
        other => anyhow::bail!("unsupported mailgun legacy event: {other}"),
    };

    Ok(vec![NormalizedEvent {
        event_type,
        recipient,
        reason: fields.get("error").or_else(|| fields.get("notification")).cloned(),
        bounce_class: None,
        error_code: fields.get("code").cloned(),
        campaign_id: fields.get("campaign-id").and_then(|s| parse_campaign_id(s)),
    }])
}

/// Field-name-based fallback for a provider with no dedicated parser
/// ("application/json generic — map by field names").
pub fn parse_generic_json(body: &[u8]) -> anyhow::Result<Vec<NormalizedEvent>> {
    let v: Value = serde_json::from_slice(body)?;

    let recipient = str_field(&v, &["recipient", "email", "address"])
        .ok_or_else(|| anyhow::anyhow!("generic payload missing a recipient field"))?
        .to_string();

    let raw_type = str_field(&v, &["type", "event", "event_type"]).unwrap_or("");
    let event_type = match raw_type {
        "hard_bounce" | "bounce" | "bounced" => WebhookEventType::HardBounce,
        "soft_bounce" | "dropped" | "deferred" => WebhookEventType::SoftBounce,
        "spam_complaint" | "complaint" | "complained" => WebhookEventType::SpamComplaint,
        "unsubscribe" | "unsubscribed" => WebhookEventType::Unsubscribe,
        "throttle" | "throttled" | "rate_limited" => WebhookEventType::Throttle,
        "delay" | "delayed" => WebhookEventType::Deferred,
        other => anyhow::bail!("unrecognized generic event type: {other}"),
    };

    Ok(vec![NormalizedEvent {
        event_type,
        recipient,
        reason: str_field(&v, &["reason", "error", "message"]).map(str::to_string),
        bounce_class: str_field(&v, &["bounce_class"]).map(str::to_string),
        error_code: str_field(&v, &["error_code", "code"]).map(str::to_string),
        campaign_id: str_field(&v, &["campaign_id", "campaign"]).and_then(parse_campaign_id),
    }])
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sparkpost_bounce_classifies_hard_vs_soft() {
        let body = br#"[
            {"msys": {"message_event": {"type": "bounce", "rcpt_to": "a@example.com", "bounce_class": "10"}}},
            {"msys": {"message_event": {"type": "bounce", "rcpt_to": "b@example.com", "bounce_class": "20"}}}
        ]"#;
        let events = parse_sparkpost(body).unwrap();
        assert_eq!(events[0].event_type, WebhookEventType::HardBounce);
        assert_eq!(events[1].event_type, WebhookEventType::SoftBounce);
    }

    #[test]
    fn ses_complaint_envelope() {
        let inner = serde_json::json!({
            "notificationType": "Complaint",
            "complaint": {"complainedRecipients": [{"emailAddress": "user@example.com"}]}
        })
        .to_string();
        let envelope = serde_json::json!({"Type": "Notification", "Message": inner});
        let events = parse_ses_sns(envelope.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, WebhookEventType::SpamComplaint);
        assert_eq!(events[0].recipient, "user@example.com");
    }

    #[test]
    fn mailgun_json_severity_distinguishes_hard_and_soft() {
        let body = serde_json::json!({
            "event-data": {
                "event": "failed",
                "severity": "permanent",
                "recipient": "user@example.com",
                "delivery-status": {"code": 550, "message": "mailbox unavailable"}
            }
        });
        let events = parse_mailgun_json(body.to_string().as_bytes()).unwrap();
        assert_eq!(events[0].event_type, WebhookEventType::HardBounce);
        assert_eq!(events[0].error_code.as_deref(), Some("550"));
    }

    #[test]
    fn mailgun_legacy_form() {
        let body = b"event=complained&recipient=user%40example.com";
        let events = parse_mailgun_form(body).unwrap();
        assert_eq!(events[0].event_type, WebhookEventType::SpamComplaint);
        assert_eq!(events[0].recipient, "user@example.com");
    }

    #[test]
    fn generic_json_maps_by_field_name() {
        let body = serde_json::json!({
            "type": "unsubscribed",
            "email": "user@example.com"
        });
        let events = parse_generic_json(body.to_string().as_bytes()).unwrap();
        assert_eq!(events[0].event_type, WebhookEventType::Unsubscribe);
    }
}
