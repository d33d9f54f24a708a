//! Click-link rewriting and open-pixel injection.
//! Grounded on the same "rewrite outbound markup just before send" shape
//! as `original_source/` content-transform pass, reimplemented here as a
//! plain regex substitution since the payloads themselves already carry
//! full HMAC-signed state — no server-side click table lookup needed at
//! rewrite time.
use crate::payload::{encode_and_sign, TrackingFields};
use regex::Regex;
use std::sync::LazyLock;

static HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(<a\s+[^>]*href\s*=\s*)(["'])(.*?)\2"#).unwrap());

static BODY_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)</body>").unwrap());

fn is_trackable(url: &str) -> bool {
    !url.starts_with('#')
        && !url.starts_with("mailto:")
        && !url.starts_with("tel:")
        && !url.starts_with("{{")
}

/// Rewrites every `<a href="...">` in `html` to point at
/// `{tracking_base}/c/{payload}`, where `payload` carries the original
/// URL so the tracking endpoint can 307-redirect to it.
pub fn rewrite_links(
    html: &str,
    fields: &TrackingFields,
    hmac_key: &str,
    tracking_base: &str,
) -> String {
    HREF.replace_all(html, |caps: &regex::Captures| {
        let prefix = &caps[1];
        let quote = &caps[2];
        let url = &caps[3];
        if !is_trackable(url) {
            return caps[0].to_string();
        }
        let mut click_fields = fields.clone();
        click_fields.original_url = Some(url.to_string());
        let payload = encode_and_sign(&click_fields, hmac_key);
        format!("{prefix}{quote}{tracking_base}/c/{payload}{quote}")
    })
    .into_owned()
}

/// Appends a 1x1 open-tracking pixel immediately before `</body>`, or to
/// the end of the document if no `</body>` tag is present.
pub fn inject_open_pixel(html: &str, fields: &TrackingFields, hmac_key: &str, tracking_base: &str) -> String {
    let mut open_fields = fields.clone();
    open_fields.original_url = None;
    let payload = encode_and_sign(&open_fields, hmac_key);
    let pixel = format!(
        r#"<img src="{tracking_base}/o/{payload}" width="1" height="1" alt="" style="display:none" border="0">"#
    );

    if BODY_CLOSE.is_match(html) {
        BODY_CLOSE.replace(html, |caps: &regex::Captures| format!("{pixel}{}", &caps[0])).into_owned()
    } else {
        format!("{html}{pixel}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use campaign_core::{CampaignId, SubscriberId, TenantId};

    fn sample_fields() -> TrackingFields {
        TrackingFields {
            tenant_id: TenantId::new(),
            campaign_id: CampaignId::new(),
            subscriber_id: SubscriberId::new(),
            message_id: "msg-1".to_string(),
            original_url: None,
        }
    }

    #[test]
    fn rewrites_plain_link() {
        let html = r#"<a href="https://example.com/sale">Shop</a>"#;
        let out = rewrite_links(html, &sample_fields(), "secret", "https://t.example.com");
        assert!(out.starts_with(r#"<a href="https://t.example.com/c/"#));
        assert!(out.contains("Shop"));
    }

    #[test]
    fn skips_mailto_and_anchor_and_merge_tag_links() {
        let html = r#"<a href="mailto:x@y.com">Mail</a><a href="#top">Top</a><a href="{{ unsubscribe_url }}">Unsub</a>"#;
        let out = rewrite_links(html, &sample_fields(), "secret", "https://t.example.com");
        assert_eq!(out, html);
    }

    #[test]
    fn injects_pixel_before_body_close() {
        let html = "<html><body>Hello</body></html>";
        let out = inject_open_pixel(html, &sample_fields(), "secret", "https://t.example.com");
        assert!(out.contains("</body></html>"));
        let pixel_pos = out.find("<img").unwrap();
        let body_close_pos = out.find("</body>").unwrap();
        assert!(pixel_pos < body_close_pos);
    }

    #[test]
    fn injects_pixel_at_end_when_no_body_tag() {
        let html = "Hello world";
        let out = inject_open_pixel(html, &sample_fields(), "secret", "https://t.example.com");
        assert!(out.starts_with("Hello world"));
        assert!(out.contains("<img"));
    }
}
