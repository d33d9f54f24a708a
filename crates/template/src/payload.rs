//! Signed tracking payload encode/decode: a
//! URL-safe, unpadded base64 blob carrying `tenant|campaign|subscriber|
//! message_id[|original_url]` plus an HMAC-SHA-256 signature appended
//! inside the same blob, matching §6 "signature carried ... appended in
//! the payload". Verification is constant-time (aws-lc-rs compares MACs
//! in constant time internally) — a one-bit flip anywhere invalidates it.
use aws_lc_rs::hmac;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use campaign_core::{CampaignId, SubscriberId, TenantId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingFields {
    pub tenant_id: TenantId,
    pub campaign_id: CampaignId,
    pub subscriber_id: SubscriberId,
    pub message_id: String,
    /// Present only for click-redirect payloads.
    pub original_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64")]
    BadEncoding,
    #[error("payload is not valid utf8")]
    BadUtf8,
    #[error("payload is malformed")]
    Malformed,
    #[error("signature verification failed")]
    BadSignature,
}

fn join_fields(f: &TrackingFields) -> String {
    match &f.original_url {
        Some(url) => format!(
            "{}|{}|{}|{}|{}",
            f.tenant_id, f.campaign_id, f.subscriber_id, f.message_id, url
        ),
        None => format!(
            "{}|{}|{}|{}",
            f.tenant_id, f.campaign_id, f.subscriber_id, f.message_id
        ),
    }
}

fn mac_hex(key: &str, raw: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    let tag = hmac::sign(&key, raw.as_bytes());
    data_encoding::HEXLOWER.encode(tag.as_ref())
}

/// Encodes `fields` as the payload path segment used in `{tracking_base}
/// /o/{payload}`, `/c/{payload}`, `/u/{payload}`.
pub fn encode_and_sign(fields: &TrackingFields, hmac_key: &str) -> String {
    let raw = join_fields(fields);
    let mac = mac_hex(hmac_key, &raw);
    let plain = format!("{raw}|{mac}");
    URL_SAFE_NO_PAD.encode(plain.as_bytes())
}

/// Extracts the tenant id from a payload without checking its signature.
/// The tenant is the first (unencrypted, signed-not-sealed) field, so a
/// multi-tenant HTTP surface can use this to resolve *which* per-tenant
/// HMAC key to verify with before calling [`decode_and_verify`] — the
/// signature still gates everything else, this only saves the caller
/// from needing the tenant out-of-band.
pub fn peek_tenant_id(payload: &str) -> Result<TenantId, PayloadError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| PayloadError::BadEncoding)?;
    let plain = String::from_utf8(bytes).map_err(|_| PayloadError::BadUtf8)?;
    let (raw, _mac) = plain.rsplit_once('|').ok_or(PayloadError::Malformed)?;
    let tenant_id = raw.split('|').next().ok_or(PayloadError::Malformed)?;
    tenant_id.parse().map_err(|_| PayloadError::Malformed)
}

/// Decodes and verifies a payload produced by [`encode_and_sign`].
/// Rejects on any base64/shape error or signature mismatch; callers
/// decide the fail-open/fail-closed response per §4.7 (the open pixel
/// always renders regardless, the click/unsubscribe routes reject with
/// 400).
pub fn decode_and_verify(payload: &str, hmac_key: &str) -> Result<TrackingFields, PayloadError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| PayloadError::BadEncoding)?;
    let plain = String::from_utf8(bytes).map_err(|_| PayloadError::BadUtf8)?;

    let (raw, mac) = plain.rsplit_once('|').ok_or(PayloadError::Malformed)?;
    let expected = mac_hex(hmac_key, raw);
    // Constant-time compare over the hex strings.
    if expected.len() != mac.len()
        || expected
            .bytes()
            .zip(mac.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            != 0
    {
        return Err(PayloadError::BadSignature);
    }

    let parts: Vec<&str> = raw.split('|').collect();
    let (tenant_id, campaign_id, subscriber_id, message_id, original_url) = match parts.as_slice()
    {
        [tenant, campaign, subscriber, message_id] => (
            tenant.parse().map_err(|_| PayloadError::Malformed)?,
            campaign.parse().map_err(|_| PayloadError::Malformed)?,
            subscriber.parse().map_err(|_| PayloadError::Malformed)?,
            message_id.to_string(),
            None,
        ),
        [tenant, campaign, subscriber, message_id, url] => (
            tenant.parse().map_err(|_| PayloadError::Malformed)?,
            campaign.parse().map_err(|_| PayloadError::Malformed)?,
            subscriber.parse().map_err(|_| PayloadError::Malformed)?,
            message_id.to_string(),
            Some(url.to_string()),
        ),
        _ => return Err(PayloadError::Malformed),
    };

    Ok(TrackingFields {
        tenant_id,
        campaign_id,
        subscriber_id,
        message_id,
        original_url,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> TrackingFields {
        TrackingFields {
            tenant_id: TenantId::new(),
            campaign_id: CampaignId::new(),
            subscriber_id: SubscriberId::new(),
            message_id: "msg-1".to_string(),
            original_url: Some("https://example.com/landing".to_string()),
        }
    }

    #[test]
    fn round_trips() {
        let fields = sample();
        let payload = encode_and_sign(&fields, "secret");
        let decoded = decode_and_verify(&payload, "secret").unwrap();
        assert_eq!(decoded, fields);
    }

    #[test]
    fn open_payload_has_no_url() {
        let mut fields = sample();
        fields.original_url = None;
        let payload = encode_and_sign(&fields, "secret");
        let decoded = decode_and_verify(&payload, "secret").unwrap();
        assert_eq!(decoded.original_url, None);
    }

    #[test]
    fn one_bit_flip_invalidates_signature() {
        let fields = sample();
        let payload = encode_and_sign(&fields, "secret");
        let mut bytes = payload.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let flipped = String::from_utf8(bytes).unwrap();
        assert!(matches!(
            decode_and_verify(&flipped, "secret"),
            Err(PayloadError::BadSignature) | Err(PayloadError::BadEncoding)
        ));
    }

    #[test]
    fn peek_tenant_id_does_not_require_the_key() {
        let fields = sample();
        let payload = encode_and_sign(&fields, "secret");
        assert_eq!(peek_tenant_id(&payload).unwrap(), fields.tenant_id);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let fields = sample();
        let payload = encode_and_sign(&fields, "secret");
        assert!(matches!(
            decode_and_verify(&payload, "other-secret"),
            Err(PayloadError::BadSignature)
        ));
    }
}
