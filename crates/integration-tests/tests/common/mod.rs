//! Shared fixture helpers for the scenario tests: raw-SQL inserts for
//! the rows the spec's repos only expose read/update APIs for
//! (`subscribers`, `sending_profiles`), plus a campaign builder mirroring
//! `enqueue::test::campaign_with_throttle`.
use campaign_core::{
    AudienceSelector, Campaign, CampaignCounters, CampaignId, CampaignStatus, EmailHash,
    EspProfileId, EspSelector, ListId, SendType, SubscriberId, SubscriberStatus, TenantId,
    ThrottlePolicy,
};
use chrono::Utc;
use db::CampaignRepo;
use sqlx::PgPool;

#[allow(dead_code)]
pub async fn insert_subscriber(
    pool: &PgPool,
    tenant_id: TenantId,
    list_id: ListId,
    email: &str,
    status: SubscriberStatus,
) -> SubscriberId {
    let id = SubscriberId::new();
    let hash = EmailHash::compute(email);
    sqlx::query(
        "insert into subscribers (id, tenant_id, list_id, email, email_hash, status)
         values ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id.as_uuid())
    .bind(tenant_id.as_uuid())
    .bind(list_id.as_uuid())
    .bind(email)
    .bind(hash.sha256())
    .bind(status.to_string())
    .execute(pool)
    .await
    .expect("insert subscriber");
    id
}

#[allow(dead_code)]
pub async fn insert_sending_profile(
    pool: &PgPool,
    provider: &str,
    daily_cap: Option<i64>,
    hourly_cap: Option<i64>,
    healthy: bool,
) -> EspProfileId {
    let id = EspProfileId::new();
    sqlx::query(
        "insert into sending_profiles (id, name, provider, daily_cap, hourly_cap, healthy)
         values ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id.as_uuid())
    .bind(format!("{provider}-profile"))
    .bind(provider)
    .bind(daily_cap)
    .bind(hourly_cap)
    .bind(healthy)
    .execute(pool)
    .await
    .expect("insert sending profile");
    id
}

/// A draft campaign with a single included list and a single ESP
/// profile, persisted via `CampaignRepo::create`. Callers override
/// fields with struct-update syntax before persisting a variant.
#[allow(dead_code)]
pub fn draft_campaign(tenant_id: TenantId, list_id: ListId, profile: EspProfileId) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: CampaignId::new(),
        tenant_id,
        name: "scenario campaign".to_string(),
        subject_template: "Hello {{subscriber.email}}".to_string(),
        html_template: "<p>Hi {{subscriber.email}}</p>".to_string(),
        text_template: None,
        preview_text: None,
        from_name: "Acme".to_string(),
        from_address: "news@acme.example".to_string(),
        reply_address: None,
        audience: AudienceSelector {
            primary_list: Some(list_id),
            additional_lists: vec![],
            primary_segment: None,
            additional_segments: vec![],
            suppression_lists: vec![],
            suppression_segments: vec![],
            max_recipients: None,
        },
        esp_selector: EspSelector::Single { profile },
        throttle: ThrottlePolicy::Preset {
            preset: campaign_core::ThrottlePreset::Instant,
        },
        max_recipients: None,
        send_type: SendType::Instant,
        scheduled_at: None,
        status: CampaignStatus::Draft,
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        counters: CampaignCounters::default(),
    }
}

#[allow(dead_code)]
pub async fn persist(repo: &CampaignRepo, campaign: &Campaign) {
    repo.create(campaign).await.expect("create campaign");
}

#[allow(dead_code)]
pub fn holder() -> String {
    format!("test-worker-{}", uuid::Uuid::new_v4())
}
