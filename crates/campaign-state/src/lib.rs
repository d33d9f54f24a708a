//! Campaign State Machine (C4): durable status transitions,
//! the edit-lock rule, and the minimum-schedule-distance rule. Grounded
//! on `server-runtime::lifecycle`'s "is this resource still mutable"
//! guard pattern, generalized from process lifecycle to per-campaign
//! lifecycle, and on the teacher's `queue/manager.rs` `DashMap`-backed
//! resolved-handle cache for the in-memory status read path.
//!
//! Every transition loads the row with `SELECT ... FOR UPDATE` inside a
//! transaction and re-checks the current status before writing, so two
//! callers racing on the same campaign never both succeed — the
//! transaction is the serialization point, not an in-process lock.
use campaign_core::{AppError, Campaign, CampaignId, CampaignStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use db::{CampaignRepo, CoordinationStore, QueueRepo};
use std::time::Duration;

pub struct CampaignStateMachine {
    campaigns: CampaignRepo,
    queue: QueueRepo,
    pool: sqlx::PgPool,
    min_preparation_minutes: i64,
    status_cache: DashMap<CampaignId, CampaignStatus>,
}

/// The per-campaign distributed lock name used while preparing a send
///. Public so the enqueue worker can acquire/renew
/// the same lock for the duration of its audience build, beyond the
/// single transition this crate performs.
pub fn lock_resource_name(id: CampaignId) -> String {
    format!("campaign-prepare:{id}")
}

fn invalid(current: CampaignStatus, attempted: &str) -> AppError {
    AppError::InvalidState {
        current: current.to_string(),
        attempted: attempted.to_string(),
    }
}

impl CampaignStateMachine {
    pub fn new(
        campaigns: CampaignRepo,
        queue: QueueRepo,
        pool: sqlx::PgPool,
        min_preparation_minutes: i64,
    ) -> Self {
        Self {
            campaigns,
            queue,
            pool,
            min_preparation_minutes,
            status_cache: DashMap::new(),
        }
    }

    fn remember(&self, id: CampaignId, status: CampaignStatus) {
        self.status_cache.insert(id, status);
    }

    /// Cheap status read for hot paths (e.g. the dispatch worker
    /// rechecking a campaign isn't paused before every send); falls back
    /// to a row fetch on cache miss and repopulates it.
    pub async fn status(&self, id: CampaignId) -> anyhow::Result<Option<CampaignStatus>> {
        if let Some(status) = self.status_cache.get(&id) {
            return Ok(Some(*status));
        }
        let campaign = self.campaigns.get(id).await?;
        if let Some(campaign) = &campaign {
            self.remember(id, campaign.status);
        }
        Ok(campaign.map(|c| c.status))
    }

    pub async fn is_editable(&self, id: CampaignId, now: DateTime<Utc>) -> Result<bool, AppError> {
        let campaign = self
            .campaigns
            .get(id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("campaign {id}")))?;
        Ok(campaign.is_editable(now, self.min_preparation_minutes))
    }

    async fn load_for_update(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: CampaignId,
    ) -> Result<Campaign, AppError> {
        self.campaigns
            .get_for_update(tx, id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("campaign {id}")))
    }

    /// `draft --schedule--> scheduled`. `scheduled_at` must be at least
    /// `min_preparation_minutes` in the future ("Minimum
    /// schedule distance").
    pub async fn schedule(
        &self,
        id: CampaignId,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Campaign, AppError> {
        if scheduled_at < now + chrono::Duration::minutes(self.min_preparation_minutes) {
            return Err(AppError::Validation(format!(
                "scheduled_at must be at least {} minutes in the future",
                self.min_preparation_minutes
            )));
        }

        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Draft {
            return Err(invalid(campaign.status, "schedule"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Scheduled)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns
            .set_scheduled_at(id, Some(scheduled_at))
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Scheduled);
        Ok(Campaign {
            status: CampaignStatus::Scheduled,
            scheduled_at: Some(scheduled_at),
            ..campaign
        })
    }

    /// `scheduled --unschedule--> draft`.
    pub async fn unschedule(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            return Err(invalid(campaign.status, "unschedule"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Draft)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns
            .set_scheduled_at(id, None)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Draft);
        Ok(Campaign {
            status: CampaignStatus::Draft,
            scheduled_at: None,
            ..campaign
        })
    }

    /// `draft --send--> preparing`, the instant-send entry point (no
    /// distributed lock needed: nothing else can be racing a draft
    /// campaign that only its owner can see).
    pub async fn send_now(&self, id: CampaignId, now: DateTime<Utc>) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Draft {
            return Err(invalid(campaign.status, "send"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Preparing)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.remember(id, CampaignStatus::Preparing);
        Ok(Campaign {
            status: CampaignStatus::Preparing,
            started_at: Some(now),
            ..campaign
        })
    }

    /// `scheduled --(time arrives; take-lock)--> preparing`. Takes the
    /// per-campaign distributed lock before transitioning so at most one
    /// enqueue-worker instance begins preparation for a given campaign;
    /// returns `Ok(None)` if the lock couldn't be acquired (another
    /// instance is already handling it) or the campaign is no longer
    /// `scheduled` by the time the lock is held.
    pub async fn begin_preparation(
        &self,
        id: CampaignId,
        coordination: &dyn CoordinationStore,
        holder_id: &str,
        lock_ttl: Duration,
    ) -> Result<Option<Campaign>, AppError> {
        let acquired = coordination
            .acquire(&lock_resource_name(id), holder_id, lock_ttl)
            .await
            .map_err(AppError::Internal)?;
        if !acquired {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            tx.rollback().await.map_err(|e| AppError::Internal(e.into()))?;
            coordination
                .release(&lock_resource_name(id), holder_id)
                .await
                .map_err(AppError::Internal)?;
            return Ok(None);
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Preparing)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.remember(id, CampaignStatus::Preparing);

        Ok(Some(Campaign {
            status: CampaignStatus::Preparing,
            started_at: Some(Utc::now()),
            ..campaign
        }))
    }

    /// `preparing --audience-empty--> completed` (`sent_count = 0`).
    pub async fn mark_audience_empty(&self, id: CampaignId, now: DateTime<Utc>) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Preparing {
            return Err(invalid(campaign.status, "audience-empty"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Completed)
            .await
            .map_err(AppError::Internal)?;
        self.campaigns
            .set_total_recipients(&mut tx, id, 0)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns
            .mark_completed(id, now)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Completed);
        Ok(Campaign {
            status: CampaignStatus::Completed,
            completed_at: Some(now),
            counters: campaign_core::CampaignCounters {
                total_recipients: 0,
                ..campaign.counters
            },
            ..campaign
        })
    }

    /// `preparing --ready--> sending`. `total_recipients` is set exactly
    /// once here (Campaign invariant).
    pub async fn mark_ready(
        &self,
        id: CampaignId,
        total_recipients: u64,
        now: DateTime<Utc>,
    ) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Preparing {
            return Err(invalid(campaign.status, "ready"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Sending)
            .await
            .map_err(AppError::Internal)?;
        self.campaigns
            .set_total_recipients(&mut tx, id, total_recipients)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns
            .mark_started(id, now)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Sending);
        Ok(Campaign {
            status: CampaignStatus::Sending,
            started_at: Some(now),
            counters: campaign_core::CampaignCounters {
                total_recipients,
                ..campaign.counters
            },
            ..campaign
        })
    }

    /// `sending --pause--> paused`. Only `queued` items are paused;
    /// already-leased items finish their in-flight attempt.
    pub async fn pause(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Err(invalid(campaign.status, "pause"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Paused)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.queue
            .pause_all_for_campaign(id)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Paused);
        Ok(Campaign { status: CampaignStatus::Paused, ..campaign })
    }

    /// `paused --resume--> sending`.
    pub async fn resume(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(invalid(campaign.status, "resume"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Sending)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.queue
            .resume_all_for_campaign(id)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Sending);
        Ok(Campaign { status: CampaignStatus::Sending, ..campaign })
    }

    /// `sending|paused|scheduled|preparing --cancel--> cancelled`. Flips
    /// every non-terminal queue row to `cancelled` in the same
    /// transaction as the status write (atomicity).
    pub async fn cancel(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if !matches!(
            campaign.status,
            CampaignStatus::Sending
                | CampaignStatus::Paused
                | CampaignStatus::Scheduled
                | CampaignStatus::Preparing
        ) {
            return Err(invalid(campaign.status, "cancel"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Cancelled)
            .await
            .map_err(AppError::Internal)?;
        self.queue
            .cancel_all_for_campaign(&mut tx, id)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.remember(id, CampaignStatus::Cancelled);
        Ok(Campaign { status: CampaignStatus::Cancelled, ..campaign })
    }

    /// `sending --(all-items-terminal)--> completed | completed_with_errors`.
    /// Called periodically (by the dispatch reaper or a lightweight
    /// poller) rather than inline with every single item completion, so
    /// this is a no-op returning `Ok(None)` until the last item lands.
    pub async fn check_completion(&self, id: CampaignId, now: DateTime<Utc>) -> Result<Option<Campaign>, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status != CampaignStatus::Sending {
            return Ok(None);
        }
        let all_terminal = self.queue.all_terminal(id).await.map_err(AppError::Internal)?;
        if !all_terminal {
            tx.rollback().await.map_err(|e| AppError::Internal(e.into()))?;
            return Ok(None);
        }
        let errors = self.queue.error_count(id).await.map_err(AppError::Internal)?;
        let final_status = if errors == 0 {
            CampaignStatus::Completed
        } else {
            CampaignStatus::CompletedWithErrors
        };
        self.campaigns
            .set_status(&mut tx, id, final_status)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns.mark_completed(id, now).await.map_err(AppError::Internal)?;
        self.remember(id, final_status);
        Ok(Some(Campaign {
            status: final_status,
            completed_at: Some(now),
            ..campaign
        }))
    }

    /// `any-non-terminal --fatal-error--> failed`.
    pub async fn fail(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if campaign.status.is_terminal() {
            return Err(invalid(campaign.status, "fatal-error"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Failed)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.remember(id, CampaignStatus::Failed);
        Ok(Campaign { status: CampaignStatus::Failed, ..campaign })
    }

    /// `failed|cancelled|completed_with_errors --reset--> draft`.
    pub async fn reset(&self, id: CampaignId) -> Result<Campaign, AppError> {
        let mut tx = self.pool.begin().await.map_err(|e| AppError::Internal(e.into()))?;
        let campaign = self.load_for_update(&mut tx, id).await?;
        if !matches!(
            campaign.status,
            CampaignStatus::Failed | CampaignStatus::Cancelled | CampaignStatus::CompletedWithErrors
        ) {
            return Err(invalid(campaign.status, "reset"));
        }
        self.campaigns
            .set_status(&mut tx, id, CampaignStatus::Draft)
            .await
            .map_err(AppError::Internal)?;
        tx.commit().await.map_err(|e| AppError::Internal(e.into()))?;
        self.campaigns
            .set_scheduled_at(id, None)
            .await
            .map_err(AppError::Internal)?;
        self.remember(id, CampaignStatus::Draft);
        Ok(Campaign {
            status: CampaignStatus::Draft,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            ..campaign
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_resource_name_is_namespaced() {
        let id = CampaignId::new();
        assert!(lock_resource_name(id).starts_with("campaign-prepare:"));
    }

    #[test]
    fn invalid_transition_carries_current_and_attempted() {
        let err = invalid(CampaignStatus::Draft, "pause");
        match err {
            AppError::InvalidState { current, attempted } => {
                assert_eq!(current, "draft");
                assert_eq!(attempted, "pause");
            }
            _ => panic!("expected InvalidState"),
        }
    }
}
