//! Per-tenant, per-ISP-bucket health counters (ISPHealth).
use crate::ids::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, utoipa::ToSchema)]
pub struct IspHealth {
    pub tenant_id: Option<TenantId>,
    pub isp_bucket: String,
    pub total_sent: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub complained: u64,
    pub opened: u64,
    pub clicked: u64,
    pub last_active_at: Option<DateTime<Utc>>,
    /// Populated only when an external inbox-placement signal is
    /// supplied; describes this as "derived ... if provided".
    pub inbox_rate: Option<f64>,
}

impl IspHealth {
    pub fn bounce_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.bounced as f64 / self.total_sent as f64
        }
    }

    pub fn complaint_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.complained as f64 / self.total_sent as f64
        }
    }
}
