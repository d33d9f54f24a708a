//! Audience segments: a named, dynamic subset of one
//! list's subscribers defined by simple equality/comparison predicates
//! over `custom_fields`, evaluated against live subscriber rows rather
//! than materialized ahead of time — the nearest equivalent in the data
//! model to the static `ListId` union the audience resolver also reads.
use crate::ids::{ListId, SegmentId, TenantId};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct SegmentCondition {
    pub field: String,
    pub op: SegmentOp,
    pub value: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, utoipa::ToSchema)]
pub struct SegmentCriteria {
    /// All conditions are ANDed together.
    pub conditions: Vec<SegmentCondition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, utoipa::ToSchema)]
pub struct Segment {
    pub id: SegmentId,
    pub tenant_id: TenantId,
    pub list_id: ListId,
    pub name: String,
    pub criteria: SegmentCriteria,
}

impl SegmentCriteria {
    /// `true` if `custom_fields` satisfies every condition. Used both by
    /// `db::SegmentRepo` (to translate into a SQL predicate) and directly
    /// here for in-process evaluation in tests and the audience resolver's
    /// fallback path when a condition can't be pushed into SQL.
    pub fn matches(&self, custom_fields: &serde_json::Value) -> bool {
        self.conditions.iter().all(|cond| {
            let Some(actual) = custom_fields.get(&cond.field) else {
                return false;
            };
            match cond.op {
                SegmentOp::Eq => actual == &cond.value,
                SegmentOp::Ne => actual != &cond.value,
                SegmentOp::Gt => compare_numeric(actual, &cond.value, |a, b| a > b),
                SegmentOp::Lt => compare_numeric(actual, &cond.value, |a, b| a < b),
                SegmentOp::Contains => match (actual.as_str(), cond.value.as_str()) {
                    (Some(a), Some(b)) => a.contains(b),
                    _ => false,
                },
            }
        })
    }
}

fn compare_numeric(actual: &serde_json::Value, value: &serde_json::Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_condition_matches() {
        let criteria = SegmentCriteria {
            conditions: vec![SegmentCondition {
                field: "plan".to_string(),
                op: SegmentOp::Eq,
                value: json!("gold"),
            }],
        };
        assert!(criteria.matches(&json!({"plan": "gold"})));
        assert!(!criteria.matches(&json!({"plan": "silver"})));
    }

    #[test]
    fn missing_field_never_matches() {
        let criteria = SegmentCriteria {
            conditions: vec![SegmentCondition {
                field: "plan".to_string(),
                op: SegmentOp::Eq,
                value: json!("gold"),
            }],
        };
        assert!(!criteria.matches(&json!({})));
    }

    #[test]
    fn numeric_comparison() {
        let criteria = SegmentCriteria {
            conditions: vec![SegmentCondition {
                field: "lifetime_value".to_string(),
                op: SegmentOp::Gt,
                value: json!(100),
            }],
        };
        assert!(criteria.matches(&json!({"lifetime_value": 150})));
        assert!(!criteria.matches(&json!({"lifetime_value": 50})));
    }

    #[test]
    fn all_conditions_must_hold() {
        let criteria = SegmentCriteria {
            conditions: vec![
                SegmentCondition { field: "plan".into(), op: SegmentOp::Eq, value: json!("gold") },
                SegmentCondition { field: "active".into(), op: SegmentOp::Eq, value: json!(true) },
            ],
        };
        assert!(criteria.matches(&json!({"plan": "gold", "active": true})));
        assert!(!criteria.matches(&json!({"plan": "gold", "active": false})));
    }
}
