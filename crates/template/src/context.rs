//! Render context assembly: `{subscriber fields, custom
//! fields, campaign fields, environment fields}` merged into one value
//! minijinja can substitute from. Subscriber/custom/campaign fields are
//! also merged flat at the top level so a merge tag author can write
//! `{{ first_name }}` instead of `{{ subscriber.first_name }}`, matching
//! how every ESP merge-tag dialect in `original_source/` actually reads;
//! the namespaced form remains available for disambiguation.
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub subscriber: Map<String, Value>,
    pub custom: Map<String, Value>,
    pub campaign: Map<String, Value>,
    pub environment: Map<String, Value>,
}

impl RenderContext {
    pub fn to_value(&self) -> Value {
        let mut flat = Map::new();
        // Precedence for the flat merge, least to most specific, matches
        // the order merge tags are described in §4.5.
        for src in [&self.environment, &self.campaign, &self.custom, &self.subscriber] {
            for (k, v) in src {
                flat.insert(k.clone(), v.clone());
            }
        }
        flat.insert("subscriber".to_string(), Value::Object(self.subscriber.clone()));
        flat.insert("custom".to_string(), Value::Object(self.custom.clone()));
        flat.insert("campaign".to_string(), Value::Object(self.campaign.clone()));
        flat.insert("environment".to_string(), Value::Object(self.environment.clone()));
        Value::Object(flat)
    }

    /// Every key resolvable at the top level, used by strict-mode
    /// unresolved-variable detection.
    pub fn known_top_level_keys(&self) -> std::collections::HashSet<String> {
        let value = self.to_value();
        match value {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Default::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_merge_precedence_subscriber_wins() {
        let mut ctx = RenderContext::default();
        ctx.environment.insert("name".into(), json!("env"));
        ctx.campaign.insert("name".into(), json!("campaign"));
        ctx.subscriber.insert("name".into(), json!("subscriber"));
        let value = ctx.to_value();
        assert_eq!(value.get("name").unwrap(), "subscriber");
    }

    #[test]
    fn namespaced_access_preserved() {
        let mut ctx = RenderContext::default();
        ctx.subscriber.insert("first_name".into(), json!("Jane"));
        let value = ctx.to_value();
        assert_eq!(value["subscriber"]["first_name"], "Jane");
    }
}
