//! Newtype identifiers for every durable entity in the data model (§3).
//! Each wraps a `Uuid`: serialized as a plain string over the wire and in
//! Postgres, displayed without braces.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(into = "String", try_from = "String")]
        #[derive(utoipa::ToSchema)]
        #[schema(value_type = String)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                self.0.fmt(fmt)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = uuid::Error;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Ok(Self(Uuid::parse_str(&s)?))
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(TenantId, "Identifies the owning tenant/subaccount.");
uuid_id!(CampaignId, "Identifies a Campaign.");
uuid_id!(QueueItemId, "Identifies a row in the per-recipient queue.");
uuid_id!(SubscriberId, "Identifies a Subscriber.");
uuid_id!(SuppressionEntryId, "Identifies a SuppressionEntry.");
uuid_id!(TrackingEventId, "Identifies a TrackingEvent.");
uuid_id!(ListId, "Identifies an audience list.");
uuid_id!(SegmentId, "Identifies an audience segment.");
uuid_id!(EspProfileId, "Identifies a configured ESP send profile.");

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_through_string() {
        let id = CampaignId::new();
        let s: String = id.into();
        let id2: CampaignId = s.try_into().unwrap();
        assert_eq!(id, id2);
    }
}
