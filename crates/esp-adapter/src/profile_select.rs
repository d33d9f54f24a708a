//! ESP profile selection (step 3, §4.6 step 3): choose one
//! `EspProfileId` to send through, given a campaign's `EspSelector` and
//! the live health/capacity of its candidate profiles. Grounded on the
//! teacher's `egress_source.rs::EgressPoolRoundRobin`, generalized from
//! deterministic weighted round-robin to weighted-random selection per
//! 's explicit "choose via weighted random across healthy
//! profiles" — a deliberate deviation from the teacher's own round-robin
//! pattern, recorded in DESIGN.md.
use campaign_core::{EspProfileId, EspSelector};
use db::SendingProfile;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

/// Profiles eligible to receive traffic right now: not capped, and
/// healthy ("healthy profiles whose current minute counter
/// is under cap" — the minute counter itself is enforced by `throttle`,
/// this filter covers the daily/hourly cap and health flag).
fn eligible<'a>(selector: &EspSelector, profiles: &'a [SendingProfile]) -> Vec<(&'a SendingProfile, u8)> {
    let quota_of = |id: EspProfileId| -> Option<u8> {
        match selector {
            EspSelector::Single { profile } => (*profile == id).then_some(100),
            EspSelector::WeightedQuota { quotas } => {
                quotas.iter().find(|q| q.profile == id).map(|q| q.percent)
            }
        }
    };

    profiles
        .iter()
        .filter(|p| p.healthy && !p.is_at_capacity())
        .filter_map(|p| quota_of(p.id).map(|weight| (p, weight)))
        .collect()
}

/// Picks one profile weighted by its configured quota percentage among
/// those currently eligible. Returns `None` if every candidate profile is
/// unhealthy or at capacity — callers should mark the item `failed` with
/// an `Auth`/`Unknown`-shaped reason rather than looping forever.
pub fn select_profile(
    selector: &EspSelector,
    profiles: &[SendingProfile],
    rng: &mut impl Rng,
) -> Option<EspProfileId> {
    let candidates = eligible(selector, profiles);
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].0.id);
    }

    let weights: Vec<u32> = candidates.iter().map(|(_, w)| *w as u32).collect();
    let index = WeightedIndex::new(&weights).ok()?;
    Some(candidates[index.sample(rng)].0.id)
}

#[cfg(test)]
mod test {
    use super::*;
    use campaign_core::EspQuota;
    use chrono::Utc;

    fn profile(healthy: bool, at_cap: bool) -> SendingProfile {
        SendingProfile {
            id: EspProfileId::new(),
            name: "test".to_string(),
            provider: "sparkpost".to_string(),
            daily_cap: at_cap.then_some(0),
            hourly_cap: None,
            sent_today: if at_cap { 1 } else { 0 },
            sent_this_hour: 0,
            counters_reset_at: Utc::now(),
            healthy,
        }
    }

    #[test]
    fn single_selector_returns_its_profile_when_healthy() {
        let p = profile(true, false);
        let selector = EspSelector::Single { profile: p.id };
        let mut rng = rand::thread_rng();
        assert_eq!(select_profile(&selector, &[p.clone()], &mut rng), Some(p.id));
    }

    #[test]
    fn single_selector_returns_none_when_unhealthy() {
        let p = profile(false, false);
        let selector = EspSelector::Single { profile: p.id };
        let mut rng = rand::thread_rng();
        assert_eq!(select_profile(&selector, &[p], &mut rng), None);
    }

    #[test]
    fn at_capacity_profiles_are_excluded() {
        let p = profile(true, true);
        let selector = EspSelector::Single { profile: p.id };
        let mut rng = rand::thread_rng();
        assert_eq!(select_profile(&selector, &[p], &mut rng), None);
    }

    #[test]
    fn weighted_quota_only_picks_among_eligible() {
        let healthy = profile(true, false);
        let unhealthy = profile(false, false);
        let selector = EspSelector::WeightedQuota {
            quotas: vec![
                EspQuota { profile: healthy.id, percent: 50 },
                EspQuota { profile: unhealthy.id, percent: 50 },
            ],
        };
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            assert_eq!(
                select_profile(&selector, &[healthy.clone(), unhealthy.clone()], &mut rng),
                Some(healthy.id)
            );
        }
    }
}
