//! Placement rule evaluation.
//!
//! Pure functions over asset attributes and the configured location set.
//! Rules never consider an asset's current placement, so recomputation is
//! idempotent and requires no synchronization.

use chrono::{DateTime, Utc};

use crate::model::{Asset, LocationId, PlacementRule, StorageLocation};

/// Compute the ordered list of locations eligible to hold `asset`, best
/// first.
///
/// Only `active` locations are considered. A location qualifies when any of
/// its rules fully matches the asset (rules are OR'd within a location);
/// a location with no rules always qualifies as a fallback sink. Qualifying
/// locations are ordered by priority descending with ties broken by the
/// order of `locations` (registration order; the sort is stable).
///
/// An empty result means no location qualifies and no fallback sink exists;
/// the caller reports `NoEligibleLocation`.
pub fn eligible_locations(
    asset: &Asset,
    locations: &[StorageLocation],
    now: DateTime<Utc>,
) -> Vec<LocationId> {
    let mut qualifying: Vec<&StorageLocation> = locations
        .iter()
        .filter(|loc| loc.is_active() && location_qualifies(loc, asset, now))
        .collect();
    qualifying.sort_by(|a, b| b.priority.cmp(&a.priority));
    qualifying.iter().map(|loc| loc.id).collect()
}

/// True when the location has no rules, or any rule matches the asset.
pub fn location_qualifies(location: &StorageLocation, asset: &Asset, now: DateTime<Utc>) -> bool {
    location.rules.is_empty() || location.rules.iter().any(|r| rule_matches(r, asset, now))
}

/// Every populated constraint must hold. An empty rule matches everything.
pub fn rule_matches(rule: &PlacementRule, asset: &Asset, now: DateTime<Utc>) -> bool {
    let age_days = (now - asset.created_at).num_days();

    if let Some(min) = rule.min_age_days {
        if age_days < min {
            return false;
        }
    }
    if let Some(max) = rule.max_age_days {
        if age_days > max {
            return false;
        }
    }
    if let Some(min) = rule.min_size_bytes {
        if asset.size_bytes < min {
            return false;
        }
    }
    if let Some(max) = rule.max_size_bytes {
        if asset.size_bytes > max {
            return false;
        }
    }
    if let Some(ref allow) = rule.allow_types {
        match asset.media_type.as_deref() {
            Some(mime) if allow.iter().any(|t| type_entry_matches(t, mime)) => {}
            _ => return false,
        }
    }
    if let Some(ref deny) = rule.deny_types {
        if let Some(mime) = asset.media_type.as_deref() {
            if deny.iter().any(|t| type_entry_matches(t, mime)) {
                return false;
            }
        }
    }
    if let Some(ref required) = rule.require_tags {
        if !required.iter().all(|t| asset.tags.contains(t)) {
            return false;
        }
    }
    if let Some(ref excluded) = rule.exclude_tags {
        if excluded.iter().any(|t| asset.tags.contains(t)) {
            return false;
        }
    }
    if let Some(min) = rule.min_quality {
        match asset.quality {
            Some(q) if q >= min => {}
            _ => return false,
        }
    }
    if let Some(max) = rule.max_quality {
        match asset.quality {
            Some(q) if q <= max => {}
            _ => return false,
        }
    }

    true
}

/// A type list entry matches a MIME type when it equals the full type
/// ("image/png"), its top-level type ("image"), or its subtype ("png").
fn type_entry_matches(entry: &str, mime: &str) -> bool {
    if entry.eq_ignore_ascii_case(mime) {
        return true;
    }
    match mime.split_once('/') {
        Some((top, sub)) => entry.eq_ignore_ascii_case(top) || entry.eq_ignore_ascii_case(sub),
        None => false,
    }
}

/// Explain why a location does not qualify for an asset, naming the rules
/// that failed to match. Used for migration plan reasons.
pub fn explain_disqualification(
    location: &StorageLocation,
    asset: &Asset,
    now: DateTime<Utc>,
) -> String {
    if location.rules.is_empty() {
        return format!("'{}' has no rules and always qualifies", location.name);
    }
    let failed: Vec<String> = location
        .rules
        .iter()
        .enumerate()
        .filter(|(_, r)| !rule_matches(r, asset, now))
        .map(|(i, r)| format!("rule {} ({})", i + 1, r.summary()))
        .collect();
    format!(
        "'{}' disqualified: no rule matches ({})",
        location.name,
        failed.join("; ")
    )
}

/// Explain why a location qualifies, naming the first matching rule or the
/// catch-all fallback.
pub fn explain_qualification(
    location: &StorageLocation,
    asset: &Asset,
    now: DateTime<Utc>,
) -> String {
    if location.rules.is_empty() {
        return format!("'{}' qualified: catch-all (no rules)", location.name);
    }
    match location
        .rules
        .iter()
        .position(|r| rule_matches(r, asset, now))
    {
        Some(i) => format!(
            "'{}' qualified by rule {} ({})",
            location.name,
            i + 1,
            location.rules[i].summary()
        ),
        None => format!("'{}' does not qualify", location.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LocationKind, LocationStatus};
    use chrono::Duration;

    fn asset(age_days: i64, size: u64) -> Asset {
        Asset {
            content_hash: "aa".repeat(32),
            size_bytes: size,
            media_type: Some("image/jpeg".to_string()),
            created_at: Utc::now() - Duration::days(age_days),
            tags: Default::default(),
            quality: None,
        }
    }

    fn location(name: &str, priority: i32, rules: Vec<PlacementRule>) -> StorageLocation {
        StorageLocation {
            id: LocationId::new(),
            name: name.to_string(),
            kind: LocationKind::Local,
            root: format!("/srv/{name}"),
            priority,
            status: LocationStatus::Active,
            rules,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let rule = PlacementRule::default();
        assert!(rule_matches(&rule, &asset(45, 1024), Utc::now()));
    }

    #[test]
    fn test_age_bounds() {
        let rule = PlacementRule {
            max_age_days: Some(30),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(rule_matches(&rule, &asset(10, 1), now));
        assert!(!rule_matches(&rule, &asset(45, 1), now));

        let rule = PlacementRule {
            min_age_days: Some(30),
            ..Default::default()
        };
        assert!(!rule_matches(&rule, &asset(10, 1), now));
        assert!(rule_matches(&rule, &asset(45, 1), now));
    }

    #[test]
    fn test_size_bounds() {
        let rule = PlacementRule {
            min_size_bytes: Some(100),
            max_size_bytes: Some(1000),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(!rule_matches(&rule, &asset(0, 99), now));
        assert!(rule_matches(&rule, &asset(0, 100), now));
        assert!(rule_matches(&rule, &asset(0, 1000), now));
        assert!(!rule_matches(&rule, &asset(0, 1001), now));
    }

    #[test]
    fn test_type_lists() {
        let now = Utc::now();
        let mut a = asset(0, 1);
        a.media_type = Some("image/jpeg".to_string());

        let allow = PlacementRule {
            allow_types: Some(vec!["image".to_string()]),
            ..Default::default()
        };
        assert!(rule_matches(&allow, &a, now));

        let allow_sub = PlacementRule {
            allow_types: Some(vec!["jpeg".to_string()]),
            ..Default::default()
        };
        assert!(rule_matches(&allow_sub, &a, now));

        let deny = PlacementRule {
            deny_types: Some(vec!["image/jpeg".to_string()]),
            ..Default::default()
        };
        assert!(!rule_matches(&deny, &a, now));

        // Populated allow list never matches an asset with unknown type.
        a.media_type = None;
        assert!(!rule_matches(&allow, &a, now));
    }

    #[test]
    fn test_tag_sets() {
        let now = Utc::now();
        let mut a = asset(0, 1);
        a.tags = ["raw", "project-x"].iter().map(|s| s.to_string()).collect();

        let rule = PlacementRule {
            require_tags: Some(["raw".to_string()].into()),
            ..Default::default()
        };
        assert!(rule_matches(&rule, &a, now));

        let rule = PlacementRule {
            require_tags: Some(["raw".to_string(), "final".to_string()].into()),
            ..Default::default()
        };
        assert!(!rule_matches(&rule, &a, now));

        let rule = PlacementRule {
            exclude_tags: Some(["project-x".to_string()].into()),
            ..Default::default()
        };
        assert!(!rule_matches(&rule, &a, now));
    }

    #[test]
    fn test_quality_bounds() {
        let now = Utc::now();
        let mut a = asset(0, 1);
        let rule = PlacementRule {
            min_quality: Some(0.5),
            ..Default::default()
        };
        // No score never satisfies a populated quality bound.
        assert!(!rule_matches(&rule, &a, now));
        a.quality = Some(0.7);
        assert!(rule_matches(&rule, &a, now));
        a.quality = Some(0.3);
        assert!(!rule_matches(&rule, &a, now));
    }

    #[test]
    fn test_priority_ordering_with_stable_ties() {
        let now = Utc::now();
        let a = location("a", 50, vec![]);
        let b = location("b", 100, vec![]);
        let c = location("c", 50, vec![]);
        let locations = vec![a.clone(), b.clone(), c.clone()];

        let order = eligible_locations(&asset(0, 1), &locations, now);
        // b first on priority; a before c because registration order is kept.
        assert_eq!(order, vec![b.id, a.id, c.id]);
    }

    #[test]
    fn test_offline_locations_excluded() {
        let now = Utc::now();
        let mut offline = location("offline", 100, vec![]);
        offline.status = LocationStatus::Offline;
        let active = location("active", 10, vec![]);

        let order = eligible_locations(&asset(0, 1), &[offline, active.clone()], now);
        assert_eq!(order, vec![active.id]);
    }

    #[test]
    fn test_rules_or_within_location() {
        let now = Utc::now();
        let loc = location(
            "tiered",
            10,
            vec![
                PlacementRule {
                    max_age_days: Some(7),
                    ..Default::default()
                },
                PlacementRule {
                    min_size_bytes: Some(1_000_000),
                    ..Default::default()
                },
            ],
        );
        // Old but large: second rule carries it.
        assert!(location_qualifies(&loc, &asset(100, 2_000_000), now));
        // Old and small: neither rule matches.
        assert!(!location_qualifies(&loc, &asset(100, 10), now));
    }

    #[test]
    fn test_no_eligible_location_when_all_ruled_out() {
        let now = Utc::now();
        let strict = location(
            "strict",
            100,
            vec![PlacementRule {
                max_age_days: Some(1),
                ..Default::default()
            }],
        );
        assert!(eligible_locations(&asset(45, 1), &[strict], now).is_empty());
    }

    #[test]
    fn test_determinism() {
        let now = Utc::now();
        let locations = vec![
            location("x", 10, vec![]),
            location(
                "y",
                20,
                vec![PlacementRule {
                    max_age_days: Some(30),
                    ..Default::default()
                }],
            ),
        ];
        let a = asset(10, 512);
        let first = eligible_locations(&a, &locations, now);
        for _ in 0..5 {
            assert_eq!(eligible_locations(&a, &locations, now), first);
        }
    }

    #[test]
    fn test_explanations() {
        let now = Utc::now();
        let fast = location(
            "fast",
            100,
            vec![PlacementRule {
                max_age_days: Some(30),
                ..Default::default()
            }],
        );
        let archive = location("archive", 50, vec![]);
        let old = asset(45, 1024);

        let dis = explain_disqualification(&fast, &old, now);
        assert!(dis.contains("'fast' disqualified"));
        assert!(dis.contains("max_age_days 30"));

        let qual = explain_qualification(&archive, &old, now);
        assert!(qual.contains("'archive' qualified"));
        assert!(qual.contains("catch-all"));
    }
}
