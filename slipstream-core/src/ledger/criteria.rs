//! Eligibility rules deciding which torrents an obligation pauses.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::torrent::TorrentInfo;

/// Rule applied to torrents that are neither ignored nor exempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseRule {
    /// Race rule: everything outside `race_categories`, plus race-category
    /// torrents whose ratio reached `ratio`. No categories selects everything.
    Race {
        #[serde(default)]
        race_categories: BTreeSet<String>,
        #[serde(default)]
        ratio: f64,
    },
    /// Manual pause rule: torrents breaching either activity limit, or every
    /// torrent when neither limit is set.
    Activity {
        #[serde(default, with = "optional_secs")]
        time_since_active: Option<Duration>,
        #[serde(default, with = "optional_secs")]
        time_active: Option<Duration>,
    },
    /// Selects nothing.
    Nothing,
}

/// Snapshot of the configuration an obligation was created with.
///
/// Persisted with the obligation and re-evaluated when other obligations
/// resolve, so later config edits never change what an existing obligation
/// retains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityCriteria {
    #[serde(default)]
    pub ignore_categories: BTreeSet<String>,
    /// Hashes never selected regardless of the rule
    #[serde(default)]
    pub exempt: BTreeSet<String>,
    pub rule: PauseRule,
}

impl EligibilityCriteria {
    pub fn race(
        ignore_categories: impl IntoIterator<Item = String>,
        race_categories: impl IntoIterator<Item = String>,
        ratio: f64,
    ) -> Self {
        Self {
            ignore_categories: ignore_categories.into_iter().collect(),
            exempt: BTreeSet::new(),
            rule: PauseRule::Race {
                race_categories: race_categories.into_iter().collect(),
                ratio,
            },
        }
    }

    pub fn activity(
        ignore_categories: impl IntoIterator<Item = String>,
        time_since_active: Option<Duration>,
        time_active: Option<Duration>,
    ) -> Self {
        Self {
            ignore_categories: ignore_categories.into_iter().collect(),
            exempt: BTreeSet::new(),
            rule: PauseRule::Activity {
                time_since_active,
                time_active,
            },
        }
    }

    pub fn nothing() -> Self {
        Self {
            ignore_categories: BTreeSet::new(),
            exempt: BTreeSet::new(),
            rule: PauseRule::Nothing,
        }
    }

    pub fn with_exempt(mut self, hash: impl Into<String>) -> Self {
        self.exempt.insert(hash.into());
        self
    }

    /// Whether `torrent` should be paused under these criteria.
    ///
    /// Paused state is deliberately not consulted: callers decide separately
    /// whether an already-paused torrent counts.
    pub fn selects(&self, torrent: &TorrentInfo) -> bool {
        if self.exempt.contains(&torrent.hash) {
            return false;
        }
        if let Some(category) = &torrent.category
            && self.ignore_categories.contains(category)
        {
            return false;
        }

        match &self.rule {
            PauseRule::Race {
                race_categories,
                ratio,
            } => {
                if race_categories.is_empty() {
                    return true;
                }
                match &torrent.category {
                    Some(category) if race_categories.contains(category) => torrent.ratio >= *ratio,
                    _ => true,
                }
            }
            PauseRule::Activity {
                time_since_active,
                time_active,
            } => {
                if time_since_active.is_none() && time_active.is_none() {
                    return true;
                }
                time_since_active.is_some_and(|limit| torrent.time_since_active >= limit)
                    || time_active.is_some_and(|limit| torrent.time_active >= limit)
            }
            PauseRule::Nothing => false,
        }
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn test_race_rule_without_categories_selects_all_but_ignored() {
        let criteria = EligibilityCriteria::race(strings(&["keep"]), Vec::new(), 0.0);

        assert!(criteria.selects(&TorrentInfo::new("a", "plain")));
        assert!(criteria.selects(&TorrentInfo::new("b", "tv").with_category("tv")));
        assert!(!criteria.selects(&TorrentInfo::new("c", "kept").with_category("keep")));
    }

    #[test]
    fn test_race_rule_with_categories_uses_ratio_ceiling() {
        let criteria = EligibilityCriteria::race(Vec::new(), strings(&["race"]), 1.0);

        let other = TorrentInfo::new("a", "other").with_category("movies");
        let uncategorised = TorrentInfo::new("b", "none");
        let low = TorrentInfo::new("c", "low").with_category("race").with_ratio(0.4);
        let high = TorrentInfo::new("d", "high").with_category("race").with_ratio(1.0);

        assert!(criteria.selects(&other));
        assert!(criteria.selects(&uncategorised));
        assert!(!criteria.selects(&low));
        assert!(criteria.selects(&high));
    }

    #[test]
    fn test_activity_rule_uses_either_limit() {
        let criteria = EligibilityCriteria::activity(Vec::new(), Some(HOUR), Some(24 * HOUR));

        let idle = TorrentInfo::new("a", "idle").with_activity(HOUR, HOUR);
        let old = TorrentInfo::new("b", "old").with_activity(Duration::ZERO, 24 * HOUR);
        let fresh = TorrentInfo::new("c", "fresh").with_activity(Duration::from_secs(5), HOUR);

        assert!(criteria.selects(&idle));
        assert!(criteria.selects(&old));
        assert!(!criteria.selects(&fresh));
    }

    #[test]
    fn test_activity_rule_without_limits_selects_everything() {
        let criteria = EligibilityCriteria::activity(Vec::new(), None, None);
        assert!(criteria.selects(&TorrentInfo::new("a", "any")));
    }

    #[test]
    fn test_exempt_and_nothing() {
        let criteria = EligibilityCriteria::race(Vec::new(), Vec::new(), 0.0).with_exempt("a");
        assert!(!criteria.selects(&TorrentInfo::new("a", "racing")));
        assert!(!EligibilityCriteria::nothing().selects(&TorrentInfo::new("b", "any")));
    }

    #[test]
    fn test_snapshot_survives_json() {
        let criteria =
            EligibilityCriteria::activity(strings(&["keep"]), Some(HOUR), None).with_exempt("x");
        let json = serde_json::to_string(&criteria).unwrap();
        let restored: EligibilityCriteria = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, criteria);
    }
}
