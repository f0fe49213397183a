//! Pure resume-eligibility computation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::PauseObligation;
use crate::torrent::TorrentInfo;

/// Outcome of resolving one obligation against the other live ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Torrents no remaining obligation wants paused
    pub resumable: BTreeSet<String>,
    /// Retained torrents keyed by the obligation that takes them over
    pub handover: BTreeMap<String, BTreeSet<String>>,
}

impl Resolution {
    pub fn retained(&self) -> BTreeSet<String> {
        self.handover.values().flatten().cloned().collect()
    }
}

/// Splits `paused_set` into torrents safe to resume and torrents some other
/// live obligation would still select.
///
/// A torrent absent from `torrents` is no longer known to the client and is
/// reported as resumable; nothing can retain it.
pub fn resolve(
    paused_set: &BTreeSet<String>,
    others: &[PauseObligation],
    torrents: &[TorrentInfo],
) -> Resolution {
    let by_hash: HashMap<&str, &TorrentInfo> = torrents
        .iter()
        .map(|torrent| (torrent.hash.as_str(), torrent))
        .collect();

    let mut resolution = Resolution::default();
    for hash in paused_set {
        let retainers: Vec<&PauseObligation> = match by_hash.get(hash.as_str()) {
            Some(torrent) => others
                .iter()
                .filter(|other| other.id != *hash && other.criteria.selects(torrent))
                .collect(),
            None => Vec::new(),
        };

        if retainers.is_empty() {
            resolution.resumable.insert(hash.clone());
            continue;
        }
        for retainer in retainers {
            resolution
                .handover
                .entry(retainer.id.clone())
                .or_default()
                .insert(hash.clone());
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use proptest::prelude::*;

    use super::*;
    use crate::ledger::EligibilityCriteria;
    use crate::torrent::TorrentState;

    fn obligation(id: &str, criteria: EligibilityCriteria, paused: &[&str]) -> PauseObligation {
        PauseObligation {
            id: id.to_string(),
            created_at: Utc::now(),
            criteria,
            paused_set: paused.iter().map(|hash| hash.to_string()).collect(),
        }
    }

    fn set(hashes: &[&str]) -> BTreeSet<String> {
        hashes.iter().map(|hash| hash.to_string()).collect()
    }

    #[test]
    fn test_no_other_obligations_resumes_everything() {
        let torrents = vec![TorrentInfo::new("x", "x"), TorrentInfo::new("y", "y")];
        let resolution = resolve(&set(&["x", "y"]), &[], &torrents);

        assert_eq!(resolution.resumable, set(&["x", "y"]));
        assert!(resolution.handover.is_empty());
    }

    #[test]
    fn test_selecting_obligation_retains_and_takes_over() {
        let torrents = vec![
            TorrentInfo::new("x", "x").with_category("movies"),
            TorrentInfo::new("y", "y").with_category("race").with_ratio(0.1),
        ];
        let other = obligation(
            "b",
            EligibilityCriteria::race(Vec::new(), vec!["race".to_string()], 1.0),
            &["z"],
        );

        let resolution = resolve(&set(&["x", "y"]), &[other], &torrents);

        assert_eq!(resolution.resumable, set(&["y"]));
        assert_eq!(resolution.handover.get("b"), Some(&set(&["x"])));
    }

    #[test]
    fn test_vanished_torrent_is_resumable() {
        let other = obligation("b", EligibilityCriteria::race(Vec::new(), Vec::new(), 0.0), &[]);
        let resolution = resolve(&set(&["gone"]), &[other], &[]);
        assert_eq!(resolution.resumable, set(&["gone"]));
    }

    #[test]
    fn test_obligation_never_retains_its_own_racing_torrent() {
        let torrents = vec![TorrentInfo::new("b", "racing")];
        let other = obligation("b", EligibilityCriteria::race(Vec::new(), Vec::new(), 0.0), &[]);
        let resolution = resolve(&set(&["b"]), &[other], &torrents);
        assert_eq!(resolution.resumable, set(&["b"]));
    }

    fn arb_torrent(hash: String) -> impl Strategy<Value = TorrentInfo> {
        (
            prop::option::of(prop::sample::select(vec!["race", "movies", "keep"])),
            0.0f64..3.0,
            0u64..7200,
        )
            .prop_map(move |(category, ratio, idle)| {
                let mut torrent = TorrentInfo::new(hash.clone(), hash.clone())
                    .with_ratio(ratio)
                    .with_state(TorrentState::StoppedUpload)
                    .with_activity(std::time::Duration::from_secs(idle), std::time::Duration::ZERO);
                torrent.category = category.map(str::to_string);
                torrent
            })
    }

    fn arb_criteria() -> impl Strategy<Value = EligibilityCriteria> {
        prop_oneof![
            (0.0f64..3.0, any::<bool>()).prop_map(|(ratio, categorised)| {
                let categories = if categorised {
                    vec!["race".to_string()]
                } else {
                    Vec::new()
                };
                EligibilityCriteria::race(vec!["keep".to_string()], categories, ratio)
            }),
            (0u64..7200).prop_map(|limit| EligibilityCriteria::activity(
                Vec::new(),
                Some(std::time::Duration::from_secs(limit)),
                None
            )),
            Just(EligibilityCriteria::nothing()),
        ]
    }

    fn arb_world() -> impl Strategy<Value = (Vec<TorrentInfo>, Vec<PauseObligation>)> {
        let torrents = (0..8)
            .map(|index| arb_torrent(format!("t{index}")))
            .collect::<Vec<_>>();
        let obligations = prop::collection::vec(
            (arb_criteria(), prop::collection::btree_set(0usize..8, 0..5)),
            1..4,
        );
        (torrents, obligations).prop_map(|(torrents, specs)| {
            let obligations = specs
                .into_iter()
                .enumerate()
                .map(|(index, (criteria, paused))| PauseObligation {
                    id: format!("o{index}"),
                    created_at: Utc::now(),
                    criteria,
                    paused_set: paused.into_iter().map(|i| format!("t{i}")).collect(),
                })
                .collect();
            (torrents, obligations)
        })
    }

    proptest! {
        #[test]
        fn prop_resolution_never_resumes_what_others_select((torrents, obligations) in arb_world()) {
            let (first, others) = obligations.split_first().unwrap();
            let resolution = resolve(&first.paused_set, others, &torrents);

            for hash in &resolution.resumable {
                if let Some(torrent) = torrents.iter().find(|t| &t.hash == hash) {
                    prop_assert!(others.iter().all(|o| !o.criteria.selects(torrent)));
                }
            }

            let retained = resolution.retained();
            prop_assert!(resolution.resumable.is_disjoint(&retained));
            let union: BTreeSet<String> = resolution.resumable.union(&retained).cloned().collect();
            prop_assert_eq!(union, first.paused_set.clone());
        }

        #[test]
        fn prop_sole_obligation_returns_full_set((torrents, obligations) in arb_world()) {
            let resolution = resolve(&obligations[0].paused_set, &[], &torrents);
            prop_assert_eq!(resolution.resumable, obligations[0].paused_set.clone());
        }
    }
}
