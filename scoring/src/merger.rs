//! Text normalization and duplicate-candidate merging for the knowledge
//! upserter, run before candidates are scored and upserted.

use std::collections::{BTreeMap, HashSet};

/// Lowercases, NFKD-normalizes, strips punctuation (keeping hyphens), and
/// collapses whitespace, so near-identical phrasing collapses to one key.
pub fn normalize_text(text: &str) -> String {
    use unicode_normalization::UnicodeNormalization;

    let decomposed: String = text.nfkd().collect();
    let lower = decomposed.to_lowercase();
    let stripped: String = lower
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A text-bearing merge candidate: enough fields to dedup, aggregate, and
/// rescore. Callers adapt their own entity shape into this before merging,
/// then apply `merged`/`rejected` output back.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub id: String,
    pub text: String,
    pub score: f64,
    pub evidence_count: u32,
    pub avg_trust: f64,
    pub avg_relevance: f64,
    pub source_chunk_ids: Vec<String>,
}

/// A candidate that lost a merge, with the id of the winner it was folded
/// into, for the resolution log.
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub candidate: MergeCandidate,
    pub merged_into: String,
}

/// Groups `candidates` by `normalize_text(text)`, keeps the highest-scoring
/// member of each group as canonical, and aggregates evidence/trust/relevance
/// and source chunk ids from the rest into it.
pub fn merge_text_entities(
    candidates: Vec<MergeCandidate>,
) -> (Vec<MergeCandidate>, Vec<RejectedCandidate>) {
    let mut groups: BTreeMap<String, Vec<MergeCandidate>> = BTreeMap::new();
    for candidate in candidates {
        let key = normalize_text(&candidate.text);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(candidate);
    }

    let mut merged = Vec::new();
    let mut rejected = Vec::new();

    for (_, mut group) in groups {
        if group.len() == 1 {
            merged.push(group.remove(0));
            continue;
        }

        group.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut winner = group.remove(0);

        let total_evidence: u32 = group.iter().map(|c| c.evidence_count).sum::<u32>()
            + winner.evidence_count;
        let trust_samples: Vec<f64> = std::iter::once(&winner)
            .chain(group.iter())
            .filter(|c| c.evidence_count > 0)
            .map(|c| c.avg_trust)
            .collect();
        let relevance_samples: Vec<f64> = std::iter::once(&winner)
            .chain(group.iter())
            .filter(|c| c.evidence_count > 0)
            .map(|c| c.avg_relevance)
            .collect();

        winner.evidence_count = total_evidence;
        if !trust_samples.is_empty() {
            winner.avg_trust = trust_samples.iter().sum::<f64>() / trust_samples.len() as f64;
        }
        if !relevance_samples.is_empty() {
            winner.avg_relevance =
                relevance_samples.iter().sum::<f64>() / relevance_samples.len() as f64;
        }

        let mut sources: HashSet<String> = winner.source_chunk_ids.drain(..).collect();
        for loser in &group {
            sources.extend(loser.source_chunk_ids.iter().cloned());
        }
        winner.source_chunk_ids = sources.into_iter().collect();
        winner.source_chunk_ids.sort();

        let winner_id = winner.id.clone();
        merged.push(winner);
        rejected.extend(group.into_iter().map(|candidate| RejectedCandidate {
            candidate,
            merged_into: winner_id.clone(),
        }));
    }

    (merged, rejected)
}

/// A numeric-range merge candidate (PID ranges, labor hours, cost).
#[derive(Debug, Clone)]
pub struct NumericRangeCandidate {
    pub id: String,
    pub score: f64,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

/// Result of merging numeric-range candidates: the winner's id plus the
/// merged min/max, and whether independent high-quality sources disagreed
/// by more than 20%.
#[derive(Debug, Clone)]
pub struct NumericRangeMerge {
    pub winner_id: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub conflict: bool,
}

/// Prefers the highest-scoring candidate's values; when independent values
/// disagree by more than 20% relative to the top candidate, widens to the
/// envelope (min of mins, max of maxes) and flags the conflict.
///
/// No upserted entity carries a numeric range today, so this has no caller
/// outside its own tests.
pub fn merge_numeric_ranges(mut candidates: Vec<NumericRangeCandidate>) -> Option<NumericRangeMerge> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let winner = candidates[0].clone();
    if candidates.len() == 1 {
        return Some(NumericRangeMerge {
            winner_id: winner.id,
            min_value: winner.min_value,
            max_value: winner.max_value,
            conflict: false,
        });
    }

    let disagrees = |top: f64, values: &[f64]| {
        values.iter().any(|v| {
            if top == 0.0 {
                *v != 0.0
            } else {
                ((v - top) / top).abs() > 0.2
            }
        })
    };

    let mins: Vec<f64> = candidates.iter().filter_map(|c| c.min_value).collect();
    let maxs: Vec<f64> = candidates.iter().filter_map(|c| c.max_value).collect();

    let min_conflict = winner
        .min_value
        .is_some_and(|top| mins.len() > 1 && disagrees(top, &mins));
    let max_conflict = winner
        .max_value
        .is_some_and(|top| maxs.len() > 1 && disagrees(top, &maxs));
    let conflict = min_conflict || max_conflict;

    let min_value = if min_conflict {
        mins.into_iter().fold(f64::INFINITY, f64::min).into()
    } else {
        winner.min_value
    };
    let max_value = if max_conflict {
        maxs.into_iter().fold(f64::NEG_INFINITY, f64::max).into()
    } else {
        winner.max_value
    };

    Some(NumericRangeMerge {
        winner_id: winner.id,
        min_value,
        max_value,
        conflict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_case_punctuation_and_whitespace() {
        assert_eq!(
            normalize_text("  Faulty   O2-Sensor!!  "),
            "faulty o2-sensor"
        );
    }

    #[test]
    fn merge_text_entities_keeps_highest_scoring_and_sums_evidence() {
        let candidates = vec![
            MergeCandidate {
                id: "a".into(),
                text: "Faulty oxygen sensor".into(),
                score: 80.0,
                evidence_count: 2,
                avg_trust: 0.8,
                avg_relevance: 0.7,
                source_chunk_ids: vec!["c1".into()],
            },
            MergeCandidate {
                id: "b".into(),
                text: "faulty OXYGEN sensor".into(),
                score: 60.0,
                evidence_count: 1,
                avg_trust: 0.6,
                avg_relevance: 0.5,
                source_chunk_ids: vec!["c2".into()],
            },
        ];

        let (merged, rejected) = merge_text_entities(candidates);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[0].evidence_count, 3);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].merged_into, "a");
        assert_eq!(merged[0].source_chunk_ids, vec!["c1", "c2"]);
    }

    #[test]
    fn merge_numeric_ranges_flags_disagreement_past_20_percent() {
        let candidates = vec![
            NumericRangeCandidate {
                id: "a".into(),
                score: 90.0,
                min_value: Some(10.0),
                max_value: Some(20.0),
            },
            NumericRangeCandidate {
                id: "b".into(),
                score: 50.0,
                min_value: Some(5.0),
                max_value: Some(20.0),
            },
        ];
        let result = merge_numeric_ranges(candidates).unwrap();
        assert!(result.conflict);
        assert_eq!(result.min_value, Some(5.0));
    }

    #[test]
    fn merge_numeric_ranges_single_candidate_is_never_conflicted() {
        let candidates = vec![NumericRangeCandidate {
            id: "solo".into(),
            score: 10.0,
            min_value: Some(1.0),
            max_value: Some(2.0),
        }];
        let result = merge_numeric_ranges(candidates).unwrap();
        assert!(!result.conflict);
    }
}
