//! Deterministic scoring engine for DTC knowledge graph entities.
//!
//! `S(entity, context) = EvidenceQualityScore + ConsensusScore +
//! VehicleSpecificityScore + PracticalImpactScore`, clamped to `[0, 100]`.

use std::cmp::Ordering;

/// Kind of child entity being scored, since `PracticalImpactScore` weighs
/// each kind differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Cause,
    Fix,
    Part,
    Symptom,
    Thread,
    Step,
    Sensor,
    LiveData,
}

/// Vehicle context an entity is being scored against, when the caller
/// has a specific make/model/year in mind. `None` fields mean "unconstrained".
#[derive(Debug, Clone, Default)]
pub struct VehicleContext {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
}

/// The vehicle attributes attached to the entity being scored, if any.
#[derive(Debug, Clone, Default)]
pub struct EntityVehicleInfo {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year_start: Option<u16>,
    pub year_end: Option<u16>,
}

/// The practical-impact-relevant fields, only some of which apply per
/// `EntityKind`.
#[derive(Debug, Clone, Default)]
pub struct PracticalImpactInput {
    pub confirmed_repair_count: u32,
    pub probability_weight: f64,
    pub frequency_score: u32,
    pub solution_marked: bool,
}

fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

pub fn evidence_quality_score(avg_trust: f64, avg_relevance: f64) -> f64 {
    let quality = 0.65 * clamp01(avg_trust) + 0.35 * clamp01(avg_relevance);
    50.0 * quality
}

pub fn consensus_score(evidence_count: u32) -> f64 {
    if evidence_count == 0 {
        return 0.0;
    }
    let consensus = ((1.0 + f64::from(evidence_count)).ln() / 11.0_f64.ln()).clamp(0.0, 1.0);
    20.0 * consensus
}

pub fn vehicle_specificity_score(entity: &EntityVehicleInfo, ctx: &VehicleContext) -> f64 {
    let Some(ctx_make) = ctx.make.as_deref() else {
        return 6.0;
    };

    let Some(entity_make) = entity.make.as_deref() else {
        return 6.0;
    };

    if !entity_make.eq_ignore_ascii_case(ctx_make) {
        return -20.0;
    }

    let (Some(ctx_model), Some(entity_model)) = (ctx.model.as_deref(), entity.model.as_deref())
    else {
        return 12.0;
    };

    if !entity_model.eq_ignore_ascii_case(ctx_model) {
        return -20.0;
    }

    match (ctx.year, entity.year_start, entity.year_end) {
        (Some(year), Some(start), Some(end)) => {
            if (start..=end).contains(&year) {
                20.0
            } else {
                -20.0
            }
        }
        (Some(year), Some(start), None) => {
            if year >= start {
                20.0
            } else {
                -20.0
            }
        }
        _ => 20.0,
    }
}

pub fn practical_impact_score(kind: EntityKind, input: &PracticalImpactInput) -> f64 {
    match kind {
        EntityKind::Fix | EntityKind::Part => {
            if input.confirmed_repair_count == 0 {
                0.0
            } else {
                let impact = ((1.0 + f64::from(input.confirmed_repair_count)).ln() / 51.0_f64.ln())
                    .clamp(0.0, 1.0);
                10.0 * impact
            }
        }
        EntityKind::Cause => 10.0 * clamp01(input.probability_weight),
        EntityKind::Symptom => 10.0 * clamp01(f64::from(input.frequency_score) / 10.0),
        EntityKind::Thread => {
            if input.solution_marked {
                6.0
            } else {
                0.0
            }
        }
        EntityKind::Step | EntityKind::Sensor | EntityKind::LiveData => 0.0,
    }
}

/// Inputs needed to compute `S` for a single candidate entity.
#[derive(Debug, Clone, Default)]
pub struct ScoreInput {
    pub kind: Option<EntityKind>,
    pub avg_trust: f64,
    pub avg_relevance: f64,
    pub evidence_count: u32,
    pub vehicle: EntityVehicleInfo,
    pub impact: PracticalImpactInput,
}

pub fn compute_score(input: &ScoreInput, ctx: &VehicleContext) -> f64 {
    let eqs = evidence_quality_score(input.avg_trust, input.avg_relevance);
    let cs = consensus_score(input.evidence_count);
    let vss = vehicle_specificity_score(&input.vehicle, ctx);
    let pis = input
        .kind
        .map_or(0.0, |kind| practical_impact_score(kind, &input.impact));
    (eqs + cs + vss + pis).clamp(0.0, 100.0)
}

/// A scored candidate plus the identity needed for the stable sort's
/// tie-breaking chain.
#[derive(Debug, Clone)]
pub struct ScoredCandidate<T> {
    pub item: T,
    pub id: String,
    pub score: f64,
    pub evidence_count: u32,
    pub avg_trust: f64,
    pub avg_relevance: f64,
}

/// Stable ordering: score desc, evidence_count desc, avg_trust desc,
/// avg_relevance desc, id asc.
pub fn sort_candidates<T>(candidates: &mut [ScoredCandidate<T>]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.evidence_count.cmp(&a.evidence_count))
            .then_with(|| b.avg_trust.partial_cmp(&a.avg_trust).unwrap_or(Ordering::Equal))
            .then_with(|| {
                b.avg_relevance
                    .partial_cmp(&a.avg_relevance)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_quality_weighs_trust_over_relevance() {
        assert!((evidence_quality_score(1.0, 0.0) - 32.5).abs() < 1e-9);
        assert!((evidence_quality_score(0.0, 1.0) - 17.5).abs() < 1e-9);
    }

    #[test]
    fn consensus_saturates_near_ten_sources() {
        assert!((consensus_score(10) - 20.0).abs() < 1e-9);
        assert!(consensus_score(1) > 5.0 && consensus_score(1) < 7.0);
        assert_eq!(consensus_score(0), 0.0);
    }

    #[test]
    fn vehicle_specificity_penalizes_make_conflict() {
        let ctx = VehicleContext {
            make: Some("Toyota".into()),
            model: Some("Camry".into()),
            year: Some(2018),
        };
        let entity = EntityVehicleInfo {
            make: Some("Honda".into()),
            ..Default::default()
        };
        assert_eq!(vehicle_specificity_score(&entity, &ctx), -20.0);
    }

    #[test]
    fn vehicle_specificity_rewards_full_match() {
        let ctx = VehicleContext {
            make: Some("Toyota".into()),
            model: Some("Camry".into()),
            year: Some(2018),
        };
        let entity = EntityVehicleInfo {
            make: Some("Toyota".into()),
            model: Some("Camry".into()),
            year_start: Some(2015),
            year_end: Some(2020),
        };
        assert_eq!(vehicle_specificity_score(&entity, &ctx), 20.0);
    }

    #[test]
    fn generic_oem_agnostic_entity_is_neutral() {
        let ctx = VehicleContext {
            make: Some("Toyota".into()),
            ..Default::default()
        };
        assert_eq!(
            vehicle_specificity_score(&EntityVehicleInfo::default(), &ctx),
            6.0
        );
    }

    #[test]
    fn sort_candidates_breaks_ties_by_evidence_then_id() {
        let mut candidates = vec![
            ScoredCandidate {
                item: "b",
                id: "b".into(),
                score: 50.0,
                evidence_count: 2,
                avg_trust: 0.5,
                avg_relevance: 0.5,
            },
            ScoredCandidate {
                item: "a",
                id: "a".into(),
                score: 50.0,
                evidence_count: 3,
                avg_trust: 0.5,
                avg_relevance: 0.5,
            },
        ];
        sort_candidates(&mut candidates);
        assert_eq!(candidates[0].id, "a");
    }
}
