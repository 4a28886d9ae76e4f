//! Derivation of target weighting plans from a file of reference response
//! weights.
//!
//! Every respondent of a quota cell is expected to carry the same weight in
//! the reference file: that weight is the scale factor of the cell. The target
//! of the cell is then its share of the weighted sample.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};

use crate::config::*;
use crate::repository::RespondentSource;
use crate::rim::{scale_factors_to_target_weights, POINT_TOLERANCE};

/// The current plans of a subset, to be replaced by target weighted plans.
#[derive(PartialEq, Debug, Clone)]
pub struct SubsetPlans {
    pub subset_id: String,
    pub plans: Vec<WeightingPlanConfiguration>,
}

/// The outcome for one subset. The plans should only be stored when there is
/// no error.
#[derive(PartialEq, Debug, Clone)]
pub struct SubsetReversal {
    pub subset_id: String,
    pub plans: Vec<WeightingPlanConfiguration>,
    pub errors: Vec<String>,
}

#[derive(PartialEq, Debug, Clone, Default)]
pub struct GeneratedWeightings {
    pub subsets: Vec<SubsetReversal>,
    pub warnings: Vec<String>,
    /// Errors that concern the whole file.
    pub errors: Vec<String>,
}

impl GeneratedWeightings {
    /// The outcome when the reference file could not be used at all: no plan
    /// for any subset.
    pub fn fatal(subset_ids: &[String], message: &str) -> GeneratedWeightings {
        GeneratedWeightings {
            subsets: subset_ids
                .iter()
                .map(|s| SubsetReversal {
                    subset_id: s.clone(),
                    plans: Vec::new(),
                    errors: Vec::new(),
                })
                .collect(),
            warnings: Vec::new(),
            errors: vec![format!("FATAL ERROR: {}", message)],
        }
    }

    pub fn subset(&self, subset_id: &str) -> Option<&SubsetReversal> {
        self.subsets.iter().find(|s| s.subset_id == subset_id)
    }
}

/// Turns the current plans of each subset into target weighted plans that
/// reproduce the reference weights.
pub fn reverse_scale_factors(
    subsets: &[SubsetPlans],
    weights: &BTreeMap<i64, f64>,
    source: &dyn RespondentSource,
) -> GeneratedWeightings {
    let mut warnings: Vec<String> = Vec::new();
    let respondents_by_subset: HashMap<String, Vec<Respondent>> = subsets
        .iter()
        .map(|s| {
            let rs: Vec<Respondent> = source
                .respondents_for_subset(&s.subset_id)
                .into_iter()
                .filter(|r| !r.archived)
                .collect();
            (s.subset_id.clone(), rs)
        })
        .collect();

    check_all_weighted_respondents_are_loaded(subsets, &respondents_by_subset, weights, &mut warnings);

    let mut res: Vec<SubsetReversal> = Vec::new();
    for s in subsets {
        let respondents = respondents_by_subset
            .get(&s.subset_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let reversal = reverse_subset(s, respondents, weights, &mut warnings);
        info!(
            "reverse_scale_factors: subset {}: {} plans, {} errors",
            s.subset_id,
            reversal.plans.len(),
            reversal.errors.len()
        );
        res.push(reversal);
    }
    GeneratedWeightings {
        subsets: res,
        warnings,
        errors: Vec::new(),
    }
}

fn check_all_weighted_respondents_are_loaded(
    subsets: &[SubsetPlans],
    respondents_by_subset: &HashMap<String, Vec<Respondent>>,
    weights: &BTreeMap<i64, f64>,
    warnings: &mut Vec<String>,
) {
    let loaded: HashSet<i64> = respondents_by_subset
        .values()
        .flat_map(|rs| rs.iter().map(|r| r.response_id))
        .collect();
    let not_loaded: Vec<String> = weights
        .iter()
        .filter(|(id, w)| **w != 0.0 && !loaded.contains(id))
        .map(|(id, _)| id.to_string())
        .collect();
    if !not_loaded.is_empty() {
        warnings.push(format!(
            "Response weight defined in csv, but respondent not in vue - possibly archived or has no enabled subset for segment: '{}'",
            not_loaded.join(",")
        ));
    }

    let mut unweighted: Vec<i64> = Vec::new();
    for s in subsets {
        let dimensions = plan_dimensions(&s.plans);
        if let Some(rs) = respondents_by_subset.get(&s.subset_id) {
            for r in rs {
                let weighted = weights.get(&r.response_id).map(|w| *w != 0.0).unwrap_or(false);
                if weighted && r.quota_cell_for(&dimensions).is_unweighted() {
                    unweighted.push(r.response_id);
                }
            }
        }
    }
    if !unweighted.is_empty() {
        warnings.push(format!(
            "Will not be weighted: Response weights defined but in vue unweighted cell: '{}'",
            unweighted
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<String>>()
                .join(",")
        ));
    }
}

fn reverse_subset(
    subset: &SubsetPlans,
    respondents: &[Respondent],
    weights: &BTreeMap<i64, f64>,
    warnings: &mut Vec<String>,
) -> SubsetReversal {
    let id = &subset.subset_id;
    let plans = &subset.plans;
    let mut errors: Vec<String> = Vec::new();

    let new_plans: Vec<WeightingPlanConfiguration> = if plans.is_empty() {
        errors.push(format!("No weighting plan for survey segment {}", id));
        Vec::new()
    } else if is_wave_plan(plans) {
        vec![reverse_wave_plan(id, &plans[0], respondents, weights, warnings)]
    } else if are_all_plans_rim(plans) {
        match cell_target_weights(id, None, plans, respondents, weights, warnings) {
            Some(targets) => vec![target_plan_for_rim(plans, &targets)],
            None if plans.len() == 1 => {
                warnings.push(format!(
                    "Ignoring plan for survey segment {} as it cannot be turned into TargetWeighted",
                    id
                ));
                plans.clone()
            }
            None => {
                errors.push(format!(
                    "ERROR: Plans for survey segment {} cannot be turned into TargetWeighted",
                    id
                ));
                Vec::new()
            }
        }
    } else if plans.len() == 1 {
        warnings.push(format!(
            "Ignoring plan for survey segment {} as it cannot be turned into TargetWeighted",
            id
        ));
        plans.clone()
    } else {
        errors.push(format!(
            "ERROR: Plans for survey segment {} cannot be turned into TargetWeighted",
            id
        ));
        Vec::new()
    };

    SubsetReversal {
        subset_id: id.clone(),
        plans: new_plans,
        errors,
    }
}

/// Each wave is weighted independently. Waves without usable weights keep
/// their current plans.
fn reverse_wave_plan(
    subset_id: &str,
    root: &WeightingPlanConfiguration,
    respondents: &[Respondent],
    weights: &BTreeMap<i64, f64>,
    warnings: &mut Vec<String>,
) -> WeightingPlanConfiguration {
    let wave_variable = &root.variable_identifier;
    let mut targets: Vec<WeightingTargetConfiguration> = Vec::new();
    for t in root.child_targets.iter() {
        let in_wave: Vec<Respondent> = respondents
            .iter()
            .filter(|r| r.answer(wave_variable) == Some(t.entity_instance_id))
            .cloned()
            .collect();

        let dimensions = plan_dimensions(&t.child_plans);
        let outside_scheme: Vec<String> = in_wave
            .iter()
            .filter(|r| weights.get(&r.response_id).map(|w| *w > 0.0).unwrap_or(false))
            .filter(|r| r.quota_cell_for(&dimensions).is_unweighted())
            .map(|r| r.response_id.to_string())
            .collect();
        if !outside_scheme.is_empty() {
            warnings.push(format!(
                "ERROR: Subset '{}' weighting scheme does not include these respondents in wave id {}:\r\n{}",
                subset_id,
                t.entity_instance_id,
                outside_scheme.join(", ")
            ));
        }

        let replaced = if are_all_plans_rim(&t.child_plans) {
            cell_target_weights(
                subset_id,
                Some(t.entity_instance_id),
                &t.child_plans,
                &in_wave,
                weights,
                warnings,
            )
            .map(|cell_targets| WeightingTargetConfiguration {
                entity_instance_id: t.entity_instance_id,
                target: None,
                target_population: None,
                child_plans: vec![target_plan_for_rim(&t.child_plans, &cell_targets)],
            })
        } else {
            None
        };
        targets.push(replaced.unwrap_or_else(|| t.clone()));
    }
    WeightingPlanConfiguration {
        variable_identifier: wave_variable.clone(),
        is_weighting_group_root: root.is_weighting_group_root,
        child_targets: targets,
    }
}

/// The target weight of each quota cell, by cell key. Cells whose respondents
/// do not all have the same weight are left out.
fn cell_target_weights(
    subset_id: &str,
    wave: Option<i64>,
    plans: &[WeightingPlanConfiguration],
    respondents: &[Respondent],
    weights: &BTreeMap<i64, f64>,
    warnings: &mut Vec<String>,
) -> Option<BTreeMap<String, f64>> {
    let wave_s = wave.map(|w| w.to_string()).unwrap_or_default();
    let dimensions = plan_dimensions(plans);
    let mut by_cell: BTreeMap<QuotaCell, Vec<&Respondent>> = BTreeMap::new();
    for r in respondents {
        let c = r.quota_cell_for(&dimensions);
        if !c.is_unweighted() {
            by_cell.entry(c).or_default().push(r);
        }
    }

    let mut cells: Vec<(QuotaCell, f64)> = Vec::new();
    let mut scale_factors: HashMap<String, f64> = HashMap::new();
    for (cell, members) in by_cell {
        let (weighted, unweighted): (Vec<&Respondent>, Vec<&Respondent>) = members
            .iter()
            .copied()
            .partition(|r| weights.contains_key(&r.response_id));
        if weighted.is_empty() {
            warnings.push(format!(
                "In subset {}: Omitting wave id {}, quota cell (in full) {} which has no response weights provided",
                subset_id, wave_s, cell
            ));
            continue;
        }
        if !unweighted.is_empty() {
            warnings.push(format!(
                "In subset {}: Omitting wave id {}, quota cell (in full) {}, which has no response weights provided for these response ids:\r\n{}",
                subset_id,
                wave_s,
                cell,
                unweighted
                    .iter()
                    .map(|r| r.response_id.to_string())
                    .collect::<Vec<String>>()
                    .join(", ")
            ));
            continue;
        }
        let weight_of = |r: &Respondent| weights.get(&r.response_id).cloned().unwrap_or(0.0);
        let first = weighted[0];
        let first_weight = weight_of(first);
        let different: Vec<String> = weighted
            .iter()
            .copied()
            .filter(|r| weight_of(*r) != first_weight)
            .map(|r| format!("({}, {})", r.response_id, weight_of(r)))
            .collect();
        if !different.is_empty() {
            warnings.push(format!(
                "In subset {}: Omitting wave id {}, quota cell (in full) {}, which has differing response weights: ({}, {}), {}",
                subset_id,
                wave_s,
                cell,
                first.response_id,
                first_weight,
                different.join(", ")
            ));
            continue;
        }
        scale_factors.insert(cell.key(), first_weight);
        cells.push((cell, members.len() as f64));
    }

    if cells.is_empty() {
        return None;
    }
    let total: f64 = cells.iter().map(|(_, n)| n).sum();
    let mut targets = scale_factors_to_target_weights(&cells, &scale_factors, total);
    let sum: f64 = targets.values().sum();
    if (1.0 - sum).abs() > POINT_TOLERANCE {
        warnings.push(format!(
            "Normalizing wave id {} which has weights summing to {}",
            wave_s, sum
        ));
        for v in targets.values_mut() {
            *v /= sum;
        }
        let sum: f64 = targets.values().sum();
        if (1.0 - sum).abs() > POINT_TOLERANCE {
            warnings.push(format!(
                "For wave id {}, cannot normalize weights to within tolerance. Sum is: {}",
                wave_s, sum
            ));
        }
    }
    debug!("cell_target_weights: subset {} wave {}: {:?}", subset_id, wave_s, targets);
    Some(targets.into_iter().collect())
}

/// Nests the rim dimensions in order. Only the cells that have a target are
/// kept, and branches without any cell are dropped.
fn target_plan_for_rim(
    rim_plans: &[WeightingPlanConfiguration],
    cell_targets: &BTreeMap<String, f64>,
) -> WeightingPlanConfiguration {
    match rim_plans.split_first() {
        Some((first, rest)) => nested_plan(first, rest, cell_targets, &[]),
        None => WeightingPlanConfiguration::new("", Vec::new()),
    }
}

fn nested_plan(
    plan: &WeightingPlanConfiguration,
    nested: &[WeightingPlanConfiguration],
    cell_targets: &BTreeMap<String, f64>,
    prefix: &[i64],
) -> WeightingPlanConfiguration {
    let mut targets: Vec<WeightingTargetConfiguration> = Vec::new();
    for t in plan.child_targets.iter() {
        let mut cell: Vec<i64> = prefix.to_vec();
        cell.push(t.entity_instance_id);
        match nested.split_first() {
            Some((next, rest)) => {
                let child = nested_plan(next, rest, cell_targets, &cell);
                if !child.child_targets.is_empty() {
                    targets.push(WeightingTargetConfiguration {
                        entity_instance_id: t.entity_instance_id,
                        target: None,
                        target_population: None,
                        child_plans: vec![child],
                    });
                }
            }
            None => {
                if let Some(x) = cell_targets.get(&generate_key(cell)) {
                    targets.push(WeightingTargetConfiguration::leaf(t.entity_instance_id, Some(*x)));
                }
            }
        }
    }
    WeightingPlanConfiguration::new(&plan.variable_identifier, targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRespondents;

    fn respondent(id: i64, wave: i64, gender: i64, age: i64) -> Respondent {
        let mut answers = BTreeMap::new();
        answers.insert("Wave".to_string(), wave);
        answers.insert("Gender".to_string(), gender);
        answers.insert("Age".to_string(), age);
        Respondent {
            response_id: id,
            subset_id: "UK".to_string(),
            archived: false,
            completed_date: None,
            answers,
        }
    }

    fn rim_plans() -> Vec<WeightingPlanConfiguration> {
        vec![
            WeightingPlanConfiguration::new(
                "Gender",
                vec![
                    WeightingTargetConfiguration::leaf(1, Some(0.5)),
                    WeightingTargetConfiguration::leaf(2, Some(0.5)),
                ],
            ),
            WeightingPlanConfiguration::new(
                "Age",
                vec![
                    WeightingTargetConfiguration::leaf(1, Some(0.5)),
                    WeightingTargetConfiguration::leaf(2, Some(0.5)),
                ],
            ),
        ]
    }

    fn source() -> InMemoryRespondents {
        InMemoryRespondents {
            subsets: vec![Subset {
                id: "UK".to_string(),
                display_name: "UK".to_string(),
                disabled: false,
            }],
            respondents: vec![
                respondent(1, 1, 1, 1),
                respondent(2, 1, 1, 1),
                respondent(3, 1, 1, 2),
                respondent(4, 1, 2, 1),
                respondent(5, 1, 2, 2),
                respondent(6, 2, 1, 1),
            ],
            instance_names: HashMap::new(),
        }
    }

    fn leaf_targets(plan: &WeightingPlanConfiguration) -> Vec<(String, f64)> {
        plan_quota_cells(std::slice::from_ref(plan))
            .into_iter()
            .map(|(c, t)| (c.key(), t.unwrap_or(f64::NAN)))
            .collect()
    }

    #[test]
    fn rim_plans_become_nested_targets() {
        // Wave 1 only, 5 respondents in 4 cells.
        let source = InMemoryRespondents {
            respondents: source().respondents[..5].to_vec(),
            ..source()
        };
        let weights: BTreeMap<i64, f64> =
            vec![(1, 0.5), (2, 0.5), (3, 2.0), (4, 1.0), (5, 1.0)].into_iter().collect();
        let res = reverse_scale_factors(
            &[SubsetPlans {
                subset_id: "UK".to_string(),
                plans: rim_plans(),
            }],
            &weights,
            &source,
        );
        let uk = res.subset("UK").unwrap();
        assert!(uk.errors.is_empty());
        assert_eq!(uk.plans.len(), 1);
        assert!(is_target_weighted(&uk.plans));
        let targets = leaf_targets(&uk.plans[0]);
        // 2 * 0.5, 1 * 2.0, 1 * 1.0, 1 * 1.0 over 5 respondents.
        assert_eq!(targets[0].0, "1:1");
        assert!((targets[0].1 - 0.2).abs() < 1e-9);
        assert!((targets[1].1 - 0.4).abs() < 1e-9);
        // The weights already average to 1.
        assert!(!res.warnings.iter().any(|w| w.starts_with("Normalizing wave id")));
        let sum: f64 = targets.iter().map(|(_, t)| t).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inconsistent_cells_are_omitted() {
        let source = InMemoryRespondents {
            respondents: source().respondents[..5].to_vec(),
            ..source()
        };
        let weights: BTreeMap<i64, f64> =
            vec![(1, 0.5), (2, 0.7), (3, 2.0), (5, 1.0), (99, 1.0)].into_iter().collect();
        let res = reverse_scale_factors(
            &[SubsetPlans {
                subset_id: "UK".to_string(),
                plans: rim_plans(),
            }],
            &weights,
            &source,
        );
        let uk = res.subset("UK").unwrap();
        let keys: Vec<String> = leaf_targets(&uk.plans[0]).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["1:2".to_string(), "2:2".to_string()]);
        assert!(res
            .warnings
            .iter()
            .any(|w| w.contains("differing response weights: (1, 0.5), (2, 0.7)")));
        assert!(res
            .warnings
            .iter()
            .any(|w| w.contains("quota cell (in full) 2:1 which has no response weights provided")));
        assert!(res.warnings.iter().any(|w| w.ends_with("segment: '99'")));
    }

    #[test]
    fn waves_are_reversed_independently() {
        let plans = vec![WeightingPlanConfiguration {
            variable_identifier: "Wave".to_string(),
            is_weighting_group_root: true,
            child_targets: vec![
                WeightingTargetConfiguration {
                    entity_instance_id: 1,
                    target: None,
                    target_population: None,
                    child_plans: rim_plans(),
                },
                WeightingTargetConfiguration {
                    entity_instance_id: 2,
                    target: None,
                    target_population: None,
                    child_plans: rim_plans(),
                },
            ],
        }];
        let weights: BTreeMap<i64, f64> =
            vec![(1, 1.0), (2, 1.0), (3, 1.0), (4, 1.0), (5, 1.0)].into_iter().collect();
        let res = reverse_scale_factors(
            &[SubsetPlans {
                subset_id: "UK".to_string(),
                plans: plans.clone(),
            }],
            &weights,
            &source(),
        );
        let uk = res.subset("UK").unwrap();
        assert!(uk.errors.is_empty());
        let root = &uk.plans[0];
        assert!(root.is_weighting_group_root);
        assert!(is_target_weighted(&root.child_targets[0].child_plans));
        // Nobody of wave 2 has a weight: the wave keeps its rim plans.
        assert_eq!(root.child_targets[1], plans[0].child_targets[1]);
    }

    #[test]
    fn subset_without_plan_is_an_error() {
        let res = reverse_scale_factors(
            &[SubsetPlans {
                subset_id: "UK".to_string(),
                plans: Vec::new(),
            }],
            &BTreeMap::new(),
            &source(),
        );
        assert_eq!(res.subset("UK").unwrap().errors.len(), 1);
    }

    #[test]
    fn fatal_outcome() {
        let res = GeneratedWeightings::fatal(&["A".to_string(), "B".to_string()], "Missing column Weight");
        assert_eq!(res.errors, vec!["FATAL ERROR: Missing column Weight".to_string()]);
        assert!(res.subsets.iter().all(|s| s.plans.is_empty()));
    }
}
