//! Sample sizes of subsets, categories and quota cells, and the consistency
//! checks between them.

use std::collections::{BTreeSet, HashSet};

use log::debug;

use crate::config::*;
use crate::rim::*;

/// Flags a difference between the raw sample size of a category and its
/// sample size once respondents are assigned to quota cells.
///
/// Returns nothing when both are known and equal.
pub fn get_description(raw: Option<f64>, weighted: Option<f64>) -> Option<String> {
    match (raw, weighted) {
        (Some(r), Some(w)) if r != w => {
            if w == 0.0 {
                Some(format!("!{} -  Missing quota cell", r))
            } else {
                Some(format!("!{}", r - w))
            }
        }
        _ => None,
    }
}

/// Same as [get_description] for a total row. A total that does not add up
/// to the independently computed grand total is flagged with `!!`.
pub fn get_total_description(total: f64, raw: Option<f64>, weighted: Option<f64>) -> Option<String> {
    if raw.unwrap_or(0.0) != total {
        return Some("!!".to_string());
    }
    get_description(raw, weighted)
}

/// The sample sizes of one category of a metric.
#[derive(PartialEq, Debug, Clone)]
pub struct CategorySampleSize {
    pub metric_name: String,
    pub instance_name: String,
    pub instance_id: i64,
    pub raw_sample_size: f64,
    /// Respondents of the category that fall in a quota cell of the scheme.
    pub sample_size_by_quota: f64,
}

/// A row of the respondent weights report.
#[derive(PartialEq, Debug, Clone)]
pub struct SampleSizeReportRow {
    pub metric_name: String,
    pub instance_name: String,
    pub instance_id: Option<i64>,
    pub sample_size: Option<f64>,
    pub sample_size_by_quota: Option<f64>,
    pub description: Option<String>,
}

fn in_scope<'a>(
    respondents: &'a [Respondent],
    filters: &'a [WeightingFilterInstance],
) -> impl Iterator<Item = &'a Respondent> {
    respondents
        .iter()
        .filter(move |r| !r.archived && r.matches(filters))
}

/// Number of respondents of the subset, optionally restricted by filters.
pub fn rim_total_sample_size(respondents: &[Respondent], filters: &[WeightingFilterInstance]) -> f64 {
    in_scope(respondents, filters).count() as f64
}

/// Sample sizes of every category of a metric. The categories are the ones
/// of the scheme when the metric is a dimension of it, otherwise the answers
/// found in the sample.
pub fn metric_sample_sizes(
    metric: &str,
    plans: &[WeightingPlanConfiguration],
    respondents: &[Respondent],
    instance_name: &dyn Fn(&str, i64) -> Option<String>,
) -> Vec<CategorySampleSize> {
    let dimensions = plan_dimensions(plans);
    let cell_keys: HashSet<String> = plan_quota_cells(plans)
        .iter()
        .map(|(c, _)| c.key())
        .collect();

    let categories: Vec<i64> = match find_plan(plans, metric) {
        Some(p) => p.child_targets.iter().map(|t| t.entity_instance_id).collect(),
        None => in_scope(respondents, &[])
            .filter_map(|r| r.answer(metric))
            .collect::<BTreeSet<i64>>()
            .into_iter()
            .collect(),
    };

    categories
        .into_iter()
        .map(|id| {
            let in_category: Vec<&Respondent> = in_scope(respondents, &[])
                .filter(|r| r.answer(metric) == Some(id))
                .collect();
            let by_quota = in_category
                .iter()
                .filter(|r| {
                    let c = r.quota_cell_for(&dimensions);
                    !c.is_unweighted() && cell_keys.contains(&c.key())
                })
                .count();
            CategorySampleSize {
                metric_name: metric.to_string(),
                instance_name: instance_name(metric, id).unwrap_or_else(|| id.to_string()),
                instance_id: id,
                raw_sample_size: in_category.len() as f64,
                sample_size_by_quota: by_quota as f64,
            }
        })
        .collect()
}

fn find_plan<'a>(
    plans: &'a [WeightingPlanConfiguration],
    variable: &str,
) -> Option<&'a WeightingPlanConfiguration> {
    for p in plans {
        if p.variable_identifier == variable {
            return Some(p);
        }
        for t in p.child_targets.iter() {
            if let Some(found) = find_plan(&t.child_plans, variable) {
                return Some(found);
            }
        }
    }
    None
}

/// Assembles the report: the categories of each metric, a total and a blank
/// line for metrics with more than one category, and the total number of
/// respondents at the end.
pub fn respondent_weights_report(
    metrics: &[Vec<CategorySampleSize>],
    total: f64,
) -> Vec<SampleSizeReportRow> {
    let mut res: Vec<SampleSizeReportRow> = Vec::new();
    for rows in metrics {
        for r in rows {
            res.push(SampleSizeReportRow {
                metric_name: r.metric_name.clone(),
                instance_name: r.instance_name.clone(),
                instance_id: Some(r.instance_id),
                sample_size: Some(r.raw_sample_size),
                sample_size_by_quota: Some(r.sample_size_by_quota),
                description: get_description(Some(r.raw_sample_size), Some(r.sample_size_by_quota)),
            });
        }
        if rows.len() > 1 {
            let raw: f64 = rows.iter().map(|r| r.raw_sample_size).sum();
            let by_quota: f64 = rows.iter().map(|r| r.sample_size_by_quota).sum();
            res.push(SampleSizeReportRow {
                metric_name: rows[0].metric_name.clone(),
                instance_name: "Total".to_string(),
                instance_id: None,
                sample_size: Some(raw),
                sample_size_by_quota: Some(by_quota),
                description: get_total_description(total, Some(raw), Some(by_quota)),
            });
            res.push(SampleSizeReportRow {
                metric_name: String::new(),
                instance_name: String::new(),
                instance_id: None,
                sample_size: None,
                sample_size_by_quota: None,
                description: None,
            });
        }
    }
    res.push(SampleSizeReportRow {
        metric_name: "Total respondents".to_string(),
        instance_name: String::new(),
        instance_id: None,
        sample_size: Some(total),
        sample_size_by_quota: None,
        description: None,
    });
    res
}

#[derive(PartialEq, Debug, Clone)]
pub struct RimCategorySampleSize {
    pub instance_id: i64,
    pub sample_size: f64,
    pub target: Option<f64>,
    /// The sample size the category should have once weighted.
    pub target_sample_size: f64,
}

#[derive(PartialEq, Debug, Clone)]
pub struct RimDimensionSampleSize {
    pub dimension: String,
    pub categories: Vec<RimCategorySampleSize>,
}

fn require_rim(plans: &[WeightingPlanConfiguration]) -> Result<(), WeightingErrors> {
    if are_all_plans_rim(plans) {
        Ok(())
    } else {
        Err(WeightingErrors::UnsupportedConfiguration(
            "Sample sizes by dimension are only available for rim weighting plans".to_string(),
        ))
    }
}

/// Raw and target sample sizes for each category of each rim dimension.
///
/// Categories without a target keep their raw sample size, and the targets of
/// the other categories apply to what is left of the sample.
pub fn rim_dimension_sample_sizes(
    plans: &[WeightingPlanConfiguration],
    respondents: &[Respondent],
    filters: &[WeightingFilterInstance],
) -> Result<Vec<RimDimensionSampleSize>, WeightingErrors> {
    require_rim(plans)?;
    let total = rim_total_sample_size(respondents, filters);
    let mut res: Vec<RimDimensionSampleSize> = Vec::new();
    for p in plans {
        let sample_of = |id: i64| -> f64 {
            in_scope(respondents, filters)
                .filter(|r| r.answer(&p.variable_identifier) == Some(id))
                .count() as f64
        };
        let untargeted: f64 = p
            .child_targets
            .iter()
            .filter(|t| t.target.is_none())
            .map(|t| sample_of(t.entity_instance_id))
            .sum();
        let categories = p
            .child_targets
            .iter()
            .map(|t| {
                let sample_size = sample_of(t.entity_instance_id);
                RimCategorySampleSize {
                    instance_id: t.entity_instance_id,
                    sample_size,
                    target: t.target,
                    target_sample_size: match t.target {
                        Some(x) => x * (total - untargeted),
                        None => sample_size,
                    },
                }
            })
            .collect();
        res.push(RimDimensionSampleSize {
            dimension: p.variable_identifier.clone(),
            categories,
        });
    }
    Ok(res)
}

/// Runs the rim calculator on the current sample, to check that a scheme
/// converges and to see the weights it produces.
pub fn validate_rim_weighting_scheme(
    plans: &[WeightingPlanConfiguration],
    respondents: &[Respondent],
    filters: &[WeightingFilterInstance],
    calculator: &dyn RimWeightingCalculator,
    include_quota_details: bool,
) -> Result<RimWeightingCalculationResult, WeightingErrors> {
    let dimension_sizes = rim_dimension_sample_sizes(plans, respondents, filters)?;
    for p in plans {
        let sum: f64 = p.child_targets.iter().filter_map(|t| t.target).sum();
        if sum > 1.0 + POINT_TOLERANCE {
            return Err(WeightingErrors::InvalidPlan(format!(
                "Targets of {} sum to {}",
                p.variable_identifier, sum
            )));
        }
    }
    let dimensions: Vec<RimDimensionTargets> = dimension_sizes
        .iter()
        .map(|d| RimDimensionTargets {
            name: d.dimension.clone(),
            category_targets: d
                .categories
                .iter()
                .map(|c| (c.instance_id, c.target_sample_size))
                .collect(),
        })
        .collect();

    let dimension_names = plan_dimensions(plans);
    let cells: Vec<(QuotaCell, f64)> = plan_quota_cells(plans)
        .into_iter()
        .map(|(c, _)| {
            let key = c.key();
            let n = in_scope(respondents, filters)
                .filter(|r| r.quota_cell_for(&dimension_names).key() == key)
                .count();
            (c, n as f64)
        })
        .collect();
    debug!("validate_rim_weighting_scheme: cells: {:?}", cells);
    Ok(calculator.calculate(&cells, &dimensions, include_quota_details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn description_null_iff_equal() {
        assert_eq!(get_description(Some(10.0), Some(10.0)), None);
        assert_eq!(get_description(None, Some(3.0)), None);
        assert_eq!(get_description(Some(3.0), None), None);
        assert_eq!(get_description(Some(10.0), Some(7.0)), Some("!3".to_string()));
        assert_eq!(get_description(Some(7.0), Some(10.0)), Some("!-3".to_string()));
    }

    #[test]
    fn description_missing_quota_cell() {
        assert_eq!(
            get_description(Some(12.0), Some(0.0)),
            Some("!12 -  Missing quota cell".to_string())
        );
        assert_eq!(get_description(Some(0.0), Some(0.0)), None);
    }

    #[test]
    fn total_description_flags_mismatched_totals() {
        assert_eq!(get_total_description(100.0, Some(99.0), Some(99.0)), Some("!!".to_string()));
        assert_eq!(get_total_description(100.0, Some(99.0), Some(0.0)), Some("!!".to_string()));
        assert_eq!(get_total_description(100.0, None, None), Some("!!".to_string()));
        assert_eq!(get_total_description(0.0, None, None), None);
        assert_eq!(get_total_description(100.0, Some(100.0), Some(100.0)), None);
        assert_eq!(
            get_total_description(100.0, Some(100.0), Some(90.0)),
            Some("!10".to_string())
        );
    }

    fn respondent(id: i64, gender: i64, age: Option<i64>) -> Respondent {
        let mut answers = BTreeMap::new();
        answers.insert("Gender".to_string(), gender);
        if let Some(a) = age {
            answers.insert("Age".to_string(), a);
        }
        Respondent {
            response_id: id,
            subset_id: "UK".to_string(),
            archived: false,
            completed_date: None,
            answers,
        }
    }

    fn plans() -> Vec<WeightingPlanConfiguration> {
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
                    WeightingTargetConfiguration::leaf(1, Some(0.6)),
                    WeightingTargetConfiguration::leaf(2, None),
                ],
            ),
        ]
    }

    fn sample() -> Vec<Respondent> {
        vec![
            respondent(1, 1, Some(1)),
            respondent(2, 1, Some(2)),
            respondent(3, 2, Some(1)),
            respondent(4, 2, Some(1)),
            respondent(5, 2, None),
        ]
    }

    #[test]
    fn report_rows() {
        let names = |_: &str, id: i64| -> Option<String> {
            match id {
                1 => Some("Male".to_string()),
                2 => Some("Female".to_string()),
                _ => None,
            }
        };
        let gender = metric_sample_sizes("Gender", &plans(), &sample(), &names);
        assert_eq!(gender[0].instance_name, "Male");
        assert_eq!(gender[1].raw_sample_size, 3.0);
        // Respondent 5 has no age, so no quota cell.
        assert_eq!(gender[1].sample_size_by_quota, 2.0);

        let total = rim_total_sample_size(&sample(), &[]);
        let rows = respondent_weights_report(&[gender], total);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].description, None);
        assert_eq!(rows[1].description, Some("!1".to_string()));
        assert_eq!(rows[2].instance_name, "Total");
        assert_eq!(rows[2].description, Some("!1".to_string()));
        assert_eq!(rows[3].metric_name, "");
        assert_eq!(rows[4].metric_name, "Total respondents");
        assert_eq!(rows[4].sample_size, Some(5.0));
    }

    #[test]
    fn dimension_sample_sizes() {
        let dims = rim_dimension_sample_sizes(&plans(), &sample(), &[]).unwrap();
        assert_eq!(dims[0].categories[1].target_sample_size, 2.5);
        // 1 respondent aged 2, without target, out of 5.
        assert_eq!(dims[1].categories[0].target_sample_size, 0.6 * 4.0);
        assert_eq!(dims[1].categories[1].target_sample_size, 1.0);

        let filtered = rim_dimension_sample_sizes(
            &plans(),
            &sample(),
            &[WeightingFilterInstance::new("Gender", Some(2))],
        )
        .unwrap();
        assert_eq!(filtered[0].categories[0].sample_size, 0.0);
        assert_eq!(filtered[0].categories[1].sample_size, 3.0);
    }

    #[test]
    fn only_rim_plans_have_dimension_sample_sizes() {
        let nested = vec![WeightingPlanConfiguration::new(
            "Gender",
            vec![WeightingTargetConfiguration {
                entity_instance_id: 1,
                target: None,
                target_population: None,
                child_plans: plans(),
            }],
        )];
        assert!(matches!(
            rim_dimension_sample_sizes(&nested, &sample(), &[]),
            Err(WeightingErrors::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn scheme_validation_runs_the_calculator() {
        let mut scheme = plans();
        scheme[1].child_targets[0].target = Some(1.0);
        let everyone_aged: Vec<Respondent> = sample()
            .into_iter()
            .filter(|r| r.answer("Age").is_some())
            .collect();
        let res = validate_rim_weighting_scheme(
            &scheme,
            &everyone_aged,
            &[],
            &IterativeRimCalculator::default(),
            true,
        )
        .unwrap();
        assert!(res.converged);
        assert_eq!(res.quota_details.unwrap().len(), 4);

        scheme[0].child_targets[0].target = Some(0.9);
        assert!(matches!(
            validate_rim_weighting_scheme(
                &scheme,
                &everyone_aged,
                &[],
                &IterativeRimCalculator::default(),
                false
            ),
            Err(WeightingErrors::InvalidPlan(_))
        ));
    }
}
