//! Reconciliation of uploaded response weights with the respondents of a
//! subset.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::config::*;
use crate::repository::*;

/// The weight given to an expected respondent without a usable weight.
pub const DEFAULT_RESPONSE_WEIGHT: f64 = 1.0;

/// Relative gap allowed between the total weight and the number of responses.
const TOTAL_WEIGHT_TOLERANCE: f64 = 0.01;

pub const INVALID_WEIGHT_ACTION: &str = "Specify a valid response weight";

/// What was written by a push.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct PushOutcome {
    pub rows_written: usize,
    /// Respondents that received the default weight.
    pub defaulted: usize,
    /// Targets added to the plans to reach the filter context.
    pub targets_created: usize,
}

/// Compares uploaded weights with the respondents expected for a subset and
/// persists them.
pub struct ReconciliationEngine {
    respondents: Arc<dyn RespondentSource>,
    plans: Arc<dyn WeightingPlanRepository>,
    weights: Arc<dyn ResponseWeightingRepository>,
    invalidation: Arc<dyn CacheInvalidation>,
    bounds: WeightBounds,
}

impl ReconciliationEngine {
    pub fn new(
        respondents: Arc<dyn RespondentSource>,
        plans: Arc<dyn WeightingPlanRepository>,
        weights: Arc<dyn ResponseWeightingRepository>,
        invalidation: Arc<dyn CacheInvalidation>,
    ) -> ReconciliationEngine {
        ReconciliationEngine {
            respondents,
            plans,
            weights,
            invalidation,
            bounds: WeightBounds::DEFAULT,
        }
    }

    pub fn with_bounds(self, bounds: WeightBounds) -> ReconciliationEngine {
        ReconciliationEngine { bounds, ..self }
    }

    pub fn bounds(&self) -> &WeightBounds {
        &self.bounds
    }

    /// The respondents that must receive a weight: not archived, and matching
    /// the filter context.
    pub fn expected_respondents(
        &self,
        subset_id: &str,
        context: &[WeightingFilterInstance],
    ) -> Vec<Respondent> {
        self.respondents
            .respondents_for_subset(subset_id)
            .into_iter()
            .filter(|r| !r.archived && r.matches(context))
            .collect()
    }

    /// Classifies each weight as valid or extra, and lists the expected
    /// respondents missing from the weights.
    ///
    /// All the fields filled by a validation are recomputed, so validating
    /// twice gives the same statistics. Messages from reading the file are
    /// kept.
    pub fn validate(
        &self,
        weights: &[RespondentWeightRow],
        scope: &PlanScope,
        context: &[WeightingFilterInstance],
        statistics: &mut ValidationStatistics,
        cancellation: &CancellationToken,
    ) -> Result<(), WeightingErrors> {
        cancellation.check()?;
        let mut messages: Vec<ValidationMessage> = statistics
            .messages
            .iter()
            .filter(|m| m.message_type.is_file_message())
            .cloned()
            .collect();

        let subset_problem = match self.respondents.get_subset(&scope.subset_id) {
            None => Some(format!("Survey segment {} does not exist", scope.subset_id)),
            Some(s) if s.disabled => Some(format!("Survey segment {} is disabled", s.display_name)),
            Some(_) => None,
        };
        if let Some(text) = subset_problem {
            warn!("validate: {}", text);
            messages.push(ValidationMessage {
                message_type: ValidationMessageType::SurveySegmentNotValid,
                text,
            });
            reset_validation(statistics, &scope.subset_id, messages);
            return Ok(());
        }

        let in_subset: HashMap<i64, Respondent> = self
            .respondents
            .respondents_for_subset(&scope.subset_id)
            .into_iter()
            .map(|r| (r.response_id, r))
            .collect();
        let expected = self.expected_respondents(&scope.subset_id, context);
        let expected_ids: HashSet<i64> = expected.iter().map(|r| r.response_id).collect();
        debug!(
            "validate: subset {}: {} respondents, {} expected",
            scope.subset_id,
            in_subset.len(),
            expected.len()
        );

        // Rows the parser rejected are still rows of the file.
        let file_rows: Vec<(i64, f64)> = weights
            .iter()
            .map(|r| (r.response_id, r.weight))
            .chain(
                statistics
                    .rejected_in_file
                    .iter()
                    .map(|e| (e.response_id, e.weight)),
            )
            .collect();

        let mut valid: Vec<RespondentWeightRow> = Vec::new();
        let mut extras: Vec<ExtraResponseWeight> = Vec::new();
        let mut invalid_weights: HashMap<i64, f64> = HashMap::new();
        let mut occurrences: HashMap<i64, usize> = HashMap::new();
        for (response_id, weight) in file_rows.iter().copied() {
            *occurrences.entry(response_id).or_insert(0) += 1;
            if !expected_ids.contains(&response_id) {
                let reason = self.unexpected_reason(response_id, &in_subset);
                debug!("validate: response {}: {:?}", response_id, reason);
                extras.push(ExtraResponseWeight {
                    response_id,
                    weight,
                    reason,
                });
                continue;
            }
            if !is_usable_weight(weight) {
                invalid_weights.entry(response_id).or_insert(weight);
            }
            match self.bounds.check(weight) {
                Some(reason) => extras.push(ExtraResponseWeight {
                    response_id,
                    weight,
                    reason,
                }),
                None => valid.push(RespondentWeightRow::new(response_id, weight)),
            }
        }

        let mut reported: HashSet<i64> = HashSet::new();
        for (response_id, _) in file_rows.iter() {
            let n = occurrences.get(response_id).cloned().unwrap_or(0);
            if n > 1 && reported.insert(*response_id) {
                messages.push(ValidationMessage {
                    message_type: ValidationMessageType::DuplicateResponse,
                    text: format!("ResponseId {} appears {} times in upload", response_id, n),
                });
            }
        }

        let errors: Vec<InvalidResponseWeight> = expected
            .iter()
            .filter_map(|r| match invalid_weights.get(&r.response_id) {
                Some(w) => Some(InvalidResponseWeight {
                    response_id: r.response_id,
                    weight: *w,
                    reason: InvalidResponseReason::IdInvalidWeight,
                }),
                None if !occurrences.contains_key(&r.response_id) => Some(InvalidResponseWeight {
                    response_id: r.response_id,
                    weight: DEFAULT_RESPONSE_WEIGHT,
                    reason: InvalidResponseReason::IdMissingFromUpload,
                }),
                None => None,
            })
            .collect();

        let matched = occurrences
            .keys()
            .filter(|id| expected_ids.contains(id))
            .count();

        let min_weight = valid.iter().map(|r| r.weight).reduce(f64::min);
        let max_weight = valid.iter().map(|r| r.weight).reduce(f64::max);
        // The weights a push would store.
        let first_valid = first_weights(&valid);
        let total_weight: f64 = expected
            .iter()
            .map(|r| {
                first_valid
                    .get(&r.response_id)
                    .cloned()
                    .unwrap_or(DEFAULT_RESPONSE_WEIGHT)
            })
            .sum();
        let n = expected.len() as f64;
        if n > 0.0 && (total_weight - n).abs() > TOTAL_WEIGHT_TOLERANCE * n {
            messages.push(ValidationMessage {
                message_type: ValidationMessageType::DifferenceTooGreat,
                text: format!(
                    "Total weight {} is more than 1% greater than number of responses {}",
                    total_weight,
                    expected.len()
                ),
            });
        }

        // Nothing is written to the statistics before this point.
        cancellation.check()?;

        reset_validation(statistics, &scope.subset_id, messages);
        statistics.is_valid = !statistics.has_fatal_message() && errors.is_empty();
        statistics.valid_weights = valid;
        statistics.extra_responses_in_excel = extras;
        statistics.error_responses_for_this_survey_and_wave = errors;
        statistics.min_weight = min_weight;
        statistics.max_weight = max_weight;
        statistics.number_of_responses_matched = matched;
        statistics.number_of_responses_in_database_for_this_survey_and_wave = expected.len();
        info!(
            "validate: subset {}: valid: {} extra: {} missing: {}",
            scope.subset_id,
            statistics.valid_weights.len(),
            statistics.extra_responses_in_excel.len(),
            statistics.error_responses_for_this_survey_and_wave.len()
        );
        Ok(())
    }

    fn unexpected_reason(
        &self,
        response_id: i64,
        in_subset: &HashMap<i64, Respondent>,
    ) -> ExtraResponseReason {
        match in_subset.get(&response_id) {
            Some(r) if r.archived => ExtraResponseReason::IdArchived,
            Some(_) => ExtraResponseReason::IdFoundInAlternativeWave,
            None => match self.respondents.find_respondent(response_id) {
                Some(_) => ExtraResponseReason::IdNotFoundInSurvey,
                None => ExtraResponseReason::IdNonExistent,
            },
        }
    }

    /// Stores a weight for every expected respondent of the subset.
    ///
    /// The weights are validated again first. Respondents without a valid
    /// weight get the default weight. Nothing is written if the validation
    /// fails or if the operation is cancelled before the commit. After a
    /// successful commit the product's cache entry is invalidated.
    pub fn push_into_database(
        &self,
        weights: &[RespondentWeightRow],
        scope: &PlanScope,
        context: &[WeightingFilterInstance],
        cancellation: &CancellationToken,
    ) -> Result<PushOutcome, WeightingErrors> {
        let mut statistics = ValidationStatistics::new("", &scope.subset_id);
        self.validate(weights, scope, context, &mut statistics, cancellation)?;
        if let Some(m) = statistics
            .messages
            .iter()
            .find(|m| m.message_type.is_fatal())
        {
            return Err(WeightingErrors::InvalidStatistics(m.text.clone()));
        }

        let first_valid = first_weights(&statistics.valid_weights);
        let mut defaulted = 0;
        let rows: Vec<RespondentWeightRow> = self
            .expected_respondents(&scope.subset_id, context)
            .iter()
            .map(|r| match first_valid.get(&r.response_id) {
                Some(w) => RespondentWeightRow::new(r.response_id, *w),
                None => {
                    defaulted += 1;
                    RespondentWeightRow::new(r.response_id, DEFAULT_RESPONSE_WEIGHT)
                }
            })
            .collect();
        if defaulted > 0 {
            warn!(
                "push_into_database: subset {}: {} respondents get the default weight",
                scope.subset_id, defaulted
            );
        }

        let previous_plans = self.plans.get_weighting_plans_for_subset(scope)?;
        let mut new_plans = previous_plans.clone();
        let targets_created = ensure_filter_path(&mut new_plans, context, &scope.subset_id)?;

        cancellation.check()?;

        if targets_created > 0 {
            self.plans.update_weighting_plan_for_subset(scope, &new_plans)?;
        }
        let written = if context.is_empty() {
            self.weights.create_response_weights_for_root(scope, &rows)
        } else {
            self.weights.create_response_weights(scope, context, &rows)
        };
        if let Err(e) = written {
            if targets_created > 0 {
                if let Err(e2) = self
                    .plans
                    .update_weighting_plan_for_subset(scope, &previous_plans)
                {
                    warn!(
                        "push_into_database: subset {}: could not restore plans: {}",
                        scope.subset_id, e2
                    );
                }
            }
            return Err(e);
        }
        self.invalidation.invalidate_cache_entry(&scope.product);
        info!(
            "push_into_database: subset {}: wrote {} weights",
            scope.subset_id,
            rows.len()
        );
        Ok(PushOutcome {
            rows_written: rows.len(),
            defaulted,
            targets_created,
        })
    }
}

/// The first weight of each response id.
fn first_weights(rows: &[RespondentWeightRow]) -> HashMap<i64, f64> {
    let mut res: HashMap<i64, f64> = HashMap::new();
    for r in rows {
        res.entry(r.response_id).or_insert(r.weight);
    }
    res
}

fn reset_validation(
    statistics: &mut ValidationStatistics,
    subset_id: &str,
    messages: Vec<ValidationMessage>,
) {
    statistics.subset_id = subset_id.to_string();
    statistics.messages = messages;
    statistics.is_valid = false;
    statistics.valid_weights = Vec::new();
    statistics.extra_responses_in_excel = Vec::new();
    statistics.error_responses_for_this_survey_and_wave = Vec::new();
    statistics.min_weight = None;
    statistics.max_weight = None;
    statistics.number_of_responses_matched = 0;
    statistics.number_of_responses_in_database_for_this_survey_and_wave = 0;
}

/// Adds the plans and targets needed for the filter context to exist in the
/// scheme. Returns the number of targets added.
pub fn ensure_filter_path(
    plans: &mut Vec<WeightingPlanConfiguration>,
    context: &[WeightingFilterInstance],
    subset_id: &str,
) -> Result<usize, WeightingErrors> {
    let mut created = 0;
    let mut level: &mut Vec<WeightingPlanConfiguration> = plans;
    for (depth, f) in context.iter().enumerate() {
        let path_error = || {
            WeightingErrors::PlanPath(format!(
                "Could not create a target for FilterMetricName: {}, instance id: {} in subset {}",
                f.filter_metric_name,
                f.filter_instance_id
                    .map(|i| i.to_string())
                    .unwrap_or_else(|| "null".to_string()),
                subset_id
            ))
        };
        let instance_id = f.filter_instance_id.ok_or_else(path_error)?;
        let current = level;
        let plan_idx = match current
            .iter()
            .position(|p| p.variable_identifier == f.filter_metric_name)
        {
            Some(idx) => idx,
            None if current.is_empty() => {
                current.push(WeightingPlanConfiguration {
                    variable_identifier: f.filter_metric_name.clone(),
                    is_weighting_group_root: depth == 0,
                    child_targets: Vec::new(),
                });
                0
            }
            None => return Err(path_error()),
        };
        let plan = &mut current[plan_idx];
        let target_idx = match plan
            .child_targets
            .iter()
            .position(|t| t.entity_instance_id == instance_id)
        {
            Some(idx) => idx,
            None => {
                debug!(
                    "ensure_filter_path: adding target {}={} in subset {}",
                    f.filter_metric_name, instance_id, subset_id
                );
                plan.child_targets
                    .push(WeightingTargetConfiguration::leaf(instance_id, None));
                created += 1;
                plan.child_targets.len() - 1
            }
        };
        level = &mut plan.child_targets[target_idx].child_plans;
    }
    Ok(created)
}

/// How a row of the error report is highlighted.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ReportHighlight {
    None,
    /// The weight cell needs a value.
    InvalidWeight,
    OutOfBounds,
    /// Any other problem.
    Anomaly,
}

#[derive(PartialEq, Debug, Clone)]
pub struct ErrorReportRow {
    pub response_id: i64,
    pub weight: f64,
    pub reason: String,
    pub action: String,
    pub highlight: ReportHighlight,
}

/// The rows of the downloadable error report.
///
/// Expected respondents without a weight come first. Then every row of the
/// file, grouped by response id. A response with several problems reports all
/// their descriptions and the action of the most severe one.
pub fn error_report_rows(
    statistics: &ValidationStatistics,
    bounds: &WeightBounds,
) -> Vec<ErrorReportRow> {
    let mut res: Vec<ErrorReportRow> = statistics
        .error_responses_for_this_survey_and_wave
        .iter()
        .map(|e| ErrorReportRow {
            response_id: e.response_id,
            weight: e.weight,
            reason: e.reason.description(e.response_id, e.weight),
            action: INVALID_WEIGHT_ACTION.to_string(),
            highlight: ReportHighlight::InvalidWeight,
        })
        .collect();

    let mut problems: HashMap<i64, Vec<ExtraResponseReason>> = HashMap::new();
    for e in statistics.extra_responses_in_excel.iter() {
        problems.entry(e.response_id).or_default().push(e.reason);
    }

    let mut file_rows: Vec<(i64, f64)> = statistics
        .valid_weights
        .iter()
        .map(|r| (r.response_id, r.weight))
        .chain(
            statistics
                .extra_responses_in_excel
                .iter()
                .map(|e| (e.response_id, e.weight)),
        )
        .collect();
    file_rows.sort_by_key(|(id, _)| *id);

    for (response_id, weight) in file_rows {
        let row = match problems.get(&response_id) {
            Some(reasons) if !reasons.is_empty() => {
                let mut descriptions: Vec<String> = Vec::new();
                for r in reasons.iter() {
                    let d = r.description(response_id);
                    if !descriptions.contains(&d) {
                        descriptions.push(d);
                    }
                }
                let top = reasons.iter().max().cloned().unwrap_or(reasons[0]);
                ErrorReportRow {
                    response_id,
                    weight,
                    reason: descriptions.join(","),
                    action: top.action(bounds),
                    highlight: if top.is_out_of_bounds() {
                        ReportHighlight::OutOfBounds
                    } else {
                        ReportHighlight::Anomaly
                    },
                }
            }
            _ => ErrorReportRow {
                response_id,
                weight,
                reason: String::new(),
                action: String::new(),
                highlight: ReportHighlight::None,
            },
        };
        res.push(row);
    }
    res
}
