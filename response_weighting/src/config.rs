// ********* Input data structures ***********

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Display;

/// Separator between the category ids that make up the key of a quota cell.
pub const PART_SEPARATOR: &str = ":";

/// The key of the quota cell that gathers all the respondents not covered by
/// a weighting scheme.
pub const UNWEIGHTED_CELL_KEY: &str = "-";

/// A product (a survey and one of its sub products). Cache entries are scoped
/// at this level.
#[derive(Eq, PartialEq, Debug, Clone, Hash, PartialOrd, Ord)]
pub struct ProductKey {
    pub short_code: String,
    pub sub_product_id: Option<String>,
}

impl ProductKey {
    pub fn new(short_code: &str, sub_product_id: Option<&str>) -> ProductKey {
        ProductKey {
            short_code: short_code.to_string(),
            sub_product_id: sub_product_id.map(|s| s.to_string()),
        }
    }
}

/// The scope of a weighting plan: one subset of one product.
#[derive(Eq, PartialEq, Debug, Clone, Hash, PartialOrd, Ord)]
pub struct PlanScope {
    pub product: ProductKey,
    pub subset_id: String,
}

impl PlanScope {
    pub fn new(product: &ProductKey, subset_id: &str) -> PlanScope {
        PlanScope {
            product: product.clone(),
            subset_id: subset_id.to_string(),
        }
    }
}

/// A survey segment.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Subset {
    pub id: String,
    pub display_name: String,
    pub disabled: bool,
}

/// A stratum of respondents, described by the category they fall in for each
/// of the weighting dimensions.
///
/// The order of the parts is the order of the dimensions in the plan. Two
/// cells with the same categories in a different order are different cells.
#[derive(Eq, PartialEq, Debug, Clone, Hash, PartialOrd, Ord)]
pub struct QuotaCell {
    parts: Vec<(String, i64)>,
}

impl QuotaCell {
    pub fn new(parts: Vec<(String, i64)>) -> QuotaCell {
        QuotaCell { parts }
    }

    /// The cell of the respondents that no weighting scheme applies to.
    pub fn unweighted() -> QuotaCell {
        QuotaCell { parts: Vec::new() }
    }

    pub fn is_unweighted(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[(String, i64)] {
        &self.parts
    }

    /// The category ids joined with `:`, or `-` for the unweighted cell.
    pub fn key(&self) -> String {
        if self.parts.is_empty() {
            return UNWEIGHTED_CELL_KEY.to_string();
        }
        generate_key(self.parts.iter().map(|(_, id)| *id))
    }

    pub fn key_part_for(&self, dimension: &str) -> Option<i64> {
        self.parts
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, id)| *id)
    }

    /// A new cell with one more part appended at the end.
    pub fn with_part(&self, dimension: &str, category: i64) -> QuotaCell {
        let mut parts = self.parts.clone();
        parts.push((dimension.to_string(), category));
        QuotaCell { parts }
    }
}

impl Display for QuotaCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

pub fn generate_key<I: IntoIterator<Item = i64>>(ids: I) -> String {
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<String>>()
        .join(PART_SEPARATOR)
}

/// Narrows the respondents in scope to the ones that gave a given answer to a
/// filter metric. Without an instance id, the filter only names the metric.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct WeightingFilterInstance {
    pub filter_metric_name: String,
    pub filter_instance_id: Option<i64>,
}

impl WeightingFilterInstance {
    pub fn new(filter_metric_name: &str, filter_instance_id: Option<i64>) -> WeightingFilterInstance {
        WeightingFilterInstance {
            filter_metric_name: filter_metric_name.to_string(),
            filter_instance_id,
        }
    }
}

/// A respondent, as loaded for a subset.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Respondent {
    pub response_id: i64,
    pub subset_id: String,
    pub archived: bool,
    /// ISO date (`yyyy-mm-dd`) at which the survey was completed.
    pub completed_date: Option<String>,
    /// Answer (entity instance id) given to each metric.
    pub answers: BTreeMap<String, i64>,
}

impl Respondent {
    pub fn answer(&self, metric: &str) -> Option<i64> {
        self.answers.get(metric).cloned()
    }

    /// True if the respondent gave the expected answer for every filter of
    /// the context that names an instance.
    pub fn matches(&self, context: &[WeightingFilterInstance]) -> bool {
        context.iter().all(|f| match f.filter_instance_id {
            Some(id) => self.answer(&f.filter_metric_name) == Some(id),
            None => true,
        })
    }

    /// The cell of this respondent for the given dimensions. A respondent who
    /// did not answer one of the dimensions is not weighted.
    pub fn quota_cell_for(&self, dimensions: &[String]) -> QuotaCell {
        let mut parts: Vec<(String, i64)> = Vec::new();
        for d in dimensions {
            match self.answer(d) {
                Some(id) => parts.push((d.clone(), id)),
                None => return QuotaCell::unweighted(),
            }
        }
        QuotaCell::new(parts)
    }
}

/// A weight for a single response.
#[derive(PartialEq, Debug, Clone)]
pub struct RespondentWeightRow {
    pub response_id: i64,
    pub weight: f64,
    pub description: Option<String>,
}

impl RespondentWeightRow {
    pub fn new(response_id: i64, weight: f64) -> RespondentWeightRow {
        RespondentWeightRow {
            response_id,
            weight,
            description: None,
        }
    }
}

/// The way weights are produced for a subset.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum WeightingStyle {
    /// One weight per response, uploaded by an administrator.
    ResponseWeighting,
    Rim,
    Target,
    Expansion,
}

impl WeightingStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightingStyle::ResponseWeighting => "ResponseWeighting",
            WeightingStyle::Rim => "Rim",
            WeightingStyle::Target => "Target",
            WeightingStyle::Expansion => "Expansion",
        }
    }

    pub fn parse(s: &str) -> Option<WeightingStyle> {
        match s {
            "ResponseWeighting" => Some(WeightingStyle::ResponseWeighting),
            "Rim" => Some(WeightingStyle::Rim),
            "Target" => Some(WeightingStyle::Target),
            "Expansion" => Some(WeightingStyle::Expansion),
            _ => None,
        }
    }

    pub fn parse_ignore_case(s: &str) -> Option<WeightingStyle> {
        [
            WeightingStyle::ResponseWeighting,
            WeightingStyle::Rim,
            WeightingStyle::Target,
            WeightingStyle::Expansion,
        ]
        .into_iter()
        .find(|w| w.as_str().eq_ignore_ascii_case(s))
    }
}

// ******** Validation results *********

/// The kinds of messages attached to a validation.
///
/// The first five come from reading the file. The order is the order in which
/// they are reported.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum ValidationMessageType {
    ExcelInvalidFile,
    ExcelMissingFile,
    ExcelMissingData,
    ExcelIgnoringRow,
    ExcelMissingSheet,
    SurveySegmentNotValid,
    DifferenceTooGreat,
    DuplicateResponse,
}

impl ValidationMessageType {
    /// Messages produced while reading the file, as opposed to the ones
    /// produced when comparing the file with the survey.
    pub fn is_file_message(&self) -> bool {
        matches!(
            self,
            ValidationMessageType::ExcelInvalidFile
                | ValidationMessageType::ExcelMissingFile
                | ValidationMessageType::ExcelMissingData
                | ValidationMessageType::ExcelIgnoringRow
                | ValidationMessageType::ExcelMissingSheet
        )
    }

    /// Messages that make the whole upload unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ValidationMessageType::ExcelIgnoringRow
                | ValidationMessageType::DifferenceTooGreat
                | ValidationMessageType::DuplicateResponse
        )
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ValidationMessage {
    pub message_type: ValidationMessageType,
    pub text: String,
}

/// Why a response in the file was not accepted as a valid weight.
///
/// The declaration order is the severity order: when a response has several
/// problems, the greatest one is the one reported.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum ExtraResponseReason {
    IdArchived,
    IdWeightTooSmall,
    IdWeightTooLarge,
    IdFoundInAlternativeWave,
    IdNotFoundInSurvey,
    IdNonExistent,
}

impl ExtraResponseReason {
    pub fn description(&self, response_id: i64) -> String {
        match self {
            ExtraResponseReason::IdArchived => {
                format!("ResponseId {} archived from survey", response_id)
            }
            ExtraResponseReason::IdFoundInAlternativeWave => {
                format!("ResponseId {} not found in wave", response_id)
            }
            ExtraResponseReason::IdNonExistent => {
                format!("ResponseId {} does not exist", response_id)
            }
            ExtraResponseReason::IdNotFoundInSurvey => {
                format!("ResponseId {} not found in survey", response_id)
            }
            ExtraResponseReason::IdWeightTooSmall | ExtraResponseReason::IdWeightTooLarge => {
                "Weight is outside recommended thresholds".to_string()
            }
        }
    }

    pub fn action(&self, bounds: &WeightBounds) -> String {
        match self {
            ExtraResponseReason::IdArchived => "No action required".to_string(),
            ExtraResponseReason::IdFoundInAlternativeWave
            | ExtraResponseReason::IdNonExistent
            | ExtraResponseReason::IdNotFoundInSurvey => {
                "No action required as response weight will be ignored".to_string()
            }
            ExtraResponseReason::IdWeightTooSmall | ExtraResponseReason::IdWeightTooLarge => {
                format!(
                    "Consider specifying weight in the range {} to {} (inclusive)",
                    format_bound(bounds.min),
                    format_bound(bounds.max)
                )
            }
        }
    }

    pub fn is_out_of_bounds(&self) -> bool {
        matches!(
            self,
            ExtraResponseReason::IdWeightTooSmall | ExtraResponseReason::IdWeightTooLarge
        )
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, PartialOrd, Ord)]
pub enum InvalidResponseReason {
    IdInvalidWeight,
    /// Expected for this subset and wave, but absent from the upload.
    IdMissingFromUpload,
}

impl InvalidResponseReason {
    pub fn description(&self, response_id: i64, weight: f64) -> String {
        match self {
            InvalidResponseReason::IdInvalidWeight if weight < 0.0 => {
                format!("Weight {} is invalid as it is less than zero", weight)
            }
            InvalidResponseReason::IdInvalidWeight => {
                format!("Weight {} is invalid as it is not a positive number", weight)
            }
            InvalidResponseReason::IdMissingFromUpload => {
                format!("ResponseId {} missing from upload", response_id)
            }
        }
    }
}

/// A response of the file that is not used as a weight.
#[derive(PartialEq, Debug, Clone)]
pub struct ExtraResponseWeight {
    pub response_id: i64,
    pub weight: f64,
    pub reason: ExtraResponseReason,
}

/// A response of the survey that does not get a usable weight from the file.
#[derive(PartialEq, Debug, Clone)]
pub struct InvalidResponseWeight {
    pub response_id: i64,
    pub weight: f64,
    pub reason: InvalidResponseReason,
}

/// Everything known about one uploaded file, for one subset.
///
/// The parser fills the file related fields, the validation fills the rest.
/// Validating again recomputes the validation fields from scratch.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct ValidationStatistics {
    pub excel_file_name: String,
    pub subset_id: String,
    pub created_unix_seconds: i64,
    pub number_of_rows: usize,
    pub number_of_bytes: usize,
    pub number_of_valid_rows_in_excel: usize,
    pub number_of_rows_in_excel_ignored: usize,
    pub is_valid: bool,
    pub messages: Vec<ValidationMessage>,
    /// Rows of the file that could never be a weight (zero or negative).
    pub rejected_in_file: Vec<ExtraResponseWeight>,
    pub extra_responses_in_excel: Vec<ExtraResponseWeight>,
    pub valid_weights: Vec<RespondentWeightRow>,
    pub error_responses_for_this_survey_and_wave: Vec<InvalidResponseWeight>,
    pub min_weight: Option<f64>,
    pub max_weight: Option<f64>,
    pub number_of_responses_matched: usize,
    pub number_of_responses_in_database_for_this_survey_and_wave: usize,
}

impl ValidationStatistics {
    pub fn new(excel_file_name: &str, subset_id: &str) -> ValidationStatistics {
        ValidationStatistics {
            excel_file_name: excel_file_name.to_string(),
            subset_id: subset_id.to_string(),
            ..Default::default()
        }
    }

    pub fn add_message(&mut self, message_type: ValidationMessageType, text: String) {
        self.messages.push(ValidationMessage { message_type, text });
    }

    pub fn has_fatal_message(&self) -> bool {
        self.messages.iter().any(|m| m.message_type.is_fatal())
    }

    pub fn has_message(&self, message_type: ValidationMessageType) -> bool {
        self.messages.iter().any(|m| m.message_type == message_type)
    }
}

// ********* Weighting plans **********

/// One level of a weighting scheme: a variable and the targets of each of its
/// categories.
#[derive(PartialEq, Debug, Clone)]
pub struct WeightingPlanConfiguration {
    pub variable_identifier: String,
    /// The root of a scheme that weights each of its categories (typically
    /// waves) independently.
    pub is_weighting_group_root: bool,
    pub child_targets: Vec<WeightingTargetConfiguration>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct WeightingTargetConfiguration {
    pub entity_instance_id: i64,
    /// Proportion of the population expected in this category.
    pub target: Option<f64>,
    pub target_population: Option<f64>,
    pub child_plans: Vec<WeightingPlanConfiguration>,
}

impl WeightingPlanConfiguration {
    pub fn new(variable_identifier: &str, child_targets: Vec<WeightingTargetConfiguration>) -> Self {
        WeightingPlanConfiguration {
            variable_identifier: variable_identifier.to_string(),
            is_weighting_group_root: false,
            child_targets,
        }
    }

    pub fn target_for(&self, entity_instance_id: i64) -> Option<&WeightingTargetConfiguration> {
        self.child_targets
            .iter()
            .find(|t| t.entity_instance_id == entity_instance_id)
    }

    fn is_leaf(&self) -> bool {
        self.child_targets.iter().all(|t| t.child_plans.is_empty())
    }
}

impl WeightingTargetConfiguration {
    pub fn leaf(entity_instance_id: i64, target: Option<f64>) -> Self {
        WeightingTargetConfiguration {
            entity_instance_id,
            target,
            target_population: None,
            child_plans: Vec::new(),
        }
    }
}

/// Sibling plans that each only hold category targets are weighted with the
/// rim algorithm.
pub fn are_all_plans_rim(plans: &[WeightingPlanConfiguration]) -> bool {
    !plans.is_empty()
        && plans
            .iter()
            .all(|p| !p.is_weighting_group_root && p.is_leaf())
}

/// A single tree of nested plans, whose leaves hold the target of each cell.
pub fn is_target_weighted(plans: &[WeightingPlanConfiguration]) -> bool {
    match plans {
        [p] => !p.is_weighting_group_root && !p.is_leaf(),
        _ => false,
    }
}

/// A single root plan whose categories are weighted independently.
pub fn is_wave_plan(plans: &[WeightingPlanConfiguration]) -> bool {
    matches!(plans, [p] if p.is_weighting_group_root)
}

/// The variables used by the plans, in plan order.
///
/// For nested plans, the first branch is followed.
pub fn plan_dimensions(plans: &[WeightingPlanConfiguration]) -> Vec<String> {
    if are_all_plans_rim(plans) {
        return plans.iter().map(|p| p.variable_identifier.clone()).collect();
    }
    let mut res: Vec<String> = Vec::new();
    let mut current = plans.first();
    while let Some(p) = current {
        res.push(p.variable_identifier.clone());
        current = p
            .child_targets
            .iter()
            .find_map(|t| t.child_plans.first());
    }
    res
}

/// All the cells a scheme can put respondents in, with the target weight of
/// the cell when it is known directly from the scheme.
pub fn plan_quota_cells(plans: &[WeightingPlanConfiguration]) -> Vec<(QuotaCell, Option<f64>)> {
    if are_all_plans_rim(plans) {
        let mut cells: Vec<QuotaCell> = vec![QuotaCell::new(Vec::new())];
        for p in plans {
            let mut next: Vec<QuotaCell> = Vec::new();
            for c in cells.iter() {
                for t in p.child_targets.iter() {
                    next.push(c.with_part(&p.variable_identifier, t.entity_instance_id));
                }
            }
            cells = next;
        }
        return cells.into_iter().map(|c| (c, None)).collect();
    }
    let mut res: Vec<(QuotaCell, Option<f64>)> = Vec::new();
    for p in plans {
        collect_nested_cells(p, &QuotaCell::new(Vec::new()), &mut res);
    }
    res
}

fn collect_nested_cells(
    plan: &WeightingPlanConfiguration,
    prefix: &QuotaCell,
    res: &mut Vec<(QuotaCell, Option<f64>)>,
) {
    for t in plan.child_targets.iter() {
        let cell = prefix.with_part(&plan.variable_identifier, t.entity_instance_id);
        if t.child_plans.is_empty() {
            res.push((cell, t.target));
        } else if are_all_plans_rim(&t.child_plans) {
            for (c, _) in plan_quota_cells(&t.child_plans) {
                let mut parts = cell.parts().to_vec();
                parts.extend(c.parts().iter().cloned());
                res.push((QuotaCell::new(parts), None));
            }
        } else {
            for child in t.child_plans.iter() {
                collect_nested_cells(child, &cell, res);
            }
        }
    }
}

// ********* Configuration **********

/// A weight can only be stored if it is a finite number above zero.
pub fn is_usable_weight(weight: f64) -> bool {
    weight.is_finite() && weight > 0.0
}

/// The inclusive range of weights that are accepted without a warning.
#[derive(PartialEq, Debug, Clone, Copy)]
pub struct WeightBounds {
    pub min: f64,
    pub max: f64,
}

impl WeightBounds {
    pub const DEFAULT: WeightBounds = WeightBounds { min: 0.2, max: 5.0 };

    pub fn new(min: f64, max: f64) -> Result<WeightBounds, WeightingErrors> {
        if !min.is_finite() || !max.is_finite() || min <= 0.0 || min > max {
            return Err(WeightingErrors::InvalidBounds { min, max });
        }
        Ok(WeightBounds { min, max })
    }

    /// The reason a weight would be rejected, if any. Weights that are not
    /// finite and positive are always rejected.
    pub fn check(&self, weight: f64) -> Option<ExtraResponseReason> {
        if weight == f64::INFINITY {
            Some(ExtraResponseReason::IdWeightTooLarge)
        } else if !is_usable_weight(weight) || weight < self.min {
            Some(ExtraResponseReason::IdWeightTooSmall)
        } else if weight > self.max {
            Some(ExtraResponseReason::IdWeightTooLarge)
        } else {
            None
        }
    }
}

impl Default for WeightBounds {
    fn default() -> Self {
        WeightBounds::DEFAULT
    }
}

// Whole numbers keep one decimal: 5 is shown as 5.0.
fn format_bound(x: f64) -> String {
    if x.fract() == 0.0 {
        format!("{:.1}", x)
    } else {
        format!("{}", x)
    }
}

/// Errors that prevent an operation from completing.
#[derive(PartialEq, Debug, Clone)]
pub enum WeightingErrors {
    UnknownSubset(String),
    /// The operation was cancelled before anything was committed.
    Cancelled,
    /// The statistics carry a fatal validation message.
    InvalidStatistics(String),
    /// The operation does not apply to this kind of product or plan.
    UnsupportedConfiguration(String),
    InvalidBounds {
        min: f64,
        max: f64,
    },
    InvalidPlan(String),
    PlanPath(String),
    Repository(String),
}

impl Error for WeightingErrors {}

impl Display for WeightingErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightingErrors::UnknownSubset(s) => write!(f, "Survey segment {} does not exist", s),
            WeightingErrors::Cancelled => write!(f, "Operation cancelled"),
            WeightingErrors::InvalidStatistics(s) => write!(f, "Validation failed: {}", s),
            WeightingErrors::UnsupportedConfiguration(s) => write!(f, "{}", s),
            WeightingErrors::InvalidBounds { min, max } => {
                write!(f, "Invalid weight bounds [{}, {}]", min, max)
            }
            WeightingErrors::InvalidPlan(s) => write!(f, "Invalid weighting plan: {}", s),
            WeightingErrors::PlanPath(s) => write!(f, "{}", s),
            WeightingErrors::Repository(s) => write!(f, "Repository error: {}", s),
        }
    }
}
