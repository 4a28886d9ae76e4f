//! The operations of the command line, on top of the stored files, plans and
//! weights of one product.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use response_weighting::reconcile::error_report_rows;
use response_weighting::repository::*;
use response_weighting::reversal::{
    reverse_scale_factors, GeneratedWeightings, SubsetPlans, SubsetReversal,
};
use response_weighting::rim::RimWeightingCalculationResult;
use response_weighting::sample_size::{self, metric_sample_sizes, rim_total_sample_size};

use crate::weights::config_reader::JobSettings;
use crate::weights::export::*;
use crate::weights::fanout::run_bounded;
use crate::weights::io_common::*;
use crate::weights::io_csv::{read_respondents_csv, read_target_weights_csv, read_weights_csv};
use crate::weights::io_excel::{generate_template, read_weights_xlsx, write_weights_xlsx};
use crate::weights::store::{JsonFileStore, LoggingInvalidation};
use crate::weights::*;

const UPLOADS_DIRECTORY: &str = "uploads";

pub const MAP_FILE_MESSAGE: &str = "Custom weightings are only supported for non-map-file Vues";

const RESPONSE_LEVEL_DESCRIPTION: &str = "Response level weighting";

/// An uploaded weight file.
#[derive(PartialEq, Debug, Clone)]
pub struct FileInformation {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub file: WeightFileName,
}

pub struct WeightingFileService {
    settings: JobSettings,
    respondents: Arc<InMemoryRespondents>,
    store: Arc<JsonFileStore>,
    invalidation: Arc<dyn CacheInvalidation>,
    engine: ReconciliationEngine,
    uploads_directory: PathBuf,
}

impl WeightingFileService {
    pub fn open(settings: &JobSettings) -> WeightsResult<WeightingFileService> {
        let respondents = read_respondents_csv(&settings.respondents_file)?;
        WeightingFileService::new(settings, respondents)
    }

    pub fn new(
        settings: &JobSettings,
        respondents: Vec<Respondent>,
    ) -> WeightsResult<WeightingFileService> {
        let source = Arc::new(InMemoryRespondents {
            subsets: settings.subsets.clone(),
            respondents,
            instance_names: settings.instance_names.clone(),
        });
        let store = Arc::new(JsonFileStore::open(&settings.store_directory)?);
        let invalidation: Arc<dyn CacheInvalidation> = Arc::new(LoggingInvalidation::default());
        let uploads_directory = settings.store_directory.join(UPLOADS_DIRECTORY);
        fs::create_dir_all(&uploads_directory).context(IoSnafu {
            path: uploads_directory.display().to_string(),
        })?;
        let engine = ReconciliationEngine::new(
            source.clone(),
            store.clone(),
            store.clone(),
            invalidation.clone(),
        )
        .with_bounds(settings.bounds);
        Ok(WeightingFileService {
            settings: settings.clone(),
            respondents: source,
            store,
            invalidation,
            engine,
            uploads_directory,
        })
    }

    fn scope(&self, subset_id: &str) -> PlanScope {
        PlanScope::new(&self.settings.product, subset_id)
    }

    fn subset(&self, subset_id: &str) -> WeightsResult<Subset> {
        match self.respondents.get_subset(subset_id) {
            Some(s) => Ok(s),
            None => Err(WeightingErrors::UnknownSubset(subset_id.to_string()))
                .context(WeightingSnafu {}),
        }
    }

    /// Custom weightings can only be set up for products that are not built
    /// from a map file.
    fn assert_generated(&self) -> WeightsResult<()> {
        if self.settings.is_map_file {
            return UnsupportedConfigurationSnafu {
                message: MAP_FILE_MESSAGE,
            }
            .fail();
        }
        Ok(())
    }

    fn upload_path(&self, file: &WeightFileName) -> PathBuf {
        self.uploads_directory
            .join(file.to_file_name(&self.settings.product))
    }

    pub fn generate_template(&self, file: &WeightFileName) -> WeightsResult<Vec<u8>> {
        if file.style != WeightingStyle::ResponseWeighting {
            return UnsupportedConfigurationSnafu {
                message: format!(
                    "Templates are only available for {} files",
                    WeightingStyle::ResponseWeighting.as_str()
                ),
            }
            .fail();
        }
        self.subset(&file.subset_id)?;
        let mut ids: Vec<i64> = self
            .engine
            .expected_respondents(&file.subset_id, &file.context)
            .iter()
            .map(|r| r.response_id)
            .collect();
        ids.sort_unstable();
        info!(
            "generate_template: {} responses for {}",
            ids.len(),
            file.subset_id
        );
        generate_template(&ids)
    }

    /// Reads and checks an uploaded file. The file is stored under its
    /// canonical name unless a check fails; csv files are stored as
    /// spreadsheets.
    pub async fn upload_file(
        &self,
        file: &WeightFileName,
        path: &str,
    ) -> WeightsResult<ValidationStatistics> {
        let kind = match UploadKind::from_path(path) {
            Some(k) => k,
            None => whatever!("File {} must be a .csv or .xlsx file", simplify_file_name(path)),
        };
        let bytes = tokio::fs::read(path)
            .await
            .context(OpeningExcelSnafu { path })?;
        check_upload_size(path, bytes.len(), kind.size_limit())?;

        let name = file.to_file_name(&self.settings.product);
        let mut stats = ValidationStatistics::new(&name, &file.subset_id);
        stats.created_unix_seconds = Utc::now().timestamp();
        let rows_o = match kind {
            UploadKind::Xlsx => read_weights_xlsx(&bytes, &mut stats),
            UploadKind::Csv => read_weights_csv(&bytes, &mut stats),
        };
        let rows = match rows_o {
            Some(rows) if !stats.has_fatal_message() => rows,
            _ => {
                warn!("upload_file: {} failed check: {:?}", path, stats.messages);
                return Ok(stats);
            }
        };

        let stored_bytes = match kind {
            UploadKind::Xlsx => bytes,
            UploadKind::Csv => {
                let mut all_rows = rows;
                all_rows.extend(
                    stats
                        .rejected_in_file
                        .iter()
                        .map(|e| RespondentWeightRow::new(e.response_id, e.weight)),
                );
                write_weights_xlsx(&all_rows)?
            }
        };
        let target = self.upload_path(file);
        tokio::fs::write(&target, &stored_bytes)
            .await
            .context(IoSnafu {
                path: target.display().to_string(),
            })?;
        info!(
            "upload_file: {} stored as {} ({} bytes)",
            path,
            name,
            stored_bytes.len()
        );
        Ok(stats)
    }

    async fn load(
        &self,
        file: &WeightFileName,
    ) -> WeightsResult<(Option<Vec<RespondentWeightRow>>, ValidationStatistics)> {
        let name = file.to_file_name(&self.settings.product);
        let mut stats = ValidationStatistics::new(&name, &file.subset_id);
        let path = self.upload_path(file);
        if !path.exists() {
            warn!("load: {} not found", path.display());
            stats.add_message(
                ValidationMessageType::ExcelMissingFile,
                format!("Failed to locate {}", name),
            );
            return Ok((None, stats));
        }
        let bytes = tokio::fs::read(&path).await.context(OpeningExcelSnafu {
            path: path.display().to_string(),
        })?;
        let rows = read_weights_xlsx(&bytes, &mut stats);
        Ok((rows, stats))
    }

    pub async fn validate(
        &self,
        file: &WeightFileName,
        token: &CancellationToken,
    ) -> WeightsResult<ValidationStatistics> {
        let (rows_o, mut stats) = self.load(file).await?;
        if let Some(rows) = rows_o {
            self.engine
                .validate(
                    &rows,
                    &self.scope(&file.subset_id),
                    &file.context,
                    &mut stats,
                    token,
                )
                .context(WeightingSnafu {})?;
        }
        info!(
            "validate: {}: valid: {}, {} messages",
            stats.excel_file_name,
            stats.is_valid,
            stats.messages.len()
        );
        Ok(stats)
    }

    pub async fn download_errors(
        &self,
        file: &WeightFileName,
        token: &CancellationToken,
    ) -> WeightsResult<ErrorReportModel> {
        let stats = self.validate(file, token).await?;
        Ok(ErrorReportModel {
            weight_file_name: stats.excel_file_name.clone(),
            rows: error_report_rows(&stats, self.engine.bounds()),
        })
    }

    pub async fn push(
        &self,
        file: &WeightFileName,
        token: &CancellationToken,
    ) -> WeightsResult<PushOutcome> {
        self.assert_generated()?;
        let (rows_o, stats) = self.load(file).await?;
        let rows = match rows_o {
            Some(rows) => rows,
            None => {
                let text = stats
                    .messages
                    .first()
                    .map(|m| m.text.clone())
                    .unwrap_or_default();
                return Err(WeightingErrors::InvalidStatistics(text)).context(WeightingSnafu {});
            }
        };
        let outcome = self
            .engine
            .push_into_database(&rows, &self.scope(&file.subset_id), &file.context, token)
            .context(WeightingSnafu {})?;
        info!("push: {}: {:?}", stats.excel_file_name, outcome);
        Ok(outcome)
    }

    pub async fn get_files(&self) -> WeightsResult<Vec<FileInformation>> {
        let dir_s = self.uploads_directory.display().to_string();
        let mut entries = tokio::fs::read_dir(&self.uploads_directory)
            .await
            .context(IoSnafu { path: dir_s.clone() })?;
        let mut res: Vec<FileInformation> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { path: dir_s.clone() })?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let file = match WeightFileName::parse(&name) {
                Some(f) => f,
                None => {
                    debug!("get_files: skipping {}", name);
                    continue;
                }
            };
            let metadata = entry
                .metadata()
                .await
                .context(IoSnafu { path: name.clone() })?;
            res.push(FileInformation {
                name,
                size: metadata.len(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                file,
            });
        }
        res.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(res)
    }

    /// Returns false if there was no such file.
    pub async fn delete_file(&self, file: &WeightFileName) -> WeightsResult<bool> {
        let path = self.upload_path(file);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        info!("delete_file: {}", path.display());
        Ok(true)
    }

    pub fn plans(&self, subset_id: &str) -> WeightsResult<Vec<WeightingPlanConfiguration>> {
        self.subset(subset_id)?;
        self.store
            .get_weighting_plans_for_subset(&self.scope(subset_id))
            .context(WeightingSnafu {})
    }

    pub fn set_plans(
        &self,
        subset_id: &str,
        plans: &[WeightingPlanConfiguration],
    ) -> WeightsResult<()> {
        self.assert_generated()?;
        self.subset(subset_id)?;
        self.store
            .update_weighting_plan_for_subset(&self.scope(subset_id), plans)
            .context(WeightingSnafu {})?;
        self.invalidation
            .invalidate_cache_entry(&self.settings.product);
        Ok(())
    }

    /// Derives target plans from reference weights. With `post`, the plan of
    /// every subset that could be derived without error is stored; otherwise
    /// nothing is written.
    ///
    /// Each subset is handled on its own: a subset that does not exist or
    /// fails is reported in its entry and does not stop the others. The
    /// subsets are posted concurrently.
    pub async fn generate_target_weights(
        &self,
        input: &str,
        subset_ids: &[String],
        post: bool,
        token: &CancellationToken,
    ) -> WeightsResult<GeneratedWeightings> {
        self.assert_generated()?;
        let bytes = tokio::fs::read(input)
            .await
            .context(OpeningExcelSnafu { path: input })?;
        check_upload_size(input, bytes.len(), MAX_TARGET_WEIGHTS_BYTES)?;
        let weights = match read_target_weights_csv(&bytes) {
            Ok(w) => w,
            Err(msg) => {
                warn!("generate_target_weights: {}: {}", input, msg);
                return Ok(GeneratedWeightings::fatal(subset_ids, &msg));
            }
        };

        let mut subsets: Vec<SubsetPlans> = Vec::new();
        let mut failed: Vec<SubsetReversal> = Vec::new();
        for id in subset_ids {
            match self.plans(id) {
                Ok(plans) => subsets.push(SubsetPlans {
                    subset_id: id.clone(),
                    plans,
                }),
                Err(e) => {
                    warn!("generate_target_weights: {}: {}", id, e);
                    failed.push(SubsetReversal {
                        subset_id: id.clone(),
                        plans: Vec::new(),
                        errors: vec![e.to_string()],
                    });
                }
            }
        }
        let mut generated = reverse_scale_factors(&subsets, &weights, self.respondents.as_ref());
        generated.subsets.extend(failed);
        generated
            .subsets
            .sort_by_key(|s| subset_ids.iter().position(|id| *id == s.subset_id));
        if !post {
            info!(
                "generate_target_weights: preview of {} subsets, nothing stored",
                generated.subsets.len()
            );
            return Ok(generated);
        }

        let tasks: Vec<_> = generated
            .subsets
            .iter()
            .filter(|s| s.errors.is_empty())
            .map(|s| {
                let store = self.store.clone();
                let invalidation = self.invalidation.clone();
                let product = self.settings.product.clone();
                let scope = self.scope(&s.subset_id);
                let plans = s.plans.clone();
                async move {
                    let res = post_subset_plans(&*store, &*store, &scope, &plans);
                    if res.is_ok() {
                        invalidation.invalidate_cache_entry(&product);
                    }
                    Ok::<_, WeightsError>((scope.subset_id, res))
                }
            })
            .collect();
        let results = run_bounded(tasks, self.settings.max_concurrency, token).await?;

        let mut posted: Vec<(String, Result<(), WeightingErrors>)> = Vec::new();
        for r in results {
            match r {
                Ok(x) => posted.push(x),
                Err(e) => generated
                    .errors
                    .push(format!("FATAL(Adding to database) {}", e)),
            }
        }
        posted.sort_by(|a, b| a.0.cmp(&b.0));
        for (subset_id, res) in posted {
            match res {
                Ok(()) => generated
                    .warnings
                    .push(format!("Updated weights for survey segment '{}'", subset_id)),
                Err(e) => generated.errors.push(format!(
                    "FATAL(Adding to database) for survey segment'{}' {}",
                    subset_id, e
                )),
            }
        }
        Ok(generated)
    }

    pub fn validate_rim_scheme(
        &self,
        subset_id: &str,
        filters: &[WeightingFilterInstance],
        include_quota_details: bool,
    ) -> WeightsResult<RimWeightingCalculationResult> {
        self.assert_generated()?;
        self.subset(subset_id)?;
        let plans = self.plans(subset_id)?;
        if !are_all_plans_rim(&plans) {
            return UnsupportedConfigurationSnafu {
                message: format!("Survey segment {} is not rim weighted", subset_id),
            }
            .fail();
        }
        let respondents = self.respondents.respondents_for_subset(subset_id);
        sample_size::validate_rim_weighting_scheme(
            &plans,
            &respondents,
            filters,
            &self.settings.rim,
            include_quota_details || self.settings.include_quota_details,
        )
        .context(WeightingSnafu {})
    }

    pub fn respondent_weights_report(
        &self,
        subset_id: &str,
        metrics: &[String],
    ) -> WeightsResult<SampleSizeReportModel> {
        self.subset(subset_id)?;
        let plans = self.plans(subset_id)?;
        let respondents = self.respondents.respondents_for_subset(subset_id);
        let total = rim_total_sample_size(&respondents, &[]);
        let source = self.respondents.clone();
        let instance_name = move |m: &str, id: i64| source.instance_name(m, id);
        let per_metric: Vec<_> = metrics
            .iter()
            .map(|m| metric_sample_sizes(m, &plans, &respondents, &instance_name))
            .collect();
        Ok(SampleSizeReportModel {
            subset_id: subset_id.to_string(),
            rows: sample_size::respondent_weights_report(&per_metric, total),
        })
    }

    pub fn export_respondent_weights_for_subset(
        &self,
        subset_id: &str,
        filters: &[WeightingFilterInstance],
    ) -> WeightsResult<RespondentWeightsExport> {
        Ok(RespondentWeightsExport {
            per_subset: true,
            subset_ids: vec![subset_id.to_string()],
            rows: self.subset_weights(subset_id, filters)?,
        })
    }

    /// Without subsets, every enabled subset is exported. The filters apply
    /// to the respondents of every subset.
    pub fn export_respondent_weights(
        &self,
        subset_ids: &[String],
        filters: &[WeightingFilterInstance],
    ) -> WeightsResult<RespondentWeightsExport> {
        let ids: Vec<String> = if subset_ids.is_empty() {
            self.respondents
                .subsets()
                .into_iter()
                .filter(|s| !s.disabled)
                .map(|s| s.id)
                .collect()
        } else {
            subset_ids.to_vec()
        };
        let mut rows: Vec<RespondentWeightExportRow> = Vec::new();
        for id in ids.iter() {
            rows.extend(self.subset_weights(id, filters)?);
        }
        Ok(RespondentWeightsExport {
            per_subset: false,
            subset_ids: ids,
            rows,
        })
    }

    /// The weight of each respondent of the subset: the stored response
    /// weights if there are any, otherwise the weights of the plans.
    /// Respondents outside of every quota cell are left out.
    fn subset_weights(
        &self,
        subset_id: &str,
        filters: &[WeightingFilterInstance],
    ) -> WeightsResult<Vec<RespondentWeightExportRow>> {
        self.subset(subset_id)?;
        let scope = self.scope(subset_id);
        let respondents: Vec<Respondent> = self
            .respondents
            .respondents_for_subset(subset_id)
            .into_iter()
            .filter(|r| !r.archived && r.matches(filters))
            .collect();
        let plans = self
            .store
            .get_weighting_plans_for_subset(&scope)
            .context(WeightingSnafu {})?;
        let stored = self
            .store
            .get_response_weights(&scope)
            .context(WeightingSnafu {})?;
        let wave_variable = if is_wave_plan(&plans) {
            Some(plans[0].variable_identifier.clone())
        } else {
            None
        };

        let mut weights: HashMap<i64, (f64, String, Option<i64>)> = HashMap::new();
        if !stored.is_empty() {
            for s in stored.iter() {
                let context_wave = s.context.iter().find_map(|f| f.filter_instance_id);
                for r in s.rows.iter() {
                    let description = r
                        .description
                        .clone()
                        .unwrap_or_else(|| RESPONSE_LEVEL_DESCRIPTION.to_string());
                    weights
                        .entry(r.response_id)
                        .or_insert((r.weight, description, context_wave));
                }
            }
        } else {
            let refs: Vec<&Respondent> = respondents.iter().collect();
            for (id, (w, d)) in self.plan_weights(&plans, &refs)? {
                weights.insert(id, (w, d, None));
            }
        }

        let mut res: Vec<RespondentWeightExportRow> = Vec::new();
        for r in respondents.iter() {
            let (weight, description, context_wave) = match weights.get(&r.response_id) {
                Some(x) => x.clone(),
                None => {
                    debug!("subset_weights: {} has no weight", r.response_id);
                    continue;
                }
            };
            res.push(RespondentWeightExportRow {
                subset_id: subset_id.to_string(),
                wave_id: context_wave.or_else(|| {
                    wave_variable
                        .as_ref()
                        .and_then(|v| r.answer(v))
                }),
                response_id: r.response_id,
                weight,
                completed_date: r.completed_date.clone(),
                description,
            });
        }
        res.sort_by_key(|r| r.response_id);
        Ok(res)
    }

    /// Weight and quota cell of each respondent under a scheme.
    fn plan_weights(
        &self,
        plans: &[WeightingPlanConfiguration],
        respondents: &[&Respondent],
    ) -> WeightsResult<BTreeMap<i64, (f64, String)>> {
        let mut res: BTreeMap<i64, (f64, String)> = BTreeMap::new();
        if plans.is_empty() {
            for r in respondents {
                res.insert(r.response_id, (1.0, "Unweighted".to_string()));
            }
        } else if are_all_plans_rim(plans) {
            let owned: Vec<Respondent> = respondents.iter().map(|r| (*r).clone()).collect();
            let calc = sample_size::validate_rim_weighting_scheme(
                plans,
                &owned,
                &[],
                &self.settings.rim,
                true,
            )
            .context(WeightingSnafu {})?;
            let scale: HashMap<String, (f64, String)> = calc
                .quota_details
                .unwrap_or_default()
                .into_iter()
                .map(|d| (d.quota_cell.key(), (d.scale_factor, d.quota_cell.to_string())))
                .collect();
            let dimensions = plan_dimensions(plans);
            for r in respondents {
                if let Some(x) = scale.get(&r.quota_cell_for(&dimensions).key()) {
                    res.insert(r.response_id, x.clone());
                }
            }
        } else if is_wave_plan(plans) {
            let root = &plans[0];
            for t in root.child_targets.iter() {
                let in_wave: Vec<&Respondent> = respondents
                    .iter()
                    .copied()
                    .filter(|r| r.answer(&root.variable_identifier) == Some(t.entity_instance_id))
                    .collect();
                res.extend(self.plan_weights(&t.child_plans, &in_wave)?);
            }
        } else {
            let total = respondents.len() as f64;
            for (cell, target) in plan_quota_cells(plans) {
                let target = match target {
                    Some(x) => x,
                    None => continue,
                };
                let members: Vec<&&Respondent> = respondents
                    .iter()
                    .filter(|r| {
                        cell.parts()
                            .iter()
                            .all(|(dim, id)| r.answer(dim) == Some(*id))
                    })
                    .collect();
                if members.is_empty() {
                    continue;
                }
                let weight = target * total / members.len() as f64;
                for r in members {
                    res.insert(r.response_id, (weight, cell.to_string()));
                }
            }
        }
        Ok(res)
    }
}

/// Replaces the plan of a subset and drops its response weights.
///
/// The new plan is written before anything is removed. If a step fails, the
/// previous plan and weights are put back.
fn post_subset_plans(
    plan_repository: &dyn WeightingPlanRepository,
    weight_repository: &dyn ResponseWeightingRepository,
    scope: &PlanScope,
    plans: &[WeightingPlanConfiguration],
) -> Result<(), WeightingErrors> {
    let previous_plans = plan_repository.get_weighting_plans_for_subset(scope)?;
    let previous_weights = weight_repository.get_response_weights(scope)?;
    let res = plan_repository
        .update_weighting_plan_for_subset(scope, plans)
        .and_then(|_| weight_repository.delete_response_weights(scope));
    if let Err(e) = res {
        warn!(
            "post_subset_plans: {}: {}, restoring the previous plan",
            scope.subset_id, e
        );
        restore_subset(
            plan_repository,
            weight_repository,
            scope,
            &previous_plans,
            &previous_weights,
        );
        return Err(e);
    }
    info!(
        "post_subset_plans: {} plans for {}",
        plans.len(),
        scope.subset_id
    );
    Ok(())
}

fn restore_subset(
    plan_repository: &dyn WeightingPlanRepository,
    weight_repository: &dyn ResponseWeightingRepository,
    scope: &PlanScope,
    plans: &[WeightingPlanConfiguration],
    weights: &[StoredResponseWeights],
) {
    let restored = if plans.is_empty() {
        plan_repository.delete_weighting_plan_for_subset(scope)
    } else {
        plan_repository.update_weighting_plan_for_subset(scope, plans)
    };
    if let Err(e) = restored {
        warn!("restore_subset: {}: plans: {}", scope.subset_id, e);
    }
    for stored in weights {
        let restored = if stored.context.is_empty() {
            weight_repository.create_response_weights_for_root(scope, &stored.rows)
        } else {
            weight_repository.create_response_weights(scope, &stored.context, &stored.rows)
        };
        if let Err(e) = restored {
            warn!("restore_subset: {}: weights: {}", scope.subset_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use response_weighting::builder::PlanBuilder;
    use response_weighting::rim::IterativeRimCalculator;
    use rust_xlsxwriter::Workbook;

    fn respondent(id: i64, subset: &str, gender: i64) -> Respondent {
        Respondent {
            response_id: id,
            subset_id: subset.to_string(),
            archived: false,
            completed_date: Some("2023-03-01".to_string()),
            answers: vec![("Gender".to_string(), gender)].into_iter().collect(),
        }
    }

    fn settings(dir: &std::path::Path) -> JobSettings {
        JobSettings {
            product: ProductKey::new("eo", None),
            is_map_file: false,
            store_directory: dir.to_path_buf(),
            respondents_file: dir.join("respondents.csv"),
            subsets: ["A", "B"]
                .iter()
                .map(|s| Subset {
                    id: s.to_string(),
                    display_name: s.to_string(),
                    disabled: false,
                })
                .collect(),
            instance_names: HashMap::new(),
            bounds: WeightBounds::DEFAULT,
            rim: IterativeRimCalculator::default(),
            include_quota_details: false,
            max_concurrency: 2,
        }
    }

    fn service(dir: &std::path::Path) -> WeightingFileService {
        let respondents = vec![
            respondent(1, "A", 1),
            respondent(2, "A", 1),
            respondent(3, "A", 2),
            respondent(4, "A", 2),
            respondent(5, "B", 1),
        ];
        WeightingFileService::new(&settings(dir), respondents).unwrap()
    }

    fn gender_builder() -> PlanBuilder {
        PlanBuilder::new()
            .dimension("Gender", &[(1, 0.5), (2, 0.5)])
            .unwrap()
    }

    fn gender_plan() -> Vec<WeightingPlanConfiguration> {
        gender_builder().build().unwrap()
    }

    fn file(subset: &str) -> WeightFileName {
        WeightFileName::new(WeightingStyle::ResponseWeighting, subset, vec![])
    }

    fn write_sheet(path: &std::path::Path, header: [&str; 2], rows: &[(i64, f64)]) {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.write_string(0, 0, header[0]).unwrap();
        worksheet.write_string(0, 1, header[1]).unwrap();
        for (idx, (id, w)) in rows.iter().enumerate() {
            worksheet.write_number(idx as u32 + 1, 0, *id as f64).unwrap();
            worksheet.write_number(idx as u32 + 1, 1, *w).unwrap();
        }
        workbook.save(path).unwrap();
    }

    #[tokio::test]
    async fn missing_weighting_column_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let input = dir.path().join("input.xlsx");
        write_sheet(&input, ["ResponseId", "Weight"], &[(1, 1.0)]);

        let stats = service
            .upload_file(&file("A"), input.to_str().unwrap())
            .await
            .unwrap();
        assert!(stats.has_message(ValidationMessageType::ExcelMissingSheet));
        assert!(service.get_files().await.unwrap().is_empty());

        let token = CancellationToken::new();
        let stats = service.validate(&file("A"), &token).await.unwrap();
        assert!(stats.has_message(ValidationMessageType::ExcelMissingFile));
        assert_eq!(
            stats.messages[0].text,
            "Failed to locate ResponseWeighting.eo.A.private.xlsx"
        );
        assert!(service.push(&file("A"), &token).await.is_err());
    }

    #[tokio::test]
    async fn upload_validate_push_export() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let input = dir.path().join("input.csv");
        fs::write(&input, "ResponseId,Weighting\n1,0.8\n2,1.2\n3,1\n4,1\n").unwrap();
        let token = CancellationToken::new();

        let stats = service
            .upload_file(&file("A"), input.to_str().unwrap())
            .await
            .unwrap();
        assert!(!stats.has_fatal_message());
        let files = service.get_files().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "ResponseWeighting.eo.A.private.xlsx");
        assert_eq!(files[0].file.subset_id, "A");

        let stats = service.validate(&file("A"), &token).await.unwrap();
        assert!(stats.is_valid);
        assert_eq!(stats.valid_weights.len(), 4);

        let outcome = service.push(&file("A"), &token).await.unwrap();
        assert_eq!(outcome.rows_written, 4);

        let export = service
            .export_respondent_weights(&["A".to_string()], &[])
            .unwrap();
        assert_eq!(export.rows.len(), 4);
        assert_eq!(export.rows[0].weight, 0.8);
        assert_eq!(export.rows[0].description, RESPONSE_LEVEL_DESCRIPTION);

        assert!(service.delete_file(&file("A")).await.unwrap());
        assert!(!service.delete_file(&file("A")).await.unwrap());
    }

    struct FailingStore {
        plans: InMemoryPlanRepository,
        weights: InMemoryResponseWeights,
        failing: &'static str,
    }

    impl FailingStore {
        fn check(&self, operation: &str) -> Result<(), WeightingErrors> {
            if self.failing == operation {
                return Err(WeightingErrors::Repository(format!("{} failed", operation)));
            }
            Ok(())
        }
    }

    impl WeightingPlanRepository for FailingStore {
        fn get_weighting_plans_for_subset(
            &self,
            scope: &PlanScope,
        ) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors> {
            self.plans.get_weighting_plans_for_subset(scope)
        }

        fn update_weighting_plan_for_subset(
            &self,
            scope: &PlanScope,
            plans: &[WeightingPlanConfiguration],
        ) -> Result<(), WeightingErrors> {
            self.check("update")?;
            self.plans.update_weighting_plan_for_subset(scope, plans)
        }

        fn delete_weighting_plan_for_subset(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
            self.plans.delete_weighting_plan_for_subset(scope)
        }
    }

    impl ResponseWeightingRepository for FailingStore {
        fn get_response_weights(
            &self,
            scope: &PlanScope,
        ) -> Result<Vec<StoredResponseWeights>, WeightingErrors> {
            self.weights.get_response_weights(scope)
        }

        fn create_response_weights_for_root(
            &self,
            scope: &PlanScope,
            rows: &[RespondentWeightRow],
        ) -> Result<(), WeightingErrors> {
            self.weights.create_response_weights_for_root(scope, rows)
        }

        fn create_response_weights(
            &self,
            scope: &PlanScope,
            context: &[WeightingFilterInstance],
            rows: &[RespondentWeightRow],
        ) -> Result<(), WeightingErrors> {
            self.weights.create_response_weights(scope, context, rows)
        }

        fn delete_response_weights(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
            self.check("delete")?;
            self.weights.delete_response_weights(scope)
        }
    }

    #[tokio::test]
    async fn rejected_rows_of_an_upload_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let input = dir.path().join("input.csv");
        fs::write(&input, "ResponseId,Weighting\n1,1\n2,1\n3,1\n4,-5\n99,-2\n").unwrap();
        let stats = service
            .upload_file(&file("A"), input.to_str().unwrap())
            .await
            .unwrap();
        assert!(!stats.has_fatal_message());

        let stats = service
            .validate(&file("A"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!stats.is_valid);
        assert_eq!(
            stats.error_responses_for_this_survey_and_wave,
            vec![InvalidResponseWeight {
                response_id: 4,
                weight: -5.0,
                reason: InvalidResponseReason::IdInvalidWeight,
            }]
        );
        let extras: Vec<(i64, ExtraResponseReason)> = stats
            .extra_responses_in_excel
            .iter()
            .map(|e| (e.response_id, e.reason))
            .collect();
        assert_eq!(
            extras,
            vec![
                (4, ExtraResponseReason::IdWeightTooSmall),
                (99, ExtraResponseReason::IdNonExistent),
            ]
        );
        assert_eq!(stats.number_of_responses_matched, 4);
    }

    #[tokio::test]
    async fn batch_keeps_going_after_a_failed_subset() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.set_plans("A", &gender_plan()).unwrap();
        // No plan for B.
        let input = dir.path().join("targets.csv");
        fs::write(&input, "ResponseId,Weight\n1,0.5\n2,0.5\n3,1.5\n4,1.5\n5,1\n").unwrap();
        let token = CancellationToken::new();

        let res = service
            .generate_target_weights(
                input.to_str().unwrap(),
                &["A".to_string(), "B".to_string()],
                true,
                &token,
            )
            .await
            .unwrap();
        assert!(res.subset("A").unwrap().errors.is_empty());
        assert!(!res.subset("B").unwrap().errors.is_empty());
        assert!(res
            .warnings
            .contains(&"Updated weights for survey segment 'A'".to_string()));
        assert!(!res.warnings.iter().any(|w| w.contains("segment 'B'")));

        // One dimension: the cell targets stay on the single plan.
        let plans = service.plans("A").unwrap();
        assert_eq!(plans.len(), 1);
        let male = plans[0].target_for(1).and_then(|t| t.target).unwrap();
        assert!((male - 0.25).abs() < 1e-9);
        assert!(service.plans("B").unwrap().is_empty());

        let export = service.export_respondent_weights_for_subset("A", &[]).unwrap();
        assert_eq!(export.rows.len(), 4);
        assert!((export.rows[0].weight - 0.5).abs() < 1e-3);
        assert!((export.rows[3].weight - 1.5).abs() < 1e-3);
        assert_eq!(export.rows[0].description, "1");
    }

    #[tokio::test]
    async fn unknown_subset_does_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.set_plans("A", &gender_plan()).unwrap();
        let input = dir.path().join("targets.csv");
        fs::write(&input, "ResponseId,Weight\n1,0.5\n2,0.5\n3,1.5\n4,1.5\n").unwrap();

        let res = service
            .generate_target_weights(
                input.to_str().unwrap(),
                &["A".to_string(), "ZZ".to_string()],
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = res.subsets.iter().map(|s| s.subset_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "ZZ"]);
        assert_eq!(
            res.subset("ZZ").unwrap().errors,
            vec!["Survey segment ZZ does not exist".to_string()]
        );
        assert!(res
            .warnings
            .contains(&"Updated weights for survey segment 'A'".to_string()));
        let plans = service.plans("A").unwrap();
        let male = plans[0].target_for(1).and_then(|t| t.target).unwrap();
        assert!((male - 0.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn preview_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        service.set_plans("A", &gender_plan()).unwrap();
        let input = dir.path().join("targets.csv");
        fs::write(&input, "ResponseId,Weight\n1,0.5\n2,0.5\n3,1.5\n4,1.5\n").unwrap();

        let res = service
            .generate_target_weights(
                input.to_str().unwrap(),
                &["A".to_string()],
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let derived = &res.subset("A").unwrap().plans;
        let male = derived[0].target_for(1).and_then(|t| t.target).unwrap();
        assert!((male - 0.25).abs() < 1e-9);
        assert!(res.warnings.iter().all(|w| !w.starts_with("Updated weights")));
        assert_eq!(service.plans("A").unwrap(), gender_plan());
    }

    #[test]
    fn failed_post_keeps_the_previous_plan_and_weights() {
        let scope = PlanScope::new(&ProductKey::new("eo", None), "A");
        let old_plans = gender_plan();
        let new_plans = PlanBuilder::new()
            .dimension("Gender", &[(1, 0.3), (2, 0.7)])
            .unwrap()
            .build()
            .unwrap();
        let rows = vec![RespondentWeightRow::new(1, 0.5)];
        for failing in ["update", "delete"] {
            let store = FailingStore {
                plans: InMemoryPlanRepository::new(),
                weights: InMemoryResponseWeights::new(),
                failing,
            };
            store
                .plans
                .update_weighting_plan_for_subset(&scope, &old_plans)
                .unwrap();
            store
                .weights
                .create_response_weights_for_root(&scope, &rows)
                .unwrap();

            assert!(post_subset_plans(&store, &store, &scope, &new_plans).is_err());
            assert_eq!(
                store.plans.get_weighting_plans_for_subset(&scope).unwrap(),
                old_plans
            );
            let stored = store.weights.get_response_weights(&scope).unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].rows, rows);

            post_subset_plans(&store.plans, &store.weights, &scope, &new_plans).unwrap();
            assert_eq!(
                store.plans.get_weighting_plans_for_subset(&scope).unwrap(),
                new_plans
            );
            assert!(store.weights.get_response_weights(&scope).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn unreadable_reference_weights() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let input = dir.path().join("targets.csv");
        fs::write(&input, "Id,Value\n1,1\n").unwrap();
        let res = service
            .generate_target_weights(
                input.to_str().unwrap(),
                &["A".to_string()],
                true,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(res.errors, vec!["FATAL ERROR: Missing column ResponseId".to_string()]);
        assert!(res.subset("A").unwrap().plans.is_empty());
    }

    #[tokio::test]
    async fn map_file_products_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.is_map_file = true;
        let service = WeightingFileService::new(&s, vec![respondent(1, "A", 1)]).unwrap();
        let res = service
            .generate_target_weights("unused.csv", &["A".to_string()], true, &CancellationToken::new())
            .await;
        assert!(matches!(
            res,
            Err(WeightsError::UnsupportedConfiguration { message }) if message == MAP_FILE_MESSAGE
        ));
        assert!(service.set_plans("A", &gender_plan()).is_err());
    }

    #[test]
    fn export_per_wave() {
        let dir = tempfile::tempdir().unwrap();
        let respondents: Vec<Respondent> = [(1, 1, 1), (2, 1, 2), (3, 2, 1), (4, 2, 2), (5, 2, 1)]
            .iter()
            .map(|(id, wave, gender)| {
                let mut r = respondent(*id, "A", *gender);
                r.answers.insert("Wave".to_string(), *wave);
                r
            })
            .collect();
        let service = WeightingFileService::new(&settings(dir.path()), respondents).unwrap();
        let plans = gender_builder().build_per_wave("Wave", &[1, 2]).unwrap();
        service.set_plans("A", &plans).unwrap();

        let export = service.export_respondent_weights(&[], &[]).unwrap();
        assert_eq!(export.subset_ids, vec!["A".to_string(), "B".to_string()]);
        let waves: Vec<Option<i64>> = export.rows.iter().map(|r| r.wave_id).collect();
        assert_eq!(waves, vec![Some(1), Some(1), Some(2), Some(2), Some(2)]);
        // Wave 2: two men share half of the weight.
        assert!((export.rows[0].weight - 1.0).abs() < 1e-3);
        assert!((export.rows[2].weight - 0.75).abs() < 1e-3);
        assert!((export.rows[3].weight - 1.5).abs() < 1e-3);

        let wave2 = service
            .export_respondent_weights(&[], &[WeightingFilterInstance::new("Wave", Some(2))])
            .unwrap();
        let ids: Vec<i64> = wave2.rows.iter().map(|r| r.response_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!((wave2.rows[0].weight - 0.75).abs() < 1e-3);
    }

    #[test]
    fn template_and_rim() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path());
        let bytes = service.generate_template(&file("A")).unwrap();
        let mut stats = ValidationStatistics::new("t.xlsx", "A");
        let rows = read_weights_xlsx(&bytes, &mut stats).unwrap();
        assert_eq!(rows.iter().map(|r| r.response_id).collect::<Vec<i64>>(), vec![1, 2, 3, 4]);

        assert!(matches!(
            service.generate_template(&file("C")),
            Err(WeightsError::Weighting {
                source: WeightingErrors::UnknownSubset(_)
            })
        ));

        service.set_plans("A", &gender_plan()).unwrap();
        let res = service.validate_rim_scheme("A", &[], true).unwrap();
        assert!(res.converged);
        let details = res.quota_details.unwrap();
        assert_eq!(details.len(), 2);
        assert!(details.iter().all(|d| (d.scale_factor - 1.0).abs() < 1e-6));

        let report = service
            .respondent_weights_report("A", &["Gender".to_string()])
            .unwrap();
        assert_eq!(report.rows.last().unwrap().sample_size, Some(4.0));
    }
}
