use crate::weights::*;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use response_weighting::rim::IterativeRimCalculator;
use serde::{Deserialize, Serialize};

use crate::weights::fanout::DEFAULT_MAX_CONCURRENCY;

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ProductSettings {
    #[serde(rename = "shortCode")]
    pub short_code: String,
    #[serde(rename = "subProductId")]
    pub sub_product_id: Option<String>,
    /// Products built from a map file have their weightings generated
    /// elsewhere.
    #[serde(rename = "isMapFile")]
    pub is_map_file: Option<bool>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SubsetSettings {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub disabled: Option<bool>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BoundsSettings {
    pub min: f64,
    pub max: f64,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct RimSettings {
    pub tolerance: Option<f64>,
    #[serde(rename = "maxIterations")]
    pub max_iterations: Option<u32>,
    #[serde(rename = "includeQuotaDetails")]
    pub include_quota_details: Option<bool>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub product: ProductSettings,
    #[serde(rename = "storeDirectory")]
    pub store_directory: String,
    #[serde(rename = "respondentsFile")]
    pub respondents_file: String,
    pub subsets: Vec<SubsetSettings>,
    /// metric name -> instance id -> display name
    #[serde(rename = "instanceNames")]
    pub instance_names: Option<BTreeMap<String, BTreeMap<String, String>>>,
    #[serde(rename = "weightBounds")]
    pub weight_bounds: Option<BoundsSettings>,
    pub rim: Option<RimSettings>,
    #[serde(rename = "maxConcurrency")]
    pub max_concurrency: Option<usize>,
}

/// The job configuration, checked and converted.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub product: ProductKey,
    pub is_map_file: bool,
    pub store_directory: PathBuf,
    pub respondents_file: PathBuf,
    pub subsets: Vec<Subset>,
    pub instance_names: HashMap<(String, i64), String>,
    pub bounds: WeightBounds,
    pub rim: IterativeRimCalculator,
    pub include_quota_details: bool,
    pub max_concurrency: usize,
}

pub fn read_job_config(path: &str) -> WeightsResult<JobConfig> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})
}

fn resolve(root: &Path, p: &str) -> PathBuf {
    let path = Path::new(p);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

pub fn validate_job_config(config: &JobConfig, root: &Path) -> WeightsResult<JobSettings> {
    let product = ProductKey::new(
        &config.product.short_code,
        config
            .product
            .sub_product_id
            .as_deref()
            .filter(|s| !s.is_empty()),
    );

    let bounds = match &config.weight_bounds {
        Some(b) => WeightBounds::new(b.min, b.max).context(WeightingSnafu {})?,
        None => WeightBounds::DEFAULT,
    };

    let mut instance_names: HashMap<(String, i64), String> = HashMap::new();
    for (metric, names) in config.instance_names.iter().flatten() {
        for (id_s, name) in names {
            let id = match id_s.parse::<i64>() {
                Ok(x) => x,
                Err(_) => {
                    whatever!(
                        "Failed to understand instance id {:?} of metric {}",
                        id_s,
                        metric
                    )
                }
            };
            instance_names.insert((metric.clone(), id), name.clone());
        }
    }

    let mut rim = IterativeRimCalculator::default();
    if let Some(r) = &config.rim {
        if let Some(t) = r.tolerance {
            if !(t > 0.0) {
                whatever!("Failed to understand rim tolerance option: {:?}", t)
            }
            rim.tolerance = t;
        }
        if let Some(m) = r.max_iterations {
            rim.max_iterations = m;
        }
    }

    let max_concurrency = match config.max_concurrency {
        Some(0) => whatever!("maxConcurrency must be at least 1"),
        Some(x) => x,
        None => DEFAULT_MAX_CONCURRENCY,
    };

    Ok(JobSettings {
        product,
        is_map_file: config.product.is_map_file.unwrap_or(false),
        store_directory: resolve(root, &config.store_directory),
        respondents_file: resolve(root, &config.respondents_file),
        subsets: config
            .subsets
            .iter()
            .map(|s| Subset {
                id: s.id.clone(),
                display_name: s.display_name.clone().unwrap_or_else(|| s.id.clone()),
                disabled: s.disabled.unwrap_or(false),
            })
            .collect(),
        instance_names,
        bounds,
        rim,
        include_quota_details: config
            .rim
            .as_ref()
            .and_then(|r| r.include_quota_details)
            .unwrap_or(false),
        max_concurrency,
    })
}

// ******** Weighting plans ********

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct PlanJs {
    #[serde(rename = "variableIdentifier")]
    pub variable_identifier: String,
    #[serde(rename = "isWeightingGroupRoot", default)]
    pub is_weighting_group_root: bool,
    #[serde(rename = "childTargets", default)]
    pub child_targets: Vec<TargetJs>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct TargetJs {
    #[serde(rename = "entityInstanceId")]
    pub entity_instance_id: i64,
    pub target: Option<f64>,
    #[serde(rename = "targetPopulation")]
    pub target_population: Option<f64>,
    #[serde(rename = "childPlans", default)]
    pub child_plans: Vec<PlanJs>,
}

impl From<&WeightingPlanConfiguration> for PlanJs {
    fn from(p: &WeightingPlanConfiguration) -> PlanJs {
        PlanJs {
            variable_identifier: p.variable_identifier.clone(),
            is_weighting_group_root: p.is_weighting_group_root,
            child_targets: p
                .child_targets
                .iter()
                .map(|t| TargetJs {
                    entity_instance_id: t.entity_instance_id,
                    target: t.target,
                    target_population: t.target_population,
                    child_plans: t.child_plans.iter().map(PlanJs::from).collect(),
                })
                .collect(),
        }
    }
}

impl From<&PlanJs> for WeightingPlanConfiguration {
    fn from(p: &PlanJs) -> WeightingPlanConfiguration {
        WeightingPlanConfiguration {
            variable_identifier: p.variable_identifier.clone(),
            is_weighting_group_root: p.is_weighting_group_root,
            child_targets: p
                .child_targets
                .iter()
                .map(|t| WeightingTargetConfiguration {
                    entity_instance_id: t.entity_instance_id,
                    target: t.target,
                    target_population: t.target_population,
                    child_plans: t
                        .child_plans
                        .iter()
                        .map(WeightingPlanConfiguration::from)
                        .collect(),
                })
                .collect(),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct FilterJs {
    #[serde(rename = "filterMetricName")]
    pub filter_metric_name: String,
    #[serde(rename = "filterInstanceId")]
    pub filter_instance_id: Option<i64>,
}

impl From<&WeightingFilterInstance> for FilterJs {
    fn from(f: &WeightingFilterInstance) -> FilterJs {
        FilterJs {
            filter_metric_name: f.filter_metric_name.clone(),
            filter_instance_id: f.filter_instance_id,
        }
    }
}

impl From<&FilterJs> for WeightingFilterInstance {
    fn from(f: &FilterJs) -> WeightingFilterInstance {
        WeightingFilterInstance::new(&f.filter_metric_name, f.filter_instance_id)
    }
}

pub fn read_plans(path: &str) -> WeightsResult<Vec<WeightingPlanConfiguration>> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let plans: Vec<PlanJs> = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})?;
    debug!("read_plans: {} plans read from {}", plans.len(), path);
    Ok(plans.iter().map(WeightingPlanConfiguration::from).collect())
}
