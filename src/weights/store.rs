//! Plans and response weights kept as JSON documents in the store directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use response_weighting::repository::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::weights::config_reader::{FilterJs, PlanJs};
use crate::weights::*;

const PLANS_FILE: &str = "plans.json";
const WEIGHTS_FILE: &str = "weights.json";

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
struct WeightRowJs {
    #[serde(rename = "responseId")]
    response_id: i64,
    weight: f64,
    description: Option<String>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
struct StoredWeightsJs {
    context: Vec<FilterJs>,
    rows: Vec<WeightRowJs>,
}

fn scope_key(scope: &PlanScope) -> String {
    format!(
        "{}|{}|{}",
        scope.product.short_code,
        scope.product.sub_product_id.as_deref().unwrap_or(""),
        scope.subset_id
    )
}

fn repository_error<E: std::fmt::Display>(path: &Path, e: E) -> WeightingErrors {
    WeightingErrors::Repository(format!("{}: {}", path.display(), e))
}

/// A store with one JSON document per kind of data, each a map keyed by
/// product and subset. Every mutation rewrites the document.
#[derive(Debug)]
pub struct JsonFileStore {
    directory: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn open(directory: &Path) -> WeightsResult<JsonFileStore> {
        fs::create_dir_all(directory).context(IoSnafu {
            path: directory.display().to_string(),
        })?;
        info!("JsonFileStore::open: {}", directory.display());
        Ok(JsonFileStore {
            directory: directory.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    fn read_doc<T: DeserializeOwned>(&self, name: &str) -> Result<BTreeMap<String, T>, WeightingErrors> {
        let path = self.directory.join(name);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&path).map_err(|e| repository_error(&path, e))?;
        serde_json::from_str(&contents).map_err(|e| repository_error(&path, e))
    }

    // Written next to the document, then renamed over it.
    fn write_doc<T: Serialize>(&self, name: &str, doc: &BTreeMap<String, T>) -> Result<(), WeightingErrors> {
        let path = self.directory.join(name);
        let tmp = self.directory.join(format!("{}.tmp", name));
        let contents = serde_json::to_string_pretty(doc).map_err(|e| repository_error(&path, e))?;
        fs::write(&tmp, contents).map_err(|e| repository_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| repository_error(&path, e))?;
        debug!("write_doc: {} entries in {}", doc.len(), path.display());
        Ok(())
    }

    fn update_doc<T, F>(&self, name: &str, f: F) -> Result<(), WeightingErrors>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut BTreeMap<String, T>),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| WeightingErrors::Repository("store lock poisoned".to_string()))?;
        let mut doc = self.read_doc::<T>(name)?;
        f(&mut doc);
        self.write_doc(name, &doc)
    }
}

impl WeightingPlanRepository for JsonFileStore {
    fn get_weighting_plans_for_subset(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors> {
        let doc = self.read_doc::<Vec<PlanJs>>(PLANS_FILE)?;
        Ok(doc
            .get(&scope_key(scope))
            .map(|ps| ps.iter().map(WeightingPlanConfiguration::from).collect())
            .unwrap_or_default())
    }

    fn update_weighting_plan_for_subset(
        &self,
        scope: &PlanScope,
        plans: &[WeightingPlanConfiguration],
    ) -> Result<(), WeightingErrors> {
        let plans_js: Vec<PlanJs> = plans.iter().map(PlanJs::from).collect();
        self.update_doc::<Vec<PlanJs>, _>(PLANS_FILE, |doc| {
            doc.insert(scope_key(scope), plans_js);
        })
    }

    fn delete_weighting_plan_for_subset(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
        self.update_doc::<Vec<PlanJs>, _>(PLANS_FILE, |doc| {
            doc.remove(&scope_key(scope));
        })
    }
}

impl ResponseWeightingRepository for JsonFileStore {
    fn get_response_weights(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<StoredResponseWeights>, WeightingErrors> {
        let doc = self.read_doc::<Vec<StoredWeightsJs>>(WEIGHTS_FILE)?;
        Ok(doc
            .get(&scope_key(scope))
            .map(|stored| {
                stored
                    .iter()
                    .map(|s| StoredResponseWeights {
                        context: s.context.iter().map(WeightingFilterInstance::from).collect(),
                        rows: s
                            .rows
                            .iter()
                            .map(|r| RespondentWeightRow {
                                response_id: r.response_id,
                                weight: r.weight,
                                description: r.description.clone(),
                            })
                            .collect(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn create_response_weights_for_root(
        &self,
        scope: &PlanScope,
        rows: &[RespondentWeightRow],
    ) -> Result<(), WeightingErrors> {
        self.create_response_weights(scope, &[], rows)
    }

    fn create_response_weights(
        &self,
        scope: &PlanScope,
        context: &[WeightingFilterInstance],
        rows: &[RespondentWeightRow],
    ) -> Result<(), WeightingErrors> {
        let context_js: Vec<FilterJs> = context.iter().map(FilterJs::from).collect();
        let entry = StoredWeightsJs {
            context: context_js.clone(),
            rows: rows
                .iter()
                .map(|r| WeightRowJs {
                    response_id: r.response_id,
                    weight: r.weight,
                    description: r.description.clone(),
                })
                .collect(),
        };
        self.update_doc::<Vec<StoredWeightsJs>, _>(WEIGHTS_FILE, |doc| {
            let stored = doc.entry(scope_key(scope)).or_default();
            stored.retain(|s| s.context != context_js);
            stored.push(entry);
        })
    }

    fn delete_response_weights(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
        self.update_doc::<Vec<StoredWeightsJs>, _>(WEIGHTS_FILE, |doc| {
            doc.remove(&scope_key(scope));
        })
    }
}

/// Nothing is cached by the command line: the invalidations are only logged.
#[derive(Debug, Default)]
pub struct LoggingInvalidation {}

impl CacheInvalidation for LoggingInvalidation {
    fn invalidate_cache_entry(&self, product: &ProductKey) {
        info!(
            "invalidate_cache_entry: {} {:?}",
            product.short_code, product.sub_product_id
        );
    }
}
