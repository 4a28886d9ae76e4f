//! The collaborators of the reconciliation engine.
//!
//! Storage is kept behind narrow traits. The implementations in this module
//! keep everything in memory; they are used by the tests and by callers that
//! load their data up front.
//!
//! The repositories do no locking across calls: two writers updating the same
//! subset race, and the last one wins. Readers learn about changes through
//! [`CacheInvalidation`] only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::config::*;

/// Persisted weighting schemes, one ordered list of plans per subset.
pub trait WeightingPlanRepository: Send + Sync {
    fn get_weighting_plans_for_subset(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors>;

    /// Replaces all the plans of the subset.
    fn update_weighting_plan_for_subset(
        &self,
        scope: &PlanScope,
        plans: &[WeightingPlanConfiguration],
    ) -> Result<(), WeightingErrors>;

    fn delete_weighting_plan_for_subset(&self, scope: &PlanScope) -> Result<(), WeightingErrors>;
}

/// Response weights stored for a filter context of a subset.
#[derive(PartialEq, Debug, Clone)]
pub struct StoredResponseWeights {
    pub context: Vec<WeightingFilterInstance>,
    pub rows: Vec<RespondentWeightRow>,
}

/// Persisted response level weights.
///
/// Each create call replaces the rows stored for the same context in a single
/// step.
pub trait ResponseWeightingRepository: Send + Sync {
    fn get_response_weights(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<StoredResponseWeights>, WeightingErrors>;

    fn create_response_weights_for_root(
        &self,
        scope: &PlanScope,
        rows: &[RespondentWeightRow],
    ) -> Result<(), WeightingErrors>;

    fn create_response_weights(
        &self,
        scope: &PlanScope,
        context: &[WeightingFilterInstance],
        rows: &[RespondentWeightRow],
    ) -> Result<(), WeightingErrors>;

    /// Deletes the weights of every context of the subset.
    fn delete_response_weights(&self, scope: &PlanScope) -> Result<(), WeightingErrors>;
}

/// Receives a notification after every mutation that changes the data loaded
/// for a product.
pub trait CacheInvalidation: Send + Sync {
    fn invalidate_cache_entry(&self, product: &ProductKey);
}

/// Read access to the subsets and respondents of a product.
pub trait RespondentSource: Send + Sync {
    fn subsets(&self) -> Vec<Subset>;

    fn get_subset(&self, subset_id: &str) -> Option<Subset> {
        self.subsets().into_iter().find(|s| s.id == subset_id)
    }

    /// All the respondents of a subset, archived ones included.
    fn respondents_for_subset(&self, subset_id: &str) -> Vec<Respondent>;

    /// Looks a respondent up in every subset.
    fn find_respondent(&self, response_id: i64) -> Option<Respondent>;

    /// Display name of an entity instance of a metric.
    fn instance_name(&self, _metric: &str, _instance_id: i64) -> Option<String> {
        None
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, WeightingErrors> {
    m.lock()
        .map_err(|_| WeightingErrors::Repository(format!("{} lock poisoned", what)))
}

#[derive(Debug, Default)]
pub struct InMemoryPlanRepository {
    plans: Mutex<HashMap<PlanScope, Vec<WeightingPlanConfiguration>>>,
}

impl InMemoryPlanRepository {
    pub fn new() -> InMemoryPlanRepository {
        InMemoryPlanRepository::default()
    }
}

impl WeightingPlanRepository for InMemoryPlanRepository {
    fn get_weighting_plans_for_subset(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors> {
        let plans = lock(&self.plans, "plans")?;
        Ok(plans.get(scope).cloned().unwrap_or_default())
    }

    fn update_weighting_plan_for_subset(
        &self,
        scope: &PlanScope,
        plans: &[WeightingPlanConfiguration],
    ) -> Result<(), WeightingErrors> {
        debug!(
            "update_weighting_plan_for_subset: {:?}: {} plans",
            scope,
            plans.len()
        );
        lock(&self.plans, "plans")?.insert(scope.clone(), plans.to_vec());
        Ok(())
    }

    fn delete_weighting_plan_for_subset(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
        lock(&self.plans, "plans")?.remove(scope);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResponseWeights {
    weights: Mutex<HashMap<PlanScope, Vec<StoredResponseWeights>>>,
}

impl InMemoryResponseWeights {
    pub fn new() -> InMemoryResponseWeights {
        InMemoryResponseWeights::default()
    }
}

impl ResponseWeightingRepository for InMemoryResponseWeights {
    fn get_response_weights(
        &self,
        scope: &PlanScope,
    ) -> Result<Vec<StoredResponseWeights>, WeightingErrors> {
        let weights = lock(&self.weights, "response weights")?;
        Ok(weights.get(scope).cloned().unwrap_or_default())
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
        let mut weights = lock(&self.weights, "response weights")?;
        let stored = weights.entry(scope.clone()).or_default();
        stored.retain(|s| s.context.as_slice() != context);
        stored.push(StoredResponseWeights {
            context: context.to_vec(),
            rows: rows.to_vec(),
        });
        Ok(())
    }

    fn delete_response_weights(&self, scope: &PlanScope) -> Result<(), WeightingErrors> {
        lock(&self.weights, "response weights")?.remove(scope);
        Ok(())
    }
}

/// Records the invalidations, in order.
#[derive(Debug, Default)]
pub struct RecordingInvalidation {
    entries: Mutex<Vec<ProductKey>>,
}

impl RecordingInvalidation {
    pub fn new() -> RecordingInvalidation {
        RecordingInvalidation::default()
    }

    pub fn entries(&self) -> Vec<ProductKey> {
        match self.entries.lock() {
            Ok(e) => e.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CacheInvalidation for RecordingInvalidation {
    fn invalidate_cache_entry(&self, product: &ProductKey) {
        debug!("invalidate_cache_entry: {:?}", product);
        match self.entries.lock() {
            Ok(mut e) => e.push(product.clone()),
            Err(poisoned) => poisoned.into_inner().push(product.clone()),
        }
    }
}

/// Subsets and respondents loaded up front.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRespondents {
    pub subsets: Vec<Subset>,
    pub respondents: Vec<Respondent>,
    /// (metric, instance id) -> display name
    pub instance_names: HashMap<(String, i64), String>,
}

impl RespondentSource for InMemoryRespondents {
    fn subsets(&self) -> Vec<Subset> {
        self.subsets.clone()
    }

    fn respondents_for_subset(&self, subset_id: &str) -> Vec<Respondent> {
        self.respondents
            .iter()
            .filter(|r| r.subset_id == subset_id)
            .cloned()
            .collect()
    }

    fn find_respondent(&self, response_id: i64) -> Option<Respondent> {
        self.respondents
            .iter()
            .find(|r| r.response_id == response_id)
            .cloned()
    }

    fn instance_name(&self, metric: &str, instance_id: i64) -> Option<String> {
        self.instance_names
            .get(&(metric.to_string(), instance_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(subset: &str) -> PlanScope {
        PlanScope::new(&ProductKey::new("eatingout", Some("uk")), subset)
    }

    #[test]
    fn plans_round_trip_in_order() {
        let repo = InMemoryPlanRepository::new();
        let plans = vec![
            WeightingPlanConfiguration::new(
                "Gender",
                vec![
                    WeightingTargetConfiguration::leaf(2, Some(0.52)),
                    WeightingTargetConfiguration::leaf(1, Some(0.48)),
                ],
            ),
            WeightingPlanConfiguration::new(
                "Age",
                vec![
                    WeightingTargetConfiguration::leaf(3, Some(0.3)),
                    WeightingTargetConfiguration::leaf(1, Some(0.3)),
                    WeightingTargetConfiguration::leaf(2, Some(0.4)),
                ],
            ),
        ];
        repo.update_weighting_plan_for_subset(&scope("UK"), &plans)
            .unwrap();
        let read = repo.get_weighting_plans_for_subset(&scope("UK")).unwrap();
        assert_eq!(read, plans);
        let cells: Vec<String> = plan_quota_cells(&read).iter().map(|(c, _)| c.key()).collect();
        let expected_cells: Vec<String> = plan_quota_cells(&plans)
            .iter()
            .map(|(c, _)| c.key())
            .collect();
        assert_eq!(cells, expected_cells);
        assert!(repo
            .get_weighting_plans_for_subset(&scope("US"))
            .unwrap()
            .is_empty());

        repo.delete_weighting_plan_for_subset(&scope("UK")).unwrap();
        assert!(repo
            .get_weighting_plans_for_subset(&scope("UK"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn response_weights_replaced_per_context() {
        let repo = InMemoryResponseWeights::new();
        let wave1 = vec![WeightingFilterInstance::new("Wave", Some(1))];
        repo.create_response_weights(&scope("UK"), &wave1, &[RespondentWeightRow::new(1, 0.5)])
            .unwrap();
        repo.create_response_weights(&scope("UK"), &wave1, &[RespondentWeightRow::new(2, 1.5)])
            .unwrap();
        repo.create_response_weights_for_root(&scope("UK"), &[RespondentWeightRow::new(3, 1.0)])
            .unwrap();
        let stored = repo.get_response_weights(&scope("UK")).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].rows, vec![RespondentWeightRow::new(2, 1.5)]);

        repo.delete_response_weights(&scope("UK")).unwrap();
        assert!(repo.get_response_weights(&scope("UK")).unwrap().is_empty());
    }
}
