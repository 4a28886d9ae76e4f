pub use crate::config::*;

use crate::rim::POINT_TOLERANCE;

/// A builder for rim weighting schemes.
///
/// Each dimension is added with the target of each of its categories. The
/// targets of a dimension must sum to 1.
///
/// ```
/// pub use response_weighting::builder::PlanBuilder;
/// # use response_weighting::WeightingErrors;
///
/// let plans = PlanBuilder::new()
///     .dimension("Gender", &[(1, 0.48), (2, 0.52)])?
///     .dimension("Age", &[(1, 0.3), (2, 0.3), (3, 0.4)])?
///     .build()?;
///
/// assert!(response_weighting::are_all_plans_rim(&plans));
///
/// # Ok::<(), WeightingErrors>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    _plans: Vec<WeightingPlanConfiguration>,
}

impl PlanBuilder {
    pub fn new() -> PlanBuilder {
        PlanBuilder::default()
    }

    /// Adds a dimension to the scheme.
    pub fn dimension(self, variable: &str, targets: &[(i64, f64)]) -> Result<PlanBuilder, WeightingErrors> {
        if self._plans.iter().any(|p| p.variable_identifier == variable) {
            return Err(WeightingErrors::InvalidPlan(format!(
                "Dimension {} added twice",
                variable
            )));
        }
        let sum: f64 = targets.iter().map(|(_, t)| t).sum();
        if targets.is_empty() || (sum - 1.0).abs() > POINT_TOLERANCE {
            return Err(WeightingErrors::InvalidPlan(format!(
                "Targets of {} sum to {}",
                variable, sum
            )));
        }
        let mut plans = self._plans;
        plans.push(WeightingPlanConfiguration::new(
            variable,
            targets
                .iter()
                .map(|(id, t)| WeightingTargetConfiguration::leaf(*id, Some(*t)))
                .collect(),
        ));
        Ok(PlanBuilder { _plans: plans })
    }

    pub fn build(self) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors> {
        if self._plans.is_empty() {
            return Err(WeightingErrors::InvalidPlan(
                "A scheme needs at least one dimension".to_string(),
            ));
        }
        Ok(self._plans)
    }

    /// Builds a scheme that weights each wave independently with the same
    /// dimensions.
    pub fn build_per_wave(
        self,
        wave_variable: &str,
        waves: &[i64],
    ) -> Result<Vec<WeightingPlanConfiguration>, WeightingErrors> {
        let plans = self.build()?;
        let child_targets = waves
            .iter()
            .map(|w| WeightingTargetConfiguration {
                entity_instance_id: *w,
                target: None,
                target_population: None,
                child_plans: plans.clone(),
            })
            .collect();
        Ok(vec![WeightingPlanConfiguration {
            variable_identifier: wave_variable.to_string(),
            is_weighting_group_root: true,
            child_targets,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_must_sum_to_one() {
        let res = PlanBuilder::new().dimension("Gender", &[(1, 0.4), (2, 0.4)]);
        assert!(matches!(res, Err(WeightingErrors::InvalidPlan(_))));
    }

    #[test]
    fn no_dimension() {
        assert!(PlanBuilder::new().build().is_err());
    }

    #[test]
    fn wave_scheme() {
        let plans = PlanBuilder::new()
            .dimension("Gender", &[(1, 0.5), (2, 0.5)])
            .unwrap()
            .build_per_wave("Wave", &[1, 2])
            .unwrap();
        assert!(is_wave_plan(&plans));
        assert_eq!(plans[0].child_targets.len(), 2);
        assert!(are_all_plans_rim(&plans[0].child_targets[1].child_plans));
        assert_eq!(plan_dimensions(&plans), vec!["Wave", "Gender"]);
    }
}
