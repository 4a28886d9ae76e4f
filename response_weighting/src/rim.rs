//! Rim weighting: iterative proportional fitting of quota cell weights to the
//! targets of each dimension.

use std::collections::HashMap;

use log::{debug, warn};

use crate::config::*;

/// Maximum change of a weight between two passes for the weights to be
/// considered converged.
pub const POINT_TOLERANCE: f64 = 0.00005;

const MAX_ITERATIONS: u32 = 50;

const DEFAULT_WEIGHT: f64 = 1.0;

/// Target sample size of each category of a dimension.
#[derive(PartialEq, Debug, Clone)]
pub struct RimDimensionTargets {
    pub name: String,
    pub category_targets: Vec<(i64, f64)>,
}

/// The weight found for one quota cell.
#[derive(PartialEq, Debug, Clone)]
pub struct QuotaWeightingDetails {
    pub quota_cell: QuotaCell,
    pub sample_size: f64,
    pub scale_factor: f64,
    pub target_weight: f64,
}

/// Number of respondents per range of weights.
#[derive(PartialEq, Debug, Clone)]
pub struct WeightsDistribution {
    pub bucket_width: f64,
    pub buckets: Vec<u64>,
}

impl WeightsDistribution {
    pub const NUMBER_OF_BUCKETS: usize = 50;
    pub const BUCKET_WIDTH: f64 = 0.1;

    pub fn new() -> WeightsDistribution {
        WeightsDistribution {
            bucket_width: WeightsDistribution::BUCKET_WIDTH,
            buckets: vec![0; WeightsDistribution::NUMBER_OF_BUCKETS],
        }
    }

    /// Weights past the last bucket are counted in it.
    pub fn add(&mut self, weight: f64, count: u64) {
        let idx = (weight / self.bucket_width).max(0.0) as usize;
        let idx = idx.min(self.buckets.len() - 1);
        self.buckets[idx] += count;
    }
}

impl Default for WeightsDistribution {
    fn default() -> Self {
        WeightsDistribution::new()
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct RimWeightingCalculationResult {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Weighting efficiency, between 0 and 1.
    pub efficiency: f64,
    pub converged: bool,
    pub iterations: u32,
    pub quota_details: Option<Vec<QuotaWeightingDetails>>,
    pub distribution: Option<WeightsDistribution>,
}

impl RimWeightingCalculationResult {
    fn empty() -> RimWeightingCalculationResult {
        RimWeightingCalculationResult {
            min_weight: 0.0,
            max_weight: 0.0,
            efficiency: 0.0,
            converged: false,
            iterations: 0,
            quota_details: None,
            distribution: None,
        }
    }
}

/// Computes the weight of every quota cell from the sample size of the cells
/// and the targets of each dimension.
pub trait RimWeightingCalculator: Send + Sync {
    /// `cells` holds every combination of dimension categories with its
    /// sample size. With `include_quota_details`, the result carries the weight
    /// of each cell, otherwise the distribution of the weights.
    fn calculate(
        &self,
        cells: &[(QuotaCell, f64)],
        dimensions: &[RimDimensionTargets],
        include_quota_details: bool,
    ) -> RimWeightingCalculationResult;
}

/// The standard raking algorithm: the cells of each category are scaled in
/// turn to match the category target, until the weights stop moving.
#[derive(Debug, Clone)]
pub struct IterativeRimCalculator {
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for IterativeRimCalculator {
    fn default() -> Self {
        IterativeRimCalculator {
            tolerance: POINT_TOLERANCE,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

impl RimWeightingCalculator for IterativeRimCalculator {
    fn calculate(
        &self,
        cells: &[(QuotaCell, f64)],
        dimensions: &[RimDimensionTargets],
        include_quota_details: bool,
    ) -> RimWeightingCalculationResult {
        if cells.is_empty() {
            return RimWeightingCalculationResult::empty();
        }
        let original: Vec<f64> = cells.iter().map(|(_, s)| *s).collect();
        let mut adjusted: Vec<f64> = original.clone();
        let mut weights: Vec<f64> = vec![DEFAULT_WEIGHT; cells.len()];

        let categories: Vec<(Vec<usize>, f64)> = dimensions
            .iter()
            .flat_map(|d| cells_with_target(cells, d))
            .collect();

        let mut converged = false;
        let mut iterations: u32 = 0;
        // One initial pass plus at most max_iterations more.
        while !converged && iterations <= self.max_iterations {
            for (indexes, target) in categories.iter() {
                let total: f64 = indexes.iter().map(|i| adjusted[*i]).sum();
                if total == 0.0 {
                    // Nobody in this category: the cells stay empty.
                    continue;
                }
                let factor = target / total;
                for i in indexes.iter() {
                    adjusted[*i] *= factor;
                }
            }
            let new_weights: Vec<f64> = original
                .iter()
                .zip(adjusted.iter())
                .map(|(o, a)| if *o == 0.0 { DEFAULT_WEIGHT } else { a / o })
                .collect();
            converged = new_weights
                .iter()
                .zip(weights.iter())
                .all(|(n, w)| (n - w).abs() <= self.tolerance);
            weights = new_weights;
            iterations += 1;
        }
        if !converged {
            warn!(
                "rim weighting did not converge after {} iterations",
                iterations
            );
        }
        debug!("rim weighting: iterations: {} weights: {:?}", iterations, weights);

        let min_weight = weights.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_weight = weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let total_sample: f64 = original.iter().sum();
        let efficiency = efficiency(&original, &weights, total_sample);

        let (quota_details, distribution) = if include_quota_details {
            let scale_factors: HashMap<String, f64> = cells
                .iter()
                .zip(weights.iter())
                .map(|((c, _), w)| (c.key(), *w))
                .collect();
            let targets = scale_factors_to_target_weights(cells, &scale_factors, total_sample);
            let details = cells
                .iter()
                .zip(weights.iter())
                .map(|((c, s), w)| QuotaWeightingDetails {
                    quota_cell: c.clone(),
                    sample_size: *s,
                    scale_factor: *w,
                    target_weight: targets.get(&c.key()).cloned().unwrap_or(0.0),
                })
                .collect();
            (Some(details), None)
        } else {
            let mut dist = WeightsDistribution::new();
            for (s, w) in original.iter().zip(weights.iter()) {
                dist.add(*w, *s as u64);
            }
            (None, Some(dist))
        };

        RimWeightingCalculationResult {
            min_weight,
            max_weight,
            efficiency,
            converged,
            iterations,
            quota_details,
            distribution,
        }
    }
}

fn cells_with_target(
    cells: &[(QuotaCell, f64)],
    dimension: &RimDimensionTargets,
) -> Vec<(Vec<usize>, f64)> {
    dimension
        .category_targets
        .iter()
        .map(|(category, target)| {
            let indexes: Vec<usize> = cells
                .iter()
                .enumerate()
                .filter(|(_, (c, _))| c.key_part_for(&dimension.name) == Some(*category))
                .map(|(i, _)| i)
                .collect();
            (indexes, *target)
        })
        .collect()
}

// (sum n.w)^2 / N / sum n.w^2
fn efficiency(samples: &[f64], weights: &[f64], total_sample: f64) -> f64 {
    let sum_weights: f64 = samples.iter().zip(weights).map(|(n, w)| n * w).sum();
    let sum_squares: f64 = samples.iter().zip(weights).map(|(n, w)| n * w * w).sum();
    if total_sample == 0.0 || sum_squares == 0.0 {
        return 0.0;
    }
    sum_weights.powi(2) / total_sample / sum_squares
}

/// The share of the weighted population in each cell: sample size times
/// scale factor over the total sample size.
pub fn scale_factors_to_target_weights(
    cells: &[(QuotaCell, f64)],
    scale_factors: &HashMap<String, f64>,
    total_sample: f64,
) -> HashMap<String, f64> {
    cells
        .iter()
        .filter_map(|(c, sample)| {
            let key = c.key();
            scale_factors.get(&key).map(|scale| {
                let target = if total_sample == 0.0 {
                    0.0
                } else {
                    sample * scale / total_sample
                };
                (key, target)
            })
        })
        .collect()
}
