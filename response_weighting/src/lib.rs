//! Validation and reconciliation of respondent level survey weights.
//!
//! The library checks uploaded response weights against the responses expected
//! for a subset ([`reconcile`]), computes rim weights ([`rim`]), turns
//! reference weights into target weighted plans ([`reversal`]) and computes the
//! sample sizes behind each weighting scheme ([`sample_size`]).
//!
//! Storage is reached through the traits of [`repository`].
//!
//! See the [`manual`] for the file formats and the rules applied.

pub mod builder;
pub mod cancellation;
mod config;
pub mod manual;
pub mod reconcile;
pub mod repository;
pub mod reversal;
pub mod rim;
pub mod sample_size;

pub use crate::cancellation::CancellationToken;
pub use crate::config::*;
pub use crate::reconcile::{ErrorReportRow, PushOutcome, ReconciliationEngine, ReportHighlight};
pub use crate::sample_size::{get_description, get_total_description};
