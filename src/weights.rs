use log::{debug, info, warn};

use response_weighting::reversal::GeneratedWeightings;
use response_weighting::*;
use snafu::{prelude::*, ErrorCompat, Snafu};

use std::fs;
use std::path::Path;

use serde_json::json;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::{Args, Command};
use crate::weights::config_reader::*;
use crate::weights::export::ExportableModel;
use crate::weights::io_common::{parse_filter, WeightFileName};
use crate::weights::service::WeightingFileService;

pub mod config_reader;
pub mod export;
pub mod fanout;
pub mod io_common;
pub mod io_csv;
pub mod io_excel;
pub mod report;
pub mod service;
pub mod store;

#[derive(Debug, Snafu)]
pub enum WeightsError {
    #[snafu(display("Error opening file {path}"))]
    OpeningExcel {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error opening json file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing json"))]
    ParsingJson { source: serde_json::Error },
    #[snafu(display("Error opening csv file {path}"))]
    CsvOpen { source: csv::Error, path: String },
    #[snafu(display("Error reading line {lineno} of the csv file"))]
    CsvLine { source: csv::Error, lineno: usize },
    #[snafu(display("Error writing the spreadsheet"))]
    WritingExcel { source: rust_xlsxwriter::XlsxError },
    #[snafu(display("IO error on {path}"))]
    Io {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("File {path} is {size} bytes, the limit is {limit} bytes"))]
    FileTooLarge {
        path: String,
        size: usize,
        limit: usize,
    },
    #[snafu(display("{source}"))]
    Weighting { source: WeightingErrors },
    #[snafu(display("{message}"))]
    UnsupportedConfiguration { message: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

pub type WeightsResult<T> = Result<T, WeightsError>;

/// Summary of a validation, as printed by the command line.
pub fn statistics_to_json(stats: &ValidationStatistics) -> JSValue {
    let messages: Vec<JSValue> = stats
        .messages
        .iter()
        .map(|m| json!({"type": format!("{:?}", m.message_type), "text": m.text}))
        .collect();
    let extras: Vec<JSValue> = stats
        .extra_responses_in_excel
        .iter()
        .map(|e| {
            json!({
                "responseId": e.response_id,
                "weight": e.weight,
                "reason": format!("{:?}", e.reason)
            })
        })
        .collect();
    let with_reason = |reason: InvalidResponseReason| -> Vec<i64> {
        stats
            .error_responses_for_this_survey_and_wave
            .iter()
            .filter(|e| e.reason == reason)
            .map(|e| e.response_id)
            .collect()
    };
    json!({
        "file": stats.excel_file_name,
        "subsetId": stats.subset_id,
        "isValid": stats.is_valid,
        "numberOfRows": stats.number_of_rows,
        "numberOfValidRows": stats.number_of_valid_rows_in_excel,
        "numberOfIgnoredRows": stats.number_of_rows_in_excel_ignored,
        "numberOfValidWeights": stats.valid_weights.len(),
        "minWeight": stats.min_weight,
        "maxWeight": stats.max_weight,
        "responsesMatched": stats.number_of_responses_matched,
        "responsesExpected": stats.number_of_responses_in_database_for_this_survey_and_wave,
        "messages": messages,
        "extraResponses": extras,
        "missingResponses": with_reason(InvalidResponseReason::IdMissingFromUpload),
        "invalidWeights": with_reason(InvalidResponseReason::IdInvalidWeight),
    })
}

fn generated_to_json(generated: &GeneratedWeightings) -> JSValue {
    let subsets: Vec<JSValue> = generated
        .subsets
        .iter()
        .map(|s| {
            json!({
                "subsetId": s.subset_id,
                "plans": s.plans.iter().map(PlanJs::from).collect::<Vec<PlanJs>>(),
                "errors": s.errors,
            })
        })
        .collect();
    json!({
        "subsets": subsets,
        "warnings": generated.warnings,
        "errors": generated.errors,
    })
}

fn print_json(js: &JSValue) -> WeightsResult<String> {
    let pretty = serde_json::to_string_pretty(js).context(ParsingJsonSnafu {})?;
    println!("{}", pretty);
    Ok(pretty)
}

fn write_output(path: &str, bytes: &[u8]) -> WeightsResult<()> {
    fs::write(path, bytes).context(IoSnafu { path })?;
    info!("write_output: wrote {} bytes to {}", bytes.len(), path);
    Ok(())
}

fn write_export(model: &dyn ExportableModel, out: &Option<String>) -> WeightsResult<()> {
    let exporter = model.create_exporter();
    let out_p = out.clone().unwrap_or_else(|| exporter.file_name());
    debug!("write_export: {} as {}", out_p, exporter.content_type());
    write_output(&out_p, &exporter.export()?)
}

fn weight_file(subset: &str, filters: &[String]) -> WeightsResult<WeightFileName> {
    Ok(WeightFileName::new(
        WeightingStyle::ResponseWeighting,
        subset,
        parse_filters(filters)?,
    ))
}

fn parse_filters(filters: &[String]) -> WeightsResult<Vec<WeightingFilterInstance>> {
    filters.iter().map(|f| parse_filter(f)).collect()
}

pub async fn run_command(args: &Args) -> WeightsResult<()> {
    let config_p = Path::new(args.config.as_str());
    let config = read_job_config(&args.config)?;
    debug!("run_command: config: {:?}", config);
    let root_p = config_p.parent().unwrap_or_else(|| Path::new("."));
    let settings = validate_job_config(&config, root_p)?;
    let service = WeightingFileService::open(&settings)?;
    let token = CancellationToken::new();

    match &args.command {
        Command::Template {
            subset,
            filter,
            out,
        } => {
            let file = weight_file(subset, filter)?;
            let bytes = service.generate_template(&file)?;
            let out_p = out
                .clone()
                .unwrap_or_else(|| file.to_file_name(&settings.product));
            write_output(&out_p, &bytes)?;
        }
        Command::Validate {
            subset,
            filter,
            input,
            reference,
        } => {
            let file = weight_file(subset, filter)?;
            if let Some(input_p) = input {
                let upload = service.upload_file(&file, input_p).await?;
                if upload.has_fatal_message() {
                    warn!("run_command: upload of {} rejected", input_p);
                    print_json(&statistics_to_json(&upload))?;
                    whatever!("File '{}' failed check", input_p)
                }
            }
            let stats = service.validate(&file, &token).await?;
            let pretty = print_json(&statistics_to_json(&stats))?;
            if let Some(reference_p) = reference {
                let reference_js = read_json(reference_p)?;
                let pretty_reference =
                    serde_json::to_string_pretty(&reference_js).context(ParsingJsonSnafu {})?;
                if pretty_reference != pretty {
                    warn!("Found differences with the reference validation");
                    print_diff(pretty_reference.as_str(), pretty.as_str(), "\n");
                    whatever!("Difference detected between the validation and the reference")
                }
            }
        }
        Command::Errors {
            subset,
            filter,
            out,
        } => {
            let file = weight_file(subset, filter)?;
            let model = service.download_errors(&file, &token).await?;
            write_export(&model, out)?;
        }
        Command::Push { subset, filter } => {
            let file = weight_file(subset, filter)?;
            let outcome = service.push(&file, &token).await?;
            print_json(&json!({
                "rowsWritten": outcome.rows_written,
                "defaulted": outcome.defaulted,
                "targetsCreated": outcome.targets_created,
            }))?;
        }
        Command::Files => {
            let files = service.get_files().await?;
            let js: Vec<JSValue> = files
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "size": f.size,
                        "lastModified": f.last_modified.map(|d| d.to_rfc3339()),
                        "subsetId": f.file.subset_id,
                        "style": f.file.style.as_str(),
                    })
                })
                .collect();
            print_json(&json!(js))?;
        }
        Command::Delete { subset, filter } => {
            let file = weight_file(subset, filter)?;
            if !service.delete_file(&file).await? {
                whatever!("File '{}' does not exist.", file.to_file_name(&settings.product))
            }
        }
        Command::Plans { subset, input } => {
            if let Some(input_p) = input {
                let plans = read_plans(input_p)?;
                service.set_plans(subset, &plans)?;
            }
            let plans = service.plans(subset)?;
            print_json(&json!(plans.iter().map(PlanJs::from).collect::<Vec<PlanJs>>()))?;
        }
        Command::Generate {
            input,
            subsets,
            post,
        } => {
            let generated = service
                .generate_target_weights(input, subsets, *post, &token)
                .await?;
            if !*post {
                info!("run_command: preview only, pass --post to store the plans");
            }
            print_json(&generated_to_json(&generated))?;
        }
        Command::Rim {
            subset,
            filter,
            details,
        } => {
            let filters = parse_filters(filter)?;
            let res = service.validate_rim_scheme(subset, &filters, *details)?;
            let cells: Option<Vec<JSValue>> = res.quota_details.as_ref().map(|ds| {
                ds.iter()
                    .map(|d| {
                        json!({
                            "quotaCell": d.quota_cell.key(),
                            "sampleSize": d.sample_size,
                            "scaleFactor": d.scale_factor,
                            "targetWeight": d.target_weight,
                        })
                    })
                    .collect()
            });
            print_json(&json!({
                "converged": res.converged,
                "iterations": res.iterations,
                "minWeight": res.min_weight,
                "maxWeight": res.max_weight,
                "efficiency": res.efficiency,
                "quotaDetails": cells,
                "distribution": res.distribution.as_ref().map(|d| d.buckets.clone()),
            }))?;
        }
        Command::SampleSizes {
            subset,
            metric,
            out,
        } => {
            let model = service.respondent_weights_report(subset, metric)?;
            write_export(&model, out)?;
        }
        Command::Export {
            subset,
            filter,
            out,
        } => {
            let filters = parse_filters(filter)?;
            let model = if subset.len() == 1 {
                service.export_respondent_weights_for_subset(&subset[0], &filters)?
            } else {
                service.export_respondent_weights(subset, &filters)?
            };
            write_export(&model, out)?;
        }
    }
    Ok(())
}

/// Runs a command and reports the error, if any. Returns false on failure.
pub async fn run_and_report(args: &Args) -> bool {
    match run_command(args).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Error occured {:?}", e);
            eprintln!("An error occured {}", e);
            if let Some(bt) = ErrorCompat::backtrace(&e) {
                eprintln!("trace: {}", bt);
            }
            false
        }
    }
}

pub fn read_json(path: &str) -> WeightsResult<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu {})
}
