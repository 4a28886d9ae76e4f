//! Downloadable documents.
//!
//! Every document is a model that knows how to build its exporter, so the
//! command line never needs to know which kind of document it writes.

use response_weighting::sample_size::SampleSizeReportRow;

use crate::weights::io_csv::write_csv;
use crate::weights::report::error_report_xlsx;
use crate::weights::*;

pub const CSV_CONTENT_TYPE: &str = "text/csv";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const EXPORT_DATE_FORMAT: &str = "%Y-%-m-%-d";

pub trait Exporter {
    /// Default name of the document.
    fn file_name(&self) -> String;

    fn content_type(&self) -> &'static str;

    fn export(&self) -> WeightsResult<Vec<u8>>;
}

pub trait ExportableModel {
    fn create_exporter(&self) -> Box<dyn Exporter + '_>;
}

fn format_number(x: f64) -> String {
    format!("{}", x)
}

fn format_opt<T: ToString>(x: &Option<T>) -> String {
    x.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

// ******** Error report ********

#[derive(PartialEq, Debug, Clone)]
pub struct ErrorReportModel {
    /// Name of the weight file the report is about.
    pub weight_file_name: String,
    pub rows: Vec<ErrorReportRow>,
}

struct ErrorReportExporter<'a> {
    model: &'a ErrorReportModel,
}

impl<'a> Exporter for ErrorReportExporter<'a> {
    fn file_name(&self) -> String {
        let stem = self
            .model
            .weight_file_name
            .strip_suffix(".xlsx")
            .unwrap_or(&self.model.weight_file_name);
        format!("{}.errors.xlsx", stem)
    }

    fn content_type(&self) -> &'static str {
        XLSX_CONTENT_TYPE
    }

    fn export(&self) -> WeightsResult<Vec<u8>> {
        error_report_xlsx(&self.model.rows)
    }
}

impl ExportableModel for ErrorReportModel {
    fn create_exporter(&self) -> Box<dyn Exporter + '_> {
        Box::new(ErrorReportExporter { model: self })
    }
}

// ******** Respondent weights ********

#[derive(PartialEq, Debug, Clone)]
pub struct RespondentWeightExportRow {
    pub subset_id: String,
    pub wave_id: Option<i64>,
    pub response_id: i64,
    pub weight: f64,
    /// ISO date, as stored with the respondent.
    pub completed_date: Option<String>,
    pub description: String,
}

/// The weight of every respondent of one or several subsets.
#[derive(PartialEq, Debug, Clone)]
pub struct RespondentWeightsExport {
    /// A single subset export leaves the completion date out.
    pub per_subset: bool,
    pub subset_ids: Vec<String>,
    pub rows: Vec<RespondentWeightExportRow>,
}

struct RespondentWeightsExporter<'a> {
    model: &'a RespondentWeightsExport,
}

fn export_date(iso: &Option<String>) -> String {
    match iso
        .as_deref()
        .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    {
        Some(d) => d.format(EXPORT_DATE_FORMAT).to_string(),
        None => String::new(),
    }
}

impl<'a> Exporter for RespondentWeightsExporter<'a> {
    fn file_name(&self) -> String {
        format!("RespondentWeights.{}.csv", self.model.subset_ids.join("_"))
    }

    fn content_type(&self) -> &'static str {
        CSV_CONTENT_TYPE
    }

    fn export(&self) -> WeightsResult<Vec<u8>> {
        let mut header = vec!["SubsetId", "WaveId", "ResponseId", "Weight", ""];
        if !self.model.per_subset {
            header.push("Completed date (yyyy-M-d)");
        }
        header.push("Information on Quota cell assignment");
        let rows: Vec<Vec<String>> = self
            .model
            .rows
            .iter()
            .map(|r| {
                let mut row = vec![
                    r.subset_id.clone(),
                    format_opt(&r.wave_id),
                    r.response_id.to_string(),
                    format_number(r.weight),
                    String::new(),
                ];
                if !self.model.per_subset {
                    row.push(export_date(&r.completed_date));
                }
                row.push(r.description.clone());
                row
            })
            .collect();
        write_csv(&header, &rows)
    }
}

impl ExportableModel for RespondentWeightsExport {
    fn create_exporter(&self) -> Box<dyn Exporter + '_> {
        Box::new(RespondentWeightsExporter { model: self })
    }
}

// ******** Sample size report ********

#[derive(PartialEq, Debug, Clone)]
pub struct SampleSizeReportModel {
    pub subset_id: String,
    pub rows: Vec<SampleSizeReportRow>,
}

struct SampleSizeReportExporter<'a> {
    model: &'a SampleSizeReportModel,
}

impl<'a> Exporter for SampleSizeReportExporter<'a> {
    fn file_name(&self) -> String {
        format!("RespondentWeightsReport.{}.csv", self.model.subset_id)
    }

    fn content_type(&self) -> &'static str {
        CSV_CONTENT_TYPE
    }

    fn export(&self) -> WeightsResult<Vec<u8>> {
        let header = [
            "MetricName",
            "InstanceName",
            "Id",
            "Sample size",
            "Sample size by Quota",
            "Description",
        ];
        let rows: Vec<Vec<String>> = self
            .model
            .rows
            .iter()
            .map(|r| {
                vec![
                    r.metric_name.clone(),
                    r.instance_name.clone(),
                    format_opt(&r.instance_id),
                    format_opt(&r.sample_size),
                    format_opt(&r.sample_size_by_quota),
                    format_opt(&r.description),
                ]
            })
            .collect();
        write_csv(&header, &rows)
    }
}

impl ExportableModel for SampleSizeReportModel {
    fn create_exporter(&self) -> Box<dyn Exporter + '_> {
        Box::new(SampleSizeReportExporter { model: self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights_model(per_subset: bool) -> RespondentWeightsExport {
        RespondentWeightsExport {
            per_subset,
            subset_ids: vec!["UK".to_string()],
            rows: vec![RespondentWeightExportRow {
                subset_id: "UK".to_string(),
                wave_id: Some(2),
                response_id: 11,
                weight: 1.25,
                completed_date: Some("2023-01-05".to_string()),
                description: "Gender:1".to_string(),
            }],
        }
    }

    fn exported(model: &dyn ExportableModel) -> String {
        String::from_utf8(model.create_exporter().export().unwrap()).unwrap()
    }

    #[test]
    fn respondent_weights_all_subsets() {
        let model = weights_model(false);
        assert_eq!(
            exported(&model),
            "SubsetId,WaveId,ResponseId,Weight,,Completed date (yyyy-M-d),Information on Quota cell assignment\n\
             UK,2,11,1.25,,2023-1-5,Gender:1\n"
        );
        assert_eq!(model.create_exporter().content_type(), CSV_CONTENT_TYPE);
    }

    #[test]
    fn respondent_weights_one_subset() {
        let model = weights_model(true);
        assert_eq!(
            exported(&model),
            "SubsetId,WaveId,ResponseId,Weight,,Information on Quota cell assignment\n\
             UK,2,11,1.25,,Gender:1\n"
        );
        assert_eq!(model.create_exporter().file_name(), "RespondentWeights.UK.csv");
    }

    #[test]
    fn sample_size_report() {
        let model = SampleSizeReportModel {
            subset_id: "UK".to_string(),
            rows: vec![
                SampleSizeReportRow {
                    metric_name: "Gender".to_string(),
                    instance_name: "Male".to_string(),
                    instance_id: Some(1),
                    sample_size: Some(10.0),
                    sample_size_by_quota: Some(7.0),
                    description: Some("!3".to_string()),
                },
                SampleSizeReportRow {
                    metric_name: "Total respondents".to_string(),
                    instance_name: String::new(),
                    instance_id: None,
                    sample_size: Some(10.0),
                    sample_size_by_quota: None,
                    description: None,
                },
            ],
        };
        assert_eq!(
            exported(&model),
            "MetricName,InstanceName,Id,Sample size,Sample size by Quota,Description\n\
             Gender,Male,1,10,7,!3\n\
             Total respondents,,,10,,\n"
        );
    }

    #[test]
    fn error_report_name() {
        let model = ErrorReportModel {
            weight_file_name: "ResponseWeighting.eo.UK.private.xlsx".to_string(),
            rows: vec![],
        };
        let exporter = model.create_exporter();
        assert_eq!(exporter.file_name(), "ResponseWeighting.eo.UK.private.errors.xlsx");
        assert_eq!(exporter.content_type(), XLSX_CONTENT_TYPE);
    }
}
