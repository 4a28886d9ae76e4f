use std::path::Path;

use crate::weights::*;

pub const MAX_CSV_UPLOAD_BYTES: usize = 1024 * 1024;
pub const MAX_XLSX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_TARGET_WEIGHTS_BYTES: usize = 50 * 1024 * 1024;

pub const RESPONSE_ID_COLUMN: &str = "ResponseId";
pub const WEIGHTING_COLUMN: &str = "Weighting";

const FILE_EXTENSION: &str = "xlsx";

pub fn simplify_file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
        .to_string()
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum UploadKind {
    Csv,
    Xlsx,
}

impl UploadKind {
    pub fn from_path(path: &str) -> Option<UploadKind> {
        let ext = Path::new(path)
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("csv") => Some(UploadKind::Csv),
            Some("xlsx") => Some(UploadKind::Xlsx),
            _ => None,
        }
    }

    pub fn size_limit(&self) -> usize {
        match self {
            UploadKind::Csv => MAX_CSV_UPLOAD_BYTES,
            UploadKind::Xlsx => MAX_XLSX_UPLOAD_BYTES,
        }
    }
}

pub fn check_upload_size(path: &str, size: usize, limit: usize) -> WeightsResult<()> {
    if size > limit {
        return FileTooLargeSnafu {
            path: simplify_file_name(path),
            size,
            limit,
        }
        .fail();
    }
    Ok(())
}

/// Parses a filter written as `Metric+InstanceId`. Without an instance id
/// (`Metric`) the filter does not restrict the respondents.
pub fn parse_filter(s: &str) -> WeightsResult<WeightingFilterInstance> {
    let parts: Vec<&str> = s.split('+').collect();
    match parts.as_slice() {
        [metric] if !metric.is_empty() => Ok(WeightingFilterInstance::new(metric, None)),
        [metric, id_s] if !metric.is_empty() => match id_s.trim().parse::<i64>() {
            Ok(id) => Ok(WeightingFilterInstance::new(metric, Some(id))),
            Err(_) => whatever!("Filter {:?}: could not read instance id {:?}", s, id_s),
        },
        _ => whatever!("Filter {:?} is not of the form Metric+InstanceId", s),
    }
}

fn encode_dots(s: &str) -> String {
    s.replace('.', "")
}

fn encode_key_chars(s: &str) -> String {
    encode_dots(s).replace(['+', ','], "")
}

fn is_invalid_file_name_char(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
}

/// Identifies an uploaded weight file: the subset and filter context it
/// holds weights for.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct WeightFileName {
    pub style: WeightingStyle,
    pub subset_id: String,
    pub context: Vec<WeightingFilterInstance>,
}

impl WeightFileName {
    pub fn new(
        style: WeightingStyle,
        subset_id: &str,
        context: Vec<WeightingFilterInstance>,
    ) -> WeightFileName {
        WeightFileName {
            style,
            subset_id: subset_id.to_string(),
            context,
        }
    }

    /// The canonical name under which the file is stored, for instance
    /// `ResponseWeighting.eatingout+uk.UK.Wave+3.private.xlsx`.
    pub fn to_file_name(&self, product: &ProductKey) -> String {
        let product_s = match &product.sub_product_id {
            Some(sub) => format!("{}+{}", product.short_code, sub),
            None => product.short_code.clone(),
        };
        let context_s = self
            .context
            .iter()
            .map(|f| {
                format!(
                    "{}+{}",
                    encode_key_chars(&f.filter_metric_name),
                    f.filter_instance_id
                        .map(|x| x.to_string())
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<String>>()
            .join(",");
        let name = format!(
            "{}.{}.{}.{}{}private.{}",
            self.style.as_str(),
            encode_dots(&product_s),
            encode_dots(&self.subset_id),
            context_s,
            if context_s.is_empty() { "" } else { "." },
            FILE_EXTENSION
        );
        name.chars()
            .map(|c| if is_invalid_file_name_char(c) { '_' } else { c })
            .collect()
    }

    /// Reads back a canonical file name. Returns nothing for names that were
    /// not produced by [WeightFileName::to_file_name].
    pub fn parse(file_name: &str) -> Option<WeightFileName> {
        let path = Path::new(file_name);
        let ext = path.extension()?.to_str()?;
        if !ext.eq_ignore_ascii_case(FILE_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        let parts: Vec<&str> = stem.split('.').collect();
        if parts.len() < 4 || parts.len() > 5 {
            return None;
        }
        let style = WeightingStyle::parse_ignore_case(parts[0])
            .unwrap_or(WeightingStyle::ResponseWeighting);
        let mut context: Vec<WeightingFilterInstance> = Vec::new();
        if parts.len() == 5 {
            for instance in parts[3].split(',') {
                let instance_parts: Vec<&str> = instance.split('+').collect();
                if let [metric, id_s] = instance_parts.as_slice() {
                    context.push(WeightingFilterInstance::new(metric, id_s.parse::<i64>().ok()));
                }
            }
        }
        Some(WeightFileName::new(style, parts[2], context))
    }
}

/// A data row as read from a sheet or a csv file, before any check.
#[derive(PartialEq, Debug, Clone)]
pub struct RawWeightRow {
    /// 1-based, counting the header row.
    pub row_number: usize,
    pub response_id: Option<i64>,
    pub weight: Option<f64>,
}

/// Normalized form of a header: no spaces, lower case.
pub fn normalize_header(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Finds the indexes of the response id and weighting columns.
pub fn find_weight_columns(header: &[String]) -> Option<(usize, usize)> {
    let find = |name: &str| {
        let target = normalize_header(name);
        header.iter().position(|h| normalize_header(h) == target)
    };
    Some((find(RESPONSE_ID_COLUMN)?, find(WEIGHTING_COLUMN)?))
}

/// Parses an integer response id, accepting whole numbers written as
/// decimals (`12.0`).
pub fn parse_response_id(s: &str) -> Option<i64> {
    let t = s.trim();
    if let Ok(x) = t.parse::<i64>() {
        return Some(x);
    }
    match t.parse::<f64>() {
        Ok(x) if x.is_finite() && x.fract() == 0.0 => Some(x as i64),
        _ => None,
    }
}

pub fn parse_weight(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|x| x.is_finite())
}

/// Applies the row checks shared by every file format and fills the file
/// related counters of the statistics.
///
/// Returns nothing when no row could be used.
pub fn collect_weight_rows(
    rows: Vec<RawWeightRow>,
    stats: &mut ValidationStatistics,
) -> Option<Vec<RespondentWeightRow>> {
    stats.number_of_rows = rows.len();
    if rows.is_empty() {
        stats.add_message(
            ValidationMessageType::ExcelMissingData,
            "No response weight rows found in file.".to_string(),
        );
        return None;
    }
    let mut res: Vec<RespondentWeightRow> = Vec::new();
    for row in rows {
        match (row.response_id, row.weight) {
            (Some(response_id), Some(weight)) if weight <= 0.0 => {
                debug!(
                    "collect_weight_rows: row {}: weight {} rejected",
                    row.row_number, weight
                );
                stats.rejected_in_file.push(ExtraResponseWeight {
                    response_id,
                    weight,
                    reason: ExtraResponseReason::IdWeightTooSmall,
                });
            }
            (Some(response_id), Some(weight)) => {
                res.push(RespondentWeightRow::new(response_id, weight));
            }
            (None, _) => {
                stats.number_of_rows_in_excel_ignored += 1;
                stats.add_message(
                    ValidationMessageType::ExcelIgnoringRow,
                    format!("Ignoring row {}: invalid response id", row.row_number),
                );
            }
            (Some(response_id), None) => {
                stats.number_of_rows_in_excel_ignored += 1;
                stats.add_message(
                    ValidationMessageType::ExcelIgnoringRow,
                    format!(
                        "Ignoring row {}: invalid weight for response id {}",
                        row.row_number, response_id
                    ),
                );
            }
        }
    }
    stats.number_of_valid_rows_in_excel = res.len();
    if res.is_empty() {
        warn!("collect_weight_rows: no usable row in {}", stats.excel_file_name);
        stats.add_message(
            ValidationMessageType::ExcelMissingData,
            "No rows read in from Excel".to_string(),
        );
        return None;
    }
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> ProductKey {
        ProductKey::new("eating.out", Some("uk"))
    }

    #[test]
    fn file_name_without_context() {
        let f = WeightFileName::new(WeightingStyle::ResponseWeighting, "UK.all", vec![]);
        assert_eq!(
            f.to_file_name(&product()),
            "ResponseWeighting.eatingout+uk.UKall.private.xlsx"
        );
    }

    #[test]
    fn file_name_with_context() {
        let f = WeightFileName::new(
            WeightingStyle::ResponseWeighting,
            "UK",
            vec![
                WeightingFilterInstance::new("Wa.ve+", Some(3)),
                WeightingFilterInstance::new("Region", None),
            ],
        );
        let name = f.to_file_name(&ProductKey::new("eo", None));
        assert_eq!(name, "ResponseWeighting.eo.UK.Wave+3,Region+.private.xlsx");
        let back = WeightFileName::parse(&name).unwrap();
        assert_eq!(back.subset_id, "UK");
        assert_eq!(
            back.context,
            vec![
                WeightingFilterInstance::new("Wave", Some(3)),
                WeightingFilterInstance::new("Region", None),
            ]
        );
    }

    #[test]
    fn invalid_chars_replaced() {
        let f = WeightFileName::new(WeightingStyle::Rim, "A/B:C", vec![]);
        assert_eq!(
            f.to_file_name(&ProductKey::new("eo", None)),
            "Rim.eo.A_B_C.private.xlsx"
        );
    }

    #[test]
    fn parse_names() {
        assert_eq!(WeightFileName::parse("ResponseWeighting.eo.UK.private.csv"), None);
        assert_eq!(WeightFileName::parse("eo.UK.private.xlsx"), None);
        let f = WeightFileName::parse("rim.eo.UK.private.XLSX").unwrap();
        assert_eq!(f.style, WeightingStyle::Rim);
        let f = WeightFileName::parse("Other.eo.UK.private.xlsx").unwrap();
        assert_eq!(f.style, WeightingStyle::ResponseWeighting);
        let f = WeightFileName::parse("ResponseWeighting.eo.UK.Wave+x,Bad.private.xlsx").unwrap();
        assert_eq!(f.context, vec![WeightingFilterInstance::new("Wave", None)]);
    }

    #[test]
    fn filters() {
        assert_eq!(
            parse_filter("Wave+3").unwrap(),
            WeightingFilterInstance::new("Wave", Some(3))
        );
        assert_eq!(
            parse_filter("Region").unwrap(),
            WeightingFilterInstance::new("Region", None)
        );
        assert!(parse_filter("Wave+x").is_err());
        assert!(parse_filter("").is_err());
    }

    #[test]
    fn upload_limits() {
        assert_eq!(UploadKind::from_path("w.CSV"), Some(UploadKind::Csv));
        assert_eq!(UploadKind::from_path("w.xls"), None);
        assert!(check_upload_size("a/w.csv", MAX_CSV_UPLOAD_BYTES, MAX_CSV_UPLOAD_BYTES).is_ok());
        let res = check_upload_size("a/w.csv", MAX_CSV_UPLOAD_BYTES + 1, MAX_CSV_UPLOAD_BYTES);
        assert!(matches!(res, Err(WeightsError::FileTooLarge { path, .. }) if path == "w.csv"));
    }

    #[test]
    fn headers() {
        let header: Vec<String> = vec!["Weighting ".to_string(), "response id".to_string()];
        assert_eq!(find_weight_columns(&header), Some((1, 0)));
        let header: Vec<String> = vec!["ResponseId".to_string(), "Weight".to_string()];
        assert_eq!(find_weight_columns(&header), None);
    }

    #[test]
    fn row_checks() {
        let mut stats = ValidationStatistics::new("f.xlsx", "UK");
        let rows = vec![
            RawWeightRow { row_number: 2, response_id: Some(1), weight: Some(1.5) },
            RawWeightRow { row_number: 3, response_id: None, weight: Some(1.0) },
            RawWeightRow { row_number: 4, response_id: Some(2), weight: Some(-5.0) },
            RawWeightRow { row_number: 5, response_id: Some(3), weight: None },
            RawWeightRow { row_number: 6, response_id: Some(1), weight: Some(0.5) },
        ];
        let res = collect_weight_rows(rows, &mut stats).unwrap();
        assert_eq!(
            res,
            vec![RespondentWeightRow::new(1, 1.5), RespondentWeightRow::new(1, 0.5)]
        );
        assert_eq!(stats.number_of_rows, 5);
        assert_eq!(stats.number_of_valid_rows_in_excel, 2);
        assert_eq!(stats.number_of_rows_in_excel_ignored, 2);
        assert_eq!(stats.rejected_in_file[0].reason, ExtraResponseReason::IdWeightTooSmall);
        assert!(!stats.has_fatal_message());
    }

    #[test]
    fn all_rows_ignored() {
        let mut stats = ValidationStatistics::new("f.xlsx", "UK");
        let rows = vec![RawWeightRow { row_number: 2, response_id: None, weight: None }];
        assert_eq!(collect_weight_rows(rows, &mut stats), None);
        assert!(stats.has_message(ValidationMessageType::ExcelMissingData));
        assert_eq!(stats.messages.last().unwrap().text, "No rows read in from Excel");
    }
}
