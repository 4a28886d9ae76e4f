// Primitives for reading and writing CSV files.

use std::collections::BTreeMap;
use std::path::Path;

use crate::weights::io_common::*;
use crate::weights::*;

const RESPONDENT_FIXED_COLUMNS: [&str; 4] = ["ResponseId", "SubsetId", "Archived", "CompletedDate"];

fn reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes)
}

/// Reads the weights of a csv file, with the same checks as for
/// spreadsheets.
pub fn read_weights_csv(
    bytes: &[u8],
    stats: &mut ValidationStatistics,
) -> Option<Vec<RespondentWeightRow>> {
    stats.number_of_bytes = bytes.len();
    let mut records = reader(bytes).into_records();
    let header: Vec<String> = match records.next() {
        Some(Ok(h)) => h.iter().map(|s| s.to_string()).collect(),
        Some(Err(e)) => {
            warn!("read_weights_csv: {}: {:?}", stats.excel_file_name, e);
            stats.add_message(
                ValidationMessageType::ExcelInvalidFile,
                "File supplied could not be read as a CSV file.".to_string(),
            );
            return None;
        }
        None => vec![],
    };
    let (id_idx, weight_idx) = match find_weight_columns(&header) {
        Some(x) => x,
        None => {
            stats.add_message(
                ValidationMessageType::ExcelMissingSheet,
                format!(
                    "Unable to find a sheet with columns named {} and {}.",
                    RESPONSE_ID_COLUMN, WEIGHTING_COLUMN
                ),
            );
            return None;
        }
    };

    let mut raw: Vec<RawWeightRow> = Vec::new();
    for (idx, line_r) in records.enumerate() {
        let row_number = idx + 2;
        match line_r {
            Ok(line) => {
                if line.iter().all(|s| s.trim().is_empty()) {
                    continue;
                }
                raw.push(RawWeightRow {
                    row_number,
                    response_id: line.get(id_idx).and_then(parse_response_id),
                    weight: line.get(weight_idx).and_then(parse_weight),
                });
            }
            Err(e) => {
                debug!("read_weights_csv: row {}: {:?}", row_number, e);
                raw.push(RawWeightRow {
                    row_number,
                    response_id: None,
                    weight: None,
                });
            }
        }
    }
    collect_weight_rows(raw, stats)
}

/// Reads the reference weights used to derive target weights: `ResponseId`
/// and `Weight` columns, blank weights skipped.
///
/// Errors are returned as text, to be reported for every subset.
pub fn read_target_weights_csv(bytes: &[u8]) -> Result<BTreeMap<i64, f64>, String> {
    let mut records = reader(bytes).into_records();
    let header: Vec<String> = match records.next() {
        Some(Ok(h)) => h.iter().map(normalize_header).collect(),
        Some(Err(e)) => return Err(format!("Could not read the header: {}", e)),
        None => return Err("The file is empty".to_string()),
    };
    let id_idx = header
        .iter()
        .position(|h| h == "responseid")
        .ok_or_else(|| "Missing column ResponseId".to_string())?;
    let weight_idx = header
        .iter()
        .position(|h| h == "weight")
        .ok_or_else(|| "Missing column Weight".to_string())?;

    let mut res: BTreeMap<i64, f64> = BTreeMap::new();
    for (idx, line_r) in records.enumerate() {
        let lineno = idx + 2;
        let line = line_r.map_err(|e| format!("Line {}: {}", lineno, e))?;
        let weight_s = line.get(weight_idx).unwrap_or("").trim();
        if weight_s.is_empty() {
            continue;
        }
        let id = line
            .get(id_idx)
            .and_then(parse_response_id)
            .ok_or_else(|| format!("Line {}: invalid response id", lineno))?;
        let weight = parse_weight(weight_s)
            .ok_or_else(|| format!("Line {}: invalid weight {:?}", lineno, weight_s))?;
        res.insert(id, weight);
    }
    debug!("read_target_weights_csv: {} weights", res.len());
    Ok(res)
}

fn parse_archived(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "" | "0" | "false" | "no" => Some(false),
        "1" | "true" | "yes" => Some(true),
        _ => None,
    }
}

/// Reads the respondents of a product.
///
/// The first columns are `ResponseId, SubsetId, Archived, CompletedDate`
/// (`yyyy-mm-dd`); every following column is a metric with the instance id of
/// the answer, or empty.
pub fn read_respondents_csv(path: &Path) -> WeightsResult<Vec<Respondent>> {
    let path_s = path.display().to_string();
    let rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .context(CsvOpenSnafu { path: path_s.clone() })?;
    let mut records = rdr.into_records();
    let header: Vec<String> = match records.next() {
        Some(h) => h
            .context(CsvLineSnafu { lineno: 1_usize })?
            .iter()
            .map(|s| s.trim().to_string())
            .collect(),
        None => whatever!("Respondents file {} is empty", path_s),
    };
    for (idx, expected) in RESPONDENT_FIXED_COLUMNS.iter().enumerate() {
        if header.get(idx).map(|h| normalize_header(h)) != Some(normalize_header(expected)) {
            whatever!(
                "Respondents file {}: column {} should be {}, found {:?}",
                path_s,
                idx + 1,
                expected,
                header.get(idx)
            )
        }
    }
    let metrics: Vec<&String> = header.iter().skip(RESPONDENT_FIXED_COLUMNS.len()).collect();

    let mut res: Vec<Respondent> = Vec::new();
    for (idx, line_r) in records.enumerate() {
        let lineno = idx + 2;
        let line = line_r.context(CsvLineSnafu { lineno })?;
        let response_id = match line.get(0).and_then(parse_response_id) {
            Some(x) => x,
            None => whatever!("Line {}: invalid response id {:?}", lineno, line.get(0)),
        };
        let archived = match parse_archived(line.get(2).unwrap_or("")) {
            Some(x) => x,
            None => whatever!("Line {}: invalid archived flag {:?}", lineno, line.get(2)),
        };
        let completed_date = match line.get(3).map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(s) => match chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                Ok(_) => Some(s.to_string()),
                Err(_) => whatever!("Line {}: invalid completion date {:?}", lineno, s),
            },
            None => None,
        };
        let mut answers: BTreeMap<String, i64> = BTreeMap::new();
        for (m_idx, metric) in metrics.iter().enumerate() {
            let cell = line
                .get(m_idx + RESPONDENT_FIXED_COLUMNS.len())
                .unwrap_or("")
                .trim();
            if cell.is_empty() {
                continue;
            }
            match parse_response_id(cell) {
                Some(x) => {
                    answers.insert(metric.to_string(), x);
                }
                None => whatever!("Line {}: invalid answer {:?} for {}", lineno, cell, metric),
            }
        }
        res.push(Respondent {
            response_id,
            subset_id: line.get(1).unwrap_or("").trim().to_string(),
            archived,
            completed_date,
            answers,
        });
    }
    info!("read_respondents_csv: {} respondents read from {}", res.len(), path_s);
    Ok(res)
}

/// Writes rows of text as csv, the header first.
pub fn write_csv(header: &[&str], rows: &[Vec<String>]) -> WeightsResult<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(header)
        .context(CsvLineSnafu { lineno: 1_usize })?;
    for (idx, row) in rows.iter().enumerate() {
        wtr.write_record(row)
            .context(CsvLineSnafu { lineno: idx + 2 })?;
    }
    match wtr.into_inner() {
        Ok(bytes) => Ok(bytes),
        Err(e) => whatever!("Could not flush the csv output: {}", e),
    }
}
