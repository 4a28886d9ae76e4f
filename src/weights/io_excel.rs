// Reading and writing weight spreadsheets.

use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use rust_xlsxwriter::{Format, Workbook};

use crate::weights::io_common::*;
use crate::weights::*;

pub const DATA_SHEET: &str = "Data";

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn cell_to_response_id(cell: Option<&Data>) -> Option<i64> {
    match cell? {
        Data::Int(i) => Some(*i),
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
        Data::String(s) => parse_response_id(s),
        _ => None,
    }
}

fn cell_to_weight(cell: Option<&Data>) -> Option<f64> {
    match cell? {
        Data::Int(i) => Some(*i as f64),
        Data::Float(f) if f.is_finite() => Some(*f),
        Data::String(s) => parse_weight(s),
        _ => None,
    }
}

fn is_empty_row(row: &[Data]) -> bool {
    row.iter()
        .all(|c| matches!(c, Data::Empty) || cell_to_string(c).trim().is_empty())
}

/// Reads the weights of an xlsx file.
///
/// The first sheet whose header row holds the response id and weighting
/// columns is used. Problems with the file are reported in the statistics and
/// give no rows.
pub fn read_weights_xlsx(
    bytes: &[u8],
    stats: &mut ValidationStatistics,
) -> Option<Vec<RespondentWeightRow>> {
    stats.number_of_bytes = bytes.len();
    let mut workbook: Xlsx<_> = match Xlsx::new(Cursor::new(bytes)) {
        Ok(wb) => wb,
        Err(e) => {
            warn!("read_weights_xlsx: {}: {:?}", stats.excel_file_name, e);
            stats.add_message(
                ValidationMessageType::ExcelInvalidFile,
                "File supplied could not be read as an Excel spreadsheet.".to_string(),
            );
            return None;
        }
    };

    for (sheet_name, range) in workbook.worksheets() {
        let mut rows = range.rows();
        let header: Vec<String> = match rows.next() {
            Some(h) => h.iter().map(cell_to_string).collect(),
            None => continue,
        };
        let (id_idx, weight_idx) = match find_weight_columns(&header) {
            Some(x) => x,
            None => {
                debug!("read_weights_xlsx: skipping sheet {}: header {:?}", sheet_name, header);
                continue;
            }
        };
        debug!(
            "read_weights_xlsx: sheet {}: columns {} and {}",
            sheet_name, id_idx, weight_idx
        );
        let raw: Vec<RawWeightRow> = rows
            .enumerate()
            .filter(|(_, row)| !is_empty_row(row))
            .map(|(idx, row)| RawWeightRow {
                // The header is row 1.
                row_number: idx + 2,
                response_id: cell_to_response_id(row.get(id_idx)),
                weight: cell_to_weight(row.get(weight_idx)),
            })
            .collect();
        return collect_weight_rows(raw, stats);
    }

    stats.add_message(
        ValidationMessageType::ExcelMissingSheet,
        format!(
            "Unable to find a sheet with columns named {} and {}.",
            RESPONSE_ID_COLUMN, WEIGHTING_COLUMN
        ),
    );
    None
}

/// A single `Data` sheet with the response ids and their weights.
pub fn write_weights_xlsx(rows: &[RespondentWeightRow]) -> WeightsResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(DATA_SHEET)
        .context(WritingExcelSnafu {})?;
    worksheet
        .write_string_with_format(0, 0, RESPONSE_ID_COLUMN, &header_format)
        .context(WritingExcelSnafu {})?;
    worksheet
        .write_string_with_format(0, 1, WEIGHTING_COLUMN, &header_format)
        .context(WritingExcelSnafu {})?;
    for (idx, r) in rows.iter().enumerate() {
        let row = (idx + 1) as u32;
        worksheet
            .write_number(row, 0, r.response_id as f64)
            .context(WritingExcelSnafu {})?;
        worksheet
            .write_number(row, 1, r.weight)
            .context(WritingExcelSnafu {})?;
    }
    worksheet.autofit();
    workbook.save_to_buffer().context(WritingExcelSnafu {})
}

/// The file an administrator fills in: every expected response with a weight
/// of 1.
pub fn generate_template(response_ids: &[i64]) -> WeightsResult<Vec<u8>> {
    let rows: Vec<RespondentWeightRow> = response_ids
        .iter()
        .map(|id| RespondentWeightRow::new(*id, 1.0))
        .collect();
    write_weights_xlsx(&rows)
}
