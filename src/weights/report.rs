// The downloadable error report.

use response_weighting::ReportHighlight;
use rust_xlsxwriter::{Color, Format, Workbook};

use crate::weights::io_common::{RESPONSE_ID_COLUMN, WEIGHTING_COLUMN};
use crate::weights::io_excel::DATA_SHEET;
use crate::weights::*;

const ERROR_FILL: u32 = 0xFBE2D5;
const OUT_OF_BOUNDS_FONT: u32 = 0xFF0000;
const ANOMALY_FILL: u32 = 0xD3D3D3;

fn weight_format(highlight: ReportHighlight) -> Option<Format> {
    match highlight {
        ReportHighlight::None => None,
        ReportHighlight::InvalidWeight => {
            Some(Format::new().set_background_color(Color::RGB(ERROR_FILL)))
        }
        ReportHighlight::OutOfBounds => {
            Some(Format::new().set_font_color(Color::RGB(OUT_OF_BOUNDS_FONT)))
        }
        ReportHighlight::Anomaly => {
            Some(Format::new().set_background_color(Color::RGB(ANOMALY_FILL)))
        }
    }
}

/// Writes the report rows to a `Data` sheet with a frozen header.
pub fn error_report_xlsx(rows: &[ErrorReportRow]) -> WeightsResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet
        .set_name(DATA_SHEET)
        .context(WritingExcelSnafu {})?;
    for (col, h) in [RESPONSE_ID_COLUMN, WEIGHTING_COLUMN, "Reason", "Action"]
        .iter()
        .enumerate()
    {
        worksheet
            .write_string_with_format(0, col as u16, *h, &header_format)
            .context(WritingExcelSnafu {})?;
    }

    for (idx, r) in rows.iter().enumerate() {
        let row = (idx + 1) as u32;
        worksheet
            .write_number(row, 0, r.response_id as f64)
            .context(WritingExcelSnafu {})?;
        match weight_format(r.highlight) {
            Some(format) => worksheet
                .write_number_with_format(row, 1, r.weight, &format)
                .context(WritingExcelSnafu {})?,
            None => worksheet
                .write_number(row, 1, r.weight)
                .context(WritingExcelSnafu {})?,
        };
        worksheet
            .write_string(row, 2, &r.reason)
            .context(WritingExcelSnafu {})?;
        worksheet
            .write_string(row, 3, &r.action)
            .context(WritingExcelSnafu {})?;
    }
    worksheet
        .set_freeze_panes(1, 0)
        .context(WritingExcelSnafu {})?;
    worksheet.autofit();
    debug!("error_report_xlsx: {} rows", rows.len());
    workbook.save_to_buffer().context(WritingExcelSnafu {})
}
