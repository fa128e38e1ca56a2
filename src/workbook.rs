// Excel workbook export of decoded recordings

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use rust_xlsxwriter::{
    Chart, ChartFont, ChartFormat, ChartLine, ChartType, Color, Workbook, Worksheet, XlsxError,
};

use crate::export::column_names;
use crate::pulse::Pulse;
use crate::{Recording, Result};

pub const RAW_DATA_SHEET: &str = "Raw_Data";

/// A single-channel capture names its only data column this.
pub const SINGLE_CHANNEL_COLUMN: &str = "Current";

pub const PULSE_COLUMN: &str = "Pulse";
pub const PEAK_COLUMN: &str = "Peak Current";

const ROW_LIMIT: usize = 1_048_576;

/// Options for [`write_xlsx`] beyond the raw data sheet.
#[derive(Clone, Debug, Default)]
pub struct WorkbookOptions<'p> {
    /// Pulses listed as a `Pulse` / `Peak Current` table to the right of the data.
    pub pulses: Option<&'p [Pulse]>,
    /// Channel plotted against time on its own chart sheet.
    pub chart_channel: Option<usize>,
}

/// Column names of the `Raw_Data` sheet. Same as the CSV columns, except that a
/// single-channel capture calls its data column `Current`.
pub fn workbook_columns(recording: &Recording<'_>) -> Vec<String> {
    let mut names = column_names(recording);
    if recording.channel_count() == 1 {
        names[1] = SINGLE_CHANNEL_COLUMN.to_string();
    }
    names
}

/// Zero-based column of the pulse table: one blank column after the data.
/// Column D for a single-channel capture.
pub fn summary_column(recording: &Recording<'_>) -> u16 {
    recording.channel_count() as u16 + 2
}

fn chart_sheet_name(recording: &Recording<'_>, channel: usize) -> String {
    if recording.channel_count() == 1 {
        format!("{}_vs_Time_Chart", SINGLE_CHANNEL_COLUMN)
    } else {
        format!("Channel_{}_vs_Time_Chart", channel)
    }
}

// Excel has no representation for NaN or infinity; such cells stay blank.
fn write_number(sheet: &mut Worksheet, row: u32, col: u16, value: f64) -> Result<()> {
    if value.is_finite() {
        sheet.write_number(row, col, value)?;
    }
    Ok(())
}

fn write_raw_data(sheet: &mut Worksheet, recording: &Recording<'_>) -> Result<()> {
    sheet.set_name(RAW_DATA_SHEET)?;
    for (col, name) in workbook_columns(recording).iter().enumerate() {
        sheet.write_string(0, col as u16, name.as_str())?;
    }

    for (i, time) in recording.timestamps().enumerate() {
        write_number(sheet, i as u32 + 1, 0, time)?;
    }
    for channel in 1..=recording.channel_count() as usize {
        for (i, value) in recording.channel_values(channel)?.enumerate() {
            write_number(sheet, i as u32 + 1, channel as u16, value)?;
        }
    }
    Ok(())
}

fn write_pulse_summary(sheet: &mut Worksheet, col: u16, pulses: &[Pulse]) -> Result<()> {
    sheet.write_string(0, col, PULSE_COLUMN)?;
    sheet.write_string(0, col + 1, PEAK_COLUMN)?;
    for (i, pulse) in pulses.iter().enumerate() {
        let row = i as u32 + 1;
        sheet.write_string(row, col, format!("Pulse {}", pulse.number).as_str())?;
        write_number(sheet, row, col + 1, pulse.peak_value.round_ties_even())?;
    }
    Ok(())
}

fn line_chart(recording: &Recording<'_>, channel: usize) -> Result<Chart> {
    let unit = recording.channel_unit(channel)?;
    let label = workbook_columns(recording).swap_remove(channel);
    let axis = if unit.is_empty() {
        label.clone()
    } else {
        format!("{} ({})", label, unit)
    };
    let title = format!("{} vs Time", label);
    let last_row = recording.sample_count() as u32;
    let col = channel as u16;

    let mut chart = Chart::new(ChartType::Line);
    chart
        .add_series()
        .set_name(axis.as_str())
        .set_categories((RAW_DATA_SHEET, 1, 0, last_row, 0))
        .set_values((RAW_DATA_SHEET, 1, col, last_row, col))
        .set_format(
            ChartFormat::new().set_line(ChartLine::new().set_color(Color::Blue).set_width(1.5)),
        );

    chart
        .title()
        .set_name(title.as_str())
        .set_font(ChartFont::new().set_size(18).set_bold());
    chart
        .x_axis()
        .set_name("Time (seconds)")
        .set_name_font(ChartFont::new().set_size(14).set_bold());
    chart
        .y_axis()
        .set_name(axis.as_str())
        .set_name_font(ChartFont::new().set_size(14).set_bold());
    chart.set_style(2);
    Ok(chart)
}

/// Build the workbook: a `Raw_Data` sheet with the time base and every channel,
/// plus the pulse table and chart sheet requested in `options`.
pub fn build_workbook(recording: &Recording<'_>, options: &WorkbookOptions<'_>) -> Result<Workbook> {
    if recording.sample_count() >= ROW_LIMIT {
        return Err(XlsxError::RowColumnLimitError.into());
    }

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    write_raw_data(sheet, recording)?;
    if let Some(pulses) = options.pulses {
        write_pulse_summary(sheet, summary_column(recording), pulses)?;
    }

    if let Some(channel) = options.chart_channel {
        let chart = line_chart(recording, channel)?;
        if recording.sample_count() == 0 {
            warn!("No samples to chart for channel {}", channel);
        } else {
            let name = chart_sheet_name(recording, channel);
            debug!("Adding chart sheet {}", name);
            workbook
                .add_chartsheet()
                .set_name(name.as_str())?
                .insert_chart(0, 0, &chart)?;
        }
    }
    Ok(workbook)
}

/// Serialise the workbook into memory.
pub fn write_xlsx_to_buffer(
    recording: &Recording<'_>,
    options: &WorkbookOptions<'_>,
) -> Result<Vec<u8>> {
    let mut workbook = build_workbook(recording, options)?;
    Ok(workbook.save_to_buffer()?)
}

/// Write the recording to an `.xlsx` file
pub fn write_xlsx<P: AsRef<Path>>(
    recording: &Recording<'_>,
    options: &WorkbookOptions<'_>,
    output_file: P,
) -> Result<()> {
    let mut workbook = build_workbook(recording, options)?;
    workbook.save(output_file.as_ref())?;

    info!(
        "Wrote {} rows x {} channels to {}",
        recording.sample_count(),
        recording.channel_count(),
        output_file.as_ref().display()
    );
    Ok(())
}

/// UTF-8 when valid, otherwise Latin-1, where every byte is one code point.
fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Cow::Borrowed(text.strip_prefix('\u{feff}').unwrap_or(text)),
        Err(_) => {
            debug!("CSV input is not UTF-8, reading it as Latin-1");
            Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())
        }
    }
}

/// Copy CSV text into `sheet`. The first row is kept as text; later cells are
/// written as numbers when they parse as finite floats. Returns the data row count.
fn write_csv_rows(sheet: &mut Worksheet, text: &str) -> Result<usize> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (col, cell) in record.iter().enumerate() {
            let (row, col) = (row as u32, col as u16);
            let number = cell.trim().parse::<f64>().ok().filter(|v| v.is_finite());
            match number {
                Some(value) if row > 0 => {
                    sheet.write_number(row, col, value)?;
                }
                _ if !cell.is_empty() => {
                    sheet.write_string(row, col, cell)?;
                }
                _ => {}
            }
        }
        rows = row;
    }
    Ok(rows)
}

/// Convert a CSV export (such as one written by [`crate::export::write_csv`])
/// into a single-sheet workbook. Returns the number of data rows.
pub fn convert_csv_to_xlsx<P: AsRef<Path>, Q: AsRef<Path>>(
    csv_file: P,
    output_file: Q,
) -> Result<usize> {
    let bytes = fs::read(&csv_file)?;
    let mut workbook = Workbook::new();
    let rows = write_csv_rows(workbook.add_worksheet(), &decode_text(&bytes))?;
    workbook.save(output_file.as_ref())?;

    info!(
        "Converted {} data rows from {} to {}",
        rows,
        csv_file.as_ref().display(),
        output_file.as_ref().display()
    );
    Ok(rows)
}
