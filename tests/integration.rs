// tests/integration.rs
// Integration tests for WDQ Reader

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use tempfile::TempDir;
use wdq_reader::export::write_csv;
use wdq_reader::pulse::{detect_pulses, PulseConfig, PulseStats};
use wdq_reader::{decode, read_file, timestamps, DecodeError};

const TABLE_OFFSET: usize = 104;
const ENTRY_SIZE: usize = 36;

/// Helper to create a test capture file
fn create_test_wdq_file(
    path: &Path,
    num_channels: usize,
    samples_per_channel: usize,
    high_res: bool,
) -> std::io::Result<()> {
    let mut file = File::create(path)?;

    let header_size = TABLE_OFFSET + num_channels * ENTRY_SIZE;
    let data_size = num_channels * samples_per_channel * 2;
    let annotations: Vec<u8> = (1..=num_channels)
        .flat_map(|ch| format!("Sensor {}\0", ch).into_bytes())
        .collect();

    let mut header = vec![0u8; header_size];
    header[0] = num_channels as u8;
    header[2..4].copy_from_slice(&144u16.to_le_bytes());
    header[4] = TABLE_OFFSET as u8;
    header[5] = ENTRY_SIZE as u8;
    header[6..8].copy_from_slice(&(header_size as i16).to_le_bytes());
    header[8..12].copy_from_slice(&(data_size as u32).to_le_bytes());
    header[12..16].copy_from_slice(&16u32.to_le_bytes());
    header[16..18].copy_from_slice(&(annotations.len() as u16).to_le_bytes());
    header[28..36].copy_from_slice(&0.001f64.to_le_bytes()); // 1 kHz per channel
    header[36..40].copy_from_slice(&1_600_000_000i32.to_le_bytes());
    header[40..44].copy_from_slice(&1_600_000_100i32.to_le_bytes());
    let flags: u16 = (1 << 14) | if high_res { 1 << 1 } else { 0 };
    header[100..102].copy_from_slice(&flags.to_le_bytes());

    // Channel n scales by n, offset by -n
    for ch in 0..num_channels {
        let e = TABLE_OFFSET + ch * ENTRY_SIZE;
        let n = (ch + 1) as f64;
        header[e..e + 4].copy_from_slice(&1.0f32.to_le_bytes());
        header[e + 8..e + 16].copy_from_slice(&n.to_le_bytes());
        header[e + 16..e + 24].copy_from_slice(&(-n).to_le_bytes());
        header[e + 24..e + 30].copy_from_slice(b"A\0\0\0\0\0");
        header[e + 30] = 1;
        header[e + 31] = ch as u8;
    }
    file.write_all(&header)?;

    // Square pulses on every channel, 20 samples wide every 100 samples
    for sample in 0..samples_per_channel {
        for _ in 0..num_channels {
            let raw: i16 = if sample % 100 >= 40 && sample % 100 < 60 { 4000 } else { 0 };
            file.write_all(&raw.to_le_bytes())?;
        }
    }

    // Trailer, then annotations
    file.write_all(&[0u8; 16])?;
    file.write_all(&annotations)?;
    Ok(())
}

#[test]
fn test_load_and_decode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("capture.wdq");
    create_test_wdq_file(&path, 3, 500, false).expect("Failed to create test file");

    let bytes = read_file(&path).expect("Failed to read file");
    let rec = decode(&bytes).expect("Failed to decode file");

    assert_eq!(rec.channel_count(), 3);
    assert_eq!(rec.sample_count(), 500);
    assert!(rec.header().packed);
    assert!(rec.annotation_error().is_none());

    for ch in 1..=3 {
        let values: Vec<f64> = rec.channel_values(ch).unwrap().collect();
        assert_eq!(values.len(), 500);
        assert!(values.iter().all(|v| v.is_finite()));

        let n = ch as f64;
        assert_eq!(values[0], -n);
        assert_eq!(values[50], n * 1000.0 - n);
        assert_eq!(rec.channel_annotation(ch).unwrap(), format!("Sensor {}", ch));
        assert_eq!(rec.channel_unit(ch).unwrap(), "A");
        assert_eq!(rec.descriptor(ch).unwrap().physical_channel_number, (ch - 1) as u8);
    }
}

#[test]
fn test_high_resolution_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("hires.wdq");
    create_test_wdq_file(&path, 1, 100, true).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    let values: Vec<f64> = rec.channel_values(1).unwrap().collect();
    assert_eq!(values[45], 999.0);
}

#[test]
fn test_shared_across_threads() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("threads.wdq");
    create_test_wdq_file(&path, 4, 1000, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();

    let sums: Vec<f64> = std::thread::scope(|s| {
        let handles: Vec<_> = (1..=4)
            .map(|ch| {
                let rec = &rec;
                s.spawn(move || rec.channel_values(ch).unwrap().sum::<f64>())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (i, sum) in sums.iter().enumerate() {
        let n = (i + 1) as f64;
        // 200 high samples of 1000n - n, 800 low samples of -n
        assert_eq!(*sum, 200.0 * (1000.0 * n - n) - 800.0 * n);
    }
}

#[test]
fn test_csv_export() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("export.wdq");
    let csv_file = dir.path().join("export.csv");
    create_test_wdq_file(&path, 2, 100, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    write_csv(&rec, &csv_file).expect("Failed to write CSV");

    let csv_content = fs::read_to_string(&csv_file).expect("Failed to read CSV");
    let lines: Vec<&str> = csv_content.lines().collect();
    assert_eq!(lines.len(), 101); // Header + 100 samples
    assert_eq!(lines[0], "Time_seconds,Channel_1_Sensor 1_A,Channel_2_Sensor 2_A");
    assert_eq!(lines[1], "0,-1,-2");
}

#[cfg(feature = "xlsx")]
#[test]
fn test_xlsx_export_with_pulses() {
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use wdq_reader::workbook::{write_xlsx, WorkbookOptions, RAW_DATA_SHEET};

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pulses.wdq");
    let xlsx_file = dir.path().join("pulses.xlsx");
    create_test_wdq_file(&path, 1, 300, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    let values: Vec<f64> = rec.channel_values(1).unwrap().collect();
    let times: Vec<f64> = timestamps(&rec).collect();
    let pulses = detect_pulses(&times, &values, &PulseConfig::default());
    assert_eq!(pulses.len(), 3);

    let options = WorkbookOptions {
        pulses: Some(&pulses),
        chart_channel: Some(1),
    };
    write_xlsx(&rec, &options, &xlsx_file).expect("Failed to write workbook");

    let mut workbook: Xlsx<_> = open_workbook(&xlsx_file).expect("Failed to open workbook");
    let range = workbook.worksheet_range(RAW_DATA_SHEET).unwrap();
    assert_eq!(range.get_value((0, 0)), Some(&Data::String("Time_seconds".into())));
    assert_eq!(range.get_value((0, 1)), Some(&Data::String("Current".into())));
    assert_eq!(range.get_value((51, 1)), Some(&Data::Float(999.0)));
    assert_eq!(range.get_value((300, 1)), Some(&Data::Float(-1.0)));
    assert_eq!(range.get_value((0, 3)), Some(&Data::String("Pulse".into())));
    assert_eq!(range.get_value((3, 3)), Some(&Data::String("Pulse 3".into())));
    assert_eq!(range.get_value((3, 4)), Some(&Data::Float(999.0)));
}

#[cfg(feature = "xlsx")]
#[test]
fn test_csv_to_xlsx_conversion() {
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use wdq_reader::workbook::convert_csv_to_xlsx;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("export.wdq");
    let csv_file = dir.path().join("export.csv");
    let xlsx_file = dir.path().join("export.xlsx");
    create_test_wdq_file(&path, 2, 100, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    write_csv(&rec, &csv_file).unwrap();

    let rows = convert_csv_to_xlsx(&csv_file, &xlsx_file).expect("Failed to convert CSV");
    assert_eq!(rows, 100);

    let mut workbook: Xlsx<_> = open_workbook(&xlsx_file).unwrap();
    let range = workbook.worksheet_range("Sheet1").unwrap();
    assert_eq!(range.get_size(), (101, 3));
    assert_eq!(
        range.get_value((0, 2)),
        Some(&Data::String("Channel_2_Sensor 2_A".into()))
    );
    assert_eq!(range.get_value((1, 2)), Some(&Data::Float(-2.0)));
    assert_eq!(range.get_value((51, 1)), Some(&Data::Float(999.0)));
}

#[test]
fn test_pulse_detection_on_channel() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pulses.wdq");
    create_test_wdq_file(&path, 1, 1000, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    let values: Vec<f64> = rec.channel_values(1).unwrap().collect();
    let times: Vec<f64> = timestamps(&rec).collect();

    let pulses = detect_pulses(&times, &values, &PulseConfig::default());
    assert_eq!(pulses.len(), 10);
    assert_eq!(pulses[0].start_index, 40);
    assert_eq!(pulses[0].end_index, 59);
    assert_eq!(pulses[0].peak_value, 999.0);

    let stats = PulseStats::from_pulses(&pulses).unwrap();
    assert_eq!(stats.total_pulses, 10);
    assert_eq!(stats.peak_std, 0.0);
}

#[test]
fn test_error_handling() {
    // Non-existent file
    let result = read_file("non_existent.wdq");
    assert!(matches!(result, Err(DecodeError::Io(_))));

    // Not a capture file
    let result = decode(b"This is not a WDQ file");
    assert!(matches!(result, Err(DecodeError::TooShort(22))));

    // Truncated sample block
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.wdq");
    create_test_wdq_file(&path, 2, 100, false).unwrap();
    let mut bytes = read_file(&path).unwrap();
    bytes.truncate(200);
    let err = decode(&bytes).unwrap_err();
    assert!(matches!(err, DecodeError::TruncatedData { .. }));
    assert!(err.is_format_defect());
}

#[test]
fn test_time_values() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("time.wdq");
    create_test_wdq_file(&path, 1, 1000, false).unwrap();

    let bytes = read_file(&path).unwrap();
    let rec = decode(&bytes).unwrap();
    let times: Vec<f64> = timestamps(&rec).collect();

    assert_eq!(times.len(), 1000);
    assert_eq!(times[0], 0.0);
    assert_eq!(times[999], 999.0 * 0.001);

    let created = rec.header().created_at_utc().unwrap();
    assert_eq!(created.timestamp(), 1_600_000_000);
    let last = rec.absolute_timestamps().unwrap().last().unwrap();
    assert_eq!((last - created).num_milliseconds(), 999);
}
