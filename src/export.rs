// Tabular export of decoded recordings

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;

use crate::{Recording, Result};

pub const TIME_COLUMN: &str = "Time_seconds";

/// Column names: the time base, then `Channel_<n>[_<annotation>][_<unit>]`.
pub fn column_names(recording: &Recording<'_>) -> Vec<String> {
    let mut names = vec![TIME_COLUMN.to_string()];
    for (slot, desc) in recording.channels().iter().enumerate() {
        let mut name = format!("Channel_{}", slot + 1);

        let annotation = recording.annotations().get(slot).map_or("", |a| a.trim());
        if !annotation.is_empty() {
            name.push('_');
            name.push_str(annotation);
        }

        let unit = desc.unit();
        if !unit.is_empty() {
            name.push('_');
            name.push_str(&unit);
        }
        names.push(name);
    }
    names
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write the time base and every channel as CSV columns
pub fn write_csv_to<W: Write>(recording: &Recording<'_>, writer: &mut W) -> Result<()> {
    let names: Vec<String> = column_names(recording).iter().map(|n| quote(n)).collect();
    writeln!(writer, "{}", names.join(","))?;

    let mut columns = (1..=recording.channel_count() as usize)
        .map(|channel| recording.channel_values(channel))
        .collect::<Result<Vec<_>>>()?;

    for time in recording.timestamps() {
        write!(writer, "{}", time)?;
        for column in columns.iter_mut() {
            // Every channel yields exactly sample_count values
            if let Some(value) = column.next() {
                write!(writer, ",{}", value)?;
            }
        }
        writeln!(writer)?;
    }

    Ok(())
}

/// Write the recording to a CSV file
pub fn write_csv<P: AsRef<Path>>(recording: &Recording<'_>, output_file: P) -> Result<()> {
    let file = File::create(&output_file)?;
    let mut writer = BufWriter::new(file);

    write_csv_to(recording, &mut writer)?;
    writer.flush()?;

    info!(
        "Wrote {} rows x {} channels to {}",
        recording.sample_count(),
        recording.channel_count(),
        output_file.as_ref().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;

    /// Two channels, unpacked, standard resolution, table at byte 104.
    fn create_test_file(annotations: &[u8], units: [&[u8; 6]; 2], samples: &[i16]) -> Vec<u8> {
        let header_size = 104 + 2 * 32;
        let mut buf = vec![0u8; header_size];
        buf[0] = 2;
        buf[2..4].copy_from_slice(&144u16.to_le_bytes());
        buf[4] = 104;
        buf[5] = 32;
        buf[6..8].copy_from_slice(&(header_size as i16).to_le_bytes());
        buf[8..12].copy_from_slice(&((samples.len() * 2) as u32).to_le_bytes());
        buf[16..18].copy_from_slice(&(annotations.len() as u16).to_le_bytes());
        buf[28..36].copy_from_slice(&0.5f64.to_le_bytes());
        for (i, unit) in units.iter().enumerate() {
            let e = 104 + i * 32;
            buf[e + 8..e + 16].copy_from_slice(&1.0f64.to_le_bytes());
            buf[e + 24..e + 30].copy_from_slice(*unit);
        }
        for s in samples {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        buf.extend_from_slice(annotations);
        buf
    }

    #[test]
    fn test_column_names() {
        let buf = create_test_file(b" Load \0\0", [b"A\0\0\0\0\0", b"\0\0\0\0\0\0"], &[0, 0]);
        let rec = decode(&buf).unwrap();
        assert_eq!(
            column_names(&rec),
            vec!["Time_seconds", "Channel_1_Load_A", "Channel_2"]
        );
    }

    #[test]
    fn test_csv_rows() {
        let buf = create_test_file(b"a\0b\0", [b"V     ", b"mA    "], &[4, 40, 8, 80]);
        let rec = decode(&buf).unwrap();

        let mut out = Vec::new();
        write_csv_to(&rec, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Time_seconds,Channel_1_a_V,Channel_2_b_mA");
        assert_eq!(lines[1], "0,1,10");
        assert_eq!(lines[2], "0.5,2,20");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_quoted_annotation() {
        let buf = create_test_file(b"x,y\0\0", [b"V     ", b"V     "], &[0, 0]);
        let rec = decode(&buf).unwrap();

        let mut out = Vec::new();
        write_csv_to(&rec, &mut out).unwrap();
        let header = String::from_utf8(out).unwrap().lines().next().unwrap().to_string();
        assert_eq!(header, "Time_seconds,\"Channel_1_x,y_V\",Channel_2_V");
    }
}
