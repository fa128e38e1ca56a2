// src/main.rs
// Command-line front end for WDQ Reader

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn, LevelFilter};
use wdq_reader::pulse::{detect_pulses, PulseConfig, PulseStats};
use wdq_reader::workbook::{self, WorkbookOptions};
use wdq_reader::{decode, export, read_file, Recording};

#[derive(Parser, Debug)]
#[command(
    name = "wdq_reader",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect and convert WinDaq waveform capture files",
    long_about = None,
)]
struct Cli {
    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Log decoder details
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Display header, channel table and timing
    Info {
        file: PathBuf,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Convert a capture to CSV or xlsx, or a CSV export to xlsx
    Convert {
        file: PathBuf,
        /// Defaults to the input path with the extension of the chosen format
        output: Option<PathBuf>,
        /// Output format; taken from the output extension when omitted, else CSV
        #[arg(long, value_enum)]
        format: Option<Format>,
        /// Add a line chart of this channel on its own sheet (xlsx only)
        #[arg(long)]
        chart: Option<usize>,
        /// Read the input as a CSV export and write it to xlsx
        #[arg(long)]
        force_csv: bool,
    },
    /// Print one channel as "time, value" lines
    Extract { file: PathBuf, channel: usize },
    /// Detect amplitude pulses on one channel
    Pulses {
        file: PathBuf,
        #[arg(short, long, default_value = "1")]
        channel: usize,
        /// Percentage of the channel maximum
        #[arg(long, default_value = "10.0")]
        threshold_percent: f64,
        /// Seconds
        #[arg(long, default_value = "0.001")]
        min_width: f64,
        /// Seconds
        #[arg(long, default_value = "0.01")]
        min_separation: f64,
        /// Print as JSON
        #[arg(long)]
        json: bool,
        /// Also write the data and a pulse table to this workbook
        #[arg(long)]
        xlsx: Option<PathBuf>,
        /// Add a line chart of the channel to the workbook
        #[arg(long, requires = "xlsx")]
        chart: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Csv,
    Xlsx,
}

impl Format {
    fn from_path(path: &Path) -> Option<Format> {
        let ext = path.extension()?.to_str()?;
        if ext.eq_ignore_ascii_case("csv") {
            Some(Format::Csv)
        } else if ext.eq_ignore_ascii_case("xlsx") {
            Some(Format::Xlsx)
        } else {
            None
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Xlsx => "xlsx",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_target(false)
        .format_timestamp_secs()
        .init();

    if let Err(e) = run(cli.command) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load(path: &Path) -> Result<Vec<u8>> {
    read_file(path).with_context(|| format!("Error loading '{}'", path.display()))
}

fn decode_file<'a>(path: &Path, bytes: &'a [u8]) -> Result<Recording<'a>> {
    decode(bytes).with_context(|| format!("Error decoding '{}'", path.display()))
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Info { file, json } => {
            let bytes = load(&file)?;
            let recording = decode_file(&file, &bytes)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recording.info())?);
            } else {
                print_file_info(&file, &recording);
            }
        }

        Command::Convert {
            file,
            output,
            format,
            chart,
            force_csv,
        } => {
            if force_csv || Format::from_path(&file) == Some(Format::Csv) {
                let output = output.unwrap_or_else(|| file.with_extension("xlsx"));
                workbook::convert_csv_to_xlsx(&file, &output).with_context(|| {
                    format!("Error converting '{}' to '{}'", file.display(), output.display())
                })?;
                return Ok(());
            }

            let format = format
                .or_else(|| output.as_deref().and_then(Format::from_path))
                .unwrap_or(Format::Csv);
            let output = output.unwrap_or_else(|| file.with_extension(format.extension()));
            if chart.is_some() && format == Format::Csv {
                warn!("--chart only applies to xlsx output; ignoring it");
            }
            let bytes = load(&file)?;
            let recording = decode_file(&file, &bytes)?;
            let written = match format {
                Format::Csv => export::write_csv(&recording, &output),
                Format::Xlsx => {
                    let options = WorkbookOptions {
                        chart_channel: chart,
                        ..Default::default()
                    };
                    workbook::write_xlsx(&recording, &options, &output)
                }
            };
            written.with_context(|| format!("Error writing '{}'", output.display()))?;
            info!("Converted {} to {}", file.display(), output.display());
        }

        Command::Extract { file, channel } => {
            let bytes = load(&file)?;
            let recording = decode_file(&file, &bytes)?;
            let values = recording.channel_values(channel)?;
            let unit = recording.channel_unit(channel)?;

            println!("# Channel {} from {}", channel, file.display());
            println!("# Time (s), Value ({})", unit);
            for (time, value) in recording.timestamps().zip(values) {
                println!("{:.9e}, {:.6e}", time, value);
            }
        }

        Command::Pulses {
            file,
            channel,
            threshold_percent,
            min_width,
            min_separation,
            json,
            xlsx,
            chart,
        } => {
            let config = PulseConfig {
                threshold_percent,
                min_pulse_width: min_width,
                min_pulse_separation: min_separation,
            };
            let bytes = load(&file)?;
            let recording = decode_file(&file, &bytes)?;
            let values: Vec<f64> = recording.channel_values(channel)?.collect();
            let times: Vec<f64> = recording.timestamps().collect();

            let pulses = detect_pulses(&times, &values, &config);
            let stats = PulseStats::from_pulses(&pulses);

            if let Some(output) = xlsx {
                let options = WorkbookOptions {
                    pulses: Some(&pulses),
                    chart_channel: chart.then_some(channel),
                };
                workbook::write_xlsx(&recording, &options, &output)
                    .with_context(|| format!("Error writing '{}'", output.display()))?;
            }

            if json {
                let report = serde_json::json!({
                    "config": config,
                    "pulses": pulses,
                    "stats": stats,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let Some(stats) = stats else {
                println!("No pulses detected. Try adjusting the threshold parameters.");
                return Ok(());
            };

            println!("Pulse  Start (s)   Peak (s)    Duration (s)  Peak        Mean        Energy");
            for p in &pulses {
                println!(
                    "{:<6} {:<11.4} {:<11.4} {:<13.4} {:<11.3} {:<11.3} {:.4}",
                    p.number, p.start_time, p.peak_time, p.duration, p.peak_value, p.mean_value, p.energy
                );
            }
            println!();
            println!("Total pulses: {}", stats.total_pulses);
            println!("Peak range: {:.3} - {:.3}", stats.peak_min, stats.peak_max);
            println!("Peak mean: {:.3} ± {:.3}", stats.peak_mean, stats.peak_std);
            println!("Duration mean: {:.4} ± {:.4} s", stats.duration_mean, stats.duration_std);
            println!("Total energy: {:.4}", stats.energy_total);
            println!("Test duration: {:.4} s", stats.test_duration);
        }
    }
    Ok(())
}

fn print_file_info(path: &Path, recording: &Recording<'_>) {
    let header = recording.header();

    println!("WDQ File Information");
    println!("====================");
    println!();
    println!("File: {}", path.display());
    println!("Format indicator: {}", header.version);
    println!();

    println!("Acquisition Parameters:");
    println!("  Channels: {}", header.channel_count);
    println!("  Samples per channel: {}", header.sample_count_per_channel);
    println!("  Packed: {}", header.packed);
    println!("  Resolution: {:?}", header.resolution());
    match header.created_at_utc() {
        Some(t) => println!("  Created: {} (UTC)", t.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Created: invalid epoch {}", header.created_epoch),
    }
    match header.written_at_local() {
        Some(t) => println!("  Written: {} (local)", t.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Written: invalid epoch {}", header.written_epoch),
    }
    println!();

    println!("Time Scaling:");
    if header.time_step > 0.0 {
        println!(
            "  Sample interval: {:.3e} s ({:.3} Hz per channel)",
            header.time_step,
            1.0 / header.time_step
        );
    } else {
        println!("  Sample interval: {:.3e} s", header.time_step);
    }
    println!("  Duration: {:.6} s", recording.duration());
    println!();

    println!("Data Layout:");
    println!("  Header size: {} bytes", header.header_size);
    println!("  Data size: {} bytes", header.data_size);
    println!("  Trailer size: {} bytes", header.trailer_size);
    println!("  Annotation size: {} bytes", header.annotation_size);
    if let Some(err) = recording.annotation_error() {
        println!("  Annotations ignored: {}", err);
    }
    println!();

    println!("Channels:");
    for info in recording.info().channels {
        let (min, max) = recording
            .channel_values(info.number)
            .map(|values| {
                values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                })
            })
            .unwrap_or((f64::NAN, f64::NAN));
        println!(
            "  {}: {:?} [{}] cal {} * x + {}, divisor {}, physical {}, range {:.3} to {:.3}",
            info.number,
            info.annotation,
            info.unit,
            info.cal_scale,
            info.cal_intercept,
            info.sample_rate_divisor,
            info.physical_channel_number,
            min,
            max
        );
    }
}
