// src/lib.rs
// WDQ Reader Library - Public API

//! # WDQ Reader
//!
//! A Rust library for decoding multi-channel WinDaq waveform capture files.
//!
//! ## Features
//!
//! - Decode the fixed header, per-channel calibration table and annotations
//! - Borrow the interleaved sample block without copying it
//! - Compute calibrated channel values and sample times on demand
//! - Export recordings to CSV, or to an Excel workbook with an optional pulse
//!   table and line chart (`xlsx` feature)
//! - Detect amplitude pulses and summarise them
//!
//! ## Example
//!
//! ```no_run
//! use wdq_reader::{decode, read_file};
//!
//! let bytes = read_file("capture.wdq").expect("Failed to read file");
//! let recording = decode(&bytes).expect("Failed to decode file");
//!
//! println!("Channels: {}", recording.channel_count());
//! println!("Samples per channel: {}", recording.sample_count());
//!
//! for channel in 1..=recording.channel_count() as usize {
//!     let unit = recording.channel_unit(channel).unwrap();
//!     let peak = recording
//!         .channel_values(channel)
//!         .unwrap()
//!         .fold(f64::NEG_INFINITY, f64::max);
//!     println!("Channel {}: peak {} {}", channel, peak, unit);
//! }
//!
//! // Export to CSV
//! wdq_reader::export::write_csv(&recording, "capture.csv").expect("Failed to write CSV");
//! ```

mod wdq_tools;

pub mod export;
pub mod pulse;
#[cfg(feature = "xlsx")]
pub mod workbook;

pub use wdq_tools::{
    channel_annotation, channel_unit, channel_values, decode, read_file, timestamps,
    ChannelDescriptor, ChannelInfo, ChannelValues, DecodeError, EntryLayout, Header, Recording,
    RecordingInfo, Resolution, Result, SampleBlock, MIN_FILE_SIZE,
};
