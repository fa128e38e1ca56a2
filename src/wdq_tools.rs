// WDQReader Module
// Decoder for WinDaq multi-channel waveform capture files

use std::fs;
use std::io;
use std::path::Path;
use std::str::Utf8Error;

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;

/// Smallest buffer that still holds every fixed header field.
pub const MIN_FILE_SIZE: usize = 104;

/// Format indicators at or above this value carry the channel count as a full byte.
const FULL_CHANNEL_BYTE_VERSION: u16 = 144;
/// Older files keep the channel count in the five low bits.
const CHANNEL_COUNT_MASK: u8 = 0x1F;

// Bits of the flag word at offset 100
const PACKED_BIT: u16 = 14;
const HIGH_RES_BIT: u16 = 1;

// Fixed header offsets
const OFF_CHANNEL_BYTE: usize = 0;
const OFF_VERSION: usize = 2;
const OFF_TABLE_OFFSET: usize = 4;
const OFF_ENTRY_SIZE: usize = 5;
const OFF_HEADER_SIZE: usize = 6;
const OFF_DATA_SIZE: usize = 8;
const OFF_TRAILER_SIZE: usize = 12;
const OFF_ANNOTATION_SIZE: usize = 16;
const OFF_TIME_STEP: usize = 28;
const OFF_CREATED: usize = 36;
const OFF_WRITTEN: usize = 40;
const OFF_FLAGS: usize = 100;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File too short: expected at least {min} bytes, got {0}", min = MIN_FILE_SIZE)]
    TooShort(usize),

    #[error("Truncated header: field at offset {offset} needs {width} bytes")]
    TruncatedHeader { offset: usize, width: usize },

    #[error("Invalid channel count: 0")]
    InvalidChannelCount,

    #[error("Invalid header size: {0}")]
    InvalidHeaderSize(i16),

    #[error("Malformed data size: {data_size} bytes is not a whole number of samples for {channel_count} channels")]
    MalformedDataSize { data_size: u32, channel_count: u8 },

    #[error("Truncated channel table: entry for channel {channel} at offset {offset} runs past end of file")]
    TruncatedChannelTable { channel: usize, offset: usize },

    #[error("Truncated sample data: block ends at byte {expected}, file has {available}")]
    TruncatedData { expected: usize, available: usize },

    #[error("Invalid annotation encoding: {0}")]
    InvalidAnnotationEncoding(#[source] Utf8Error),

    #[error("Annotation block has {found} entries, expected {expected}")]
    AnnotationCountMismatch { expected: usize, found: usize },

    #[error("Annotation block at offset {offset} ({len} bytes) runs past end of file ({available} bytes)")]
    TruncatedAnnotations { offset: usize, len: usize, available: usize },

    #[error("Invalid channel index {index}: file has channels 1..={channel_count}")]
    InvalidChannelIndex { index: usize, channel_count: u8 },

    #[cfg(feature = "xlsx")]
    #[error("Workbook error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[cfg(feature = "xlsx")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl DecodeError {
    /// True when the bytes are not a well-formed capture file, as opposed to
    /// an I/O failure, a bad channel index from the caller or an export failure.
    pub fn is_format_defect(&self) -> bool {
        matches!(
            self,
            DecodeError::TooShort(_)
                | DecodeError::TruncatedHeader { .. }
                | DecodeError::InvalidChannelCount
                | DecodeError::InvalidHeaderSize(_)
                | DecodeError::MalformedDataSize { .. }
                | DecodeError::TruncatedChannelTable { .. }
                | DecodeError::TruncatedData { .. }
                | DecodeError::InvalidAnnotationEncoding(_)
                | DecodeError::AnnotationCountMismatch { .. }
                | DecodeError::TruncatedAnnotations { .. }
        )
    }

    /// Annotation problems degrade to empty annotations instead of failing the decode.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DecodeError::InvalidAnnotationEncoding(_)
                | DecodeError::AnnotationCountMismatch { .. }
                | DecodeError::TruncatedAnnotations { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

fn field<const N: usize>(buffer: &[u8], offset: usize) -> Option<[u8; N]> {
    buffer.get(offset..offset.checked_add(N)?)?.try_into().ok()
}

fn header_field<const N: usize>(buffer: &[u8], offset: usize) -> Result<[u8; N]> {
    field(buffer, offset).ok_or(DecodeError::TruncatedHeader { offset, width: N })
}

/// Where the optional divisor byte and the physical channel byte sit in a
/// channel entry. Packed files insert the divisor before the channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryLayout {
    Unpacked,
    Packed,
}

impl EntryLayout {
    const SLOPE: usize = 0;
    const INTERCEPT: usize = 4;
    const CAL_SCALE: usize = 8;
    const CAL_INTERCEPT: usize = 16;
    const UNIT: usize = 24;
    const TAIL: usize = 30;

    pub fn from_packed(packed: bool) -> Self {
        if packed {
            EntryLayout::Packed
        } else {
            EntryLayout::Unpacked
        }
    }

    pub fn divisor_offset(self) -> Option<usize> {
        match self {
            EntryLayout::Unpacked => None,
            EntryLayout::Packed => Some(Self::TAIL),
        }
    }

    pub fn physical_channel_offset(self) -> usize {
        match self {
            EntryLayout::Unpacked => Self::TAIL,
            EntryLayout::Packed => Self::TAIL + 1,
        }
    }

    /// Bytes of the entry this decoder reads.
    pub fn entry_len(self) -> usize {
        self.physical_channel_offset() + 1
    }
}

/// Sample width mode selected by bit 1 of the flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 14-bit samples left-aligned in a 16-bit word.
    Standard,
    /// Full 16-bit samples.
    High,
}

impl Resolution {
    /// Convert a raw word to ADC counts before calibration.
    pub fn scale(self, raw: i16) -> f64 {
        match self {
            Resolution::High => raw as f64 * 0.25,
            // arithmetic shift == floor(raw / 4)
            Resolution::Standard => (raw >> 2) as f64,
        }
    }
}

/// Representation of the capture file header as decoded.
#[derive(Default, Clone, Debug, PartialEq, Serialize)]
pub struct Header {
    pub version: u16,
    pub channel_count: u8,
    pub channel_table_offset: u8,
    pub channel_entry_size: u8,
    pub header_size: i16,
    pub data_size: u32,
    pub trailer_size: u32,
    pub annotation_size: u16,
    pub sample_count_per_channel: usize,
    /// Seconds between successive samples of one channel.
    pub time_step: f64,
    /// Seconds since 1970-01-01 when acquisition opened the file.
    pub created_epoch: i32,
    /// Seconds since 1970-01-01 when acquisition wrote the file.
    pub written_epoch: i32,
    pub flags: u16,
    pub packed: bool,
    pub high_resolution: bool,
}

impl Header {
    /// Parse the fixed header region of a capture file
    pub fn parse_header(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < MIN_FILE_SIZE {
            return Err(DecodeError::TooShort(buffer.len()));
        }

        let mut hdr = Header::default();

        // Channel count, masked on older revisions
        hdr.version = u16::from_le_bytes(header_field(buffer, OFF_VERSION)?);
        let [channel_byte] = header_field::<1>(buffer, OFF_CHANNEL_BYTE)?;
        hdr.channel_count = if hdr.version >= FULL_CHANNEL_BYTE_VERSION {
            channel_byte
        } else {
            channel_byte & CHANNEL_COUNT_MASK
        };
        if hdr.channel_count == 0 {
            return Err(DecodeError::InvalidChannelCount);
        }

        // Block sizes
        hdr.channel_table_offset = header_field::<1>(buffer, OFF_TABLE_OFFSET)?[0];
        hdr.channel_entry_size = header_field::<1>(buffer, OFF_ENTRY_SIZE)?[0];
        hdr.header_size = i16::from_le_bytes(header_field(buffer, OFF_HEADER_SIZE)?);
        hdr.data_size = u32::from_le_bytes(header_field(buffer, OFF_DATA_SIZE)?);
        hdr.trailer_size = u32::from_le_bytes(header_field(buffer, OFF_TRAILER_SIZE)?);
        hdr.annotation_size = u16::from_le_bytes(header_field(buffer, OFF_ANNOTATION_SIZE)?);
        hdr.time_step = f64::from_le_bytes(header_field(buffer, OFF_TIME_STEP)?);

        if hdr.header_size < 0 {
            return Err(DecodeError::InvalidHeaderSize(hdr.header_size));
        }

        // Every sample is one 16-bit word regardless of resolution
        let row_bytes = 2 * hdr.channel_count as u32;
        if hdr.data_size % row_bytes != 0 {
            return Err(DecodeError::MalformedDataSize {
                data_size: hdr.data_size,
                channel_count: hdr.channel_count,
            });
        }
        hdr.sample_count_per_channel = (hdr.data_size / row_bytes) as usize;

        hdr.created_epoch = i32::from_le_bytes(header_field(buffer, OFF_CREATED)?);
        hdr.written_epoch = i32::from_le_bytes(header_field(buffer, OFF_WRITTEN)?);

        hdr.flags = u16::from_le_bytes(header_field(buffer, OFF_FLAGS)?);
        hdr.packed = (hdr.flags & (1 << PACKED_BIT)) >> PACKED_BIT == 1;
        hdr.high_resolution = hdr.flags & (1 << HIGH_RES_BIT) != 0;

        Ok(hdr)
    }

    pub fn layout(&self) -> EntryLayout {
        EntryLayout::from_packed(self.packed)
    }

    pub fn resolution(&self) -> Resolution {
        if self.high_resolution {
            Resolution::High
        } else {
            Resolution::Standard
        }
    }

    pub fn sample_count_f64(&self) -> f64 {
        self.sample_count_per_channel as f64
    }

    /// Byte offset of the first sample.
    pub fn data_offset(&self) -> usize {
        self.header_size.max(0) as usize
    }

    /// Byte offset of the annotation block, past the data and trailer.
    pub fn annotation_offset(&self) -> Option<usize> {
        self.data_offset()
            .checked_add(self.data_size as usize)?
            .checked_add(self.trailer_size as usize)
    }

    /// Creation time in the caller's time zone, `None` if unrepresentable.
    pub fn created_at<Tz: TimeZone>(&self, tz: &Tz) -> Option<DateTime<Tz>> {
        tz.timestamp_opt(self.created_epoch as i64, 0).single()
    }

    /// Write time in the caller's time zone, `None` if unrepresentable.
    pub fn written_at<Tz: TimeZone>(&self, tz: &Tz) -> Option<DateTime<Tz>> {
        tz.timestamp_opt(self.written_epoch as i64, 0).single()
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        self.created_at(&Utc)
    }

    pub fn written_at_local(&self) -> Option<DateTime<Local>> {
        self.written_at(&Local)
    }
}

/// Per-channel calibration entry.
#[derive(Default, Clone, Debug, PartialEq, Serialize)]
pub struct ChannelDescriptor {
    /// Display scaling, not used for physical values.
    pub scaling_slope: f32,
    pub scaling_intercept: f32,
    pub cal_scale: f64,
    pub cal_intercept: f64,
    /// Raw unit tag, padded with spaces or nulls.
    pub engineering_unit: [u8; 6],
    pub sample_rate_divisor: u8,
    pub physical_channel_number: u8,
}

impl ChannelDescriptor {
    fn parse_entry(buffer: &[u8], index: usize, hdr: &Header) -> Result<Self> {
        let layout = hdr.layout();
        let start = hdr.channel_table_offset as usize + index * hdr.channel_entry_size as usize;
        let truncated = move || DecodeError::TruncatedChannelTable {
            channel: index + 1,
            offset: start,
        };
        let entry = buffer
            .get(start..start + layout.entry_len())
            .ok_or_else(truncated)?;

        let f32_at = |offset| field(entry, offset).map(f32::from_le_bytes).ok_or_else(truncated);
        let f64_at = |offset| field(entry, offset).map(f64::from_le_bytes).ok_or_else(truncated);

        Ok(ChannelDescriptor {
            scaling_slope: f32_at(EntryLayout::SLOPE)?,
            scaling_intercept: f32_at(EntryLayout::INTERCEPT)?,
            cal_scale: f64_at(EntryLayout::CAL_SCALE)?,
            cal_intercept: f64_at(EntryLayout::CAL_INTERCEPT)?,
            engineering_unit: field(entry, EntryLayout::UNIT).ok_or_else(truncated)?,
            sample_rate_divisor: layout.divisor_offset().map_or(1, |off| entry[off]),
            physical_channel_number: entry[layout.physical_channel_offset()],
        })
    }

    /// Unit tag with embedded nulls and surrounding whitespace removed.
    pub fn unit(&self) -> String {
        String::from_utf8_lossy(&self.engineering_unit)
            .replace('\0', "")
            .trim()
            .to_string()
    }

    pub fn calibrate(&self, counts: f64) -> f64 {
        self.cal_scale * counts + self.cal_intercept
    }
}

/// Borrowed view of the interleaved little-endian i16 sample words.
#[derive(Clone, Copy, Debug)]
pub struct SampleBlock<'a> {
    bytes: &'a [u8],
}

impl<'a> SampleBlock<'a> {
    /// Number of sample words across all channels.
    pub fn len(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn raw(&self, index: usize) -> Option<i16> {
        field(self.bytes, index.checked_mul(2)?).map(i16::from_le_bytes)
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Lazily calibrated values of one channel.
#[derive(Clone, Debug)]
pub struct ChannelValues<'a> {
    samples: SampleBlock<'a>,
    position: usize,
    remaining: usize,
    stride: usize,
    resolution: Resolution,
    cal_scale: f64,
    cal_intercept: f64,
}

impl Iterator for ChannelValues<'_> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.remaining == 0 {
            return None;
        }
        let raw = self.samples.raw(self.position)?;
        self.position += self.stride;
        self.remaining -= 1;
        Some(self.cal_scale * self.resolution.scale(raw) + self.cal_intercept)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ChannelValues<'_> {}

/// Serialisable summary of a recording, one entry per channel.
#[derive(Clone, Debug, Serialize)]
pub struct RecordingInfo {
    pub channel_count: u8,
    pub sample_count_per_channel: usize,
    pub time_step: f64,
    pub duration: f64,
    pub packed: bool,
    pub resolution: Resolution,
    pub created_utc: Option<DateTime<Utc>>,
    pub written_local: Option<DateTime<Local>>,
    pub channels: Vec<ChannelInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChannelInfo {
    pub number: usize,
    pub unit: String,
    pub annotation: String,
    pub cal_scale: f64,
    pub cal_intercept: f64,
    pub sample_rate_divisor: u8,
    pub physical_channel_number: u8,
}

/// A decoded capture file. Borrows the sample block from the input buffer.
#[derive(Debug)]
pub struct Recording<'a> {
    header: Header,
    channels: Vec<ChannelDescriptor>,
    annotations: Vec<String>,
    annotation_error: Option<DecodeError>,
    samples: SampleBlock<'a>,
}

impl<'a> Recording<'a> {
    /// Decode a complete capture file held in memory.
    ///
    /// Header and channel table failures abort the decode. A bad annotation
    /// block only empties the annotations; see [`Recording::annotation_error`].
    pub fn decode(buffer: &'a [u8]) -> Result<Self> {
        let header = Header::parse_header(buffer)?;
        debug!(
            "Header: {} channels, {} samples/channel, dt={}s, packed={}, hires={}",
            header.channel_count,
            header.sample_count_per_channel,
            header.time_step,
            header.packed,
            header.high_resolution
        );

        let channels = (0..header.channel_count as usize)
            .map(|index| ChannelDescriptor::parse_entry(buffer, index, &header))
            .collect::<Result<Vec<_>>>()?;
        for (index, ch) in channels.iter().enumerate() {
            debug!(
                "Channel {}: cal {} * x + {}, unit {:?}, divisor {}, physical {}",
                index + 1,
                ch.cal_scale,
                ch.cal_intercept,
                ch.unit(),
                ch.sample_rate_divisor,
                ch.physical_channel_number
            );
        }

        let data_start = header.data_offset();
        let data_end = data_start + header.data_size as usize;
        let bytes = buffer
            .get(data_start..data_end)
            .ok_or(DecodeError::TruncatedData {
                expected: data_end,
                available: buffer.len(),
            })?;

        let (annotations, annotation_error) = parse_annotations(buffer, &header);
        if let Some(err) = &annotation_error {
            warn!("Ignoring channel annotations: {}", err);
        }

        Ok(Recording {
            header,
            channels,
            annotations,
            annotation_error,
            samples: SampleBlock { bytes },
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn channels(&self) -> &[ChannelDescriptor] {
        &self.channels
    }

    pub fn samples(&self) -> SampleBlock<'a> {
        self.samples
    }

    pub fn channel_count(&self) -> u8 {
        self.header.channel_count
    }

    pub fn time_step(&self) -> f64 {
        self.header.time_step
    }

    pub fn sample_count(&self) -> usize {
        self.header.sample_count_per_channel
    }

    /// Length of the capture in seconds.
    pub fn duration(&self) -> f64 {
        self.header.sample_count_f64() * self.header.time_step
    }

    /// The recoverable annotation failure hit during decode, if any.
    pub fn annotation_error(&self) -> Option<&DecodeError> {
        self.annotation_error.as_ref()
    }

    /// All annotation parts, including any past the last channel.
    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }

    fn slot(&self, channel: usize) -> Result<usize> {
        if channel == 0 || channel > self.header.channel_count as usize {
            return Err(DecodeError::InvalidChannelIndex {
                index: channel,
                channel_count: self.header.channel_count,
            });
        }
        Ok(channel - 1)
    }

    /// Calibration entry for a 1-based channel number.
    pub fn descriptor(&self, channel: usize) -> Result<&ChannelDescriptor> {
        Ok(&self.channels[self.slot(channel)?])
    }

    /// Physical values of a 1-based channel, computed on demand.
    pub fn channel_values(&self, channel: usize) -> Result<ChannelValues<'a>> {
        let slot = self.slot(channel)?;
        let desc = &self.channels[slot];
        Ok(ChannelValues {
            samples: self.samples,
            position: slot,
            remaining: self.header.sample_count_per_channel,
            stride: self.header.channel_count as usize,
            resolution: self.header.resolution(),
            cal_scale: desc.cal_scale,
            cal_intercept: desc.cal_intercept,
        })
    }

    /// Seconds since the first sample, shared by every channel.
    pub fn timestamps(&self) -> impl ExactSizeIterator<Item = f64> + DoubleEndedIterator + Clone {
        let step = self.header.time_step;
        (0..self.header.sample_count_per_channel).map(move |i| i as f64 * step)
    }

    /// Wall-clock time of every sample, anchored at the creation time in UTC.
    pub fn absolute_timestamps(&self) -> Option<impl ExactSizeIterator<Item = DateTime<Utc>> + Clone> {
        let start = self.header.created_at_utc()?;
        let step_ns = self.header.time_step * 1e9;
        Some(
            (0..self.header.sample_count_per_channel)
                .map(move |i| start + Duration::nanoseconds((i as f64 * step_ns).round() as i64)),
        )
    }

    pub fn channel_unit(&self, channel: usize) -> Result<String> {
        Ok(self.descriptor(channel)?.unit())
    }

    pub fn channel_annotation(&self, channel: usize) -> Result<&str> {
        let slot = self.slot(channel)?;
        Ok(self.annotations.get(slot).map_or("", String::as_str))
    }

    pub fn info(&self) -> RecordingInfo {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(slot, desc)| ChannelInfo {
                number: slot + 1,
                unit: desc.unit(),
                annotation: self.annotations.get(slot).cloned().unwrap_or_default(),
                cal_scale: desc.cal_scale,
                cal_intercept: desc.cal_intercept,
                sample_rate_divisor: desc.sample_rate_divisor,
                physical_channel_number: desc.physical_channel_number,
            })
            .collect();

        RecordingInfo {
            channel_count: self.header.channel_count,
            sample_count_per_channel: self.header.sample_count_per_channel,
            time_step: self.header.time_step,
            duration: self.duration(),
            packed: self.header.packed,
            resolution: self.header.resolution(),
            created_utc: self.header.created_at_utc(),
            written_local: self.header.written_at_local(),
            channels,
        }
    }
}

fn parse_annotations(buffer: &[u8], hdr: &Header) -> (Vec<String>, Option<DecodeError>) {
    let count = hdr.channel_count as usize;
    let len = hdr.annotation_size as usize;
    let empty = || vec![String::new(); count];
    if len == 0 {
        return (empty(), None);
    }

    let block = hdr
        .annotation_offset()
        .and_then(|offset| buffer.get(offset..offset.checked_add(len)?));
    let Some(block) = block else {
        let err = DecodeError::TruncatedAnnotations {
            offset: hdr.annotation_offset().unwrap_or(usize::MAX),
            len,
            available: buffer.len(),
        };
        return (empty(), Some(err));
    };

    let text = match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(e) => return (empty(), Some(DecodeError::InvalidAnnotationEncoding(e))),
    };

    let mut parts: Vec<String> = text.split('\0').map(String::from).collect();
    if parts.len() < count {
        let found = parts.len();
        parts.resize(count, String::new());
        return (
            parts,
            Some(DecodeError::AnnotationCountMismatch {
                expected: count,
                found,
            }),
        );
    }
    (parts, None)
}

/// Decode a complete capture file held in memory.
pub fn decode(buffer: &[u8]) -> Result<Recording<'_>> {
    Recording::decode(buffer)
}

/// Physical values of a 1-based channel.
pub fn channel_values<'a>(recording: &Recording<'a>, channel: usize) -> Result<ChannelValues<'a>> {
    recording.channel_values(channel)
}

/// Sample times in seconds, starting at zero.
pub fn timestamps(recording: &Recording<'_>) -> impl ExactSizeIterator<Item = f64> + Clone {
    recording.timestamps()
}

pub fn channel_unit(recording: &Recording<'_>, channel: usize) -> Result<String> {
    recording.channel_unit(channel)
}

pub fn channel_annotation<'r>(recording: &'r Recording<'_>, channel: usize) -> Result<&'r str> {
    recording.channel_annotation(channel)
}

/// Read a whole capture file into memory for [`decode`].
pub fn read_file<P: AsRef<Path>>(input_file: P) -> Result<Vec<u8>> {
    Ok(fs::read(input_file)?)
}
