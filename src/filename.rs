//! Artifact filename codec
//!
//! Encodes `(requested_key, timestamp, media kind)` into
//! `{key}__{DD-MM-YYYY}_{HH-MM-SS}.{ext}` and decodes it back. The cleanup
//! sweep relies on the embedded timestamp to decide deletion age, so decoding
//! is strict: anything not matching the exact shape is "no match", never an
//! error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Output media of a render job. Jpeg maps to the `jpg` file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Pdf,
    Png,
    Jpeg,
}

impl MediaKind {
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Pdf => "pdf",
            MediaKind::Png => "png",
            MediaKind::Jpeg => "jpg",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(MediaKind::Pdf),
            "png" => Some(MediaKind::Png),
            "jpg" => Some(MediaKind::Jpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub requested_key: String,
    pub timestamp: NaiveDateTime,
    pub media: MediaKind,
}

impl ParsedFilename {
    /// Age of the artifact relative to `now`, in whole hours. Timestamps in
    /// the future count as zero.
    pub fn age_hours(&self, now: DateTime<Utc>) -> u64 {
        let age = now.naive_utc() - self.timestamp;
        age.num_hours().max(0) as u64
    }
}

pub fn encode_filename(requested_key: &str, timestamp: DateTime<Utc>, media: MediaKind) -> String {
    format!(
        "{requested_key}__{}.{}",
        timestamp.format("%d-%m-%Y_%H-%M-%S"),
        media.extension()
    )
}

/// Keys are restricted to filename-safe characters so the codec stays
/// unambiguous.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 255
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn parse_field(s: &str, width: usize) -> Option<u32> {
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub fn decode_filename(filename: &str) -> Option<ParsedFilename> {
    // Keys may themselves contain `__`; the timestamp never does, so the
    // last separator is the unambiguous one.
    let (key, rest) = filename.rsplit_once("__")?;
    if !is_valid_key(key) {
        return None;
    }

    let (stamp, ext) = rest.rsplit_once('.')?;
    let media = MediaKind::from_extension(ext)?;

    // DD-MM-YYYY_HH-MM-SS with exact zero-padded widths
    let (date_part, time_part) = stamp.split_once('_')?;
    let date_fields: Vec<&str> = date_part.split('-').collect();
    let time_fields: Vec<&str> = time_part.split('-').collect();
    if date_fields.len() != 3 || time_fields.len() != 3 {
        return None;
    }

    let day = parse_field(date_fields[0], 2)?;
    let month = parse_field(date_fields[1], 2)?;
    let year = parse_field(date_fields[2], 4)?;
    let hour = parse_field(time_fields[0], 2)?;
    let minute = parse_field(time_fields[1], 2)?;
    let second = parse_field(time_fields[2], 2)?;

    let timestamp = NaiveDate::from_ymd_opt(year as i32, month, day)?
        .and_hms_opt(hour, minute, second)?;

    Some(ParsedFilename {
        requested_key: key.to_string(),
        timestamp,
        media,
    })
}
