/*!
Object key layout and the canonical backup timestamp.

Keys have the form `{prefix}/{service}/{path-name}/{timestamp}.{ext}` where
the timestamp is `YYYYMMDD-HHMMSS` in UTC, so lexicographic key order within
one path equals chronological order. The extension is `tar.gz` for
compressed archives and `tar` otherwise.
*/

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// strftime layout of the canonical timestamp
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Length of a canonical timestamp
pub const TIMESTAMP_LEN: usize = 15;
/// Length of a calendar date token (`YYYYMMDD`)
pub const DATE_LEN: usize = 8;

/// Second-resolution UTC instant with a single canonical text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    /// The current instant truncated to whole seconds
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        let naive = instant.naive_utc();
        Self(naive.with_nanosecond(0).unwrap_or(naive))
    }

    /// Parse the canonical form, rejecting anything that is not exactly
    /// `YYYYMMDD-HHMMSS`.
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.len() != TIMESTAMP_LEN || bytes[DATE_LEN] != b'-' {
            return None;
        }
        let digits_only = bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == DATE_LEN || b.is_ascii_digit());
        if !digits_only {
            return None;
        }
        NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok().map(Self)
    }

    pub fn date(&self) -> NaiveDate {
        self.0.date()
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        self.0.and_utc()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Container format of an uploaded archive, encoded in the key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// Plain tar stream
    Tar,
    /// Gzip-compressed tar stream
    TarGz,
}

impl ArchiveFormat {
    pub fn from_compression(compressed: bool) -> Self {
        if compressed {
            Self::TarGz
        } else {
            Self::Tar
        }
    }

    /// Key suffix including the leading dot
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Self::TarGz)
    }

    /// Split a file name into stem and format. `.tar.gz` is checked first.
    pub fn strip_suffix(file_name: &str) -> Option<(&str, Self)> {
        if let Some(stem) = file_name.strip_suffix(Self::TarGz.suffix()) {
            return Some((stem, Self::TarGz));
        }
        file_name.strip_suffix(Self::Tar.suffix()).map(|stem| (stem, Self::Tar))
    }
}

/// Components recovered from a well-formed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub service: String,
    pub path_name: String,
    pub timestamp: Timestamp,
    pub format: ArchiveFormat,
}

/// Encodes and decodes object keys under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
    format: ArchiveFormat,
}

impl KeyCodec {
    /// `prefix` may be empty; surrounding slashes are ignored.
    pub fn new(prefix: &str, format: ArchiveFormat) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            format,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Format used for newly encoded keys
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn encode(&self, service: &str, path_name: &str, timestamp: &Timestamp) -> String {
        format!(
            "{}{}/{}/{}{}",
            self.root_prefix(),
            service,
            path_name,
            timestamp,
            self.format.suffix()
        )
    }

    /// Prefix under which every key of this codec lives (`""` or `"prefix/"`)
    pub fn root_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    /// Prefix of all keys belonging to `service`
    pub fn service_prefix(&self, service: &str) -> String {
        format!("{}{}/", self.root_prefix(), service)
    }

    /// Decode a key, returning `None` for anything not produced by `encode`.
    pub fn decode(&self, key: &str) -> Option<DecodedKey> {
        let relative = key.strip_prefix(&self.root_prefix())?;
        let segments: Vec<&str> = relative.split('/').collect();
        if segments.len() < 3 || segments.iter().any(|segment| segment.is_empty()) {
            return None;
        }

        let (file_name, directories) = segments.split_last()?;
        let (stem, format) = ArchiveFormat::strip_suffix(file_name)?;
        let timestamp = Timestamp::parse(stem)?;

        Some(DecodedKey {
            service: directories[0].to_string(),
            path_name: directories[1..].join("/"),
            timestamp,
            format,
        })
    }
}
