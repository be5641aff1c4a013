//! Firmware images, format sniffing, and release catalogs
//!
//! This module provides:
//! - [`FirmwareImage`], the immutable payload handed to the programmer
//! - [`detect_format`], a pure classifier from bytes (and an optional file
//!   name) to image format and target board
//! - Catalog types for the remote release index and semver comparison

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::board::BoardType;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("Unrecognized firmware image: {0}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    RawBinary,
    IntelHex,
}

impl ImageFormat {
    /// File extension used when handing the image to a programmer
    pub fn extension(self) -> &'static str {
        match self {
            Self::RawBinary => "bin",
            Self::IntelHex => "hex",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RawBinary => f.write_str("raw-binary"),
            Self::IntelHex => f.write_str("intel-hex"),
        }
    }
}

/// Where an image came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    LocalPath { path: PathBuf },
    Remote { url: String, version: String },
}

impl ImageSource {
    /// File name component, used as a board hint during sniffing
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::LocalPath { path } => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            Self::Remote { url, .. } => url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }
}

/// Result of sniffing a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub format: ImageFormat,
    pub target: Option<BoardType>,
}

/// A loaded firmware image; immutable once built
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    source: ImageSource,
    format: ImageFormat,
    target: Option<BoardType>,
    payload: Vec<u8>,
}

impl FirmwareImage {
    /// Sniff `payload` and wrap it
    pub fn from_bytes(source: ImageSource, payload: Vec<u8>) -> Result<Self, FormatError> {
        let name = source.file_name();
        let detection = detect_format(&payload, name.as_deref())?;
        Ok(Self {
            source,
            format: detection.format,
            target: detection.target,
            payload,
        })
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn target(&self) -> Option<BoardType> {
        self.target
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn sha256(&self) -> String {
        sha256_hex(&self.payload)
    }
}

/// First byte of an Espressif application image
const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Classify a firmware payload
///
/// A payload starting with the Intel-HEX start code must also carry a
/// well-formed first record, otherwise it is rejected rather than treated
/// as raw data. Empty payloads and HTML pages (a download that returned an
/// error page) are rejected. The target board comes from the file name when
/// it names one, then from image magic.
pub fn detect_format(payload: &[u8], file_name: Option<&str>) -> Result<Detection, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::UnknownFormat("empty payload".to_string()));
    }

    let trimmed = trim_leading_whitespace(payload);
    if looks_like_html(trimmed) {
        return Err(FormatError::UnknownFormat(
            "payload is an HTML document".to_string(),
        ));
    }

    let format = if trimmed.first() == Some(&b':') {
        let first_line = trimmed
            .split(|b| *b == b'\n' || *b == b'\r')
            .next()
            .unwrap_or_default();
        if !is_valid_hex_record(first_line) {
            return Err(FormatError::UnknownFormat(
                "starts with ':' but is not a valid Intel-HEX record".to_string(),
            ));
        }
        ImageFormat::IntelHex
    } else {
        ImageFormat::RawBinary
    };

    let target = file_name.and_then(board_from_file_name).or_else(|| {
        (format == ImageFormat::RawBinary && payload[0] == ESP_IMAGE_MAGIC)
            .then_some(BoardType::Esp32C3)
    });

    Ok(Detection { format, target })
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head: Vec<u8> = bytes.iter().take(15).map(u8::to_ascii_lowercase).collect();
    head.starts_with(b"<!doctype html") || head.starts_with(b"<html")
}

/// Check one `:LLAAAATT<data>CC` record including its checksum
fn is_valid_hex_record(line: &[u8]) -> bool {
    let Some(body) = line.strip_prefix(b":") else {
        return false;
    };
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let Ok(bytes) = hex::decode(text.trim_end()) else {
        return false;
    };
    if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
        return false;
    }
    // Record types 00-05
    if bytes[3] > 5 {
        return false;
    }
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

/// Find a board name anywhere in a release file name
fn board_from_file_name(name: &str) -> Option<BoardType> {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_uppercase();
    BoardType::ALL
        .into_iter()
        .find(|b| normalized.contains(b.as_str()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Release channel in the remote catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Stable,
    Testing,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Testing => "testing",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "testing" => Ok(Self::Testing),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// Release index for one channel
/// Fetched from: {catalog_url}/{channel}/catalog.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareCatalog {
    pub channel: Channel,
    #[serde(default)]
    pub generated: Option<DateTime<Utc>>,
    pub releases: Vec<FirmwareRelease>,
}

impl FirmwareCatalog {
    /// Latest release built for `board`
    pub fn latest_for(&self, board: BoardType) -> Option<&FirmwareRelease> {
        self.releases
            .iter()
            .filter(|r| r.board == board)
            .max_by(|a, b| {
                match (parse_version(&a.version), parse_version(&b.version)) {
                    (Some(va), Some(vb)) => va.cmp(&vb),
                    _ => a.date.cmp(&b.date),
                }
            })
    }
}

/// A downloadable firmware build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub board: BoardType,
    /// Version string, e.g. "v2.2.1"
    pub version: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    /// Binary file size in bytes
    pub size: u64,
    /// SHA-256 of the file, hex
    pub sha256: String,
    /// Absolute, or relative to the catalog location
    pub url: String,
    #[serde(default)]
    pub changelog: Option<String>,
}

/// Result of firmware version comparison
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FirmwareStatus {
    UpToDate,
    UpdateAvailable {
        latest_version: String,
        changelog: Option<String>,
    },
    /// Version strings could not be compared
    Unknown,
}

/// Compare the board's firmware version against a catalog release
pub fn compare_versions(device_version: &str, release: &FirmwareRelease) -> FirmwareStatus {
    match (parse_version(device_version), parse_version(&release.version)) {
        (Some(device), Some(latest)) if device < latest => FirmwareStatus::UpdateAvailable {
            latest_version: release.version.clone(),
            changelog: release.changelog.clone(),
        },
        (Some(_), Some(_)) => FirmwareStatus::UpToDate,
        _ => FirmwareStatus::Unknown,
    }
}

/// Parse a firmware version tag
///
/// Accepts a leading `v` and fills in a missing minor or patch number, so
/// "v2.2" parses as 2.2.0. Pre-release suffixes such as "-dirty" are kept.
pub fn parse_version(version: &str) -> Option<semver::Version> {
    let v = version.trim();
    let v = v.strip_prefix(['v', 'V']).unwrap_or(v);

    let (core, suffix) = match v.find(['-', '+']) {
        Some(i) => v.split_at(i),
        None => (v, ""),
    };
    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{}.0.0{}", core, suffix),
        1 => format!("{}.0{}", core, suffix),
        _ => v.to_string(),
    };
    semver::Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &[u8] = b":10000000000102030405060708090A0B0C0D0E0F78\n:00000001FF\n";

    #[test]
    fn test_detect_intel_hex() {
        let d = detect_format(HEX, None).unwrap();
        assert_eq!(d.format, ImageFormat::IntelHex);
        assert_eq!(d.target, None);
    }

    #[test]
    fn test_detect_raw_binary() {
        let d = detect_format(&[0x00, 0x10, 0x00, 0x20, 0xff], None).unwrap();
        assert_eq!(d.format, ImageFormat::RawBinary);
    }

    #[test]
    fn test_colon_without_valid_record_is_unknown() {
        assert!(matches!(
            detect_format(b":not a hex record", None),
            Err(FormatError::UnknownFormat(_))
        ));
        // Checksum off by one
        assert!(detect_format(b":00000001FE\n", None).is_err());
    }

    #[test]
    fn test_empty_and_html_are_unknown() {
        assert!(detect_format(b"", None).is_err());
        assert!(detect_format(b"\n<!DOCTYPE html><html></html>", None).is_err());
        assert!(detect_format(b"<HTML><body>404</body>", None).is_err());
    }

    #[test]
    fn test_target_from_file_name() {
        let d = detect_format(HEX, Some("headtracker_v2.2_XIAO_SENSE.hex")).unwrap();
        assert_eq!(d.target, Some(BoardType::XiaoSense));
        let d = detect_format(b"\x01\x02", Some("fw-nano33ble.bin")).unwrap();
        assert_eq!(d.target, Some(BoardType::Nano33Ble));
    }

    #[test]
    fn test_target_from_esp_magic() {
        let d = detect_format(&[0xE9, 0x03, 0x02, 0x20], Some("firmware.bin")).unwrap();
        assert_eq!(d.target, Some(BoardType::Esp32C3));
    }

    #[test]
    fn test_image_from_remote_source() {
        let source = ImageSource::Remote {
            url: "https://example.com/stable/headtracker_DTQSYS.hex".to_string(),
            version: "v2.2.1".to_string(),
        };
        let image = FirmwareImage::from_bytes(source, HEX.to_vec()).unwrap();
        assert_eq!(image.format(), ImageFormat::IntelHex);
        assert_eq!(image.target(), Some(BoardType::DtqSys));
        assert_eq!(image.sha256(), sha256_hex(HEX));
    }

    fn release(version: &str) -> FirmwareRelease {
        FirmwareRelease {
            board: BoardType::Nano33Ble,
            version: version.to_string(),
            date: None,
            size: 1000,
            sha256: "00".to_string(),
            url: "nano.hex".to_string(),
            changelog: Some("Test release".to_string()),
        }
    }

    #[test]
    fn test_parse_version_padding() {
        assert_eq!(parse_version("v2.2"), Some(semver::Version::new(2, 2, 0)));
        assert_eq!(parse_version("3"), Some(semver::Version::new(3, 0, 0)));
        assert_eq!(parse_version("V1.2.3"), Some(semver::Version::new(1, 2, 3)));
        assert!(parse_version("v2.2-dirty").unwrap().pre.as_str() == "dirty");
        assert_eq!(parse_version("nightly"), None);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("v2.2", &release("2.2.0")), FirmwareStatus::UpToDate);
        assert!(matches!(
            compare_versions("v2.1.9", &release("v2.2")),
            FirmwareStatus::UpdateAvailable { .. }
        ));
        assert_eq!(compare_versions("custom", &release("v2.2")), FirmwareStatus::Unknown);
    }

    #[test]
    fn test_catalog_latest_for_board() {
        let catalog = FirmwareCatalog {
            channel: Channel::Stable,
            generated: None,
            releases: vec![release("v2.1"), release("v2.10"), release("v2.9")],
        };
        assert_eq!(catalog.latest_for(BoardType::Nano33Ble).unwrap().version, "v2.10");
        assert!(catalog.latest_for(BoardType::Esp32C3).is_none());
    }
}
