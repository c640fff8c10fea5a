//! Firmware version strings and images.

use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Seek};
use std::str::FromStr;

/// `MAJOR.MINOR.PATCH[...]` as reported by the firmware revision characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Whatever follows the patch digits, e.g. `-rc1` or `.abc123`.
    pub suffix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid firmware version {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let mut parts = trimmed.splitn(3, '.');

        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;

        let rest = parts.next().ok_or_else(invalid)?;
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid());
        }
        let patch = rest[..digits].parse().map_err(|_| invalid())?;

        Ok(Self {
            major,
            minor,
            patch,
            suffix: rest[digits..].to_string(),
        })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.suffix)
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| self.suffix.cmp(&other.suffix))
    }
}

/// A leading `0` component means the watch is running the recovery firmware.
pub fn is_recovery_mode(firmware: &str) -> bool {
    firmware.split('.').next() == Some("0")
}

/// True when `candidate` is strictly newer than what the watch reports.
///
/// An unparseable current version (e.g. a development build) always offers the update.
pub fn update_available(current: &str, candidate: &str) -> bool {
    let Ok(candidate) = candidate.parse::<FirmwareVersion>() else {
        return false;
    };
    match current.parse::<FirmwareVersion>() {
        Ok(current) => candidate > current,
        Err(_) => true,
    }
}

/// Application image plus its init packet, as extracted from a DFU package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub version: Option<String>,
    pub init_packet: Vec<u8>,
    pub image: Vec<u8>,
}

impl FirmwareImage {
    pub fn new(init_packet: Vec<u8>, image: Vec<u8>) -> Self {
        Self {
            version: None,
            init_packet,
            image,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Reads a DFU `.zip` package: `manifest.json` names the application
    /// image and its init packet. The version comes from the image file name
    /// (`pinetime-mcuboot-app-image-1.14.0.bin`) when it carries one.
    pub fn from_package<R: Read + Seek>(reader: R) -> Result<Self, PackageError> {
        let mut archive = zip::ZipArchive::new(reader)?;
        let manifest: PackageManifest = serde_json::from_slice(&read_entry(&mut archive, MANIFEST)?)
            .map_err(PackageError::Manifest)?;
        let application = manifest
            .manifest
            .application
            .ok_or(PackageError::NoApplication)?;

        let init_packet = read_entry(&mut archive, &application.dat_file)?;
        let image = read_entry(&mut archive, &application.bin_file)?;
        let firmware = Self::new(init_packet, image);
        Ok(match version_from_file_name(&application.bin_file) {
            Some(version) => firmware.with_version(version),
            None => firmware,
        })
    }
}

const MANIFEST: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("invalid DFU package: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("DFU package entry {name} unreadable: {source}")]
    Entry {
        name: String,
        source: std::io::Error,
    },
    #[error("invalid DFU manifest: {0}")]
    Manifest(serde_json::Error),
    #[error("DFU package has no application image")]
    NoApplication,
}

#[derive(Deserialize)]
struct PackageManifest {
    manifest: ManifestContent,
}

#[derive(Deserialize)]
struct ManifestContent {
    application: Option<ManifestEntry>,
}

#[derive(Deserialize)]
struct ManifestEntry {
    bin_file: String,
    dat_file: String,
}

fn read_entry<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, PackageError> {
    let mut entry = archive.by_name(name)?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|source| PackageError::Entry {
            name: name.to_string(),
            source,
        })?;
    Ok(data)
}

fn version_from_file_name(file: &str) -> Option<String> {
    let stem = file.rsplit('/').next()?.strip_suffix(".bin")?;
    let candidate = stem.rsplit('-').next()?;
    candidate
        .parse::<FirmwareVersion>()
        .ok()
        .map(|_| candidate.to_string())
}
