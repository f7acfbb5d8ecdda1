//! Firmware build classification
//!
//! Tasmota reports its build as `<major>.<minor>.<patch>[.<build>](<variant>)`,
//! e.g. `9.5.0(tasmota)`, `12.4.0(tasmota32-DE)` or `9.5.0(tasmota-minimal)`.
//! The verdict decides whether an OTA upgrade can be requested safely:
//!
//! 1. a base below the table's minimum is legacy, whatever the variant
//! 2. a minimal build is excluded
//! 3. localized and feature-set builds are eligible
//! 4. an empty variant or a stock base name is eligible
//! 5. anything else is a custom build and excluded
//!
//! The variant lists are data ([`VariantTable`]) and can be replaced from
//! configuration when new builds appear.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn version_re() -> Option<&'static Regex> {
    VERSION_RE
        .get_or_init(|| {
            Regex::new(r"^\s*(\d+)\.(\d+)\.(\d+)(?:\.(\d+))?\s*(?:\(([^)]*)\))?\s*$").ok()
        })
        .as_ref()
}

/// Numeric base version. Ordered component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }

    fn key(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.patch, self.build)
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, ".{}", self.build)?;
        }
        Ok(())
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(format!("invalid firmware version '{}'", s));
        }
        let mut nums = [0u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("invalid firmware version '{}'", s))?;
        }
        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            build: nums[3],
        })
    }
}

impl TryFrom<String> for FirmwareVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FirmwareVersion> for String {
    fn from(v: FirmwareVersion) -> Self {
        v.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum BuildVariant {
    Standard,
    Minimal,
    Localized(String),
    FeatureSet(String),
    Custom(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateVerdict {
    Eligible,
    ExcludedMinimal,
    ExcludedLegacy,
    ExcludedCustom,
}

impl UpdateVerdict {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

impl fmt::Display for UpdateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eligible => "eligible",
            Self::ExcludedMinimal => "excluded-minimal",
            Self::ExcludedLegacy => "excluded-legacy",
            Self::ExcludedCustom => "excluded-custom",
        };
        f.write_str(s)
    }
}

/// A parsed firmware string. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareBuild {
    pub raw: String,
    pub base: Option<FirmwareVersion>,
    pub variant: BuildVariant,
}

/// Build plus verdict, as stored on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatus {
    pub build: FirmwareBuild,
    pub verdict: UpdateVerdict,
}

/// Known build names, grouped by how they affect upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantTable {
    /// Label of this table revision, logged at startup
    pub revision: String,
    /// Builds below this base are legacy
    pub min_version: FirmwareVersion,
    /// Stock build names that may carry a `-<tag>` suffix
    pub bases: Vec<String>,
    pub minimal: Vec<String>,
    /// Two-letter language codes of localized builds
    pub localized: Vec<String>,
    pub feature_sets: Vec<String>,
}

impl Default for VariantTable {
    fn default() -> Self {
        fn list(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            revision: "2024.06".to_string(),
            min_version: FirmwareVersion::new(9, 1, 0),
            bases: list(&[
                "tasmota",
                "tasmota32",
                "tasmota32c2",
                "tasmota32c3",
                "tasmota32c6",
                "tasmota32s2",
                "tasmota32s3",
                "tasmota32solo1",
            ]),
            minimal: list(&["minimal"]),
            localized: list(&[
                "AD", "AF", "BG", "BR", "CN", "CZ", "DE", "ES", "FR", "FY", "GR", "HE", "HU", "IT",
                "KO", "NL", "PL", "PT", "RO", "RU", "SE", "SK", "TR", "TW", "UK", "VN",
            ]),
            feature_sets: list(&[
                "sensors", "lite", "ir", "display", "knx", "zbbridge", "zigbee", "bluetooth",
                "lvgl", "webcam", "nspanel", "zbbrdgpro", "ethernet", "4m",
            ]),
        }
    }
}

impl VariantTable {
    /// Match a variant name. Names are `<stock-base>[-<tag>]`, optionally
    /// prefixed with `release-`; matching ignores case.
    pub fn variant_of(&self, variant: &str) -> BuildVariant {
        let lower = variant.trim().to_ascii_lowercase();
        let name = lower.strip_prefix("release-").unwrap_or(&lower);
        if name.is_empty() {
            return BuildVariant::Standard;
        }

        let (base, tag) = name.split_once('-').unwrap_or((name, ""));
        if contains_ignore_case(&self.minimal, tag) || contains_ignore_case(&self.minimal, name) {
            return BuildVariant::Minimal;
        }
        if !contains_ignore_case(&self.bases, base) {
            return BuildVariant::Custom(variant.trim().to_string());
        }
        if tag.is_empty() {
            BuildVariant::Standard
        } else if contains_ignore_case(&self.localized, tag) {
            BuildVariant::Localized(tag.to_ascii_uppercase())
        } else if contains_ignore_case(&self.feature_sets, tag) {
            BuildVariant::FeatureSet(tag.to_string())
        } else {
            BuildVariant::Custom(variant.trim().to_string())
        }
    }

    pub fn parse(&self, raw: &str) -> FirmwareBuild {
        let captures = version_re().and_then(|re| re.captures(raw));
        let Some(caps) = captures else {
            return FirmwareBuild {
                raw: raw.to_string(),
                base: None,
                variant: BuildVariant::Custom(raw.trim().to_string()),
            };
        };

        let num = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };
        let base = FirmwareVersion {
            major: num(1),
            minor: num(2),
            patch: num(3),
            build: num(4),
        };
        let variant = self.variant_of(caps.get(5).map_or("", |m| m.as_str()));

        FirmwareBuild {
            raw: raw.to_string(),
            base: Some(base),
            variant,
        }
    }

    pub fn verdict(&self, build: &FirmwareBuild) -> UpdateVerdict {
        let Some(base) = build.base else {
            return UpdateVerdict::ExcludedCustom;
        };
        if base < self.min_version {
            return UpdateVerdict::ExcludedLegacy;
        }
        match build.variant {
            BuildVariant::Minimal => UpdateVerdict::ExcludedMinimal,
            BuildVariant::Localized(_) | BuildVariant::FeatureSet(_) | BuildVariant::Standard => {
                UpdateVerdict::Eligible
            }
            BuildVariant::Custom(_) => UpdateVerdict::ExcludedCustom,
        }
    }

    /// Parse and judge a raw firmware string.
    pub fn classify(&self, raw: &str) -> FirmwareStatus {
        let build = self.parse(raw);
        let verdict = self.verdict(&build);
        FirmwareStatus { build, verdict }
    }
}

fn contains_ignore_case(list: &[String], needle: &str) -> bool {
    !needle.is_empty() && list.iter().any(|s| s.eq_ignore_ascii_case(needle))
}
