//! Core domain model for tipster: predictors, races, predictions and the
//! identifiers that tie them together.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tipster-core";

/// Prefix shared by every locally synthesized race identifier.
pub const PLACEHOLDER_PREFIX: &str = "temp_";

/// Canonical race identifiers are exactly this many ASCII digits.
pub const CANONICAL_RACE_ID_LEN: usize = 12;

/// Grade-tier prediction count at which a predictor becomes `High` reliability.
///
/// Fixed business rule carried over as-is; pending product confirmation on
/// whether it should become configurable.
pub const HIGH_RELIABILITY_MIN_GRADE_PREDICTIONS: i64 = 15;

/// Grade-tier prediction count at which a predictor becomes `Medium` reliability.
pub const MEDIUM_RELIABILITY_MIN_GRADE_PREDICTIONS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("canonical race id must be 12 ascii digits, got {0:?}")]
    MalformedCanonical(String),
    #[error("placeholder race id must start with \"temp_\", got {0:?}")]
    MalformedPlaceholder(String),
    #[error("unknown surface label {0:?}")]
    UnknownSurface(String),
    #[error("unknown grade label {0:?}")]
    UnknownGrade(String),
}

macro_rules! row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(PredictorId);
row_id!(RaceRowId);
row_id!(PredictionId);

/// Externally assigned, globally unique race identifier (e.g. `202505050211`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalRaceId(String);

impl CanonicalRaceId {
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        let trimmed = input.trim();
        if trimmed.len() == CANONICAL_RACE_ID_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(KeyError::MalformedCanonical(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CanonicalRaceId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CanonicalRaceId {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CanonicalRaceId> for String {
    fn from(value: CanonicalRaceId) -> Self {
        value.0
    }
}

impl fmt::Display for CanonicalRaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally synthesized race identifier: `temp_{predictor_key}_{sequence}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlaceholderKey(String);

impl PlaceholderKey {
    pub fn new(predictor_key: i64, sequence: i64) -> Self {
        Self(format!("{PLACEHOLDER_PREFIX}{predictor_key}_{sequence}"))
    }

    pub fn parse(input: &str) -> Result<Self, KeyError> {
        match input.strip_prefix(PLACEHOLDER_PREFIX) {
            Some(rest) if !rest.is_empty() => Ok(Self(input.to_string())),
            _ => Err(KeyError::MalformedPlaceholder(input.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PlaceholderKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PlaceholderKey> for String {
    fn from(value: PlaceholderKey) -> Self {
        value.0
    }
}

/// The value of a race's identifier column, either before or after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RaceKey {
    Placeholder(PlaceholderKey),
    Canonical(CanonicalRaceId),
}

impl RaceKey {
    pub fn parse(input: &str) -> Result<Self, KeyError> {
        if input.starts_with(PLACEHOLDER_PREFIX) {
            PlaceholderKey::parse(input).map(Self::Placeholder)
        } else {
            CanonicalRaceId::parse(input).map(Self::Canonical)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Placeholder(p) => p.as_str(),
            Self::Canonical(c) => c.as_str(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    pub fn canonical(&self) -> Option<&CanonicalRaceId> {
        match self {
            Self::Canonical(c) => Some(c),
            Self::Placeholder(_) => None,
        }
    }
}

impl FromStr for RaceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RaceKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RaceKey> for String {
    fn from(value: RaceKey) -> Self {
        match value {
            RaceKey::Placeholder(p) => p.into(),
            RaceKey::Canonical(c) => c.into(),
        }
    }
}

impl From<CanonicalRaceId> for RaceKey {
    fn from(value: CanonicalRaceId) -> Self {
        Self::Canonical(value)
    }
}

impl From<PlaceholderKey> for RaceKey {
    fn from(value: PlaceholderKey) -> Self {
        Self::Placeholder(value)
    }
}

impl fmt::Display for RaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track surface. `Unknown` is the sentinel an un-enriched race carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    Turf,
    Dirt,
    Jump,
    #[default]
    Unknown,
}

impl Surface {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Turf => "turf",
            Self::Dirt => "dirt",
            Self::Jump => "jump",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl FromStr for Surface {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "turf" => Ok(Self::Turf),
            "dirt" => Ok(Self::Dirt),
            "jump" => Ok(Self::Jump),
            "unknown" | "" => Ok(Self::Unknown),
            _ => Err(KeyError::UnknownSurface(s.to_string())),
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graded-stakes tier. Races outside the graded tiers carry no grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Grade {
    G1,
    G2,
    G3,
}

impl Grade {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::G1 => "G1",
            Self::G2 => "G2",
            Self::G3 => "G3",
        }
    }

    /// Accepts `G1`, `GI`, `GⅠ`, full-width `Ｇ１` and the bare tier numeral.
    pub fn parse_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .chars()
            .map(|c| match c {
                'Ｇ' | 'g' => 'G',
                '１' | 'Ⅰ' => '1',
                '２' | 'Ⅱ' => '2',
                '３' | 'Ⅲ' => '3',
                other => other,
            })
            .collect();
        let tier = normalized.strip_prefix('G').unwrap_or(&normalized);
        match tier {
            "1" | "I" => Some(Self::G1),
            "2" | "II" => Some(Self::G2),
            "3" | "III" => Some(Self::G3),
            _ => None,
        }
    }
}

impl TryFrom<String> for Grade {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_label(&value).ok_or(KeyError::UnknownGrade(value))
    }
}

impl From<Grade> for String {
    fn from(value: Grade) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReliabilityTier {
    #[default]
    Low,
    Medium,
    High,
}

impl ReliabilityTier {
    pub fn from_grade_predictions(count: i64) -> Self {
        if count >= HIGH_RELIABILITY_MIN_GRADE_PREDICTIONS {
            Self::High
        } else if count >= MEDIUM_RELIABILITY_MIN_GRADE_PREDICTIONS {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for ReliabilityTier {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            _ => Ok(Self::Low),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Hit,
    Miss,
    #[default]
    Unknown,
}

impl Outcome {
    pub fn from_hit(is_hit: Option<bool>) -> Self {
        match is_hit {
            Some(true) => Self::Hit,
            Some(false) => Self::Miss,
            None => Self::Unknown,
        }
    }

    pub fn as_hit(self) -> Option<bool> {
        match self {
            Self::Hit => Some(true),
            Self::Miss => Some(false),
            Self::Unknown => None,
        }
    }
}

/// Return on investment in percent, from the payout and the net balance the
/// source reports. The stake is `payout - balance`; without a positive stake
/// there is nothing to derive.
pub fn derive_roi(payout: Option<i64>, balance: Option<i64>) -> Option<f64> {
    let (payout, balance) = (payout?, balance?);
    if payout <= 0 || balance == 0 {
        return None;
    }
    let stake = payout - balance;
    if stake <= 0 {
        return None;
    }
    Some(payout as f64 / stake as f64 * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predictor {
    pub id: PredictorId,
    pub external_key: i64,
    pub name: String,
    pub total_predictions: i64,
    pub grade_predictions: i64,
    pub reliability: ReliabilityTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub id: RaceRowId,
    pub key: RaceKey,
    pub name: String,
    pub race_date: Option<NaiveDate>,
    pub venue: Option<String>,
    pub surface: Surface,
    pub distance_m: u32,
    pub grade: Option<Grade>,
    pub field_size: Option<u32>,
    pub track_condition: Option<String>,
    pub resolve_failures: u32,
    pub enrich_failures: u32,
}

impl Race {
    pub fn is_placeholder(&self) -> bool {
        self.key.is_placeholder()
    }

    /// Enriched means both sentinel attributes have been replaced.
    pub fn is_enriched(&self) -> bool {
        self.surface.is_known() && self.distance_m > 0
    }

    pub fn is_graded(&self) -> bool {
        self.grade.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: PredictionId,
    pub predictor_id: PredictorId,
    pub race_id: RaceRowId,
    pub lookup_key: Option<i64>,
    pub outcome: Outcome,
    pub payout: Option<i64>,
    pub roi: Option<f64>,
}

/// Descriptive race attributes returned by a detail fetch. `None` means the
/// value was not confidently extracted and must not overwrite what is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RaceAttributes {
    pub name: Option<String>,
    pub race_date: Option<NaiveDate>,
    pub venue: Option<String>,
    pub surface: Option<Surface>,
    pub distance_m: Option<u32>,
    pub grade: Option<Grade>,
    pub field_size: Option<u32>,
    pub track_condition: Option<String>,
}

impl RaceAttributes {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.race_date.is_none()
            && self.venue.is_none()
            && self.surface.is_none()
            && self.distance_m.is_none()
            && self.grade.is_none()
            && self.field_size.is_none()
            && self.track_condition.is_none()
    }

    /// True when both enrichment sentinels would be replaced by this set.
    pub fn is_complete(&self) -> bool {
        self.surface.is_some_and(Surface::is_known) && self.distance_m.is_some_and(|d| d > 0)
    }
}

/// The two backlogs a race can sit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkPhase {
    Resolve,
    Enrich,
}

impl WorkPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Enrich => "enrich",
        }
    }
}

impl fmt::Display for WorkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scraped forecast, as handed to ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionDraft {
    pub lookup_key: Option<i64>,
    pub race_name: String,
    #[serde(default)]
    pub race_date: Option<NaiveDate>,
    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub grade: Option<Grade>,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default)]
    pub payout: Option<i64>,
    #[serde(default)]
    pub balance: Option<i64>,
}

impl PredictionDraft {
    pub fn roi(&self) -> Option<f64> {
        derive_roi(self.payout, self.balance)
    }
}

/// A predictor seen on a listing page, with the forecasts collected for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictorSighting {
    pub external_key: i64,
    pub name: String,
    #[serde(default)]
    pub predictions: Vec<PredictionDraft>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_are_twelve_digits() {
        assert!(CanonicalRaceId::parse("202505050211").is_ok());
        assert!(CanonicalRaceId::parse(" 202505050211\n").is_ok());
        assert!(CanonicalRaceId::parse("20250505021").is_err());
        assert!(CanonicalRaceId::parse("2025050502ab").is_err());
    }

    #[test]
    fn race_key_distinguishes_placeholders() {
        let temp = RaceKey::parse("temp_7_101").unwrap();
        assert!(temp.is_placeholder());
        assert_eq!(temp.as_str(), "temp_7_101");
        assert_eq!(PlaceholderKey::new(7, 101).as_str(), "temp_7_101");

        let canonical = RaceKey::parse("202505050211").unwrap();
        assert!(!canonical.is_placeholder());
        assert_eq!(canonical.canonical().unwrap().as_str(), "202505050211");

        assert!(RaceKey::parse("temp_").is_err());
        assert!(RaceKey::parse("not-a-key").is_err());
    }

    #[test]
    fn reliability_tier_thresholds() {
        assert_eq!(ReliabilityTier::from_grade_predictions(0), ReliabilityTier::Low);
        assert_eq!(ReliabilityTier::from_grade_predictions(9), ReliabilityTier::Low);
        assert_eq!(ReliabilityTier::from_grade_predictions(10), ReliabilityTier::Medium);
        assert_eq!(ReliabilityTier::from_grade_predictions(14), ReliabilityTier::Medium);
        assert_eq!(ReliabilityTier::from_grade_predictions(15), ReliabilityTier::High);
    }

    #[test]
    fn grade_labels_accept_roman_and_full_width() {
        assert_eq!(Grade::parse_label("G1"), Some(Grade::G1));
        assert_eq!(Grade::parse_label("(GII)"), Some(Grade::G2));
        assert_eq!(Grade::parse_label("GⅢ"), Some(Grade::G3));
        assert_eq!(Grade::parse_label("Ｇ１"), Some(Grade::G1));
        assert_eq!(Grade::parse_label("OP"), None);
    }

    #[test]
    fn roi_needs_a_positive_stake() {
        assert_eq!(derive_roi(Some(1500), Some(500)), Some(150.0));
        assert_eq!(derive_roi(Some(0), Some(-1000)), None);
        assert_eq!(derive_roi(Some(1000), Some(1000)), None);
        assert_eq!(derive_roi(None, Some(100)), None);
    }

    #[test]
    fn attributes_complete_only_when_sentinels_replaced() {
        let mut attrs = RaceAttributes {
            surface: Some(Surface::Turf),
            ..Default::default()
        };
        assert!(!attrs.is_complete());
        attrs.distance_m = Some(2500);
        assert!(attrs.is_complete());
        attrs.surface = Some(Surface::Unknown);
        assert!(!attrs.is_complete());
        assert!(RaceAttributes::default().is_empty());
    }

    #[test]
    fn sighting_deserializes_with_defaults() {
        let json = r#"{
            "external_key": 7,
            "name": "Tipster Seven",
            "predictions": [
                {"lookup_key": 5528852, "race_name": "Copa Republica Argentina", "grade": "GII",
                 "outcome": "hit", "payout": 1500, "balance": 500}
            ]
        }"#;
        let sighting: PredictorSighting = serde_json::from_str(json).unwrap();
        let draft = &sighting.predictions[0];
        assert_eq!(draft.grade, Some(Grade::G2));
        assert_eq!(draft.outcome, Outcome::Hit);
        assert_eq!(draft.roi(), Some(150.0));
        assert!(draft.race_date.is_none());
    }
}
