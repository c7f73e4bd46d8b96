//! Core domain model for hemodash: indicator catalog, legacy key
//! resolution, eligibility rules and report windows.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hemodash-core";

/// Opaque indicator identifier. Canonical form is snake_case; anything else
/// is expected to pass through [`resolve_legacy_key`] first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorKey(String);

impl IndicatorKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndicatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IndicatorKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Presentation grouping for indicators. `Overview` spans both device
/// families; `Apheresis` covers the collection devices and `WholeBlood` the
/// whole-blood processing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Overview,
    Apheresis,
    WholeBlood,
    Other,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Overview => "Overview",
            Category::Apheresis => "Apheresis",
            Category::WholeBlood => "Whole Blood",
            Category::Other => "Other",
        }
    }

    /// Catalog presentation order.
    pub const ORDERED: [Category; 4] = [
        Category::Overview,
        Category::Apheresis,
        Category::WholeBlood,
        Category::Other,
    ];
}

/// Shape of the rows an indicator query produces; the report renderer
/// dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultShape {
    Scalar,
    DualScalar,
    RankedList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorDescriptor {
    pub key: &'static str,
    pub title: &'static str,
    pub category: Category,
    pub shape: ResultShape,
}

/// Static indicator registry. Keys referenced by stored preferences must
/// either appear here or map here through [`resolve_legacy_key`].
pub const CATALOG: &[IndicatorDescriptor] = &[
    IndicatorDescriptor {
        key: "apheresis_donations",
        title: "Total Donations by Apheresis",
        category: Category::Overview,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "whole_blood_donations",
        title: "Total Donations by Whole Blood",
        category: Category::Overview,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "components_produced",
        title: "Total Components Produced",
        category: Category::Overview,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "staff_productivity",
        title: "Staff Productivity",
        category: Category::Overview,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "platelet_offered_vs_collected",
        title: "Platelets Offered vs Collected",
        category: Category::Apheresis,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "platelet_pre_count",
        title: "Donor Pre-Count Platelets",
        category: Category::Apheresis,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "donor_ht_hb",
        title: "Donor Ht/Hb Pre-Procedure",
        category: Category::Apheresis,
        shape: ResultShape::DualScalar,
    },
    IndicatorDescriptor {
        key: "procedure_duration",
        title: "Average Procedure Duration",
        category: Category::Apheresis,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "top_alarms_apheresis",
        title: "Top 10 Alarms - Apheresis",
        category: Category::Apheresis,
        shape: ResultShape::RankedList,
    },
    IndicatorDescriptor {
        key: "components_processed",
        title: "Components Processed",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "run_duration",
        title: "Average Run Duration",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "platelet_mean_volume",
        title: "Mean Platelet Volume",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "platelet_yield_index",
        title: "Platelet Yield Index",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "plasma_mean_volume",
        title: "Mean Plasma Volume",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "plasma_total_volume",
        title: "Total Plasma Volume",
        category: Category::WholeBlood,
        shape: ResultShape::Scalar,
    },
    IndicatorDescriptor {
        key: "top_alarms_whole_blood",
        title: "Top 10 Alarms - Whole Blood",
        category: Category::WholeBlood,
        shape: ResultShape::RankedList,
    },
];

pub fn descriptor(key: &str) -> Option<&'static IndicatorDescriptor> {
    CATALOG.iter().find(|d| d.key == key)
}

/// Maps historical indicator identifiers onto current catalog keys. One hop,
/// total: unknown input comes back unchanged, so keys already in canonical
/// form (including future ones) pass through.
///
/// Only used when flattening previously persisted preferences; fresh API
/// selections are already canonical.
pub fn resolve_legacy_key(raw: &str) -> &str {
    match raw {
        "totalDonations" | "totalDonationsApheresis" | "apheresisDonations" => {
            "apheresis_donations"
        }
        "totalDonationsWholeBlood" | "wholeBloodDonations" => "whole_blood_donations",
        "totalComponentsProduced" | "producedComponents" => "components_produced",
        "overallProductivity" | "productivityPerUser" | "userProductivity" => "staff_productivity",
        "plateletOfferedVsCollected" | "offeredVsCollected" => "platelet_offered_vs_collected",
        "plateletCount" | "plateletPreCount" => "platelet_pre_count",
        "hemoglobinLevels" | "donorHtHb" => "donor_ht_hb",
        "procedureDuration" => "procedure_duration",
        "alarmFrequency" => "top_alarms_apheresis",
        "processedComponents" => "components_processed",
        "processingTime" => "run_duration",
        "plateletVolume" => "platelet_mean_volume",
        "plateletYield" | "plateletIndex" => "platelet_yield_index",
        "plasmaVolume" => "plasma_mean_volume",
        "totalPlasmaVolume" => "plasma_total_volume",
        "equipmentAlarms" => "top_alarms_whole_blood",
        other => other,
    }
}

/// A single aggregated measure, numeric or pre-formatted text (percentage
/// indicators come back as text from the executor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub rank: u32,
    pub label: String,
    pub detail: Option<String>,
    pub frequency: i64,
    pub percent: f64,
}

/// Typed per-period payload, tagged by the indicator's [`ResultShape`]. The
/// untyped map form only exists inside the query executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndicatorValue {
    Scalar(MetricValue),
    Dual { first: f64, second: f64 },
    Ranked(Vec<RankedEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRow {
    pub year: i32,
    pub month: u32,
    pub value: IndicatorValue,
}

impl AggregationRow {
    pub fn period_label(&self) -> String {
        format!("{}/{}", self.month, self.year)
    }
}

/// Sorts rows ascending by (year, month). Consumers must not rely on
/// executor ordering, so every executor calls this before returning.
pub fn sort_rows(rows: &mut [AggregationRow]) {
    rows.sort_by_key(|r| (r.year, r.month));
}

/// Reporting cadence. Stored preferences keep the raw string so that
/// unknown historical values survive a round-trip; parsing is lenient and
/// eligibility fails closed on anything unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

/// Whether a user with the given frequency is due a report today.
pub fn is_due(frequency: &str, today: NaiveDate) -> bool {
    match Frequency::parse(frequency) {
        Some(Frequency::Daily) => true,
        Some(Frequency::Weekly) => today.weekday() == Weekday::Mon,
        Some(Frequency::Monthly) => today.day() == 1,
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Query window per cadence. The window deliberately covers more than one
/// cadence interval (daily reports look back a week, weekly a month,
/// monthly a quarter); this matches observed production behavior.
pub fn report_window(frequency: Frequency, now: DateTime<Utc>) -> ReportWindow {
    let start = match frequency {
        Frequency::Daily => now - Duration::days(7),
        Frequency::Weekly => now - Duration::days(30),
        Frequency::Monthly => now
            .checked_sub_months(Months::new(3))
            .unwrap_or(now - Duration::days(90)),
    };
    ReportWindow { start, end: now }
}

/// Email subject per cadence.
pub fn subject_line(frequency: &str, today: NaiveDate) -> String {
    match Frequency::parse(frequency) {
        Some(Frequency::Daily) => {
            format!("Indicator Dashboard - Daily Report ({})", today.format("%Y-%m-%d"))
        }
        Some(Frequency::Weekly) => format!(
            "Indicator Dashboard - Weekly Report (Week {}, {})",
            today.iso_week().week(),
            today.format("%Y-%m-%d")
        ),
        Some(Frequency::Monthly) => {
            format!("Indicator Dashboard - Monthly Report ({})", today.format("%B %Y"))
        }
        None => format!("Indicator Dashboard - Indicator Report ({})", today.format("%Y-%m-%d")),
    }
}

fn default_frequency() -> String {
    "weekly".to_string()
}

fn default_template_id() -> String {
    "default".to_string()
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One user's notification subscription. Owned exclusively by the
/// preference store; the orchestrator and assembler only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreference {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_frequency")]
    pub frequency: String,
    #[serde(default)]
    pub overview_indicators: BTreeMap<String, bool>,
    #[serde(default)]
    pub apheresis_indicators: BTreeMap<String, bool>,
    #[serde(default)]
    pub whole_blood_indicators: BTreeMap<String, bool>,
    #[serde(default = "default_template_id")]
    pub template_id: String,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_from: Option<String>,
}

impl UserPreference {
    /// Flattens the per-category selections into an ordered, deduplicated
    /// list of canonical keys. Legacy names are resolved first; keys that
    /// resolve to nothing in the catalog are dropped silently.
    pub fn selected_keys(&self) -> Vec<IndicatorKey> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        let groups = [
            &self.overview_indicators,
            &self.apheresis_indicators,
            &self.whole_blood_indicators,
        ];
        for group in groups {
            for (raw, selected) in group {
                if !selected {
                    continue;
                }
                let canonical = resolve_legacy_key(raw);
                if descriptor(canonical).is_none() {
                    continue;
                }
                if seen.insert(canonical) {
                    out.push(IndicatorKey::from(canonical));
                }
            }
        }
        out
    }
}

/// Visual parameters for rendered reports. Exactly one template carries
/// `is_default`; the store enforces that it is never deleted or mutated in
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "EmailTemplate::default_color")]
    pub color: String,
    #[serde(default = "EmailTemplate::default_accent")]
    pub accent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer_background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer_text_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub based_on: Option<String>,
    #[serde(default = "epoch")]
    pub created: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub is_default: bool,
}

impl EmailTemplate {
    fn default_color() -> String {
        "#2c70b8".to_string()
    }

    fn default_accent() -> String {
        "#5e72e4".to_string()
    }

    /// In-memory default used when the template store is unreachable.
    pub fn fallback() -> Self {
        Self {
            name: "Default".to_string(),
            description: "Built-in default template".to_string(),
            color: Self::default_color(),
            accent: Self::default_accent(),
            background_color: None,
            text_color: None,
            header_text_color: None,
            footer_background: None,
            footer_text_color: None,
            based_on: None,
            created: epoch(),
            last_updated: epoch(),
            is_default: true,
        }
    }
}
