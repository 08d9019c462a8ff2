use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const RESULT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifeBasis {
    #[default]
    Page,
    Drive,
}

impl LifeBasis {
    pub fn other(self) -> Self {
        match self {
            LifeBasis::Page => LifeBasis::Drive,
            LifeBasis::Drive => LifeBasis::Page,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifeBasis::Page => "page",
            LifeBasis::Drive => "drive",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UsagePair {
    #[serde(default)]
    pub current: Option<u64>,
    #[serde(default)]
    pub expected: Option<u64>,
}

impl UsagePair {
    pub fn new(current: Option<u64>, expected: Option<u64>) -> Self {
        Self { current, expected }
    }

    pub fn ratio(&self) -> Option<f64> {
        match (self.current, self.expected) {
            (Some(current), Some(expected)) if expected > 0 => {
                Some(current as f64 / expected as f64)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub line: usize,
    pub descriptor: String,
    pub canonical: Option<String>,
    #[serde(default)]
    pub page: UsagePair,
    #[serde(default)]
    pub drive: UsagePair,
}

impl Item {
    pub fn ratio(&self, basis: LifeBasis) -> Option<f64> {
        match basis {
            LifeBasis::Page => self.page.ratio(),
            LifeBasis::Drive => self.drive.ratio(),
        }
    }

    /// Life used on the preferred basis, falling back to the other basis only when the
    /// preferred one has no computable ratio.
    pub fn life_used(&self, preferred: LifeBasis) -> Option<(f64, LifeBasis)> {
        self.ratio(preferred)
            .map(|ratio| (ratio, preferred))
            .or_else(|| {
                let other = preferred.other();
                self.ratio(other).map(|ratio| (ratio, other))
            })
    }

    pub fn finding_code(&self) -> &str {
        self.canonical.as_deref().unwrap_or(&self.descriptor)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BasisFlags {
    pub page: bool,
    pub drive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportHeader {
    #[serde(default)]
    pub title: Option<String>,
    pub model: String,
    pub serial: String,
    #[serde(default)]
    pub captured_raw: Option<String>,
    #[serde(default)]
    pub captured_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub finisher_serial: Option<String>,
    #[serde(default)]
    pub basis: BasisFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub header: ReportHeader,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    pub items: Vec<Item>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColorChannel {
    K,
    C,
    M,
    Y,
}

impl ColorChannel {
    pub const ALL: [ColorChannel; 4] = [
        ColorChannel::K,
        ColorChannel::C,
        ColorChannel::M,
        ColorChannel::Y,
    ];

    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter.trim().to_ascii_uppercase().as_str() {
            "K" => Some(ColorChannel::K),
            "C" => Some(ColorChannel::C),
            "M" => Some(ColorChannel::M),
            "Y" => Some(ColorChannel::Y),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            ColorChannel::K => 'K',
            ColorChannel::C => 'C',
            ColorChannel::M => 'M',
            ColorChannel::Y => 'Y',
        }
    }
}

impl fmt::Display for ColorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    Life,
    KitLink,
    UnitGrouping,
    QuantityOverride,
    InventoryCheck,
    PartExpansion,
}

impl RuleId {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::Life => "life",
            RuleId::KitLink => "kit_link",
            RuleId::UnitGrouping => "unit_grouping",
            RuleId::QuantityOverride => "quantity_override",
            RuleId::InventoryCheck => "inventory_check",
            RuleId::PartExpansion => "part_expansion",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DueSource {
    OverLife,
    Threshold,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KitLink {
    #[default]
    Unlinked,
    Linked(String),
    NoCatalogEntry,
}

impl KitLink {
    pub fn kit_code(&self) -> Option<&str> {
        match self {
            KitLink::Linked(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    pub kit: String,
    #[serde(default)]
    pub channel: Option<ColorChannel>,
    #[serde(default)]
    pub tray: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub code: String,
    pub mapped: bool,
    pub descriptor: String,
    pub life_used: f64,
    pub basis: LifeBasis,
    pub due: bool,
    #[serde(default)]
    pub due_source: Option<DueSource>,
    #[serde(default)]
    pub kit: KitLink,
    #[serde(default)]
    pub bucket: Option<BucketKey>,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub on_hand: Option<u32>,
    #[serde(default)]
    pub excluded: bool,
    pub rule: RuleId,
}

impl Finding {
    pub fn is_kit_candidate(&self) -> bool {
        self.due && !self.excluded && self.kit.kit_code().is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KitRequest {
    pub quantity: u32,
    #[serde(default)]
    pub on_hand: Option<u32>,
    pub codes: Vec<String>,
    #[serde(default)]
    pub over_life: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionMeta {
    pub threshold: f64,
    pub threshold_enabled: bool,
    pub basis: LifeBasis,
    pub show_all: bool,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Selection {
    pub model: String,
    pub catalog_model: String,
    pub serial: String,
    pub kits: BTreeMap<String, KitRequest>,
    pub due: Vec<Finding>,
    pub watch: Vec<Finding>,
    pub all: Vec<Finding>,
    pub unresolved: Vec<Finding>,
    #[serde(default)]
    pub rule_traces: Vec<RuleTrace>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub meta: SelectionMeta,
}

impl Selection {
    pub fn quantities(&self) -> BTreeMap<String, u32> {
        self.kits
            .iter()
            .map(|(kit, request)| (kit.clone(), request.quantity))
            .collect()
    }

    pub fn quantity_of(&self, kit: &str) -> Option<u32> {
        self.kits.get(kit).map(|request| request.quantity)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleTrace {
    pub rule: RuleId,
    pub status: RuleTraceStatus,
    pub detail: String,
    #[serde(default)]
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleTraceStatus {
    Emitted,
    #[default]
    Skipped,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedPart {
    pub kit_code: String,
    #[serde(default)]
    pub part_number: Option<String>,
    pub quantity: u32,
    #[serde(default)]
    pub line: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciledLine {
    pub part_number: String,
    pub quantity: u32,
    pub required: u32,
    pub on_hand: u32,
    pub kits: Vec<String>,
    #[serde(default)]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub extended_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnpricedKit {
    pub kit_code: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReconciledResult {
    pub matched: Vec<ReconciledLine>,
    pub to_order: Vec<ReconciledLine>,
    #[serde(default)]
    pub unpriced: Vec<UnpricedKit>,
    #[serde(default)]
    pub matched_value: f64,
    #[serde(default)]
    pub order_cost: f64,
    #[serde(default)]
    pub uncosted_order_lines: usize,
}

impl ReconciledResult {
    pub fn matched_quantity(&self, part_number: &str) -> u32 {
        line_quantity(&self.matched, part_number)
    }

    pub fn to_order_quantity(&self, part_number: &str) -> u32 {
        line_quantity(&self.to_order, part_number)
    }
}

fn line_quantity(lines: &[ReconciledLine], part_number: &str) -> u32 {
    lines
        .iter()
        .filter(|line| line.part_number == part_number)
        .map(|line| line.quantity)
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub subject: String,
    pub message: String,
    #[serde(default)]
    pub line: Option<usize>,
    #[serde(default)]
    pub rule: Option<RuleId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    ItemParse,
    UnresolvedKit,
    RuleEvaluation,
}

impl Diagnostic {
    pub fn item_parse(line: usize, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::ItemParse,
            subject: subject.into(),
            message: message.into(),
            line: Some(line),
            rule: None,
        }
    }

    pub fn unresolved_kit(kit: impl Into<String>) -> Self {
        let kit = kit.into();
        Self {
            kind: DiagnosticKind::UnresolvedKit,
            message: format!("kit {kit} has no part-number rows; needed but unpriced"),
            subject: kit,
            line: None,
            rule: None,
        }
    }

    pub fn rule_evaluation(
        rule: RuleId,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: DiagnosticKind::RuleEvaluation,
            subject: subject.into(),
            message: message.into(),
            line: None,
            rule: Some(rule),
        }
    }
}
