use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Outcome, PipelineError};
use crate::model::{Diagnostic, ResolvedPart, Selection};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartRow {
    pub kit_code: String,
    #[serde(default)]
    pub line: Option<String>,
    pub part_number: String,
    #[serde(default = "default_quantity_per_kit")]
    pub quantity_per_kit: u32,
    pub created_on: NaiveDate,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_quantity_per_kit() -> u32 {
    1
}

pub trait PartSource: Send + Sync {
    fn rows_for_kit(&self, kit_code: &str) -> Result<Vec<PartRow>>;
}

#[derive(Debug, Clone, Default)]
pub struct PartTable {
    rows_by_kit: HashMap<String, Vec<PartRow>>,
}

impl PartTable {
    pub fn from_rows(rows: Vec<PartRow>) -> Self {
        let mut rows_by_kit: HashMap<String, Vec<PartRow>> = HashMap::new();
        for row in rows {
            rows_by_kit
                .entry(kit_key(&row.kit_code))
                .or_default()
                .push(row);
        }
        Self { rows_by_kit }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read part table {}", path.display()))?;
        let rows: Vec<PartRow> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse part table {}", path.display()))?;
        Ok(Self::from_rows(rows))
    }

    pub fn kit_count(&self) -> usize {
        self.rows_by_kit.len()
    }
}

impl PartSource for PartTable {
    fn rows_for_kit(&self, kit_code: &str) -> Result<Vec<PartRow>> {
        Ok(self
            .rows_by_kit
            .get(&kit_key(kit_code))
            .cloned()
            .unwrap_or_default())
    }
}

fn kit_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Latest row per line; rows without a line share the kit's default line. Ties on the
/// creation date go to the lowest part number.
pub fn select_current_rows(rows: Vec<PartRow>) -> Vec<PartRow> {
    let mut by_line: BTreeMap<Option<String>, PartRow> = BTreeMap::new();
    for row in rows {
        let line = row
            .line
            .as_deref()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string);
        let newer = by_line.get(&line).map_or(true, |current| {
            (row.created_on, Reverse(&row.part_number))
                > (current.created_on, Reverse(&current.part_number))
        });
        if newer {
            by_line.insert(line, row);
        }
    }
    by_line.into_values().collect()
}

pub fn resolve(
    selection: &Selection,
    source: &dyn PartSource,
) -> Result<Outcome<Vec<ResolvedPart>>, PipelineError> {
    let mut outcome = Outcome::clean(Vec::new());

    for (kit_code, request) in &selection.kits {
        let rows = source
            .rows_for_kit(kit_code)
            .map_err(|err| PipelineError::PartLookup {
                kit: kit_code.clone(),
                message: format!("{err:#}"),
            })?;
        let current = select_current_rows(rows);

        if current.is_empty() {
            warn!(kit = %kit_code, "kit has no part rows");
            outcome.value.push(ResolvedPart {
                kit_code: kit_code.clone(),
                part_number: None,
                quantity: request.quantity,
                line: None,
            });
            outcome.push(Diagnostic::unresolved_kit(kit_code.clone()));
            continue;
        }

        for row in current {
            outcome.value.push(ResolvedPart {
                kit_code: kit_code.clone(),
                part_number: Some(row.part_number.trim().to_uppercase()),
                quantity: row.quantity_per_kit.saturating_mul(request.quantity),
                line: row.line,
            });
        }
    }

    debug!(parts = outcome.value.len(), "kits resolved to part numbers");
    Ok(outcome)
}
