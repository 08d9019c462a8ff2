use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryRecord {
    pub part_number: String,
    #[serde(default)]
    pub quantity: u32,
    #[serde(default)]
    pub unit_cost: Option<f64>,
    #[serde(default)]
    pub unit_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    by_part: BTreeMap<String, InventoryRecord>,
}

impl InventorySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<InventoryRecord>) -> Self {
        let mut by_part: BTreeMap<String, InventoryRecord> = BTreeMap::new();
        for record in records {
            let key = part_key(&record.part_number);
            if key.is_empty() {
                continue;
            }
            match by_part.get_mut(&key) {
                Some(existing) => {
                    existing.quantity = existing.quantity.saturating_add(record.quantity);
                    existing.unit_cost = existing.unit_cost.or(record.unit_cost);
                    if existing.unit_name.is_none() {
                        existing.unit_name = record.unit_name;
                    }
                }
                None => {
                    by_part.insert(
                        key.clone(),
                        InventoryRecord {
                            part_number: key,
                            ..record
                        },
                    );
                }
            }
        }
        Self { by_part }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory snapshot {}", path.display()))?;
        let records: Vec<InventoryRecord> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse inventory snapshot {}", path.display()))?;
        Ok(Self::from_records(records))
    }

    pub fn len(&self) -> usize {
        self.by_part.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_part.is_empty()
    }

    pub fn record(&self, part_number: &str) -> Option<&InventoryRecord> {
        self.by_part.get(&part_key(part_number))
    }

    pub fn on_hand(&self, part_number: &str) -> u32 {
        self.record(part_number)
            .map(|record| record.quantity)
            .unwrap_or(0)
    }

    pub fn unit_cost(&self, part_number: &str) -> Option<f64> {
        self.record(part_number).and_then(|record| record.unit_cost)
    }

    pub fn on_hand_for_kit(&self, kit_code: &str) -> Option<u32> {
        if let Some(record) = self.record(kit_code) {
            return Some(record.quantity);
        }
        let wanted = part_key(kit_code);
        self.by_part
            .values()
            .find(|record| {
                record
                    .unit_name
                    .as_deref()
                    .map(|name| part_key(name) == wanted)
                    .unwrap_or(false)
            })
            .map(|record| record.quantity)
    }
}

fn part_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(part: &str, quantity: u32, name: Option<&str>) -> InventoryRecord {
        InventoryRecord {
            part_number: part.to_string(),
            quantity,
            unit_cost: None,
            unit_name: name.map(str::to_string),
        }
    }

    #[test]
    fn lookups_ignore_case_and_whitespace() {
        let snapshot = InventorySnapshot::from_records(vec![record(" 6lk49015000 ", 5, None)]);
        assert_eq!(snapshot.on_hand("6LK49015000"), 5);
        assert_eq!(snapshot.on_hand("6LK00000000"), 0);
    }

    #[test]
    fn duplicate_rows_are_summed() {
        let snapshot = InventorySnapshot::from_records(vec![
            record("6LH58364000", 1, None),
            InventoryRecord {
                unit_cost: Some(12.0),
                ..record("6LH58364000", 2, Some("FILTER"))
            },
        ]);
        let merged = snapshot.record("6LH58364000").expect("record");
        assert_eq!(merged.quantity, 3);
        assert_eq!(merged.unit_cost, Some(12.0));
        assert_eq!(merged.unit_name.as_deref(), Some("FILTER"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn kit_stock_matches_part_number_or_unit_name() {
        let snapshot = InventorySnapshot::from_records(vec![
            record("6LK49015000", 5, Some("od-fc50")),
            record("FR-KIT-FC50", 1, None),
        ]);
        assert_eq!(snapshot.on_hand_for_kit("OD-FC50"), Some(5));
        assert_eq!(snapshot.on_hand_for_kit("FR-KIT-FC50"), Some(1));
        assert_eq!(snapshot.on_hand_for_kit("D-FC50-Y"), None);
    }

    #[test]
    fn loads_snapshot_fixture() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/inventory.json");
        let snapshot = InventorySnapshot::load(&path).expect("fixture loads");
        assert_eq!(snapshot.on_hand("6LH28171000"), 4);
        assert_eq!(snapshot.unit_cost("6LK49015000"), Some(189.0));
    }
}
