use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canon::{CanonMap, CanonTable};
use crate::catalog::{CatalogRegistry, CatalogSpec};
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_JSON: &str = include_str!("../data/default-config.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfigFile {
    #[serde(default)]
    pub canon: CanonTable,
    #[serde(default)]
    pub catalogs: Vec<CatalogSpec>,
    #[serde(default)]
    pub quantity_overrides: Vec<QuantityOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuantityOverride {
    #[serde(flatten)]
    pub target: OverrideTarget,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTarget {
    Kit(String),
    Canonical(String),
}

#[derive(Debug, Clone, Default)]
pub struct QuantityOverrides {
    by_kit: HashMap<String, u32>,
    by_code: HashMap<String, u32>,
}

impl QuantityOverrides {
    pub fn for_kit(&self, kit: &str) -> Option<u32> {
        self.by_kit.get(kit).copied()
    }

    pub fn for_code(&self, code: &str) -> Option<u32> {
        self.by_code.get(code).copied()
    }

    pub fn len(&self) -> usize {
        self.by_kit.len() + self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub canon: CanonMap,
    pub catalogs: CatalogRegistry,
    pub overrides: QuantityOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub models: Vec<String>,
    pub kits: usize,
    pub canon_entries: usize,
    pub canon_patterns: usize,
    pub quantity_overrides: usize,
}

impl PlannerConfig {
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_json(DEFAULT_CONFIG_JSON)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let file: PlannerConfigFile = serde_json::from_str(text)?;
        Self::from_file_model(file)
    }

    pub fn from_file_model(file: PlannerConfigFile) -> Result<Self, ConfigError> {
        let canon = CanonMap::from_table(&file.canon)?;
        let catalogs = CatalogRegistry::from_specs(file.catalogs)?;

        for catalog in catalogs.catalogs() {
            for kit in catalog.kits() {
                for code in &kit.covers {
                    if canon.normalize(code).as_deref() != Some(code.as_str()) {
                        return Err(ConfigError::NonCanonicalCoverage {
                            model: catalog.model().to_string(),
                            kit: kit.code.clone(),
                            code: code.clone(),
                        });
                    }
                }
            }
        }

        let mut overrides = QuantityOverrides::default();
        for entry in file.quantity_overrides {
            let (name, table) = match &entry.target {
                OverrideTarget::Kit(kit) => {
                    if !catalogs.kit_codes().any(|known| known == kit) {
                        return Err(ConfigError::UnknownOverrideKit(kit.clone()));
                    }
                    (kit.clone(), &mut overrides.by_kit)
                }
                OverrideTarget::Canonical(code) => {
                    if canon.normalize(code).as_deref() != Some(code.as_str()) {
                        return Err(ConfigError::NonCanonicalOverride(code.clone()));
                    }
                    (code.clone(), &mut overrides.by_code)
                }
            };
            if entry.quantity == 0 {
                return Err(ConfigError::ZeroOverride(name));
            }
            if table.insert(name.clone(), entry.quantity).is_some() {
                return Err(ConfigError::DuplicateOverride(name));
            }
        }

        debug!(
            models = catalogs.catalogs().len(),
            canon_entries = canon.entry_count(),
            overrides = overrides.len(),
            "planner configuration validated"
        );

        Ok(Self {
            canon,
            catalogs,
            overrides,
        })
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            models: self
                .catalogs
                .catalogs()
                .iter()
                .map(|catalog| catalog.model().to_string())
                .collect(),
            kits: self.catalogs.kit_codes().count(),
            canon_entries: self.canon.entry_count(),
            canon_patterns: self.canon.pattern_count(),
            quantity_overrides: self.overrides.len(),
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<PlannerConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read configuration {}", path.display()))?;
            PlannerConfig::from_json(&text)
                .with_context(|| format!("invalid configuration {}", path.display()))
        }
        None => PlannerConfig::embedded().context("embedded default configuration is invalid"),
    }
}
