use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSpec {
    pub model: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub kits: Vec<Kit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Kit {
    pub code: String,
    #[serde(default = "default_kit_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub axis: UnitAxis,
    pub covers: Vec<String>,
}

fn default_kit_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitAxis {
    #[default]
    Auto,
    Single,
    PerColor,
    PerTray,
    PerColorAndTray,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    model: String,
    aliases: Vec<String>,
    kits: Vec<Kit>,
    by_code: HashMap<String, usize>,
    by_kit: HashMap<String, usize>,
}

impl Catalog {
    fn from_spec(spec: CatalogSpec) -> Result<Self, ConfigError> {
        let mut by_code = HashMap::new();
        let mut by_kit = HashMap::new();
        for (index, kit) in spec.kits.iter().enumerate() {
            if kit.covers.is_empty() {
                return Err(ConfigError::EmptyKit {
                    model: spec.model.clone(),
                    kit: kit.code.clone(),
                });
            }
            if kit.quantity == 0 {
                return Err(ConfigError::ZeroKitQuantity {
                    model: spec.model.clone(),
                    kit: kit.code.clone(),
                });
            }
            if by_kit.insert(kit.code.clone(), index).is_some() {
                return Err(ConfigError::DuplicateKit {
                    model: spec.model.clone(),
                    kit: kit.code.clone(),
                });
            }
            for code in &kit.covers {
                if let Some(previous) = by_code.insert(code.clone(), index) {
                    return Err(ConfigError::AmbiguousCoverage {
                        model: spec.model.clone(),
                        code: code.clone(),
                        first: spec.kits[previous].code.clone(),
                        second: kit.code.clone(),
                    });
                }
            }
        }

        Ok(Self {
            model: spec.model,
            aliases: spec.aliases,
            kits: spec.kits,
            by_code,
            by_kit,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn kits(&self) -> &[Kit] {
        &self.kits
    }

    pub fn kit_for(&self, code: &str) -> Option<&Kit> {
        self.by_code.get(code).map(|index| &self.kits[*index])
    }

    pub fn kit(&self, kit_code: &str) -> Option<&Kit> {
        self.by_kit.get(kit_code).map(|index| &self.kits[*index])
    }

    fn model_keys(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(self.model.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .map(model_key)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogRegistry {
    catalogs: Vec<Catalog>,
}

impl CatalogRegistry {
    pub fn from_specs(specs: Vec<CatalogSpec>) -> Result<Self, ConfigError> {
        let mut seen: HashMap<String, String> = HashMap::new();
        let mut catalogs = Vec::with_capacity(specs.len());
        for spec in specs {
            let catalog = Catalog::from_spec(spec)?;
            for key in catalog.model_keys() {
                if seen.insert(key.clone(), catalog.model.clone()).is_some() {
                    return Err(ConfigError::DuplicateModel(key));
                }
            }
            catalogs.push(catalog);
        }
        Ok(Self { catalogs })
    }

    pub fn catalogs(&self) -> &[Catalog] {
        &self.catalogs
    }

    pub fn kit_codes(&self) -> impl Iterator<Item = &str> {
        self.catalogs
            .iter()
            .flat_map(|catalog| catalog.kits.iter().map(|kit| kit.code.as_str()))
    }

    pub fn catalog_for_model(&self, model: &str) -> Option<&Catalog> {
        let wanted = model_key(model);
        if wanted.is_empty() {
            return None;
        }

        if let Some(catalog) = self
            .catalogs
            .iter()
            .find(|catalog| catalog.model_keys().any(|key| key == wanted))
        {
            return Some(catalog);
        }

        self.catalogs
            .iter()
            .filter_map(|catalog| {
                catalog
                    .model_keys()
                    .filter(|key| wanted.contains(key.as_str()))
                    .map(|key| key.len())
                    .max()
                    .map(|len| (len, catalog))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, catalog)| catalog)
    }
}

pub fn model_key(model: &str) -> String {
    model
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}
