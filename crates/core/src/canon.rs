use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::ColorChannel;

static COLOR_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.+?)\s*[\(\[]\s*(?P<channel>[KCMY])\s*[\)\]]$")
        .expect("color suffix pattern compiles")
});

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CanonTable {
    #[serde(default)]
    pub entries: Vec<CanonEntry>,
    #[serde(default)]
    pub patterns: Vec<CanonPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonEntry {
    pub descriptor: String,
    /// `None` marks a descriptor known to have no canonical mapping.
    #[serde(default)]
    pub canonical: Option<String>,
    #[serde(default)]
    pub color_axis: bool,
    #[serde(default)]
    pub default_channel: Option<ColorChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonPattern {
    pub pattern: String,
    pub template: String,
    #[serde(default)]
    pub samples: Vec<String>,
}

#[derive(Debug, Clone)]
enum CanonTarget {
    Unmapped,
    Code {
        code: String,
        color_axis: bool,
        default_channel: Option<ColorChannel>,
    },
}

impl CanonTarget {
    fn bare(&self) -> Option<String> {
        match self {
            CanonTarget::Unmapped => None,
            CanonTarget::Code {
                code,
                color_axis: false,
                ..
            } => Some(code.clone()),
            CanonTarget::Code {
                code,
                color_axis: true,
                default_channel,
            } => default_channel.map(|channel| format!("{code}[{channel}]")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanonMap {
    entries: HashMap<String, CanonTarget>,
    patterns: Vec<(Regex, String)>,
    sample_codes: Vec<String>,
}

impl CanonMap {
    pub fn from_table(table: &CanonTable) -> Result<Self, ConfigError> {
        let mut entries = HashMap::new();
        for entry in &table.entries {
            let key = normalize_key(&entry.descriptor);
            if key.is_empty() {
                return Err(ConfigError::EmptyDescriptor(entry.descriptor.clone()));
            }
            let target = match entry.canonical.as_deref().map(str::trim) {
                None => CanonTarget::Unmapped,
                Some(code) => {
                    if code.is_empty() || code != code.to_uppercase() {
                        return Err(ConfigError::LowercaseCode(code.to_string()));
                    }
                    CanonTarget::Code {
                        code: code.to_string(),
                        color_axis: entry.color_axis,
                        default_channel: entry.default_channel,
                    }
                }
            };
            if entries.insert(key.clone(), target).is_some() {
                return Err(ConfigError::DuplicateDescriptor(key));
            }
        }

        let mut patterns = Vec::with_capacity(table.patterns.len());
        let mut sample_codes = Vec::new();
        for pattern in &table.patterns {
            if !pattern.pattern.starts_with('^') || !pattern.pattern.ends_with('$') {
                return Err(ConfigError::UnanchoredPattern(pattern.pattern.clone()));
            }
            let regex = RegexBuilder::new(&pattern.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|err| ConfigError::InvalidPattern {
                    pattern: pattern.pattern.clone(),
                    message: err.to_string(),
                })?;
            if pattern.template.contains('$') && pattern.samples.is_empty() {
                return Err(ConfigError::UnsampledPattern(pattern.pattern.clone()));
            }
            for sample in &pattern.samples {
                let key = normalize_key(sample);
                if !regex.is_match(&key) {
                    return Err(ConfigError::SampleMismatch {
                        pattern: pattern.pattern.clone(),
                        sample: sample.clone(),
                    });
                }
                sample_codes.push(regex.replace(&key, pattern.template.as_str()).into_owned());
            }
            patterns.push((regex, pattern.template.clone()));
        }

        let map = Self {
            entries,
            patterns,
            sample_codes,
        };
        map.check_idempotent()?;
        Ok(map)
    }

    pub fn normalize(&self, raw: &str) -> Option<String> {
        let key = normalize_key(raw);
        if key.is_empty() {
            return None;
        }

        if let Some(target) = self.entries.get(&key) {
            return target.bare();
        }

        if let Some(captures) = COLOR_SUFFIX.captures(&key) {
            let base = captures.name("base").map(|m| m.as_str()).unwrap_or_default();
            let channel = captures
                .name("channel")
                .and_then(|m| ColorChannel::from_letter(m.as_str()));
            if let (
                Some(CanonTarget::Code {
                    code,
                    color_axis: true,
                    ..
                }),
                Some(channel),
            ) = (self.entries.get(base), channel)
            {
                return Some(format!("{code}[{channel}]"));
            }
        }

        self.patterns
            .iter()
            .find(|(regex, _)| regex.is_match(&key))
            .map(|(regex, template)| regex.replace(&key, template.as_str()).into_owned())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn produced_codes(&self) -> Vec<String> {
        let mut codes = Vec::new();
        for target in self.entries.values() {
            if let CanonTarget::Code {
                code, color_axis, ..
            } = target
            {
                if *color_axis {
                    codes.extend(
                        ColorChannel::ALL
                            .iter()
                            .map(|channel| format!("{code}[{channel}]")),
                    );
                } else {
                    codes.push(code.clone());
                }
            }
        }
        codes.extend(
            self.patterns
                .iter()
                .filter(|(_, template)| !template.contains('$'))
                .map(|(_, template)| template.clone()),
        );
        codes.extend(self.sample_codes.iter().cloned());
        codes.sort();
        codes.dedup();
        codes
    }

    fn check_idempotent(&self) -> Result<(), ConfigError> {
        for code in self.produced_codes() {
            let got = self.normalize(&code);
            if got.as_deref() != Some(code.as_str()) {
                return Err(ConfigError::NotIdempotent { code, got });
            }
        }
        Ok(())
    }
}

/// Trim, collapse whitespace, upper-case, fold full-width brackets, one space before `(`.
pub fn normalize_key(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .map(|ch| match ch {
            '\u{FF08}' => '(',
            '\u{FF09}' => ')',
            '\u{FF3B}' => '[',
            '\u{FF3D}' => ']',
            other => other,
        })
        .collect();
    let collapsed = folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();

    let mut key = String::with_capacity(collapsed.len() + 2);
    for ch in collapsed.chars() {
        if ch == '(' && !key.is_empty() && !key.ends_with(' ') {
            key.push(' ');
        }
        key.push(ch);
    }
    key
}
