use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PlannerConfig;
use crate::engine::{run_rules, RuleOptions, DEFAULT_THRESHOLD};
use crate::model::LifeBasis;
use crate::parse::parse_report;
use crate::pipeline::read_report_text;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSuite {
    pub cases: Vec<EvaluationCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCase {
    pub name: String,
    pub report: String,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub basis: Option<LifeBasis>,
    #[serde(default)]
    pub expected_kits: BTreeMap<String, u32>,
    #[serde(default)]
    pub forbidden_kits: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub total_cases: usize,
    pub passed_cases: usize,
    pub exact_match_rate: f32,
    pub case_results: Vec<EvaluationCaseResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCaseResult {
    pub name: String,
    pub passed: bool,
    pub observed_kits: BTreeMap<String, u32>,
    pub expected_kits: BTreeMap<String, u32>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub forbidden_hits: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub fn evaluate_suite_file(path: &Path, config: &PlannerConfig) -> Result<EvaluationResult> {
    let suite_text = fs::read_to_string(path)
        .with_context(|| format!("failed to read evaluation suite {}", path.display()))?;
    let suite: EvaluationSuite =
        serde_json::from_str(&suite_text).context("failed to parse evaluation suite JSON")?;
    evaluate_suite(path, &suite, config)
}

pub fn evaluate_suite(
    suite_path: &Path,
    suite: &EvaluationSuite,
    config: &PlannerConfig,
) -> Result<EvaluationResult> {
    let suite_dir = suite_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut case_results = Vec::with_capacity(suite.cases.len());
    for case in &suite.cases {
        let options = RuleOptions {
            threshold: case.threshold.unwrap_or(DEFAULT_THRESHOLD),
            basis: case.basis.unwrap_or_default(),
            ..RuleOptions::default()
        };
        let report_path = suite_dir.join(&case.report);
        let observed = observe_kits(&report_path, config, &options);
        let result = score_case(case, observed);
        if !result.passed {
            warn!(case = %case.name, "evaluation case failed");
        }
        case_results.push(result);
    }

    let total_cases = case_results.len();
    let passed_cases = case_results.iter().filter(|case| case.passed).count();
    let exact_match_rate = if total_cases == 0 {
        0.0
    } else {
        passed_cases as f32 / total_cases as f32
    };
    info!(total_cases, passed_cases, "evaluation suite finished");

    Ok(EvaluationResult {
        total_cases,
        passed_cases,
        exact_match_rate,
        case_results,
    })
}

fn observe_kits(
    report_path: &Path,
    config: &PlannerConfig,
    options: &RuleOptions,
) -> Result<BTreeMap<String, u32>> {
    let text = read_report_text(report_path)?;
    let report = parse_report(&text, &config.canon)
        .with_context(|| format!("failed to parse {}", report_path.display()))?;
    let selection = run_rules(&report, config, options, None)
        .with_context(|| format!("rules failed for {}", report_path.display()))?;
    Ok(selection.quantities())
}

fn score_case(case: &EvaluationCase, observed: Result<BTreeMap<String, u32>>) -> EvaluationCaseResult {
    let (observed_kits, error) = match observed {
        Ok(kits) => (kits, None),
        Err(err) => (BTreeMap::new(), Some(format!("{err:#}"))),
    };

    let missing = case
        .expected_kits
        .iter()
        .filter(|(kit, quantity)| observed_kits.get(kit.as_str()) != Some(quantity))
        .map(|(kit, _)| kit.clone())
        .collect::<Vec<_>>();
    let unexpected = observed_kits
        .keys()
        .filter(|kit| !case.expected_kits.contains_key(kit.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    let forbidden_hits = case
        .forbidden_kits
        .iter()
        .filter(|kit| observed_kits.contains_key(kit.as_str()))
        .cloned()
        .collect::<Vec<_>>();

    let passed = error.is_none()
        && missing.is_empty()
        && unexpected.is_empty()
        && forbidden_hits.is_empty();

    EvaluationCaseResult {
        name: case.name.clone(),
        passed,
        observed_kits,
        expected_kits: case.expected_kits.clone(),
        missing,
        unexpected,
        forbidden_hits,
        error,
    }
}
