use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PlannerConfig;
use crate::engine::{run_rules, RuleOptions};
use crate::error::PipelineError;
use crate::inventory::InventorySnapshot;
use crate::model::{
    Diagnostic, ReconciledResult, Report, ReportHeader, ResolvedPart, Selection, RESULT_VERSION,
};
use crate::parse::parse_report;
use crate::reconcile::reconcile;
use crate::resolve::{resolve, PartSource};

#[derive(Clone, Copy)]
pub struct PipelineShared<'a> {
    pub config: &'a PlannerConfig,
    pub parts: &'a dyn PartSource,
    pub inventory: &'a InventorySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub result_version: String,
    pub generated_at: String,
    pub header: ReportHeader,
    pub counters: BTreeMap<String, u64>,
    pub selection: Selection,
    pub resolved_parts: Vec<ResolvedPart>,
    pub reconciled: ReconciledResult,
    pub diagnostics: Vec<Diagnostic>,
}

impl PipelineResult {
    pub fn best_life_used(&self) -> Option<f64> {
        self.selection
            .all
            .iter()
            .filter(|finding| !finding.excluded)
            .map(|finding| finding.life_used)
            .max_by(f64::total_cmp)
    }
}

pub fn run_pipeline(
    text: &str,
    shared: &PipelineShared<'_>,
    options: &RuleOptions,
) -> Result<PipelineResult, PipelineError> {
    let report = parse_report(text, &shared.config.canon)?;
    run_pipeline_report(report, shared, options)
}

pub fn run_pipeline_report(
    report: Report,
    shared: &PipelineShared<'_>,
    options: &RuleOptions,
) -> Result<PipelineResult, PipelineError> {
    let selection = run_rules(&report, shared.config, options, Some(shared.inventory))?;
    let (resolved_parts, resolve_diagnostics) = resolve(&selection, shared.parts)?.into_parts();
    let reconciled = reconcile(&resolved_parts, shared.inventory);

    let mut diagnostics = report.diagnostics.clone();
    diagnostics.extend(selection.diagnostics.iter().cloned());
    diagnostics.extend(resolve_diagnostics);

    info!(
        serial = %report.header.serial,
        kits = selection.kits.len(),
        to_order = reconciled.to_order.len(),
        diagnostics = diagnostics.len(),
        "pipeline finished"
    );

    Ok(PipelineResult {
        result_version: RESULT_VERSION.to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        header: report.header,
        counters: report.counters,
        selection,
        resolved_parts,
        reconciled,
        diagnostics,
    })
}

pub fn read_report_text(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read report {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn run_pipeline_file(
    path: &Path,
    shared: &PipelineShared<'_>,
    options: &RuleOptions,
) -> Result<PipelineResult> {
    let text = read_report_text(path)?;
    run_pipeline(&text, shared, options)
        .with_context(|| format!("pipeline failed for {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DiagnosticKind;
    use crate::resolve::PartTable;

    const COLOR_REPORT: &str = include_str!("../../../fixtures/reports/PM_LIST_CNAM66582.csv");

    #[test]
    fn best_life_used_ignores_excluded_findings() {
        let config = PlannerConfig::embedded().expect("config");
        let parts = PartTable::default();
        let inventory = InventorySnapshot::empty();
        let shared = PipelineShared {
            config: &config,
            parts: &parts,
            inventory: &inventory,
        };
        let options = RuleOptions {
            manual: vec![crate::engine::ManualOverride {
                code: "YELLOW DEVELOPER".to_string(),
                action: crate::engine::ManualAction::Skip,
            }],
            ..RuleOptions::default()
        };

        let result = run_pipeline(COLOR_REPORT, &shared, &options).expect("pipeline runs");
        let best = result.best_life_used().expect("ratio");
        assert!((best - 1.0).abs() < 1e-9);

        let unresolved = result
            .diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::UnresolvedKit)
            .count();
        assert_eq!(unresolved, result.selection.kits.len());
        assert_eq!(result.reconciled.unpriced.len(), result.selection.kits.len());
    }
}
