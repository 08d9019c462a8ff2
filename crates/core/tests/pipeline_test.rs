use std::path::PathBuf;

use anyhow::Result;
use pm_planner_core::{
    discover_reports, run_bulk, run_pipeline_file, BulkOptions, BulkUnitStatus, DiagnosticKind,
    InventorySnapshot, PartTable, PipelineError, PipelineShared, PlannerConfig, RuleOptions,
};

fn fixtures_path() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop();
    path.pop();
    path.push("fixtures");
    path
}

struct Collaborators {
    config: PlannerConfig,
    parts: PartTable,
    inventory: InventorySnapshot,
}

impl Collaborators {
    fn load() -> Result<Self> {
        let fixtures = fixtures_path();
        Ok(Self {
            config: PlannerConfig::embedded()?,
            parts: PartTable::load(&fixtures.join("parts.json"))?,
            inventory: InventorySnapshot::load(&fixtures.join("inventory.json"))?,
        })
    }

    fn shared(&self) -> PipelineShared<'_> {
        PipelineShared {
            config: &self.config,
            parts: &self.parts,
            inventory: &self.inventory,
        }
    }
}

#[test]
fn color_report_reconciles_against_inventory() -> Result<()> {
    let collaborators = Collaborators::load()?;
    let report = fixtures_path().join("reports/PM_LIST_CNAM66582.csv");
    let result = run_pipeline_file(&report, &collaborators.shared(), &RuleOptions::default())?;

    assert_eq!(result.header.serial, "CNAM66582");
    assert_eq!(result.selection.quantity_of("OD-FC50"), Some(3));

    let reconciled = &result.reconciled;
    assert_eq!(reconciled.matched_quantity("6LK49015000"), 3);
    assert_eq!(reconciled.to_order_quantity("6LK49015000"), 0);

    assert_eq!(reconciled.matched_quantity("6LK50755000"), 0);
    assert_eq!(reconciled.to_order_quantity("6LK50755000"), 2);

    assert_eq!(reconciled.matched_quantity("6LH58364000"), 1);
    assert_eq!(reconciled.to_order_quantity("6LH58364000"), 1);

    // Inventory part numbers are matched case-insensitively.
    assert_eq!(reconciled.matched_quantity("6LH28171000"), 2);
    assert!(reconciled.unpriced.is_empty());

    let parse_errors = result
        .diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.kind == DiagnosticKind::ItemParse)
        .count();
    assert_eq!(parse_errors, 1);
    Ok(())
}

#[test]
fn mono_report_leaves_cleaning_kit_unpriced() -> Result<()> {
    let collaborators = Collaborators::load()?;
    let report = fixtures_path().join("reports/PM_LIST_CXJ712345.txt");
    let result = run_pipeline_file(&report, &collaborators.shared(), &RuleOptions::default())?;

    assert_eq!(result.reconciled.matched_quantity("6LJ70598000"), 1);
    assert!(result
        .reconciled
        .unpriced
        .iter()
        .any(|kit| kit.kit_code == "CLN-KIT-5018"));
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::UnresolvedKit && d.subject == "CLN-KIT-5018"));
    Ok(())
}

#[test]
fn unknown_model_is_reported() -> Result<()> {
    let collaborators = Collaborators::load()?;
    let report = fixtures_path().join("reports/PM_LIST_CZZ100001.csv");
    let err = run_pipeline_file(&report, &collaborators.shared(), &RuleOptions::default())
        .expect_err("model is not in the catalog");

    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::UnknownModel { model }) => assert_eq!(model, "e-STUDIO2000AC"),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[test]
fn bulk_run_over_fixture_directory() -> Result<()> {
    let collaborators = Collaborators::load()?;
    let inputs = discover_reports(&fixtures_path().join("reports"))?;
    assert_eq!(inputs.len(), 4);

    let output = run_bulk(inputs, &collaborators.shared(), &BulkOptions::default())?;
    assert_eq!(output.count(BulkUnitStatus::Completed), 3);
    assert_eq!(output.count(BulkUnitStatus::Failed), 1);

    let failed = output
        .units
        .iter()
        .find(|unit| unit.status == BulkUnitStatus::Failed)
        .expect("one failed unit");
    assert_eq!(failed.label, "PM_LIST_CZZ100001");
    assert_eq!(failed.serial.as_deref(), Some("CZZ100001"));

    let ranked = output.ranked();
    assert_eq!(ranked[0].label, "PM_LIST_CNJL43460");
    assert_eq!(ranked.len(), 3);
    Ok(())
}
