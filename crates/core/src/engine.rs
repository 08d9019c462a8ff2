use std::collections::{BTreeMap, HashMap};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::canon::{normalize_key, CanonMap};
use crate::config::PlannerConfig;
use crate::error::PipelineError;
use crate::inventory::InventorySnapshot;
use crate::model::{
    Diagnostic, DueSource, Finding, KitLink, KitRequest, LifeBasis, Report, RuleTrace,
    RuleTraceStatus, Selection, SelectionMeta,
};
use crate::rules::{
    FindingSet, InventoryCheckRule, KitLinkRule, LifeRule, PartExpansionRule,
    QuantityOverrideRule, Rule, RuleContext, UnitGroupingRule,
};

pub const DEFAULT_THRESHOLD: f64 = 0.63;
pub const MIN_THRESHOLD: f64 = 0.01;
pub const MAX_THRESHOLD: f64 = 2.0;
pub const WATCH_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleOptions {
    pub threshold: f64,
    pub threshold_enabled: bool,
    pub basis: LifeBasis,
    pub show_all: bool,
    #[serde(default)]
    pub manual: Vec<ManualOverride>,
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            threshold_enabled: true,
            basis: LifeBasis::Page,
            show_all: false,
            manual: Vec::new(),
        }
    }
}

impl RuleOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.threshold.is_finite()
            || self.threshold < MIN_THRESHOLD
            || self.threshold > MAX_THRESHOLD
        {
            return Err(PipelineError::InvalidOptions(format!(
                "threshold {} is outside [{MIN_THRESHOLD:.2}, {MAX_THRESHOLD:.2}]",
                self.threshold
            )));
        }
        if let Some(blank) = self.manual.iter().find(|entry| entry.code.trim().is_empty()) {
            return Err(PipelineError::InvalidOptions(format!(
                "manual {:?} override has an empty code",
                blank.action
            )));
        }
        Ok(())
    }

    pub fn effective_threshold(&self) -> f64 {
        if self.threshold_enabled {
            self.threshold
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualOverride {
    pub code: String,
    pub action: ManualAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManualAction {
    ForceDue,
    Skip,
}

pub struct RuleChain {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleChain {
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Box::new(LifeRule),
                Box::new(KitLinkRule),
                Box::new(UnitGroupingRule),
                Box::new(QuantityOverrideRule),
                Box::new(InventoryCheckRule),
                Box::new(PartExpansionRule),
            ],
        }
    }

    pub fn ids(&self) -> Vec<crate::model::RuleId> {
        self.rules.iter().map(|rule| rule.id()).collect()
    }
}

impl Default for RuleChain {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn run_rules(
    report: &Report,
    config: &PlannerConfig,
    options: &RuleOptions,
    inventory: Option<&InventorySnapshot>,
) -> Result<Selection, PipelineError> {
    run_rule_chain(&RuleChain::standard(), report, config, options, inventory)
}

pub fn run_rule_chain(
    chain: &RuleChain,
    report: &Report,
    config: &PlannerConfig,
    options: &RuleOptions,
    inventory: Option<&InventorySnapshot>,
) -> Result<Selection, PipelineError> {
    options.validate()?;
    let catalog = config
        .catalogs
        .catalog_for_model(&report.header.model)
        .ok_or_else(|| PipelineError::UnknownModel {
            model: report.header.model.clone(),
        })?;
    let manual = manual_actions(&options.manual, &config.canon);

    let mut findings = FindingSet::default();
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut traces = Vec::new();

    for rule in &chain.rules {
        let ctx = RuleContext {
            report,
            catalog,
            config,
            options,
            inventory,
            manual: &manual,
            findings: &findings,
        };
        let (emitted, rule_diagnostics) = rule.apply(&ctx).into_parts();
        diagnostics.extend(rule_diagnostics);

        let mut merged = Vec::new();
        let mut rejected = Vec::new();
        for finding in emitted {
            let code = finding.code.clone();
            if findings.merge(finding) {
                merged.push(code);
            } else {
                rejected.push(code);
            }
        }
        debug!(
            rule = %rule.id(),
            merged = merged.len(),
            rejected = rejected.len(),
            "rule applied"
        );
        traces.push(rule_trace(rule.as_ref(), merged));
        if !rejected.is_empty() {
            traces.push(RuleTrace {
                rule: rule.id(),
                status: RuleTraceStatus::Rejected,
                detail: "code is terminally excluded; finding dropped".to_string(),
                codes: rejected,
            });
        }
    }

    let selection = build_selection(report, catalog.model(), options, findings, traces, diagnostics);
    info!(
        serial = %selection.serial,
        kits = selection.kits.len(),
        due = selection.due.len(),
        unresolved = selection.unresolved.len(),
        "selection computed"
    );
    Ok(selection)
}

fn manual_actions(overrides: &[ManualOverride], canon: &CanonMap) -> HashMap<String, ManualAction> {
    let mut actions = HashMap::new();
    for entry in overrides {
        let key = canon
            .normalize(&entry.code)
            .unwrap_or_else(|| normalize_key(&entry.code));
        let action = match actions.get(&key) {
            Some(ManualAction::Skip) => ManualAction::Skip,
            _ => entry.action,
        };
        actions.insert(key, action);
    }
    actions
}

fn rule_trace(rule: &dyn Rule, codes: Vec<String>) -> RuleTrace {
    if codes.is_empty() {
        RuleTrace {
            rule: rule.id(),
            status: RuleTraceStatus::Skipped,
            detail: format!("{}: nothing to do", rule.summary()),
            codes,
        }
    } else {
        RuleTrace {
            rule: rule.id(),
            status: RuleTraceStatus::Emitted,
            detail: format!("{}: {} finding(s) merged", rule.summary(), codes.len()),
            codes,
        }
    }
}

fn build_selection(
    report: &Report,
    catalog_model: &str,
    options: &RuleOptions,
    findings: FindingSet,
    rule_traces: Vec<RuleTrace>,
    diagnostics: Vec<Diagnostic>,
) -> Selection {
    let watch_floor = options.effective_threshold() - WATCH_MARGIN;
    let all = findings.into_sorted();

    let due: Vec<Finding> = all
        .iter()
        .filter(|finding| finding.due && !finding.excluded)
        .cloned()
        .collect();
    let watch = all
        .iter()
        .filter(|finding| !finding.due && !finding.excluded && finding.life_used >= watch_floor)
        .cloned()
        .collect();
    let unresolved = due
        .iter()
        .filter(|finding| finding.kit == KitLink::NoCatalogEntry)
        .cloned()
        .collect();

    let mut kits: BTreeMap<String, KitRequest> = BTreeMap::new();
    for finding in all.iter().filter(|finding| finding.is_kit_candidate()) {
        let Some(kit) = finding.kit.kit_code() else {
            continue;
        };
        let request = kits.entry(kit.to_string()).or_insert_with(|| KitRequest {
            quantity: 0,
            on_hand: None,
            codes: Vec::new(),
            over_life: false,
        });
        request.quantity = request.quantity.saturating_add(finding.quantity);
        request.codes.push(finding.code.clone());
        if finding.on_hand.is_some() {
            request.on_hand = finding.on_hand;
        }
        request.over_life |= finding.due_source == Some(DueSource::OverLife);
    }
    kits.retain(|_, request| request.quantity > 0);

    Selection {
        model: report.header.model.clone(),
        catalog_model: catalog_model.to_string(),
        serial: report.header.serial.clone(),
        kits,
        due,
        watch,
        all,
        unresolved,
        rule_traces,
        diagnostics,
        meta: SelectionMeta {
            threshold: options.threshold,
            threshold_enabled: options.threshold_enabled,
            basis: options.basis,
            show_all: options.show_all,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        },
    }
}

impl Selection {
    pub fn over_life_kits(&self) -> Vec<&str> {
        self.kits
            .iter()
            .filter(|(_, request)| request.over_life)
            .map(|(kit, _)| kit.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiagnosticKind, RuleId};
    use crate::parse::parse_report;

    const COLOR_REPORT: &str = include_str!("../../../fixtures/reports/PM_LIST_CNAM66582.csv");
    const MONO_REPORT: &str = include_str!("../../../fixtures/reports/PM_LIST_CXJ712345.txt");

    fn config() -> PlannerConfig {
        PlannerConfig::embedded().expect("embedded config")
    }

    fn select(text: &str, options: &RuleOptions) -> Selection {
        let config = config();
        let report = parse_report(text, &config.canon).expect("report parses");
        run_rules(&report, &config, options, None).expect("rules run")
    }

    #[test]
    fn drums_group_per_color_channel() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        assert_eq!(selection.quantity_of("OD-FC50"), Some(3));
        let drums = &selection.kits["OD-FC50"].codes;
        assert_eq!(drums.len(), 3);
        assert!(!drums.contains(&"DRUM[K]".to_string()));
    }

    #[test]
    fn color_report_selects_expected_kits() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        let expected: BTreeMap<String, u32> = [
            ("ASYS-ROLL-FEED-CST", 2),
            ("CLN-KIT-FC50", 1),
            ("D-FC50-Y", 1),
            ("FILTER-OZN-KCH-A08K", 2),
            ("FR-KIT-FC50", 1),
            ("OD-FC50", 3),
        ]
        .into_iter()
        .map(|(kit, quantity)| (kit.to_string(), quantity))
        .collect();
        assert_eq!(selection.quantities(), expected);
        assert_eq!(selection.over_life_kits(), vec!["D-FC50-Y"]);
    }

    #[test]
    fn near_threshold_item_is_watched_not_selected() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        assert!(selection.watch.iter().any(|f| f.code == "FUSER BELT"));
        assert!(selection.due.iter().all(|f| f.code != "FUSER BELT"));
        assert_eq!(selection.kits["FR-KIT-FC50"].codes, vec!["PRESS ROLLER".to_string()]);
    }

    #[test]
    fn due_codes_without_kit_are_unresolved_and_unmapped_items_display_only() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        let unresolved: Vec<&str> = selection.unresolved.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(unresolved, vec!["HEAT ROLLER"]);

        let tbu = selection
            .due
            .iter()
            .find(|f| f.code == "TBU DRIVER ROLLER")
            .expect("unmapped due item is displayed");
        assert!(!tbu.mapped);
        assert_eq!(tbu.kit, KitLink::Unlinked);
    }

    #[test]
    fn items_without_ratio_never_become_findings() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        assert!(selection
            .all
            .iter()
            .all(|f| f.code != "BELT BLADE" && f.code != "TRANSFER BELT"));
    }

    #[test]
    fn kit_override_replaces_grouped_total() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        let filter = &selection.kits["FILTER-OZN-KCH-A08K"];
        assert_eq!(filter.quantity, 2);
        assert!(selection.rule_traces.iter().any(|trace| {
            trace.rule == RuleId::QuantityOverride && trace.codes.contains(&"OZONE FILTER".to_string())
        }));
    }

    #[test]
    fn manual_skip_excludes_and_force_due_selects() {
        let options = RuleOptions {
            manual: vec![
                ManualOverride {
                    code: "Drum Blade(Y)".to_string(),
                    action: ManualAction::Skip,
                },
                ManualOverride {
                    code: "GRID(Y)".to_string(),
                    action: ManualAction::Skip,
                },
                ManualOverride {
                    code: "CYAN DEVELOPER".to_string(),
                    action: ManualAction::ForceDue,
                },
            ],
            ..RuleOptions::default()
        };
        let selection = select(COLOR_REPORT, &options);

        assert_eq!(selection.quantity_of("CLN-KIT-FC50"), None);
        assert_eq!(selection.quantity_of("D-FC50-C"), Some(1));
        let forced = selection.due.iter().find(|f| f.code == "DEVELOPER[C]").expect("forced");
        assert_eq!(forced.due_source, Some(DueSource::Manual));
        assert!(selection
            .all
            .iter()
            .any(|f| f.code == "GRID[Y]" && f.excluded && !f.due));
    }

    #[test]
    fn disabled_threshold_selects_only_over_life_items() {
        let options = RuleOptions {
            threshold_enabled: false,
            ..RuleOptions::default()
        };
        let selection = select(COLOR_REPORT, &options);
        assert_eq!(
            selection.kits.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["D-FC50-Y"]
        );
    }

    #[test]
    fn preferred_basis_falls_back_only_when_missing() {
        let selection = select(MONO_REPORT, &RuleOptions::default());
        let drum = selection.all.iter().find(|f| f.code == "DRUM[K]").expect("drum");
        assert_eq!(drum.basis, LifeBasis::Drive);
        let developer = selection.all.iter().find(|f| f.code == "DEVELOPER[K]").expect("dev");
        assert_eq!(developer.basis, LifeBasis::Page);
        assert_eq!(selection.quantity_of("D-5018"), None);

        let drive = RuleOptions {
            basis: LifeBasis::Drive,
            ..RuleOptions::default()
        };
        let selection = select(MONO_REPORT, &drive);
        assert!(selection.watch.iter().any(|f| f.code == "DEVELOPER[K]"));
    }

    #[test]
    fn mono_bypass_kit_uses_override() {
        let selection = select(MONO_REPORT, &RuleOptions::default());
        assert_eq!(selection.quantity_of("ASYS-ROLL-FEED-SFB-H44X"), Some(2));
        assert_eq!(selection.quantity_of("FR-KIT-5018"), Some(1));
        assert_eq!(selection.quantity_of("OD-5018"), Some(1));
    }

    #[test]
    fn threshold_outside_range_is_rejected() {
        let config = config();
        let report = parse_report(COLOR_REPORT, &config.canon).expect("report parses");
        for threshold in [0.0, 2.5, f64::NAN] {
            let options = RuleOptions {
                threshold,
                ..RuleOptions::default()
            };
            assert!(matches!(
                run_rules(&report, &config, &options, None),
                Err(PipelineError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn unknown_model_is_fatal() {
        let config = config();
        let mut report = parse_report(COLOR_REPORT, &config.canon).expect("report parses");
        report.header.model = "e-STUDIO2000AC".to_string();
        assert!(matches!(
            run_rules(&report, &config, &RuleOptions::default(), None),
            Err(PipelineError::UnknownModel { model }) if model == "e-STUDIO2000AC"
        ));
    }

    #[test]
    fn inventory_annotates_kits_without_changing_quantities() {
        let config = config();
        let report = parse_report(COLOR_REPORT, &config.canon).expect("report parses");
        let inventory = InventorySnapshot::from_records(vec![crate::inventory::InventoryRecord {
            part_number: "6LK49015000".to_string(),
            quantity: 5,
            unit_cost: None,
            unit_name: Some("OD-FC50".to_string()),
        }]);
        let selection =
            run_rules(&report, &config, &RuleOptions::default(), Some(&inventory)).expect("rules");

        assert_eq!(selection.kits["OD-FC50"].on_hand, Some(5));
        assert_eq!(selection.kits["OD-FC50"].quantity, 3);
        assert_eq!(selection.kits["FR-KIT-FC50"].on_hand, Some(0));
    }

    #[test]
    fn per_color_kit_reports_codes_without_channel() {
        let mut file: crate::config::PlannerConfigFile =
            serde_json::from_str(crate::config::DEFAULT_CONFIG_JSON).expect("default parses");
        let fuser = file.catalogs[0]
            .kits
            .iter_mut()
            .find(|kit| kit.code == "FR-KIT-FC50")
            .expect("fuser kit");
        fuser.axis = crate::catalog::UnitAxis::PerColor;
        let config = PlannerConfig::from_file_model(file).expect("config valid");
        let report = parse_report(COLOR_REPORT, &config.canon).expect("report parses");

        let selection = run_rules(&report, &config, &RuleOptions::default(), None).expect("rules");
        assert_eq!(selection.quantity_of("FR-KIT-FC50"), None);
        assert!(selection.diagnostics.iter().any(|d| {
            d.kind == DiagnosticKind::RuleEvaluation && d.subject == "PRESS ROLLER"
        }));
        assert_eq!(selection.quantity_of("OD-FC50"), Some(3));
    }

    fn tray_report(feed: u64, pick: u64) -> String {
        format!(
            "MODEL: e-STUDIO5015AC\nSERIAL: CNAM66582\nUNIT,PC,PE,DC,DE\n\
             FEED ROLLER(1st CST.),{feed},100,,\nPICK UP ROLLER(1st CST.),{pick},100,,\n"
        )
    }

    fn select_with_pickup_override(text: &str, quantity: u32) -> Selection {
        let mut file: crate::config::PlannerConfigFile =
            serde_json::from_str(crate::config::DEFAULT_CONFIG_JSON).expect("default parses");
        file.quantity_overrides.push(crate::config::QuantityOverride {
            target: crate::config::OverrideTarget::Canonical("PICK UP ROLLER (1ST CST.)".into()),
            quantity,
        });
        let config = PlannerConfig::from_file_model(file).expect("config valid");
        let report = parse_report(text, &config.canon).expect("report parses");
        run_rules(&report, &config, &RuleOptions::default(), None).expect("rules run")
    }

    #[test]
    fn code_override_sets_tray_total_when_code_trails_its_tray() {
        let plain = select(&tray_report(95, 80), &RuleOptions::default());
        assert_eq!(plain.quantity_of("ASYS-ROLL-FEED-CST"), Some(1));

        let selection = select_with_pickup_override(&tray_report(95, 80), 2);
        assert_eq!(selection.quantity_of("ASYS-ROLL-FEED-CST"), Some(2));
    }

    #[test]
    fn code_override_sets_tray_total_when_code_leads_its_tray() {
        let selection = select_with_pickup_override(&tray_report(80, 95), 2);
        assert_eq!(selection.quantity_of("ASYS-ROLL-FEED-CST"), Some(2));
    }

    #[test]
    fn code_override_matching_grouped_quantity_is_stable() {
        let selection = select_with_pickup_override(&tray_report(95, 80), 1);
        assert_eq!(selection.quantity_of("ASYS-ROLL-FEED-CST"), Some(1));
    }

    #[test]
    fn every_rule_leaves_a_trace_in_chain_order() {
        let selection = select(COLOR_REPORT, &RuleOptions::default());
        let rules: Vec<RuleId> = selection
            .rule_traces
            .iter()
            .filter(|trace| trace.status != RuleTraceStatus::Rejected)
            .map(|trace| trace.rule)
            .collect();
        assert_eq!(rules, RuleChain::standard().ids());
        let marker = selection.rule_traces.last().expect("trace");
        assert_eq!(marker.status, RuleTraceStatus::Skipped);
    }
}
