use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::catalog::Catalog;
use crate::config::PlannerConfig;
use crate::engine::{ManualAction, RuleOptions};
use crate::error::Outcome;
use crate::grouping::bucket_key;
use crate::inventory::InventorySnapshot;
use crate::model::{BucketKey, Diagnostic, DueSource, Finding, KitLink, Report, RuleId};

pub struct RuleContext<'a> {
    pub report: &'a Report,
    pub catalog: &'a Catalog,
    pub config: &'a PlannerConfig,
    pub options: &'a RuleOptions,
    pub inventory: Option<&'a InventorySnapshot>,
    pub manual: &'a HashMap<String, ManualAction>,
    pub findings: &'a FindingSet,
}

pub trait Rule: Send + Sync {
    fn id(&self) -> RuleId;
    fn summary(&self) -> &'static str;
    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>>;
}

#[derive(Debug, Clone, Default)]
pub struct FindingSet {
    mapped: BTreeMap<String, Finding>,
    unmapped: BTreeMap<String, Finding>,
}

impl FindingSet {
    /// Last writer wins, except that a terminal exclusion is never replaced.
    pub fn merge(&mut self, finding: Finding) -> bool {
        let slot = if finding.mapped {
            &mut self.mapped
        } else {
            &mut self.unmapped
        };
        if slot
            .get(&finding.code)
            .is_some_and(|prior| prior.excluded)
        {
            return false;
        }
        slot.insert(finding.code.clone(), finding);
        true
    }

    pub fn get(&self, code: &str) -> Option<&Finding> {
        self.mapped.get(code)
    }

    pub fn mapped(&self) -> impl Iterator<Item = &Finding> {
        self.mapped.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.mapped.values().chain(self.unmapped.values())
    }

    pub fn len(&self) -> usize {
        self.mapped.len() + self.unmapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kit_candidates(&self) -> Vec<&Finding> {
        let mut candidates: Vec<&Finding> = self
            .mapped
            .values()
            .filter(|finding| finding.is_kit_candidate())
            .collect();
        candidates.sort_by(|a, b| compare_findings(a, b));
        candidates
    }

    pub fn into_sorted(self) -> Vec<Finding> {
        let mut all: Vec<Finding> = self
            .mapped
            .into_values()
            .chain(self.unmapped.into_values())
            .collect();
        all.sort_by(compare_findings);
        all
    }
}

pub fn compare_findings(a: &Finding, b: &Finding) -> std::cmp::Ordering {
    b.life_used
        .total_cmp(&a.life_used)
        .then_with(|| a.code.cmp(&b.code))
}

pub struct LifeRule;

impl Rule for LifeRule {
    fn id(&self) -> RuleId {
        RuleId::Life
    }

    fn summary(&self) -> &'static str {
        "life used against threshold and 100% life"
    }

    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        let options = ctx.options;
        let mut best: BTreeMap<(bool, String), Finding> = BTreeMap::new();

        for item in &ctx.report.items {
            let Some((ratio, basis)) = item.life_used(options.basis) else {
                continue;
            };
            let due_source = due_source(ratio, options);
            let candidate = Finding {
                code: item.finding_code().to_string(),
                mapped: item.canonical.is_some(),
                descriptor: item.descriptor.clone(),
                life_used: ratio,
                basis,
                due: due_source.is_some(),
                due_source,
                kit: KitLink::Unlinked,
                bucket: None,
                quantity: 0,
                on_hand: None,
                excluded: false,
                rule: RuleId::Life,
            };
            let key = (candidate.mapped, candidate.code.clone());
            let higher = best
                .get(&key)
                .map_or(true, |existing| ratio > existing.life_used);
            if higher {
                best.insert(key, candidate);
            }
        }

        let findings = best
            .into_values()
            .map(|mut finding| {
                let manual_key = if finding.mapped {
                    finding.code.clone()
                } else {
                    crate::canon::normalize_key(&finding.descriptor)
                };
                match ctx.manual.get(&manual_key) {
                    Some(ManualAction::Skip) => {
                        finding.excluded = true;
                        finding.due = false;
                        finding.due_source = None;
                    }
                    Some(ManualAction::ForceDue) if !finding.due => {
                        finding.due = true;
                        finding.due_source = Some(DueSource::Manual);
                    }
                    _ => {}
                }
                finding
            })
            .collect();
        Outcome::clean(findings)
    }
}

pub fn due_source(ratio: f64, options: &RuleOptions) -> Option<DueSource> {
    if ratio > 1.0 {
        Some(DueSource::OverLife)
    } else if options.threshold_enabled && ratio >= options.threshold {
        Some(DueSource::Threshold)
    } else {
        None
    }
}

pub struct KitLinkRule;

impl Rule for KitLinkRule {
    fn id(&self) -> RuleId {
        RuleId::KitLink
    }

    fn summary(&self) -> &'static str {
        "link canonical codes to catalog kits"
    }

    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        let linked = ctx
            .findings
            .mapped()
            .filter(|finding| !finding.excluded && (finding.due || ctx.options.show_all))
            .map(|finding| {
                let kit = match ctx.catalog.kit_for(&finding.code) {
                    Some(kit) => KitLink::Linked(kit.code.clone()),
                    None => KitLink::NoCatalogEntry,
                };
                Finding {
                    kit,
                    rule: RuleId::KitLink,
                    ..finding.clone()
                }
            })
            .collect();
        Outcome::clean(linked)
    }
}

pub struct UnitGroupingRule;

impl Rule for UnitGroupingRule {
    fn id(&self) -> RuleId {
        RuleId::UnitGrouping
    }

    fn summary(&self) -> &'static str {
        "group due codes into physical kit units"
    }

    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        let mut outcome = Outcome::clean(Vec::new());
        let mut seen = HashSet::new();

        for finding in ctx.findings.kit_candidates() {
            let Some(kit_code) = finding.kit.kit_code() else {
                continue;
            };
            let Some(kit) = ctx.catalog.kit(kit_code) else {
                outcome.push(Diagnostic::rule_evaluation(
                    RuleId::UnitGrouping,
                    finding.code.clone(),
                    format!("kit {kit_code} is not part of catalog {}", ctx.catalog.model()),
                ));
                continue;
            };
            match bucket_key(&finding.code, kit) {
                Ok(key) => {
                    let quantity = if seen.insert(key.clone()) {
                        kit.quantity
                    } else {
                        0
                    };
                    outcome.value.push(Finding {
                        bucket: Some(key),
                        quantity,
                        rule: RuleId::UnitGrouping,
                        ..finding.clone()
                    });
                }
                Err(err) => outcome.push(Diagnostic::rule_evaluation(
                    RuleId::UnitGrouping,
                    finding.code.clone(),
                    err.to_string(),
                )),
            }
        }
        outcome
    }
}

pub struct QuantityOverrideRule;

impl Rule for QuantityOverrideRule {
    fn id(&self) -> RuleId {
        RuleId::QuantityOverride
    }

    fn summary(&self) -> &'static str {
        "apply configured absolute quantities"
    }

    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        let overrides = &ctx.config.overrides;
        if overrides.is_empty() {
            return Outcome::clean(Vec::new());
        }

        let mut grouped: Vec<Finding> = ctx
            .findings
            .kit_candidates()
            .into_iter()
            .filter(|finding| finding.bucket.is_some())
            .cloned()
            .collect();
        let mut changed = BTreeSet::new();

        let code_targets: Vec<(BucketKey, u32)> = grouped
            .iter()
            .filter_map(|finding| {
                let quantity = overrides.for_code(&finding.code)?;
                Some((finding.bucket.clone()?, quantity))
            })
            .collect();
        for (bucket, quantity) in code_targets {
            assign_to_lead(&mut grouped, &mut changed, quantity, |finding| {
                finding.bucket.as_ref() == Some(&bucket)
            });
        }

        let kits: BTreeSet<String> = grouped
            .iter()
            .filter_map(|finding| finding.kit.kit_code().map(str::to_string))
            .collect();
        for kit in kits {
            let Some(quantity) = overrides.for_kit(&kit) else {
                continue;
            };
            assign_to_lead(&mut grouped, &mut changed, quantity, |finding| {
                finding.kit.kit_code() == Some(kit.as_str())
            });
        }

        let emitted = grouped
            .into_iter()
            .enumerate()
            .filter(|(index, _)| changed.contains(index))
            .map(|(_, finding)| Finding {
                rule: RuleId::QuantityOverride,
                ..finding
            })
            .collect();
        Outcome::clean(emitted)
    }
}

/// First match takes `quantity`; every other match drops to zero.
fn assign_to_lead(
    grouped: &mut [Finding],
    changed: &mut BTreeSet<usize>,
    quantity: u32,
    member: impl Fn(&Finding) -> bool,
) {
    let mut lead = true;
    for (index, finding) in grouped.iter_mut().enumerate() {
        if !member(finding) {
            continue;
        }
        let wanted = if lead { quantity } else { 0 };
        lead = false;
        if finding.quantity != wanted {
            finding.quantity = wanted;
            changed.insert(index);
        }
    }
}

pub struct InventoryCheckRule;

impl Rule for InventoryCheckRule {
    fn id(&self) -> RuleId {
        RuleId::InventoryCheck
    }

    fn summary(&self) -> &'static str {
        "annotate kits with on-hand stock"
    }

    fn apply(&self, ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        let Some(inventory) = ctx.inventory else {
            return Outcome::clean(Vec::new());
        };
        let annotated = ctx
            .findings
            .kit_candidates()
            .into_iter()
            .filter_map(|finding| {
                let kit = finding.kit.kit_code()?;
                Some(Finding {
                    on_hand: Some(inventory.on_hand_for_kit(kit).unwrap_or(0)),
                    rule: RuleId::InventoryCheck,
                    ..finding.clone()
                })
            })
            .collect();
        Outcome::clean(annotated)
    }
}

pub struct PartExpansionRule;

impl Rule for PartExpansionRule {
    fn id(&self) -> RuleId {
        RuleId::PartExpansion
    }

    fn summary(&self) -> &'static str {
        "part expansion runs after the selection is final"
    }

    fn apply(&self, _ctx: &RuleContext<'_>) -> Outcome<Vec<Finding>> {
        Outcome::clean(Vec::new())
    }
}
