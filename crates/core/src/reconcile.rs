use std::collections::BTreeMap;

use crate::inventory::InventorySnapshot;
use crate::model::{ReconciledLine, ReconciledResult, ResolvedPart, UnpricedKit};

#[derive(Default)]
struct Requirement {
    quantity: u32,
    kits: Vec<String>,
}

pub fn reconcile(parts: &[ResolvedPart], inventory: &InventorySnapshot) -> ReconciledResult {
    let mut required: BTreeMap<String, Requirement> = BTreeMap::new();
    let mut unpriced: BTreeMap<String, u32> = BTreeMap::new();

    for part in parts {
        match part.part_number.as_deref() {
            Some(part_number) => {
                let entry = required.entry(part_number.to_string()).or_default();
                entry.quantity = entry.quantity.saturating_add(part.quantity);
                if !entry.kits.contains(&part.kit_code) {
                    entry.kits.push(part.kit_code.clone());
                }
            }
            None => {
                let entry = unpriced.entry(part.kit_code.clone()).or_default();
                *entry = entry.saturating_add(part.quantity);
            }
        }
    }

    let mut result = ReconciledResult::default();
    for (part_number, requirement) in required {
        if requirement.quantity == 0 {
            continue;
        }
        let have = inventory.on_hand(&part_number);
        let unit_cost = inventory.unit_cost(&part_number);
        let line = |quantity: u32| ReconciledLine {
            part_number: part_number.clone(),
            quantity,
            required: requirement.quantity,
            on_hand: have,
            kits: requirement.kits.clone(),
            unit_cost,
            extended_cost: unit_cost.map(|cost| cost * f64::from(quantity)),
        };

        let matched = requirement.quantity.min(have);
        let to_order = requirement.quantity.saturating_sub(have);
        if matched > 0 {
            let matched_line = line(matched);
            result.matched_value += matched_line.extended_cost.unwrap_or(0.0);
            result.matched.push(matched_line);
        }
        if to_order > 0 {
            let order_line = line(to_order);
            match order_line.extended_cost {
                Some(cost) => result.order_cost += cost,
                None => result.uncosted_order_lines += 1,
            }
            result.to_order.push(order_line);
        }
    }

    result.unpriced = unpriced
        .into_iter()
        .map(|(kit_code, quantity)| UnpricedKit { kit_code, quantity })
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::InventoryRecord;

    fn part(kit: &str, part_number: Option<&str>, quantity: u32) -> ResolvedPart {
        ResolvedPart {
            kit_code: kit.to_string(),
            part_number: part_number.map(str::to_string),
            quantity,
            line: None,
        }
    }

    fn stock(entries: &[(&str, u32, Option<f64>)]) -> InventorySnapshot {
        InventorySnapshot::from_records(
            entries
                .iter()
                .map(|(part, quantity, cost)| InventoryRecord {
                    part_number: part.to_string(),
                    quantity: *quantity,
                    unit_cost: *cost,
                    unit_name: None,
                })
                .collect(),
        )
    }

    #[test]
    fn fully_stocked_part_is_matched_only() {
        let result = reconcile(
            &[part("OD-FC50", Some("6LK49015000"), 3)],
            &stock(&[("6LK49015000", 5, Some(189.0))]),
        );
        assert_eq!(result.matched_quantity("6LK49015000"), 3);
        assert!(result.to_order.is_empty());
        assert!((result.matched_value - 567.0).abs() < 1e-9);
    }

    #[test]
    fn missing_part_is_ordered_only() {
        let result = reconcile(
            &[part("FR-KIT-FC50", Some("6LK50755000"), 2)],
            &stock(&[("6LK50755000", 0, Some(42.5))]),
        );
        assert!(result.matched.is_empty());
        assert_eq!(result.to_order_quantity("6LK50755000"), 2);
        assert!((result.order_cost - 85.0).abs() < 1e-9);
    }

    #[test]
    fn partial_stock_splits_across_both_lists() {
        let result = reconcile(
            &[part("FILTER-OZN-KCH-A08K", Some("6LH58364000"), 2)],
            &stock(&[("6LH58364000", 1, None)]),
        );
        assert_eq!(result.matched_quantity("6LH58364000"), 1);
        assert_eq!(result.to_order_quantity("6LH58364000"), 1);
        assert_eq!(result.uncosted_order_lines, 1);
    }

    #[test]
    fn quantities_are_summed_per_part_and_conserved() {
        let parts = [
            part("CLN-KIT-FC50", Some("6LK49044000"), 1),
            part("CLN-KIT-5018", Some("6LK49044000"), 2),
            part("OD-FC50", Some("6LK49015000"), 4),
        ];
        let result = reconcile(&parts, &stock(&[("6LK49044000", 2, None)]));

        for part_number in ["6LK49044000", "6LK49015000"] {
            let required: u32 = parts
                .iter()
                .filter(|p| p.part_number.as_deref() == Some(part_number))
                .map(|p| p.quantity)
                .sum();
            assert_eq!(
                result.matched_quantity(part_number) + result.to_order_quantity(part_number),
                required
            );
        }
        let line = result
            .to_order
            .iter()
            .find(|line| line.part_number == "6LK49044000")
            .expect("cleaning kit part ordered");
        assert_eq!(line.quantity, 1);
        assert_eq!(line.kits, vec!["CLN-KIT-FC50".to_string(), "CLN-KIT-5018".to_string()]);
    }

    #[test]
    fn unresolved_kits_are_listed_as_unpriced() {
        let result = reconcile(
            &[part("DF-KIT-FC50", None, 1), part("DF-KIT-FC50", None, 1)],
            &InventorySnapshot::empty(),
        );
        assert!(result.matched.is_empty());
        assert!(result.to_order.is_empty());
        assert_eq!(
            result.unpriced,
            vec![UnpricedKit {
                kit_code: "DF-KIT-FC50".to_string(),
                quantity: 2,
            }]
        );
    }
}
