use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::canon::CanonMap;
use crate::error::PipelineError;
use crate::model::{BasisFlags, Diagnostic, Item, Report, ReportHeader, UsagePair};

const REPORT_TITLE: &str = "PM SUPPORT CODE LIST";
const FINISHER_PREFIX: &str = "FIN S/N-";
const HEURISTIC_WINDOW: usize = 10;
const DATE_WINDOW: usize = 6;

static MODEL_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\be[-\s]?studio\s*\d{3,5}[a-z]{0,3}\b").expect("model pattern compiles")
});
static SERIAL_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[A-Z][A-Z0-9]{3}\d{5}\b").expect("serial pattern compiles")
});
static DATE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,4}[-/.]\d{1,2}[-/.]\d{1,4}(?:\s+\d{1,2}:\d{2}(?::\d{2})?)?\b")
        .expect("date pattern compiles")
});

const DATETIME_FORMATS: &[&str] = &[
    "%m-%d-%Y %H:%M:%S",
    "%m-%d-%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];
const DATE_FORMATS: &[&str] = &["%m-%d-%Y", "%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y"];

const USAGE_FIELDS: [&str; 4] = [
    "current_page",
    "expected_page",
    "current_drive",
    "expected_drive",
];

#[derive(Debug, Default)]
struct HeaderFields {
    title: Option<String>,
    model: Option<String>,
    serial: Option<String>,
    captured: Option<String>,
    finisher_serial: Option<String>,
}

/// Parses one PM support code report. Item descriptors are mapped through `canon` as they
/// are read; malformed item lines become diagnostics instead of failing the parse.
pub fn parse_report(text: &str, canon: &CanonMap) -> Result<Report, PipelineError> {
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim().trim_start_matches('\u{FEFF}')))
        .filter(|(_, line)| !line.is_empty())
        .collect();

    let split = lines
        .iter()
        .position(|(_, line)| is_unit_header(line))
        .map(|index| (index, index + 1))
        .or_else(|| {
            lines
                .iter()
                .position(|(_, line)| is_item_candidate(line))
                .map(|index| (index, index))
        })
        .unwrap_or((lines.len(), lines.len()));
    let (head, body) = (&lines[..split.0], &lines[split.1..]);

    let mut fields = HeaderFields::default();
    let mut counters = BTreeMap::new();
    for (_, line) in head {
        read_header_line(line, &mut fields, &mut counters);
    }
    apply_heuristics(head, &mut fields);

    let mut missing = Vec::new();
    if fields.model.is_none() {
        missing.push("model");
    }
    if fields.serial.is_none() {
        missing.push("serial");
    }
    if !missing.is_empty() {
        return Err(PipelineError::MalformedReport {
            missing: missing.join(" and "),
        });
    }

    let mut items = Vec::new();
    let mut diagnostics = Vec::new();
    for (line_no, line) in body {
        if is_unit_header(line) || line.to_uppercase().starts_with(REPORT_TITLE) {
            continue;
        }
        let columns = split_csv_row(line);
        if columns.len() < 2 {
            debug!(line = line_no, "ignoring non-item line in report body");
            continue;
        }
        match parse_item(*line_no, &columns, canon) {
            Ok(item) => items.push(item),
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }

    if items.is_empty() {
        return Err(PipelineError::NoItemsFound {
            rejected: diagnostics.len(),
        });
    }

    let basis = BasisFlags {
        page: items.iter().any(|item| item.page.ratio().is_some()),
        drive: items.iter().any(|item| item.drive.ratio().is_some()),
    };
    let captured_at = fields.captured.as_deref().and_then(parse_capture_date);

    debug!(
        items = items.len(),
        diagnostics = diagnostics.len(),
        "parsed report body"
    );

    Ok(Report {
        header: ReportHeader {
            title: fields.title,
            model: fields.model.unwrap_or_default(),
            serial: fields.serial.unwrap_or_default(),
            captured_raw: fields.captured,
            captured_at,
            finisher_serial: fields.finisher_serial,
            basis,
        },
        counters,
        items,
        diagnostics,
    })
}

fn read_header_line(
    line: &str,
    fields: &mut HeaderFields,
    counters: &mut BTreeMap<String, u64>,
) {
    let upper = line.to_uppercase();
    if upper.starts_with("TOTAL") && split_csv_row(line).len() >= 4 {
        read_total_line(line, counters);
        return;
    }
    if upper.starts_with(FINISHER_PREFIX) {
        let value = line.get(FINISHER_PREFIX.len()..).unwrap_or_default().trim();
        if !value.is_empty() {
            fields.finisher_serial = Some(value.to_string());
        }
        return;
    }

    let Some((key, value)) = split_key_value(line) else {
        return;
    };
    match key.as_str() {
        "TITLE" => fields.title = Some(value),
        "MODEL" | "MODEL NAME" => fields.model = Some(value),
        "SERIAL" | "SERIAL NO" | "SERIAL NUMBER" | "S/N" => fields.serial = Some(value),
        "DATE" | "REPORT DATE" | "CAPTURED" => fields.captured = Some(value),
        "FIN S/N" | "FINISHER" | "FINISHER SERIAL" => fields.finisher_serial = Some(value),
        "COLOR" | "BLACK" | "DF" | "TOTAL" => {
            if let Ok(Some(count)) = parse_usage(&value) {
                counters.insert(key.to_lowercase(), count);
            }
        }
        _ => debug!(key = %key, "ignoring unknown header key"),
    }
}

fn read_total_line(line: &str, counters: &mut BTreeMap<String, u64>) {
    let columns = split_csv_row(line);
    let count_at = |index: usize| {
        columns
            .get(index)
            .and_then(|value| parse_usage(value).ok().flatten())
    };
    let color = count_at(1);
    let black = count_at(3);
    let df = count_at(5);

    if let Some(color) = color {
        counters.insert("color".to_string(), color);
    }
    if let Some(black) = black {
        counters.insert("black".to_string(), black);
    }
    if let Some(df) = df {
        counters.insert("df".to_string(), df);
    }
    if color.is_some() || black.is_some() {
        counters.insert(
            "total".to_string(),
            color.unwrap_or(0).saturating_add(black.unwrap_or(0)),
        );
    }
}

fn apply_heuristics(head: &[(usize, &str)], fields: &mut HeaderFields) {
    let window = &head[..head.len().min(HEURISTIC_WINDOW)];

    if fields.title.is_none() {
        fields.title = window
            .iter()
            .find(|(_, line)| line.to_uppercase().starts_with(REPORT_TITLE))
            .map(|(_, line)| line.to_string());
    }
    if fields.captured.is_none() {
        fields.captured = window
            .iter()
            .take(DATE_WINDOW)
            .find_map(|(_, line)| DATE_TOKEN.find(line))
            .map(|found| found.as_str().to_string());
    }
    if fields.model.is_none() {
        fields.model = window
            .iter()
            .find_map(|(_, line)| MODEL_TOKEN.find(line))
            .map(|found| found.as_str().to_string());
    }
    if fields.serial.is_none() {
        fields.serial = window
            .iter()
            .filter(|(_, line)| !MODEL_TOKEN.is_match(line))
            .filter(|(_, line)| !line.to_uppercase().starts_with("FIN S/N"))
            .find_map(|(_, line)| SERIAL_TOKEN.find(line))
            .map(|found| found.as_str().to_uppercase());
    }
}

fn parse_item(
    line_no: usize,
    columns: &[String],
    canon: &CanonMap,
) -> Result<Item, Diagnostic> {
    let descriptor = columns[0].trim();
    if descriptor.is_empty() {
        return Err(Diagnostic::item_parse(
            line_no,
            "",
            "item line has no descriptor",
        ));
    }

    let mut values = [None; 4];
    for (slot, name) in USAGE_FIELDS.iter().enumerate() {
        let raw = columns.get(slot + 1).map(String::as_str).unwrap_or("");
        values[slot] = parse_usage(raw).map_err(|_| {
            Diagnostic::item_parse(
                line_no,
                descriptor,
                format!("{name} value {raw:?} is not a non-negative integer"),
            )
        })?;
    }

    Ok(Item {
        line: line_no,
        descriptor: descriptor.to_string(),
        canonical: canon.normalize(descriptor),
        page: UsagePair::new(values[0], values[1]),
        drive: UsagePair::new(values[2], values[3]),
    })
}

/// Empty or dash means missing; thousands separators and inner spaces are ignored.
fn parse_usage(raw: &str) -> Result<Option<u64>, ()> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed == "--" {
        return Ok(None);
    }
    let digits: String = trimmed
        .chars()
        .filter(|ch| !matches!(ch, ',' | '_' | ' '))
        .collect();
    if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(());
    }
    digits.parse::<u64>().map(Some).map_err(|_| ())
}

fn split_key_value(line: &str) -> Option<(String, String)> {
    let index = line.find([':', '=', ','])?;
    let key = line[..index].trim().to_uppercase();
    let value = line[index + 1..]
        .trim()
        .trim_matches('"')
        .trim_end_matches(',')
        .trim();
    if key.is_empty() || value.is_empty() || !is_header_key(&key) {
        return None;
    }
    Some((key, value.to_string()))
}

fn is_header_key(key: &str) -> bool {
    matches!(
        key,
        "TITLE"
            | "MODEL"
            | "MODEL NAME"
            | "SERIAL"
            | "SERIAL NO"
            | "SERIAL NUMBER"
            | "S/N"
            | "DATE"
            | "REPORT DATE"
            | "CAPTURED"
            | "FIN S/N"
            | "FINISHER"
            | "FINISHER SERIAL"
            | "COLOR"
            | "BLACK"
            | "DF"
            | "TOTAL"
    )
}

fn is_unit_header(line: &str) -> bool {
    split_csv_row(line)
        .first()
        .map(|first| first.trim().eq_ignore_ascii_case("UNIT"))
        .unwrap_or(false)
}

fn is_item_candidate(line: &str) -> bool {
    let columns = split_csv_row(line);
    if columns.len() < 3 {
        return false;
    }
    let first = columns[0].trim().to_uppercase();
    if first.is_empty() || first.starts_with("TOTAL") {
        return false;
    }
    // Header keys only open the body when the row carries usage columns.
    !is_header_key(&first) || columns[1..3].iter().all(|value| parse_usage(value).is_ok())
}

fn parse_capture_date(raw: &str) -> Option<NaiveDateTime> {
    let candidate = DATE_TOKEN
        .find(raw)
        .map(|found| found.as_str())
        .unwrap_or(raw)
        .trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(candidate, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(candidate, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

pub fn split_csv_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            other => current.push(other),
        }
    }
    fields.push(current.trim().to_string());
    fields
}
