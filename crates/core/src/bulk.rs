use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::engine::RuleOptions;
use crate::parse::parse_report;
use crate::pipeline::{read_report_text, run_pipeline_report, PipelineResult, PipelineShared};

pub const DEFAULT_WORKERS: usize = 4;
const REPORT_EXTENSIONS: &[&str] = &["csv", "txt"];

#[derive(Debug, Clone)]
pub struct BulkInput {
    pub label: String,
    pub source: BulkSource,
}

#[derive(Debug, Clone)]
pub enum BulkSource {
    File(PathBuf),
    Text(String),
}

impl BulkInput {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let label = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            label,
            source: BulkSource::File(path),
        }
    }

    pub fn text(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            source: BulkSource::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub workers: usize,
    pub rules: RuleOptions,
    pub blacklist: Vec<String>,
    pub cancel_flag: Option<Arc<AtomicBool>>,
    pub run_id: Option<String>,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            rules: RuleOptions::default(),
            blacklist: Vec::new(),
            cancel_flag: None,
            run_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkEventKind {
    Started,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkEvent {
    pub seq: u64,
    pub run_id: String,
    pub label: String,
    pub kind: BulkEventKind,
    #[serde(default)]
    pub message: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkUnitStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkUnitResult {
    pub label: String,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub status: BulkUnitStatus,
    #[serde(default)]
    pub best_life_used: Option<f64>,
    #[serde(default)]
    pub kit_count: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<PipelineResult>,
}

impl BulkUnitResult {
    fn bare(label: &str, status: BulkUnitStatus) -> Self {
        Self {
            label: label.to_string(),
            serial: None,
            model: None,
            status,
            best_life_used: None,
            kit_count: 0,
            error: None,
            result: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRunOutput {
    pub run_id: String,
    pub started_at: String,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub units: Vec<BulkUnitResult>,
}

impl BulkRunOutput {
    pub fn count(&self, status: BulkUnitStatus) -> usize {
        self.units.iter().filter(|unit| unit.status == status).count()
    }

    pub fn ranked(&self) -> Vec<&BulkUnitResult> {
        let mut ranked: Vec<&BulkUnitResult> = self
            .units
            .iter()
            .filter(|unit| unit.status == BulkUnitStatus::Completed)
            .collect();
        ranked.sort_by(|a, b| {
            b.best_life_used
                .unwrap_or(0.0)
                .total_cmp(&a.best_life_used.unwrap_or(0.0))
                .then_with(|| a.label.cmp(&b.label))
        });
        ranked
    }
}

struct SerialBlacklist {
    globset: Option<GlobSet>,
}

impl SerialBlacklist {
    fn new(patterns: &[String]) -> Result<Self> {
        let patterns: Vec<&str> = patterns
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self { globset: None });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid blacklist pattern '{pattern}'"))?;
            builder.add(glob);
        }
        let globset = builder
            .build()
            .context("failed to compile blacklist patterns")?;
        Ok(Self {
            globset: Some(globset),
        })
    }

    fn is_blocked(&self, value: &str) -> bool {
        self.globset
            .as_ref()
            .map(|globset| globset.is_match(value.trim()))
            .unwrap_or(false)
    }
}

enum WorkerMessage {
    Event {
        label: String,
        kind: BulkEventKind,
        message: Option<String>,
    },
    Finished {
        index: usize,
        unit: Box<BulkUnitResult>,
    },
}

pub fn discover_reports(dir: &Path) -> Result<Vec<BulkInput>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry =
            entry.with_context(|| format!("failed to walk report directory {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_report = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                REPORT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            })
            .unwrap_or(false);
        if is_report {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    Ok(paths.into_iter().map(BulkInput::file).collect())
}

pub fn run_bulk(
    inputs: Vec<BulkInput>,
    shared: &PipelineShared<'_>,
    options: &BulkOptions,
) -> Result<BulkRunOutput> {
    run_bulk_with_events(inputs, shared, options, |_| {})
}

pub fn run_bulk_with_events<F>(
    inputs: Vec<BulkInput>,
    shared: &PipelineShared<'_>,
    options: &BulkOptions,
    mut on_event: F,
) -> Result<BulkRunOutput>
where
    F: FnMut(BulkEvent),
{
    options.rules.validate()?;
    let blacklist = SerialBlacklist::new(&options.blacklist)?;
    let run_id = options
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let started = Instant::now();
    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let workers = options.workers.clamp(1, inputs.len().max(1));

    info!(
        run_id = %run_id,
        units = inputs.len(),
        workers,
        "bulk run started"
    );

    let mut seq = 0_u64;
    let mut emit = |label: &str, kind: BulkEventKind, message: Option<String>| {
        seq += 1;
        on_event(BulkEvent {
            seq,
            run_id: run_id.clone(),
            label: label.to_string(),
            kind,
            message,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    };

    let mut slots: Vec<Option<BulkUnitResult>> = (0..inputs.len()).map(|_| None).collect();
    let next = AtomicUsize::new(0);
    let shared = *shared;

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        for _ in 0..workers {
            let tx = tx.clone();
            let inputs = &inputs;
            let next = &next;
            let blacklist = &blacklist;
            scope.spawn(move || loop {
                if is_cancelled(options) {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(input) = inputs.get(index) else {
                    break;
                };
                let send = |kind: BulkEventKind, message: Option<String>| {
                    let _ = tx.send(WorkerMessage::Event {
                        label: input.label.clone(),
                        kind,
                        message,
                    });
                };
                let unit = process_unit(input, &shared, &options.rules, blacklist, send);
                if tx
                    .send(WorkerMessage::Finished {
                        index,
                        unit: Box::new(unit),
                    })
                    .is_err()
                {
                    break;
                }
            });
        }
        drop(tx);

        for message in rx {
            match message {
                WorkerMessage::Event {
                    label,
                    kind,
                    message,
                } => emit(&label, kind, message),
                WorkerMessage::Finished { index, unit } => slots[index] = Some(*unit),
            }
        }
    });

    let mut cancelled = false;
    let mut units = Vec::with_capacity(slots.len());
    for (input, slot) in inputs.iter().zip(slots) {
        match slot {
            Some(unit) => units.push(unit),
            None => {
                cancelled = true;
                emit(&input.label, BulkEventKind::Cancelled, None);
                units.push(BulkUnitResult::bare(&input.label, BulkUnitStatus::Cancelled));
            }
        }
    }
    units.sort_by(|a, b| a.label.cmp(&b.label));

    let output = BulkRunOutput {
        run_id,
        started_at,
        elapsed_ms: saturating_millis(started.elapsed()),
        cancelled,
        units,
    };
    info!(
        run_id = %output.run_id,
        completed = output.count(BulkUnitStatus::Completed),
        failed = output.count(BulkUnitStatus::Failed),
        skipped = output.count(BulkUnitStatus::Skipped),
        cancelled = output.count(BulkUnitStatus::Cancelled),
        elapsed_ms = output.elapsed_ms,
        "bulk run finished"
    );
    Ok(output)
}

fn is_cancelled(options: &BulkOptions) -> bool {
    options
        .cancel_flag
        .as_ref()
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
}

fn process_unit(
    input: &BulkInput,
    shared: &PipelineShared<'_>,
    rules: &RuleOptions,
    blacklist: &SerialBlacklist,
    send: impl Fn(BulkEventKind, Option<String>),
) -> BulkUnitResult {
    if blacklist.is_blocked(&input.label) {
        send(BulkEventKind::Skipped, Some("label is blacklisted".to_string()));
        return BulkUnitResult::bare(&input.label, BulkUnitStatus::Skipped);
    }
    send(BulkEventKind::Started, None);

    let failed = |message: String| {
        warn!(label = %input.label, error = %message, "bulk unit failed");
        send(BulkEventKind::Failed, Some(message.clone()));
        BulkUnitResult {
            error: Some(message),
            ..BulkUnitResult::bare(&input.label, BulkUnitStatus::Failed)
        }
    };

    let text = match &input.source {
        BulkSource::File(path) => match read_report_text(path) {
            Ok(text) => text,
            Err(err) => return failed(format!("{err:#}")),
        },
        BulkSource::Text(text) => text.clone(),
    };
    let report = match parse_report(&text, &shared.config.canon) {
        Ok(report) => report,
        Err(err) => return failed(err.to_string()),
    };

    let serial = report.header.serial.clone();
    let model = report.header.model.clone();
    if blacklist.is_blocked(&serial) {
        send(
            BulkEventKind::Skipped,
            Some(format!("serial {serial} is blacklisted")),
        );
        return BulkUnitResult {
            serial: Some(serial),
            model: Some(model),
            ..BulkUnitResult::bare(&input.label, BulkUnitStatus::Skipped)
        };
    }

    match run_pipeline_report(report, shared, rules) {
        Ok(result) => {
            send(BulkEventKind::Completed, None);
            BulkUnitResult {
                serial: Some(serial),
                model: Some(model),
                best_life_used: result.best_life_used(),
                kit_count: result.selection.kits.len(),
                result: Some(result),
                ..BulkUnitResult::bare(&input.label, BulkUnitStatus::Completed)
            }
        }
        Err(err) => BulkUnitResult {
            serial: Some(serial),
            model: Some(model),
            ..failed(err.to_string())
        },
    }
}

fn saturating_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::inventory::InventorySnapshot;
    use crate::resolve::PartTable;

    const COLOR_REPORT: &str = include_str!("../../../fixtures/reports/PM_LIST_CNAM66582.csv");

    struct Fixture {
        config: PlannerConfig,
        parts: PartTable,
        inventory: InventorySnapshot,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: PlannerConfig::embedded().expect("config"),
                parts: PartTable::default(),
                inventory: InventorySnapshot::empty(),
            }
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
    fn one_bad_unit_does_not_affect_the_others() {
        let fixture = Fixture::new();
        let inputs = vec![
            BulkInput::text("b-good", COLOR_REPORT),
            BulkInput::text("a-broken", "MODEL: e-STUDIO5015AC\n"),
            BulkInput::text("c-good", COLOR_REPORT),
        ];
        let output = run_bulk(inputs, &fixture.shared(), &BulkOptions::default()).expect("run");

        let labels: Vec<&str> = output.units.iter().map(|u| u.label.as_str()).collect();
        assert_eq!(labels, vec!["a-broken", "b-good", "c-good"]);
        assert_eq!(output.count(BulkUnitStatus::Completed), 2);
        assert_eq!(output.units[0].status, BulkUnitStatus::Failed);
        assert!(output.units[0].error.is_some());
        assert!(!output.cancelled);
    }

    #[test]
    fn events_arrive_in_sequence_for_every_unit() {
        let fixture = Fixture::new();
        let inputs = vec![
            BulkInput::text("one", COLOR_REPORT),
            BulkInput::text("two", COLOR_REPORT),
        ];
        let mut events = Vec::new();
        let options = BulkOptions {
            workers: 2,
            run_id: Some("run-1".to_string()),
            ..BulkOptions::default()
        };
        run_bulk_with_events(inputs, &fixture.shared(), &options, |event| events.push(event))
            .expect("run");

        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|event| event.run_id == "run-1"));
        let seqs: Vec<u64> = events.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        for label in ["one", "two"] {
            let kinds: Vec<BulkEventKind> = events
                .iter()
                .filter(|event| event.label == label)
                .map(|event| event.kind)
                .collect();
            assert_eq!(kinds, vec![BulkEventKind::Started, BulkEventKind::Completed]);
        }
    }

    #[test]
    fn blacklisted_serials_are_skipped() {
        let fixture = Fixture::new();
        let options = BulkOptions {
            blacklist: vec!["cnam6*".to_string()],
            ..BulkOptions::default()
        };
        let output = run_bulk(
            vec![BulkInput::text("unit", COLOR_REPORT)],
            &fixture.shared(),
            &options,
        )
        .expect("run");
        assert_eq!(output.units[0].status, BulkUnitStatus::Skipped);
        assert_eq!(output.units[0].serial.as_deref(), Some("CNAM66582"));
    }

    #[test]
    fn cancelled_run_marks_unstarted_units() {
        let fixture = Fixture::new();
        let options = BulkOptions {
            cancel_flag: Some(Arc::new(AtomicBool::new(true))),
            ..BulkOptions::default()
        };
        let mut kinds = Vec::new();
        let output = run_bulk_with_events(
            vec![
                BulkInput::text("one", COLOR_REPORT),
                BulkInput::text("two", COLOR_REPORT),
            ],
            &fixture.shared(),
            &options,
            |event| kinds.push(event.kind),
        )
        .expect("run");

        assert!(output.cancelled);
        assert_eq!(output.count(BulkUnitStatus::Cancelled), 2);
        assert_eq!(kinds, vec![BulkEventKind::Cancelled, BulkEventKind::Cancelled]);
    }

    #[test]
    fn invalid_blacklist_pattern_is_rejected() {
        let fixture = Fixture::new();
        let options = BulkOptions {
            blacklist: vec!["CNAM[".to_string()],
            ..BulkOptions::default()
        };
        assert!(run_bulk(Vec::new(), &fixture.shared(), &options).is_err());
    }

    #[test]
    fn discovers_report_files_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("nested")).expect("nested dir");
        std::fs::write(dir.path().join("b.csv"), COLOR_REPORT).expect("write");
        std::fs::write(dir.path().join("nested").join("a.TXT"), COLOR_REPORT).expect("write");
        std::fs::write(dir.path().join("notes.md"), "ignore me").expect("write");

        let inputs = discover_reports(dir.path()).expect("discover");
        let mut labels: Vec<String> = inputs.into_iter().map(|input| input.label).collect();
        labels.sort();
        assert_eq!(labels, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn elapsed_time_saturates_instead_of_wrapping() {
        assert_eq!(saturating_millis(Duration::from_millis(1_250)), 1_250);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
}
