pub mod bulk;
pub mod canon;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod grouping;
pub mod inventory;
pub mod model;
pub mod parse;
pub mod pipeline;
pub mod reconcile;
pub mod resolve;
pub mod rules;

pub use bulk::{
    discover_reports, run_bulk, run_bulk_with_events, BulkEvent, BulkEventKind, BulkInput,
    BulkOptions, BulkRunOutput, BulkSource, BulkUnitResult, BulkUnitStatus, DEFAULT_WORKERS,
};
pub use canon::{normalize_key, CanonMap, CanonTable};
pub use catalog::{Catalog, CatalogRegistry, CatalogSpec, Kit, UnitAxis};
pub use config::{load_config, ConfigSummary, PlannerConfig, PlannerConfigFile};
pub use engine::{
    run_rule_chain, run_rules, ManualAction, ManualOverride, RuleChain, RuleOptions,
    DEFAULT_THRESHOLD, MAX_THRESHOLD, MIN_THRESHOLD,
};
pub use error::{ConfigError, Outcome, PipelineError};
pub use eval::{
    evaluate_suite, evaluate_suite_file, EvaluationCase, EvaluationResult, EvaluationSuite,
};
pub use inventory::{InventoryRecord, InventorySnapshot};
pub use model::{
    ColorChannel, Diagnostic, DiagnosticKind, DueSource, Finding, Item, KitLink, KitRequest,
    LifeBasis, ReconciledLine, ReconciledResult, Report, ReportHeader, ResolvedPart, RuleId,
    RuleTrace, RuleTraceStatus, Selection, RESULT_VERSION,
};
pub use parse::parse_report;
pub use pipeline::{
    read_report_text, run_pipeline, run_pipeline_file, run_pipeline_report, PipelineResult,
    PipelineShared,
};
pub use reconcile::reconcile;
pub use resolve::{resolve, PartRow, PartSource, PartTable};
pub use rules::{Rule, RuleContext};
