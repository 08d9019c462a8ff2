pub mod service;

pub use service::{
    bulk_run_output, cancel_bulk_run, get_bulk_session, plan_report, poll_bulk_events,
    release_bulk_run, start_bulk_run, BulkRequest, BulkSessionSnapshot, BulkSessionStatus, CancelBulkResponse,
    DataSources, PlanOptions,
};
