pub const REPORTS_CLAIMED: &str = "ureport_reports_claimed";
pub const REPORTS_SAVED: &str = "ureport_reports_saved";
pub const REPORTS_DEFERRED: &str = "ureport_reports_deferred";
pub const REPORTS_ARCHIVED: &str = "ureport_reports_archived";
pub const REPORT_ERRORS: &str = "ureport_report_errors";
pub const CLAIMS_LOST: &str = "ureport_claims_lost";
pub const REPORT_PROCESSING_TIME: &str = "ureport_report_processing_seconds";

pub const STALLED_RECLAIMED: &str = "ureport_stalled_reclaimed";
pub const UNCLAIMABLE_ARCHIVED: &str = "ureport_unclaimable_archived";
pub const RECOVERY_ERRORS: &str = "ureport_recovery_errors";
pub const SPOOL_DEPTH: &str = "ureport_spool_depth";

pub const CLUSTER_MATCHES: &str = "ureport_cluster_matches";
pub const CLUSTERS_CREATED: &str = "ureport_clusters_created";
pub const STORE_TIMEOUTS: &str = "ureport_store_timeouts";

pub const RUNS_COMPLETED: &str = "ureport_runs_completed";
pub const RUN_DURATION: &str = "ureport_run_duration_seconds";

pub const HTTP_REQUESTS: &str = "ureport_http_requests";
pub const HTTP_REQUEST_DURATION: &str = "ureport_http_request_duration_seconds";
