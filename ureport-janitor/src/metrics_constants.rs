pub const RUN_STARTS: &str = "ureport_janitor_run_starts";
pub const RUN_TIME: &str = "ureport_janitor_total_run_seconds";
pub const RUN_ENDS: &str = "ureport_janitor_run_ends";

pub const STALLED_COUNT: &str = "ureport_janitor_stalled_reclaimed";
pub const EXHAUSTED_COUNT: &str = "ureport_janitor_exhausted_archived";
pub const ORPHANED_REASONS_COUNT: &str = "ureport_janitor_orphaned_reasons_removed";
pub const SAVED_PURGED_COUNT: &str = "ureport_janitor_saved_purged";
pub const RECOVERY_ERRORS_COUNT: &str = "ureport_janitor_recovery_errors";
