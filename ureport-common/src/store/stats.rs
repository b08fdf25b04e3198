use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::report::StructuredReport;

/// What a cluster counts occurrences of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stat {
    OsRelease,
    Architecture,
    Executable,
    UptimeExp,
    SelinuxMode,
    RelatedPackage,
    Day,
    Week,
    Month,
}

impl Stat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stat::OsRelease => "os_release",
            Stat::Architecture => "architecture",
            Stat::Executable => "executable",
            Stat::UptimeExp => "uptime_exp",
            Stat::SelinuxMode => "selinux_mode",
            Stat::RelatedPackage => "related_package",
            Stat::Day => "day",
            Stat::Week => "week",
            Stat::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "os_release" => Stat::OsRelease,
            "architecture" => Stat::Architecture,
            "executable" => Stat::Executable,
            "uptime_exp" => Stat::UptimeExp,
            "selinux_mode" => Stat::SelinuxMode,
            "related_package" => Stat::RelatedPackage,
            "day" => Stat::Day,
            "week" => Stat::Week,
            "month" => Stat::Month,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatKey {
    pub stat: Stat,
    pub value: String,
}

impl StatKey {
    pub fn new(stat: Stat, value: impl Into<String>) -> Self {
        Self {
            stat,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCount {
    pub key: StatKey,
    pub count: i64,
}

/// Order of magnitude of the uptime in seconds, -1 for a crash right at start.
pub fn uptime_exponent(uptime: u64) -> i32 {
    match uptime.checked_ilog10() {
        Some(exp) => exp as i32,
        None => -1,
    }
}

fn history(seen_at: DateTime<Utc>) -> [StatKey; 3] {
    let day = seen_at.date_naive();
    let week = day - chrono::Duration::days(i64::from(day.weekday().num_days_from_monday()));
    let month = NaiveDate::from_ymd_opt(day.year(), day.month(), 1).unwrap_or(day);
    [
        StatKey::new(Stat::Day, day.to_string()),
        StatKey::new(Stat::Week, week.to_string()),
        StatKey::new(Stat::Month, month.to_string()),
    ]
}

/// Counters one report adds to its cluster. Each key appears once.
pub fn report_stats(report: &StructuredReport, seen_at: DateTime<Utc>) -> Vec<StatKey> {
    let mut keys = BTreeSet::new();

    keys.insert(StatKey::new(
        Stat::OsRelease,
        format!("{} {}", report.os.name, report.os.version),
    ));
    if let Some(arch) = &report.os.architecture {
        keys.insert(StatKey::new(Stat::Architecture, arch));
    }
    if let Some(executable) = &report.executable {
        keys.insert(StatKey::new(Stat::Executable, executable));
    }
    if let Some(uptime) = report.auxiliary.uptime {
        keys.insert(StatKey::new(
            Stat::UptimeExp,
            uptime_exponent(uptime).to_string(),
        ));
    }
    if let Some(mode) = &report.auxiliary.selinux_mode {
        keys.insert(StatKey::new(Stat::SelinuxMode, mode.to_ascii_uppercase()));
    }
    for package in &report.auxiliary.related_packages {
        keys.insert(StatKey::new(Stat::RelatedPackage, package.nvr()));
    }
    keys.extend(history(seen_at));

    keys.into_iter().collect()
}
