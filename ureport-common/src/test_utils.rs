use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::store::{
    AppendOutcome, ClusterMember, ClusterStore, CreateOutcome, NewCluster, ProblemCluster,
    StatCount, StoreError,
};

/// uReport v1 of a `userspace` SIGSEGV in `/usr/bin/<name>`, `frames` deep, frames named `fn_<i>`.
pub fn core_v1_report(name: &str, version: &str, frames: usize) -> Value {
    let backtrace: Vec<Value> = (0..frames)
        .map(|i| {
            json!({
                "thread": 0,
                "frame": i,
                "buildid": "3b4c2f1a",
                "path": format!("/usr/bin/{name}"),
                "offset": 4096 + i * 16,
                "funcname": format!("fn_{i}"),
                "funchash": format!("abcd{i:02x}"),
            })
        })
        .collect();

    json!({
        "type": "userspace",
        "reason": format!("Process /usr/bin/{name} was killed by signal 11 (SIGSEGV)"),
        "uptime": 1234,
        "executable": format!("/usr/bin/{name}"),
        "installed_package": {
            "name": name,
            "version": version,
            "release": "1.fc20",
            "epoch": 0,
            "architecture": "x86_64",
        },
        "related_packages": [{
            "installed_package": {
                "name": "glibc",
                "version": "2.18",
                "release": "11.fc20",
                "epoch": 0,
                "architecture": "x86_64",
            }
        }],
        "os": {"name": "Fedora", "version": "20"},
        "architecture": "x86_64",
        "reporter": {"name": "ABRT", "version": "2.1.11"},
        "crash_thread": 0,
        "core_backtrace": backtrace,
        "user_type": "root",
        "selinux": {"mode": "enforcing"},
    })
}

pub fn core_v2_report(name: &str, version: &str, signal: u32, frames: usize) -> Value {
    let frames: Vec<Value> = (0..frames)
        .map(|i| {
            json!({
                "build_id": "3b4c2f1a",
                "build_id_offset": 4096 + i * 16,
                "file_name": format!("/usr/lib64/lib{name}.so.1.0.{i}"),
                "function_name": format!("fn_{i}"),
                "fingerprint": format!("abcd{i:02x}"),
                "address": 140_000_000 + i,
            })
        })
        .collect();

    json!({
        "ureport_version": 2,
        "reporter": {"name": "satyr", "version": "0.13"},
        "os": {"name": "fedora", "version": "20", "architecture": "x86_64"},
        "packages": [{
            "name": name,
            "epoch": 0,
            "version": version,
            "release": "1.fc20",
            "architecture": "x86_64",
            "package_role": "affected",
        }],
        "problem": {
            "type": "core",
            "component": name,
            "executable": format!("/usr/bin/{name}"),
            "signal": signal,
            "user": {"local": true, "root": false},
            "stacktrace": [{"crash_thread": true, "frames": frames}],
        },
        "reason": "Program crashed",
    })
}

/// Python crash three frames deep, outermost frame first as on the wire.
pub fn python_v2_report(name: &str, version: &str, exception: &str) -> Value {
    json!({
        "ureport_version": 2,
        "reporter": {"name": "satyr", "version": "0.13"},
        "os": {"name": "fedora", "version": "20", "architecture": "x86_64"},
        "packages": [{
            "name": name,
            "epoch": 0,
            "version": version,
            "release": "1.fc20",
            "architecture": "noarch",
            "package_role": "affected",
        }],
        "problem": {
            "type": "python",
            "component": name,
            "exception_name": exception,
            "stacktrace": [
                {"file_name": format!("/usr/bin/{name}"), "file_line": 30,
                 "special_function": "module", "line_contents": "main()"},
                {"file_name": format!("/usr/lib/python3.3/site-packages/{name}/cli.py"),
                 "file_line": 20, "function_name": "main", "line_contents": "divide(1, 0)"},
                {"file_name": format!("/usr/lib/python3.3/site-packages/{name}/math.py"),
                 "file_line": 12, "function_name": "divide", "line_contents": "return a / b"},
            ],
        },
    })
}

/// Wraps a store to inject failures and hangs.
pub struct FlakyStore {
    inner: Arc<dyn ClusterStore>,
    calls: AtomicUsize,
    fail_next: AtomicUsize,
    fail_every: AtomicUsize,
    stalled: AtomicBool,
    down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ClusterStore>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_every: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            down: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every `n`th call, 0 to stop.
    pub fn fail_every(&self, n: usize) {
        self.fail_every.store(n, Ordering::SeqCst);
    }

    /// Calls hang, long enough for any caller timeout to fire.
    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Every call fails, health pings included.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    // Pings only fail when the store is down, so runs still start under injected failures
    async fn gate(&self) -> Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".to_owned()));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        let every = self.fail_every.load(Ordering::SeqCst);
        if every > 0 && call % every == 0 {
            return Err(StoreError::Unavailable("injected periodic failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".to_owned()));
        }
        self.inner.ping().await
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<ProblemCluster>, StoreError> {
        self.gate().await?;
        self.inner.find_by_fingerprint(fingerprint).await
    }

    async fn candidates(
        &self,
        component: &str,
        crash_type: &str,
        limit: usize,
    ) -> Result<Vec<ProblemCluster>, StoreError> {
        self.gate().await?;
        self.inner.candidates(component, crash_type, limit).await
    }

    async fn create_if_absent(&self, cluster: NewCluster) -> Result<CreateOutcome, StoreError> {
        self.gate().await?;
        self.inner.create_if_absent(cluster).await
    }

    async fn link_fingerprint(
        &self,
        fingerprint: &str,
        cluster_id: Uuid,
    ) -> Result<Uuid, StoreError> {
        self.gate().await?;
        self.inner.link_fingerprint(fingerprint, cluster_id).await
    }

    async fn append_report(
        &self,
        cluster_id: Uuid,
        member: ClusterMember,
    ) -> Result<AppendOutcome, StoreError> {
        self.gate().await?;
        self.inner.append_report(cluster_id, member).await
    }

    async fn cluster_stats(&self, cluster_id: Uuid) -> Result<Vec<StatCount>, StoreError> {
        self.gate().await?;
        self.inner.cluster_stats(cluster_id).await
    }

    async fn cluster_of_report(&self, report_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.gate().await?;
        self.inner.cluster_of_report(report_id).await
    }
}
