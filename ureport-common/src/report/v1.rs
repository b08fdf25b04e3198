use serde::Deserialize;
use serde_json::{Map, Value};

use super::validate;
use super::{
    Auxiliary, Backtrace, FormatVersion, Frame, OperatingSystem, Package, ParseError, ProblemType,
    Reporter, StructuredReport,
};

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    version: String,
    release: String,
    epoch: u32,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct RawRelatedPackage {
    installed_package: RawPackage,
}

#[derive(Debug, Deserialize)]
struct RawNameVersion {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct RawSelinux {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct RawOsState {
    suspend: String,
    boot: String,
    login: String,
    logout: String,
    shutdown: String,
}

impl RawOsState {
    fn validate(&self) -> Result<(), ParseError> {
        validate::yes_no("os_state.suspend", &self.suspend)?;
        validate::yes_no("os_state.boot", &self.boot)?;
        validate::yes_no("os_state.login", &self.login)?;
        validate::yes_no("os_state.logout", &self.logout)?;
        validate::yes_no("os_state.shutdown", &self.shutdown)
    }
}

#[derive(Debug, Deserialize)]
struct RawReport {
    #[serde(rename = "type")]
    problem_type: String,
    reason: String,
    uptime: u64,
    executable: String,
    installed_package: RawPackage,
    #[serde(default)]
    related_packages: Vec<RawRelatedPackage>,
    os: RawNameVersion,
    architecture: String,
    reporter: RawNameVersion,
    crash_thread: Option<u32>,
    // Kept untyped, a broken backtrace must not reject the whole report
    core_backtrace: Option<Value>,
    user_type: Option<String>,
    selinux: Option<RawSelinux>,
    os_state: Option<RawOsState>,
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    thread: u32,
    frame: u32,
    buildid: Option<String>,
    path: String,
    offset: u64,
    funcname: Option<String>,
    funchash: Option<String>,
}

impl RawPackage {
    fn validate(self, prefix: &str) -> Result<Package, ParseError> {
        validate::package_field(&format!("{prefix}.name"), &self.name)?;
        validate::package_field(&format!("{prefix}.version"), &self.version)?;
        validate::package_field(&format!("{prefix}.release"), &self.release)?;
        validate::phrase(&format!("{prefix}.architecture"), &self.architecture)?;
        Ok(Package {
            name: self.name,
            version: self.version,
            release: Some(self.release),
            epoch: Some(self.epoch),
            architecture: Some(self.architecture),
        })
    }
}

pub fn parse(object: Map<String, Value>) -> Result<StructuredReport, ParseError> {
    let raw: RawReport = serde_json::from_value(Value::Object(object))
        .map_err(|e| ParseError::malformed(format!("uReport v1: {e}")))?;

    let problem_type = match raw.problem_type.to_ascii_lowercase().as_str() {
        "userspace" => ProblemType::Core,
        "python" => ProblemType::Python,
        "kerneloops" => ProblemType::Kerneloops,
        other => {
            return Err(ParseError::malformed(format!(
                "unknown problem type {other:?}"
            )))
        }
    };

    validate::phrase("reason", &raw.reason)?;
    validate::executable(&raw.executable)?;
    validate::phrase("architecture", &raw.architecture)?;
    validate::phrase("os.name", &raw.os.name)?;
    validate::package_field("os.version", &raw.os.version)?;
    validate::phrase("reporter.name", &raw.reporter.name)?;
    validate::package_field("reporter.version", &raw.reporter.version)?;
    if let Some(user_type) = raw.user_type.as_deref() {
        validate::user_type(user_type)?;
    }
    if let Some(selinux) = &raw.selinux {
        validate::selinux_mode(&selinux.mode)?;
    }
    if let Some(os_state) = &raw.os_state {
        os_state.validate()?;
    }

    let package = raw.installed_package.validate("installed_package")?;
    let related_packages = raw
        .related_packages
        .into_iter()
        .map(|related| related.installed_package.validate("related_packages"))
        .collect::<Result<Vec<_>, _>>()?;

    let crash_type = match problem_type {
        ProblemType::Core => validate::native_crash_type(&raw.reason),
        ProblemType::Python => validate::python_crash_type(&raw.reason),
        ProblemType::Kerneloops => "kerneloops".to_owned(),
    };

    let backtrace = match raw.core_backtrace {
        Some(value) => backtrace(value, raw.crash_thread),
        None => Backtrace::Unavailable {
            reason: "no core_backtrace".to_owned(),
        },
    };

    Ok(StructuredReport {
        format: FormatVersion::V1,
        problem_type,
        reporter: Reporter {
            name: raw.reporter.name,
            version: raw.reporter.version,
        },
        os: OperatingSystem {
            name: raw.os.name,
            version: raw.os.version,
            architecture: Some(raw.architecture),
        },
        component: package.name.clone(),
        package,
        crash_type,
        executable: Some(raw.executable),
        backtrace,
        auxiliary: Auxiliary {
            reason: Some(raw.reason),
            uptime: Some(raw.uptime),
            related_packages,
            user_type: raw.user_type,
            selinux_mode: raw.selinux.map(|s| s.mode.to_ascii_lowercase()),
            taint_flags: Vec::new(),
        },
    })
}

fn backtrace(value: Value, crash_thread: Option<u32>) -> Backtrace {
    let mut frames: Vec<RawFrame> = match serde_json::from_value(value) {
        Ok(frames) => frames,
        Err(e) => {
            return Backtrace::Unavailable {
                reason: format!("unparsable core_backtrace: {e}"),
            }
        }
    };

    // Without an explicit crash thread, the first listed frame's thread is the one that crashed
    let Some(crash_thread) = crash_thread.or_else(|| frames.first().map(|f| f.thread)) else {
        return Backtrace::Unavailable {
            reason: "empty core_backtrace".to_owned(),
        };
    };

    frames.retain(|f| f.thread == crash_thread);
    frames.sort_by_key(|f| f.frame);

    let mut out = Vec::with_capacity(frames.len());
    for raw in frames {
        if !validate::is_executable(&raw.path) {
            return Backtrace::Unavailable {
                reason: format!("frame {} has an invalid path", raw.frame),
            };
        }
        if let Some(build_id) = raw.buildid.as_deref() {
            if !validate::is_hex(build_id) {
                return Backtrace::Unavailable {
                    reason: format!("frame {} has an invalid build id", raw.frame),
                };
            }
        }
        if let Some(name) = raw.funcname.as_deref() {
            if !validate::is_valid_function(name) {
                return Backtrace::Unavailable {
                    reason: format!("frame {} has an invalid function name", raw.frame),
                };
            }
        }
        if let Some(hash) = raw.funchash.as_deref() {
            if !validate::is_hex(hash) {
                return Backtrace::Unavailable {
                    reason: format!("frame {} has an invalid function hash", raw.frame),
                };
            }
        }
        out.push(Frame {
            path: raw.path,
            function: raw.funcname,
            function_hash: raw.funchash,
            offset: Some(raw.offset),
            build_id: raw.buildid,
            source: None,
        });
    }

    Backtrace::from_frames(out)
}
