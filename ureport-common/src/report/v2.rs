use serde::Deserialize;
use serde_json::{Map, Value};

use super::validate;
use super::{
    signal_name, Auxiliary, Backtrace, FormatVersion, Frame, OperatingSystem, Package, ParseError,
    ProblemType, Reporter, SourceLocation, StructuredReport,
};

#[derive(Debug, Deserialize)]
struct RawNameVersion {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct RawOs {
    name: String,
    version: String,
    architecture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    version: String,
    release: Option<String>,
    epoch: Option<u32>,
    architecture: Option<String>,
    package_role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    reporter: RawNameVersion,
    os: RawOs,
    #[serde(default)]
    packages: Vec<RawPackage>,
    problem: Value,
    reason: Option<String>,
}

// Only the problem header is strict, the stacktrace is read separately and best-effort.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawProblem {
    Core {
        component: String,
        executable: String,
        signal: u32,
    },
    Python {
        component: String,
        exception_name: String,
    },
    Kerneloops {
        component: String,
        version: Option<String>,
        #[serde(default)]
        taint_flags: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawCoreThread {
    #[serde(default)]
    crash_thread: bool,
    frames: Vec<RawCoreFrame>,
}

#[derive(Debug, Deserialize)]
struct RawCoreFrame {
    build_id: Option<String>,
    file_name: Option<String>,
    build_id_offset: Option<u64>,
    function_name: Option<String>,
    fingerprint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPythonFrame {
    file_name: String,
    file_line: u32,
    line_contents: Option<String>,
    function_name: Option<String>,
    special_function: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawKernelFrame {
    function_name: String,
    function_offset: Option<u64>,
    module_name: Option<String>,
    reliable: Option<bool>,
}

pub fn parse(object: Map<String, Value>) -> Result<StructuredReport, ParseError> {
    let raw: RawReport = serde_json::from_value(Value::Object(object))
        .map_err(|e| ParseError::malformed(format!("uReport v2: {e}")))?;

    let header: RawProblem = serde_json::from_value(raw.problem.clone())
        .map_err(|e| ParseError::malformed(format!("uReport v2 problem: {e}")))?;

    validate::phrase("reporter.name", &raw.reporter.name)?;
    validate::package_field("reporter.version", &raw.reporter.version)?;
    validate::phrase("os.name", &raw.os.name)?;
    validate::package_field("os.version", &raw.os.version)?;
    if let Some(reason) = raw.reason.as_deref() {
        validate::phrase("reason", reason)?;
    }

    let package = affected_package(raw.packages)?;

    let mut auxiliary = Auxiliary {
        reason: raw.reason,
        ..Default::default()
    };

    let (problem_type, component, crash_type, executable, backtrace) = match header {
        RawProblem::Core {
            component,
            executable,
            signal,
        } => {
            validate::executable(&executable)?;
            (
                ProblemType::Core,
                component,
                signal_name(signal),
                Some(executable),
                core_backtrace(&raw.problem),
            )
        }
        RawProblem::Python {
            component,
            exception_name,
        } => {
            validate::package_field("problem.exception_name", &exception_name)?;
            (
                ProblemType::Python,
                component,
                exception_name,
                None,
                python_backtrace(&raw.problem),
            )
        }
        RawProblem::Kerneloops {
            component,
            version,
            taint_flags,
        } => {
            if let Some(version) = version.as_deref() {
                validate::package_field("problem.version", version)?;
            }
            auxiliary.taint_flags = taint_flags;
            (
                ProblemType::Kerneloops,
                component,
                "kerneloops".to_owned(),
                None,
                kernel_backtrace(&raw.problem),
            )
        }
    };
    validate::package_field("problem.component", &component)?;

    Ok(StructuredReport {
        format: FormatVersion::V2,
        problem_type,
        reporter: Reporter {
            name: raw.reporter.name,
            version: raw.reporter.version,
        },
        os: OperatingSystem {
            name: raw.os.name,
            version: raw.os.version,
            architecture: raw.os.architecture,
        },
        package,
        component,
        crash_type,
        executable,
        backtrace,
        auxiliary,
    })
}

fn affected_package(packages: Vec<RawPackage>) -> Result<Package, ParseError> {
    let raw = match packages
        .iter()
        .position(|p| p.package_role.as_deref() == Some("affected"))
    {
        Some(pos) => packages.into_iter().nth(pos),
        None => packages.into_iter().next(),
    }
    .ok_or_else(|| ParseError::malformed("uReport v2: no affected package"))?;

    validate::package_field("package.name", &raw.name)?;
    validate::package_field("package.version", &raw.version)?;
    if let Some(release) = raw.release.as_deref() {
        validate::package_field("package.release", release)?;
    }

    Ok(Package {
        name: raw.name,
        version: raw.version,
        release: raw.release,
        epoch: raw.epoch,
        architecture: raw.architecture,
    })
}

fn field<T: serde::de::DeserializeOwned>(problem: &Value, name: &str) -> Result<T, String> {
    let value = problem
        .get(name)
        .ok_or_else(|| format!("no {name} in problem"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("unparsable {name}: {e}"))
}

fn core_backtrace(problem: &Value) -> Backtrace {
    let threads: Vec<RawCoreThread> = match field(problem, "stacktrace") {
        Ok(threads) => threads,
        Err(reason) => return Backtrace::Unavailable { reason },
    };

    let Some(thread) = threads
        .iter()
        .position(|t| t.crash_thread)
        .or(if threads.is_empty() { None } else { Some(0) })
        .and_then(|pos| threads.into_iter().nth(pos))
    else {
        return Backtrace::Unavailable {
            reason: "stacktrace has no threads".to_owned(),
        };
    };

    let mut frames = Vec::with_capacity(thread.frames.len());
    for (index, raw) in thread.frames.into_iter().enumerate() {
        if raw.function_name.as_deref().is_some_and(|f| !validate::is_valid_function(f))
            || raw.fingerprint.as_deref().is_some_and(|f| !validate::is_hex(f))
        {
            return Backtrace::Unavailable {
                reason: format!("frame {index} has an invalid function symbol"),
            };
        }
        frames.push(Frame {
            path: raw.file_name.unwrap_or_else(|| "??".to_owned()),
            function: raw.function_name,
            function_hash: raw.fingerprint,
            offset: raw.build_id_offset,
            build_id: raw.build_id,
            source: None,
        });
    }

    Backtrace::from_frames(frames)
}

fn python_backtrace(problem: &Value) -> Backtrace {
    let raw: Vec<RawPythonFrame> = match field(problem, "stacktrace") {
        Ok(frames) => frames,
        Err(reason) => return Backtrace::Unavailable { reason },
    };

    // Outermost frame first on the wire
    let frames = raw
        .into_iter()
        .rev()
        .map(|f| Frame {
            function: f
                .special_function
                .map(|special| format!("<{special}>"))
                .or(f.function_name),
            path: f.file_name.clone(),
            function_hash: None,
            offset: None,
            build_id: None,
            source: Some(SourceLocation {
                file: f.file_name,
                line: f.file_line,
                contents: f.line_contents,
            }),
        })
        .collect();

    Backtrace::from_frames(frames)
}

fn kernel_backtrace(problem: &Value) -> Backtrace {
    let raw: Vec<RawKernelFrame> = match field(problem, "frames") {
        Ok(frames) => frames,
        Err(reason) => return Backtrace::Unavailable { reason },
    };

    // Unreliable frames are stack garbage that happened to look like return addresses
    let frames = raw
        .into_iter()
        .filter(|f| f.reliable != Some(false))
        .map(|f| Frame {
            path: f.module_name.unwrap_or_else(|| "vmlinux".to_owned()),
            function: Some(f.function_name),
            function_hash: None,
            offset: f.function_offset,
            build_id: None,
            source: None,
        })
        .collect();

    Backtrace::from_frames(frames)
}
