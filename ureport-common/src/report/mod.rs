use serde::{Deserialize, Serialize};
use thiserror::Error;

mod signal;
mod v1;
mod v2;
mod validate;

pub use signal::signal_name;

/// Reports above this size are rejected before any JSON parsing happens.
pub const DEFAULT_MAX_REPORT_BYTES: usize = 512 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unsupported report format: {0}")]
    UnsupportedFormat(String),
    #[error("malformed report: {0}")]
    MalformedReport(String),
}

impl ParseError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ParseError::MalformedReport(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemType {
    /// Native userspace crash (`userspace` in v1, `core` in v2)
    Core,
    Python,
    Kerneloops,
}

impl ProblemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProblemType::Core => "core",
            ProblemType::Python => "python",
            ProblemType::Kerneloops => "kerneloops",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub release: Option<String>,
    pub epoch: Option<u32>,
    pub architecture: Option<String>,
}

impl Package {
    /// `name-version-release`, or `name-version` when the release is unknown.
    pub fn nvr(&self) -> String {
        match &self.release {
            Some(release) => format!("{}-{}-{}", self.name, self.version, release),
            None => format!("{}-{}", self.name, self.version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reporter {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystem {
    pub name: String,
    pub version: String,
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub contents: Option<String>,
}

/// One stack frame, as reported by the client. Nothing is normalized at this stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Binary, shared object, python file or kernel module the frame belongs to
    pub path: String,
    pub function: Option<String>,
    pub function_hash: Option<String>,
    pub offset: Option<u64>,
    pub build_id: Option<String>,
    pub source: Option<SourceLocation>,
}

impl Frame {
    pub fn is_symbolized(&self) -> bool {
        self.function.is_some() || self.function_hash.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Backtrace {
    /// Crash thread frames, innermost first. Never empty.
    Available { frames: Vec<Frame> },
    Unavailable { reason: String },
}

impl Backtrace {
    pub fn frames(&self) -> Option<&[Frame]> {
        match self {
            Backtrace::Available { frames } => Some(frames),
            Backtrace::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Backtrace::Available { .. })
    }

    /// Keep the frames only when the backtrace is usable for deduplication.
    pub(crate) fn from_frames(frames: Vec<Frame>) -> Self {
        if frames.is_empty() {
            return Backtrace::Unavailable {
                reason: "crash thread has no frames".to_owned(),
            };
        }
        if let Some(pos) = frames.iter().position(|f| !f.is_symbolized()) {
            return Backtrace::Unavailable {
                reason: format!("frame {pos} has neither a function name nor a function hash"),
            };
        }
        Backtrace::Available { frames }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auxiliary {
    pub reason: Option<String>,
    pub uptime: Option<u64>,
    pub related_packages: Vec<Package>,
    pub user_type: Option<String>,
    pub selinux_mode: Option<String>,
    pub taint_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredReport {
    pub format: FormatVersion,
    pub problem_type: ProblemType,
    pub reporter: Reporter,
    pub os: OperatingSystem,
    pub package: Package,
    /// Component the problem is filed against, used to scope similarity candidates
    pub component: String,
    pub crash_type: String,
    pub executable: Option<String>,
    pub backtrace: Backtrace,
    pub auxiliary: Auxiliary,
}

#[derive(Debug, Clone, Copy)]
pub struct ReportParser {
    max_report_bytes: usize,
}

impl Default for ReportParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPORT_BYTES)
    }
}

impl ReportParser {
    pub fn new(max_report_bytes: usize) -> Self {
        Self { max_report_bytes }
    }

    /// Validate raw report bytes and normalize them into a `StructuredReport`.
    /// Pure: the same bytes always produce the same result.
    pub fn parse(&self, raw: &[u8]) -> Result<StructuredReport, ParseError> {
        if raw.len() > self.max_report_bytes {
            return Err(ParseError::malformed(format!(
                "report is {} bytes, the limit is {}",
                raw.len(),
                self.max_report_bytes
            )));
        }

        let value: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| ParseError::malformed(format!("invalid JSON: {e}")))?;

        let serde_json::Value::Object(object) = value else {
            return Err(ParseError::malformed("report is not a JSON object"));
        };

        match object.get("ureport_version") {
            None => v1::parse(object),
            Some(version) => match version.as_u64() {
                Some(1) => v1::parse(object),
                Some(2) => v2::parse(object),
                _ => Err(ParseError::UnsupportedFormat(format!(
                    "ureport_version {version}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::test_utils::{core_v1_report, core_v2_report, python_v2_report};

    fn parse(value: serde_json::Value) -> Result<StructuredReport, ParseError> {
        ReportParser::default().parse(value.to_string().as_bytes())
    }

    #[test]
    fn test_v1_userspace_report() {
        let report = parse(core_v1_report("foo", "1.2", 4)).unwrap();

        assert_eq!(report.format, FormatVersion::V1);
        assert_eq!(report.problem_type, ProblemType::Core);
        assert_eq!(report.component, "foo");
        assert_eq!(report.package.version, "1.2");
        assert_eq!(report.crash_type, "SIGSEGV");
        assert_eq!(report.executable.as_deref(), Some("/usr/bin/foo"));

        let frames = report.backtrace.frames().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].function.as_deref(), Some("fn_0"));
        assert_eq!(frames[3].function.as_deref(), Some("fn_3"));
    }

    #[test]
    fn test_v1_frames_are_sorted_and_scoped_to_crash_thread() {
        let mut value = core_v1_report("foo", "1.2", 3);
        let frames = value["core_backtrace"].as_array_mut().unwrap();
        frames.reverse();
        frames.push(json!({
            "thread": 1, "frame": 0, "buildid": "aa", "path": "/usr/bin/foo",
            "offset": 12, "funcname": "other_thread"
        }));

        let report = parse(value).unwrap();
        let names: Vec<_> = report
            .backtrace
            .frames()
            .unwrap()
            .iter()
            .map(|f| f.function.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["fn_0", "fn_1", "fn_2"]);
    }

    #[test]
    fn test_v2_core_report() {
        let report = parse(core_v2_report("bar", "3.0", 11, 5)).unwrap();

        assert_eq!(report.format, FormatVersion::V2);
        assert_eq!(report.problem_type, ProblemType::Core);
        assert_eq!(report.crash_type, "SIGSEGV");
        assert_eq!(report.package.name, "bar");
        assert_eq!(report.backtrace.frames().unwrap().len(), 5);
    }

    #[test]
    fn test_v2_python_frames_are_reversed() {
        let report = parse(python_v2_report("baz", "0.9", "ZeroDivisionError")).unwrap();

        assert_eq!(report.problem_type, ProblemType::Python);
        assert_eq!(report.crash_type, "ZeroDivisionError");
        let frames = report.backtrace.frames().unwrap();
        assert_eq!(frames[0].function.as_deref(), Some("divide"));
        assert_eq!(frames.last().unwrap().function.as_deref(), Some("<module>"));
        assert_eq!(frames[0].source.as_ref().unwrap().line, 12);
    }

    #[test]
    fn test_unknown_version_is_unsupported() {
        let mut value = core_v2_report("bar", "3.0", 11, 5);
        value["ureport_version"] = json!(3);
        assert!(matches!(parse(value), Err(ParseError::UnsupportedFormat(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["ureport_version"] = json!("one");
        assert!(matches!(parse(value), Err(ParseError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let parser = ReportParser::default();
        assert!(matches!(
            parser.parse(b"\x00\x01 not json"),
            Err(ParseError::MalformedReport(_))
        ));
        assert!(matches!(
            parser.parse(b"[1, 2, 3]"),
            Err(ParseError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_missing_required_fields_are_malformed() {
        let mut value = core_v1_report("foo", "1.2", 2);
        value.as_object_mut().unwrap().remove("installed_package");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v2_report("bar", "3.0", 11, 2);
        value.as_object_mut().unwrap().remove("reporter");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));
    }

    #[test]
    fn test_invalid_field_values_are_malformed() {
        let mut value = core_v1_report("foo", "1.2", 2);
        value["installed_package"]["name"] = json!("foo; rm -rf /");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["executable"] = json!("relative/path");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["type"] = json!("firmware");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));
    }

    #[test]
    fn test_enumerated_header_fields_are_checked() {
        let mut value = core_v1_report("foo", "1.2", 2);
        value["user_type"] = json!("bogus");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["selinux"]["mode"] = json!("strict");
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["os_state"] = json!({
            "suspend": "no", "boot": "maybe", "login": "no", "logout": "no", "shutdown": "no"
        });
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["os_state"] = json!({"suspend": "no", "boot": "yes"});
        assert!(matches!(parse(value), Err(ParseError::MalformedReport(_))));

        let mut value = core_v1_report("foo", "1.2", 2);
        value["user_type"] = json!("Remote");
        value["selinux"]["mode"] = json!("Permissive");
        value["os_state"] = json!({
            "suspend": "no", "boot": "YES", "login": "no", "logout": "no", "shutdown": "no"
        });
        let report = parse(value).unwrap();
        assert_eq!(report.auxiliary.selinux_mode.as_deref(), Some("permissive"));
    }

    #[test]
    fn test_invalid_frame_fields_make_the_backtrace_unavailable() {
        let mut value = core_v1_report("foo", "1.2", 3);
        value["core_backtrace"][1]["buildid"] = json!("not-hex");
        let report = parse(value).unwrap();
        assert!(matches!(
            report.backtrace,
            Backtrace::Unavailable { ref reason } if reason.contains("build id")
        ));

        let mut value = core_v1_report("foo", "1.2", 3);
        value["core_backtrace"][2]["path"] = json!("libfoo.so");
        let report = parse(value).unwrap();
        assert!(matches!(
            report.backtrace,
            Backtrace::Unavailable { ref reason } if reason.contains("path")
        ));
    }

    #[test]
    fn test_oversized_report_is_malformed() {
        let raw = core_v1_report("foo", "1.2", 40).to_string();
        let parser = ReportParser::new(raw.len() - 1);
        assert!(matches!(
            parser.parse(raw.as_bytes()),
            Err(ParseError::MalformedReport(_))
        ));
        assert!(ReportParser::new(raw.len()).parse(raw.as_bytes()).is_ok());
    }

    #[test]
    fn test_unusable_backtrace_is_flagged_not_rejected() {
        let mut value = core_v1_report("foo", "1.2", 3);
        let frame = &mut value["core_backtrace"][1];
        frame.as_object_mut().unwrap().remove("funcname");
        frame.as_object_mut().unwrap().remove("funchash");

        let report = parse(value).unwrap();
        assert!(matches!(report.backtrace, Backtrace::Unavailable { .. }));

        let mut value = core_v1_report("foo", "1.2", 3);
        value["core_backtrace"] = json!("definitely not frames");
        let report = parse(value).unwrap();
        assert!(!report.backtrace.is_available());

        let mut value = core_v1_report("foo", "1.2", 3);
        value.as_object_mut().unwrap().remove("core_backtrace");
        let report = parse(value).unwrap();
        assert!(!report.backtrace.is_available());
    }

    #[test]
    fn test_parse_is_pure() {
        let raw = core_v2_report("bar", "3.0", 6, 8).to_string();
        let parser = ReportParser::default();
        assert_eq!(
            parser.parse(raw.as_bytes()).unwrap(),
            parser.parse(raw.as_bytes()).unwrap()
        );
    }
}
