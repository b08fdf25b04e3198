use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::report::{Backtrace, Frame, StructuredReport};

pub const DEFAULT_HASH_FRAMES: usize = 16;

// Representative backtraces are capped, deep recursion would otherwise bloat every cluster row
pub const MAX_KEPT_FRAMES: usize = 128;

static SYMBOL_OFFSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\+0[xX][0-9a-fA-F]+$").unwrap());
static RUST_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"::h[0-9a-f]{16}$").unwrap());
static HOME_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(/home/[^/]+|/root)/").unwrap());
static TMP_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(/var)?/tmp/.*/").unwrap());
static PROC_PID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/proc/[0-9]+/").unwrap());
static LIB_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.so(\.[0-9]+)+$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    Names,
    Hashes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "hash_type")]
pub enum FingerprintKind {
    Backtrace(HashType),
    /// Package and crash type only. Low confidence, never used for approximate matching.
    Fallback,
}

// A record of what actually went into a fingerprint, for operators wondering why two
// reports did or did not end up in the same cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FingerprintRecordPart {
    Package { name: String, version: String },
    Problem { problem_type: String, crash_type: String },
    Frame { index: usize, piece: String },
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub value: String,
    pub kind: FingerprintKind,
    pub component: String,
    pub crash_type: String,
    /// Normalized crash thread, innermost first. Empty for fallback fingerprints.
    pub frames: Vec<String>,
    pub record: Vec<FingerprintRecordPart>,
}

impl Fingerprint {
    pub fn is_fallback(&self) -> bool {
        self.kind == FingerprintKind::Fallback
    }
}

#[derive(Default)]
struct FingerprintBuilder {
    hasher: Sha512,
    record: Vec<FingerprintRecordPart>,
}

impl FingerprintBuilder {
    fn update(&mut self, data: impl AsRef<[u8]>) {
        self.hasher.update(data);
        // Separator, so that "ab" + "c" and "a" + "bc" differ
        self.hasher.update(b"\n");
    }

    fn add_part(&mut self, part: FingerprintRecordPart) {
        self.record.push(part);
    }

    fn finalize(self) -> (String, Vec<FingerprintRecordPart>) {
        (format!("{:x}", self.hasher.finalize()), self.record)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    hash_frames: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_FRAMES)
    }
}

impl Fingerprinter {
    pub fn new(hash_frames: usize) -> Self {
        Self {
            hash_frames: hash_frames.max(1),
        }
    }

    pub fn fingerprint(&self, report: &StructuredReport) -> Fingerprint {
        let mut builder = FingerprintBuilder::default();

        let (kind, frames) = match report.backtrace.frames() {
            Some(frames) => {
                let hash_type = if frames
                    .iter()
                    .take(self.hash_frames)
                    .all(|f| f.function.is_some())
                {
                    HashType::Names
                } else {
                    HashType::Hashes
                };
                let normalized: Vec<String> = frames
                    .iter()
                    .take(MAX_KEPT_FRAMES)
                    .map(|f| frame_piece(f, hash_type))
                    .collect();
                (FingerprintKind::Backtrace(hash_type), normalized)
            }
            None => (FingerprintKind::Fallback, Vec::new()),
        };

        // Domain separation between the two kinds, a fallback can never collide with a
        // backtrace fingerprint of the same package
        match kind {
            FingerprintKind::Backtrace(HashType::Names) => builder.update("backtrace:names"),
            FingerprintKind::Backtrace(HashType::Hashes) => builder.update("backtrace:hashes"),
            FingerprintKind::Fallback => builder.update("fallback"),
        }

        builder.update(&report.package.name);
        builder.update(&report.package.version);
        builder.add_part(FingerprintRecordPart::Package {
            name: report.package.name.clone(),
            version: report.package.version.clone(),
        });

        builder.update(report.problem_type.as_str());
        builder.update(&report.crash_type);
        builder.add_part(FingerprintRecordPart::Problem {
            problem_type: report.problem_type.as_str().to_owned(),
            crash_type: report.crash_type.clone(),
        });

        if let Backtrace::Unavailable { reason } = &report.backtrace {
            builder.add_part(FingerprintRecordPart::Fallback {
                reason: reason.clone(),
            });
        }

        for (index, piece) in frames.iter().take(self.hash_frames).enumerate() {
            builder.update(piece);
            builder.add_part(FingerprintRecordPart::Frame {
                index,
                piece: piece.clone(),
            });
        }

        let (value, record) = builder.finalize();
        Fingerprint {
            value,
            kind,
            component: report.component.clone(),
            crash_type: report.crash_type.clone(),
            frames,
            record,
        }
    }
}

/// `function @ path`, plus the line for frames that carry a source location. Offsets,
/// addresses and build ids never make it in.
fn frame_piece(frame: &Frame, hash_type: HashType) -> String {
    let symbol = match hash_type {
        HashType::Names => frame
            .function
            .as_deref()
            .map(normalize_function)
            .or_else(|| frame.function_hash.clone()),
        HashType::Hashes => frame
            .function_hash
            .as_deref()
            .map(|h| h.trim_start_matches("0x").to_ascii_lowercase())
            .or_else(|| frame.function.as_deref().map(normalize_function)),
    }
    .unwrap_or_default();

    let path = normalize_path(&frame.path);
    match &frame.source {
        Some(source) => format!("{symbol} @ {path} + {}", source.line),
        None => format!("{symbol} @ {path}"),
    }
}

pub fn normalize_function(name: &str) -> String {
    let name = SYMBOL_OFFSET.replace(name.trim(), "");
    RUST_HASH.replace(&name, "").into_owned()
}

pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = HOME_DIR.replace(path, "~/");
    let path = TMP_DIR.replace(&path, "<tmp>/");
    let path = PROC_PID.replace(&path, "/proc/<pid>/");
    LIB_VERSION.replace(&path, ".so").into_owned()
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::report::ReportParser;
    use crate::test_utils::{core_v1_report, python_v2_report};

    fn parse(value: serde_json::Value) -> StructuredReport {
        ReportParser::default()
            .parse(value.to_string().as_bytes())
            .unwrap()
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/usr/lib64/libfoo.so.1.2.3"), "/usr/lib64/libfoo.so");
        assert_eq!(normalize_path("/usr/lib64/libfoo.so"), "/usr/lib64/libfoo.so");
        assert_eq!(normalize_path("/home/alice/bin/tool"), "~/bin/tool");
        assert_eq!(normalize_path("/root/bin/tool"), "~/bin/tool");
        assert_eq!(normalize_path("/tmp/build-8812/a/plugin.so.2"), "<tmp>/plugin.so");
        assert_eq!(normalize_path("/proc/4242/exe"), "/proc/<pid>/exe");
    }

    #[test]
    fn test_normalize_function() {
        assert_eq!(normalize_function("g_main_loop_run+0x1f"), "g_main_loop_run");
        assert_eq!(
            normalize_function("core::panicking::panic::h0123456789abcdef"),
            "core::panicking::panic"
        );
        assert_eq!(normalize_function("operator new"), "operator new");
    }

    #[test]
    fn test_fingerprint_ignores_incidental_noise() {
        let base = parse(core_v1_report("foo", "1.2", 10));

        let mut noisy = core_v1_report("foo", "1.2", 10);
        noisy["uptime"] = json!(987654);
        noisy["reason"] = json!("Process /usr/bin/foo was killed by signal 11 (SIGSEGV)");
        noisy["installed_package"]["release"] = json!("7.fc20");
        for (i, frame) in noisy["core_backtrace"]
            .as_array_mut()
            .unwrap()
            .iter_mut()
            .enumerate()
        {
            frame["offset"] = json!(0xdead00 + i);
            frame["buildid"] = json!("ffffffffffff");
            frame["funcname"] = json!(format!("fn_{i}+0x{i}f"));
        }
        noisy["core_backtrace"][2]["path"] = json!("/usr/lib64/libbar.so.9.9");

        let mut base_with_lib = base.clone();
        if let Backtrace::Available { frames } = &mut base_with_lib.backtrace {
            frames[2].path = "/usr/lib64/libbar.so.1".to_owned();
        }

        let fingerprinter = Fingerprinter::default();
        let a = fingerprinter.fingerprint(&base_with_lib);
        let b = fingerprinter.fingerprint(&parse(noisy));
        assert_eq!(a.value, b.value);
        assert_eq!(a.kind, FingerprintKind::Backtrace(HashType::Names));
        assert_eq!(a.frames, b.frames);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let report = parse(python_v2_report("baz", "0.9", "KeyError"));
        let fingerprinter = Fingerprinter::default();
        assert_eq!(
            fingerprinter.fingerprint(&report),
            fingerprinter.fingerprint(&report)
        );
        // SHA-512, hex encoded
        assert_eq!(fingerprinter.fingerprint(&report).value.len(), 128);
    }

    #[test]
    fn test_fingerprint_distinguishes_real_differences() {
        let fingerprinter = Fingerprinter::default();
        let a = fingerprinter.fingerprint(&parse(core_v1_report("foo", "1.2", 10)));
        let b = fingerprinter.fingerprint(&parse(core_v1_report("foo", "1.3", 10)));
        let c = fingerprinter.fingerprint(&parse(core_v1_report("foo", "1.2", 9)));

        assert_ne!(a.value, b.value);
        assert_ne!(a.value, c.value);
    }

    #[test]
    fn test_only_top_frames_are_hashed() {
        let fingerprinter = Fingerprinter::new(4);
        let mut deep = core_v1_report("foo", "1.2", 10);
        deep["core_backtrace"][8]["funcname"] = json!("something_else");

        let a = fingerprinter.fingerprint(&parse(core_v1_report("foo", "1.2", 10)));
        let b = fingerprinter.fingerprint(&parse(deep));
        assert_eq!(a.value, b.value);
        // but the kept frames still tell them apart for similarity
        assert_ne!(a.frames, b.frames);
    }

    #[test]
    fn test_hashes_when_a_name_is_missing() {
        let mut value = core_v1_report("foo", "1.2", 3);
        value["core_backtrace"][1]
            .as_object_mut()
            .unwrap()
            .remove("funcname");

        let fingerprint = Fingerprinter::default().fingerprint(&parse(value));
        assert_eq!(fingerprint.kind, FingerprintKind::Backtrace(HashType::Hashes));
        assert!(fingerprint.frames[1].starts_with("abcd01 @ "));
    }

    #[test]
    fn test_fallback_without_backtrace() {
        let mut value = core_v1_report("foo", "1.2", 3);
        value.as_object_mut().unwrap().remove("core_backtrace");
        let fallback = Fingerprinter::default().fingerprint(&parse(value));

        assert!(fallback.is_fallback());
        assert!(fallback.frames.is_empty());
        assert!(fallback
            .record
            .iter()
            .any(|p| matches!(p, FingerprintRecordPart::Fallback { .. })));

        let full = Fingerprinter::default().fingerprint(&parse(core_v1_report("foo", "1.2", 3)));
        assert_ne!(fallback.value, full.value);
    }
}
