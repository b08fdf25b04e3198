use once_cell::sync::Lazy;
use regex::Regex;

use super::{signal_name, ParseError};

static PACKAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_.+\-~]+$").unwrap());
static EXECUTABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/[0-9a-zA-Z/_.\-+]+$").unwrap());
static PHRASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-zA-Z :_/\-+*.()?!<>,'=\[\]]+$").unwrap());
static FUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_<>:*+=~@! &(),/|^\-.\[\]$]+$").unwrap());
static HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(0[xX])?[0-9a-fA-F]+$").unwrap());
static USER_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(root|nologin|local|remote)$").unwrap());
static SELINUX_MODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(enforcing|permissive|disabled)$").unwrap());
static YES_NO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(yes|no)$").unwrap());

static SIGNAL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(SIG[A-Z0-9]+)\b").unwrap());
static SIGNAL_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"signal (\d+)").unwrap());
static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"0[xX][0-9a-fA-F]+|[0-9]+").unwrap());
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());

const MAX_CRASH_TYPE_LEN: usize = 64;

fn check(field: &str, value: &str, re: &Regex) -> Result<(), ParseError> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(ParseError::malformed(format!(
            "{field} contains invalid characters: {value:?}"
        )))
    }
}

pub fn package_field(field: &str, value: &str) -> Result<(), ParseError> {
    check(field, value, &PACKAGE)
}

pub fn executable(value: &str) -> Result<(), ParseError> {
    check("executable", value, &EXECUTABLE)
}

pub fn phrase(field: &str, value: &str) -> Result<(), ParseError> {
    check(field, value, &PHRASE)
}

pub fn user_type(value: &str) -> Result<(), ParseError> {
    check("user_type", value, &USER_TYPE)
}

pub fn selinux_mode(value: &str) -> Result<(), ParseError> {
    check("selinux.mode", value, &SELINUX_MODE)
}

pub fn yes_no(field: &str, value: &str) -> Result<(), ParseError> {
    check(field, value, &YES_NO)
}

pub fn is_executable(value: &str) -> bool {
    EXECUTABLE.is_match(value)
}

pub fn is_valid_function(value: &str) -> bool {
    FUNCTION.is_match(value)
}

pub fn is_hex(value: &str) -> bool {
    HEX.is_match(value)
}

/// Crash type of a native crash from its free-form reason,
/// e.g. `Process /usr/bin/foo was killed by signal 11 (SIGSEGV)`.
pub fn native_crash_type(reason: &str) -> String {
    if let Some(caps) = SIGNAL_NAME.captures(reason) {
        return caps[1].to_owned();
    }
    if let Some(number) = SIGNAL_NUMBER
        .captures(reason)
        .and_then(|caps| caps[1].parse::<u32>().ok())
    {
        return signal_name(number);
    }
    normalized_reason(reason)
}

/// Exception name of a python crash reason, which is either the bare exception name or
/// `file:line:function:Exception: message`.
pub fn python_crash_type(reason: &str) -> String {
    let head = reason.split(": ").next().unwrap_or(reason);
    let candidate = head.rsplit(':').next().unwrap_or(head).trim();
    if IDENTIFIER.is_match(candidate) {
        candidate.to_owned()
    } else {
        normalized_reason(reason)
    }
}

fn normalized_reason(reason: &str) -> String {
    let reason = NUMBERS.replace_all(reason.trim(), "#");
    reason.chars().take(MAX_CRASH_TYPE_LEN).collect()
}
