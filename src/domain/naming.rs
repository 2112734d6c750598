//! Naming rules for services, containers and manifest objects

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

/// Minimum length of a manifest object name
pub const MIN_NAME_LENGTH: usize = 3;

/// Maximum length of a manifest object name (DNS label limit)
pub const MAX_NAME_LENGTH: usize = 63;

fn dns_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("Invalid object name pattern")
    })
}

/// Join non-empty parts with `-`, lowercased, skipping a part equal to
/// the one before it (`adcm`, `adcm` becomes `adcm`).
pub fn concat<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut out: Vec<String> = Vec::new();
    for part in parts {
        let part = part.trim().to_lowercase();
        if part.is_empty() || out.last() == Some(&part) {
            continue;
        }
        out.push(part);
    }
    out.join("-")
}

/// Reduce a string to `[a-z0-9-]`, collapsing runs of other characters
pub fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Service key within a project: `<kind>-<name>`
pub fn service_name(kind: &str, name: &str) -> String {
    slug(&concat([kind, name]))
}

/// Container name: `<namespace>-<kind>-<name>`
pub fn container_name(namespace: &str, kind: &str, name: &str) -> String {
    slug(&concat([namespace, kind, name]))
}

/// Project network name as created by the engine
pub fn network_name(project: &str, network: &str) -> String {
    format!("{project}_{network}")
}

/// Validate a manifest name or namespace
pub fn validate_object_name(field: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidName {
        field: field.to_string(),
        value: value.to_string(),
        reason,
    };

    if value.len() < MIN_NAME_LENGTH {
        return Err(invalid(format!(
            "must be at least {MIN_NAME_LENGTH} characters"
        )));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(invalid(format!(
            "must be no more than {MAX_NAME_LENGTH} characters"
        )));
    }
    if !dns_label().is_match(value) {
        return Err(invalid(
            "must consist of lower case alphanumeric characters or '-', and must start and end with an alphanumeric character".to_string(),
        ));
    }
    Ok(())
}
