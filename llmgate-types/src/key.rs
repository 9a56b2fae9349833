//! API key data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Invalid,
}

/// One upstream credential belonging to a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub group_id: i64,
    pub value: String,
    pub status: KeyStatus,
    pub request_count: u64,
    pub failure_count: u64,
    /// Consecutive failures since the last success; compared against
    /// `blacklist_threshold`. Reset to zero on success or restore.
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ApiKey {
    pub fn new(id: i64, group_id: i64, value: String) -> Self {
        Self {
            id,
            group_id,
            value,
            status: KeyStatus::Active,
            request_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used_at: None,
            last_error: None,
        }
    }
}

const KEY_MIN_LEN: usize = 4;
const KEY_MAX_LEN: usize = 1000;

/// Validates the key format from the data model: length 4-1000, charset
/// `[A-Za-z0-9_\-./+=:]`.
pub fn validate_key_format(value: &str) -> Result<()> {
    if value.len() < KEY_MIN_LEN || value.len() > KEY_MAX_LEN {
        return Err(ProxyError::Validation(format!(
            "key must be {KEY_MIN_LEN}-{KEY_MAX_LEN} characters, got {}",
            value.len()
        )));
    }
    let ok = value.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(b, b'_' | b'-' | b'.' | b'/' | b'+' | b'=' | b':')
    });
    if !ok {
        return Err(ProxyError::Validation(
            "key contains characters outside [A-Za-z0-9_-./+=:]".into(),
        ));
    }
    Ok(())
}

/// Splits a raw `keys_text` blob on whitespace, commas, semicolons, pipes,
/// or newlines, per the `POST /api/keys` contract. A leading `[` is treated
/// as a JSON array instead.
pub fn parse_keys_text(text: &str) -> Result<Vec<String>> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        let values: Vec<String> = serde_json::from_str(trimmed)
            .map_err(|e| ProxyError::Validation(format!("invalid keys_text JSON array: {e}")))?;
        return Ok(values.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    Ok(trimmed
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '|'))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_delimiters() {
        let got = parse_keys_text("k1\nk2,k3; k4|k5").unwrap();
        assert_eq!(got, vec!["k1", "k2", "k3", "k4", "k5"]);
    }

    #[test]
    fn parses_json_array() {
        let got = parse_keys_text(r#"["k1", "k2"]"#).unwrap();
        assert_eq!(got, vec!["k1", "k2"]);
    }

    #[test]
    fn rejects_too_short_key() {
        assert!(validate_key_format("abc").is_err());
    }

    #[test]
    fn rejects_bad_charset() {
        assert!(validate_key_format("valid key with space").is_err());
    }

    #[test]
    fn accepts_typical_key() {
        assert!(validate_key_format("sk-abcDEF123_456.789").is_ok());
    }
}
