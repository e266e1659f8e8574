//! Parsing of raw QR payloads into identity lookup keys.
//!
//! Accepted forms:
//! - `rollcall:<participant_id>`
//! - `rollcall:acct:<account_id>`
//! - a JSON object carrying `participant_id` or `account_id`
//! - any other bare token, taken as a participant id

use serde::Deserialize;
use thiserror::Error;

const URI_PREFIX: &str = "rollcall:";
const ACCOUNT_PREFIX: &str = "acct:";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QrError {
    #[error("empty QR payload")]
    Empty,
    #[error("QR payload has no identity key: {0}")]
    MissingKey(String),
}

/// Which roster key a scanned code refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QrKey {
    Participant(String),
    Account(String),
}

#[derive(Deserialize)]
struct JsonCode {
    #[serde(default)]
    participant_id: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

pub fn parse_code(raw: &str) -> Result<QrKey, QrError> {
    let code = raw.trim();
    if code.is_empty() {
        return Err(QrError::Empty);
    }

    if code.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<JsonCode>(code) {
            return match (non_empty(json.participant_id), non_empty(json.account_id)) {
                (Some(id), _) => Ok(QrKey::Participant(id)),
                (None, Some(account)) => Ok(QrKey::Account(account)),
                (None, None) => Err(QrError::MissingKey(code.to_string())),
            };
        }
    }

    if let Some(rest) = code.strip_prefix(URI_PREFIX) {
        let (key, value) = match rest.strip_prefix(ACCOUNT_PREFIX) {
            Some(account) => (QrKey::Account(account.trim().to_string()), account),
            None => (QrKey::Participant(rest.trim().to_string()), rest),
        };
        if value.trim().is_empty() {
            return Err(QrError::MissingKey(code.to_string()));
        }
        return Ok(key);
    }

    Ok(QrKey::Participant(code.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
