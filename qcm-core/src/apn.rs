//! Carrier APN lookup by MCC/MNC.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::profile::{ApnSettings, AuthMode};

/// Resolves APN settings for the SIM's home network.
pub trait ApnResolver: Send + Sync {
    fn lookup(&self, mcc: &str, mnc: &str) -> Option<ApnSettings>;
}

/// Split an IMSI into its 3 digit MCC and 2 digit MNC.
pub fn home_network(imsi: &str) -> Option<(&str, &str)> {
    if imsi.len() < 5 || !imsi.is_char_boundary(5) || !imsi[..5].bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((&imsi[..3], &imsi[3..5]))
}

#[derive(Debug, Clone, Deserialize)]
struct ApnEntry {
    mcc: String,
    mnc: String,
    apn: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<AuthMode>,
}

/// JSON carrier database: an array of `{mcc, mnc, apn, user?, password?, auth?}`.
#[derive(Debug, Clone, Default)]
pub struct ApnDatabase {
    entries: Vec<ApnEntry>,
}

impl ApnDatabase {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read APN database {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid APN database {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let entries: Vec<ApnEntry> = serde_json::from_str(text)?;
        debug!("Loaded {} APN entries", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ApnResolver for ApnDatabase {
    /// First matching entry that is not an MMS APN.
    fn lookup(&self, mcc: &str, mnc: &str) -> Option<ApnSettings> {
        self.entries
            .iter()
            .filter(|e| e.mcc == mcc && e.mnc == mnc)
            .find(|e| !e.apn.to_ascii_lowercase().contains("mms"))
            .map(|e| ApnSettings {
                apn: Some(e.apn.clone()),
                user: e.user.clone(),
                password: e.password.clone(),
                auth: e.auth.unwrap_or_default(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: &str = r#"[
        {"mcc": "460", "mnc": "01", "apn": "3gwap"},
        {"mcc": "460", "mnc": "01", "apn": "mms.3gnet"},
        {"mcc": "460", "mnc": "01", "apn": "3gnet", "user": "carl", "password": "1234", "auth": "chap"},
        {"mcc": "310", "mnc": "26", "apn": "fast.t-mobile.com"}
    ]"#;

    #[test]
    fn test_home_network_from_imsi() {
        assert_eq!(home_network("460011234567890"), Some(("460", "01")));
        assert_eq!(home_network("4600"), None);
        assert_eq!(home_network("46a011234567890"), None);
    }

    #[test]
    fn test_lookup_skips_mms() -> Result<()> {
        let db = ApnDatabase::from_json(
            r#"[{"mcc": "460", "mnc": "01", "apn": "mms.3gnet"},
                {"mcc": "460", "mnc": "01", "apn": "3gnet", "user": "carl", "password": "1234", "auth": "chap"}]"#,
        )?;
        let settings = db.lookup("460", "01").context("no match")?;
        assert_eq!(settings.apn.as_deref(), Some("3gnet"));
        assert_eq!(settings.auth, AuthMode::Chap);
        assert!(settings.has_credentials());
        Ok(())
    }

    #[test]
    fn test_lookup_first_match_and_miss() -> Result<()> {
        let db = ApnDatabase::from_json(DB)?;
        assert_eq!(db.len(), 4);
        let settings = db.lookup("460", "01").context("no match")?;
        assert_eq!(settings.apn.as_deref(), Some("3gwap"));
        assert_eq!(settings.auth, AuthMode::None);
        assert!(db.lookup("262", "01").is_none());
        Ok(())
    }

    #[test]
    fn test_malformed_database() {
        assert!(ApnDatabase::from_json(r#"[{"mcc": "460"}]"#).is_err());
    }
}
