use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::KindSection;

pub const MASK_SUFFIX: &str = "...";

/// `created_at` layout of documents written before timestamps carried a zone.
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Outbound relay towards a third-party ingest endpoint.
    #[default]
    Relay,
    /// Inbound capture of a live source the operator is logged into.
    Capture,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Relay => "relay",
            SessionKind::Capture => "capture",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relay" => Ok(SessionKind::Relay),
            "capture" => Ok(SessionKind::Capture),
            other => Err(format!("unknown session kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn from_presence(present: bool) -> Self {
        if present {
            SessionStatus::Running
        } else {
            SessionStatus::Stopped
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One declared streaming job. `status` is a cache of the supervisor's view
/// and is only meaningful right after reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSession {
    pub id: String,
    pub session_name: String,
    #[serde(default)]
    pub kind: SessionKind,
    #[serde(alias = "name")]
    pub display_name: String,
    #[serde(rename = "credential", alias = "stream_key")]
    pub credential_masked: String,
    pub source_url: String,
    #[serde(deserialize_with = "deserialize_created_at")]
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl StreamSession {
    pub fn new(
        id: String,
        kind: SessionKind,
        kind_config: &KindSection,
        display_name: Option<&str>,
        credential: &str,
        source_url: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{} {}", kind_config.label, created_at.format("%H:%M:%S"))
            });
        Self {
            session_name: session_name_for(&kind_config.prefix, &id),
            id,
            kind,
            display_name,
            credential_masked: mask_credential(credential, kind_config.mask_prefix_len),
            source_url,
            created_at,
            status: SessionStatus::Starting,
        }
    }
}

/// Accepts RFC 3339 and the zone-less legacy layout, the latter read as UTC.
pub fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, LEGACY_TIMESTAMP_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|err| format!("unrecognised created_at {raw:?}: {err}"))
}

fn deserialize_created_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_created_at(&raw).map_err(serde::de::Error::custom)
}

pub fn session_name_for(prefix: &str, id: &str) -> String {
    format!("{prefix}_{id}")
}

/// Keeps `prefix_len` leading characters followed by `...`. Credentials
/// shorter than the prefix keep only their first half.
pub fn mask_credential(credential: &str, prefix_len: usize) -> String {
    let total = credential.chars().count();
    let keep = if total >= prefix_len {
        prefix_len
    } else {
        total / 2
    };
    let mut masked: String = credential.chars().take(keep).collect();
    masked.push_str(MASK_SUFFIX);
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn kind_config() -> KindSection {
        KindSection {
            prefix: "relay".into(),
            label: "relay".into(),
            mask_prefix_len: 10,
            ingest_base: None,
        }
    }

    #[test]
    fn masks_long_credentials_to_exact_prefix() {
        assert_eq!(mask_credential("FB-1234567890-abcdef", 10), "FB-1234567...");
        assert_eq!(mask_credential("ABCDEFGHIJK", 10), "ABCDEFGHIJ...");
    }

    #[test]
    fn masks_short_credentials_deterministically() {
        assert_eq!(mask_credential("ABCDEFGHIJ", 10), "ABCDEFGHIJ...");
        assert_eq!(mask_credential("ABCDEFGHI", 10), "ABCD...");
        assert_eq!(mask_credential("abc", 10), "a...");
        assert_eq!(mask_credential("a", 10), "...");
        assert_eq!(mask_credential("abc", 10), mask_credential("abc", 10));
    }

    #[test]
    fn masking_counts_characters_not_bytes() {
        assert_eq!(mask_credential("ключключключ", 4), "ключ...");
    }

    #[test]
    fn new_session_derives_name_and_defaults() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let session = StreamSession::new(
            "1a2b3c4d".into(),
            SessionKind::Relay,
            &kind_config(),
            Some("   "),
            "rtmps://live-api-s.example.com:443/rtmp/FB-secret-key",
            "http://example.com/live.ts".into(),
            created,
        );
        assert_eq!(session.session_name, "relay_1a2b3c4d");
        assert_eq!(session.display_name, "relay 13:04:05");
        assert_eq!(session.credential_masked, "rtmps://li...");
        assert_eq!(session.status, SessionStatus::Starting);
    }

    #[test]
    fn reads_documents_written_with_legacy_field_names() {
        let raw = r#"{
            "id": "deadbeef",
            "session_name": "fbstream_deadbeef",
            "name": "evening show",
            "stream_key": "FB-1234567...",
            "source_url": "http://example.com/a.ts",
            "created_at": "2024-05-01 10:00:00",
            "status": "running"
        }"#;
        let session: StreamSession = serde_json::from_str(raw).unwrap();
        assert_eq!(
            session.created_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(session.kind, SessionKind::Relay);
        assert_eq!(session.display_name, "evening show");
        assert_eq!(session.credential_masked, "FB-1234567...");
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[test]
    fn created_at_round_trips_and_rejects_garbage() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let session = StreamSession::new(
            "1a2b3c4d".into(),
            SessionKind::Capture,
            &kind_config(),
            None,
            "rtmp://ingest.example.com/live/key",
            "http://example.com/live.ts".into(),
            created,
        );
        let encoded = serde_json::to_string(&session).unwrap();
        let decoded: StreamSession = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, session);
        assert!(parse_created_at("yesterday").is_err());
    }
}
