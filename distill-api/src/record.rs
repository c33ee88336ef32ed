/// Short id records and the requests that create them
///
/// Records are stored bincode-encoded under their `Record` key. The CSV row
/// layout is the interchange format for backups and must keep its column
/// order.

use crate::lifecycle::{normalize_optional_url, normalize_url};
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Number of columns in a record CSV row
pub const RECORD_CSV_COLUMNS: usize = 9;

/// Column names of a record CSV row, in order
pub const RECORD_CSV_HEADER: [&str; RECORD_CSV_COLUMNS] = [
    "id",
    "redirect_url",
    "recorded_on",
    "hits",
    "resolve_limit",
    "exhausted_redirect_url",
    "ttl",
    "expires_on",
    "expired_redirect_url",
];

/// A short id mapped to its target url
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub redirect_url: String,
    /// Creation time, never changes
    pub recorded_on: DateTime<Utc>,
    /// The record does not resolve before this point
    pub active_from: DateTime<Utc>,
    /// The record does not resolve at or after this point (None = never)
    pub expires_on: Option<DateTime<Utc>>,
    /// Seconds after `active_from` the record was given to live (0 = none)
    pub ttl: u64,
    /// Successful resolutions allowed (0 = unlimited)
    pub resolve_limit: u64,
    /// Every lookup through `get`
    pub hits: u64,
    /// Lookups while the record was in its active window
    pub resolve_count: u64,
    /// Per-record fallbacks; empty means the configured default applies
    pub expired_redirect_url: String,
    pub exhausted_redirect_url: String,
    pub inactive_redirect_url: String,
}

impl Record {
    /// A record that is active from `recorded_on` with no limits
    pub fn new(id: impl Into<String>, redirect_url: impl Into<String>, recorded_on: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            redirect_url: redirect_url.into(),
            recorded_on,
            active_from: recorded_on,
            expires_on: None,
            ttl: 0,
            resolve_limit: 0,
            hits: 0,
            resolve_count: 0,
            expired_redirect_url: String::new(),
            exhausted_redirect_url: String::new(),
            inactive_redirect_url: String::new(),
        }
    }

    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn unmarshal_binary(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Whether `now` falls inside the active window
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.active_from && self.expires_on.map_or(true, |exp| now < exp)
    }

    /// Count one lookup at `now`.
    ///
    /// `hits` always moves; `resolve_count` only moves inside the active
    /// window and is pinned to the limit first, so it never exceeds
    /// `resolve_limit + 1`.
    pub fn register_hit(&mut self, now: DateTime<Utc>) {
        self.hits = self.hits.saturating_add(1);
        if self.is_live_at(now) {
            if self.resolve_limit > 0 {
                self.resolve_count = self.resolve_count.min(self.resolve_limit);
            }
            self.resolve_count = self.resolve_count.saturating_add(1);
        }
    }

    /// Marshal into the fixed CSV column order
    pub fn to_csv_row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.redirect_url.clone(),
            format_time(Some(self.recorded_on)),
            format_u64(self.hits),
            format_u64(self.resolve_limit),
            self.exhausted_redirect_url.clone(),
            format_u64(self.ttl),
            format_time(self.expires_on),
            self.expired_redirect_url.clone(),
        ]
    }

    /// Unmarshal a CSV row written by [`Record::to_csv_row`].
    ///
    /// Urls are validated the way [`UrlRequest`] urls are.
    /// The row does not carry `active_from`, `resolve_count` or the inactive
    /// fallback; they are rebuilt from `recorded_on` and `hits`.
    pub fn from_csv_row(fields: &[String]) -> std::result::Result<Self, String> {
        if fields.len() != RECORD_CSV_COLUMNS {
            return Err(format!(
                "expected {} columns, found {}",
                RECORD_CSV_COLUMNS,
                fields.len()
            ));
        }
        let id = fields[0].trim();
        if id.is_empty() {
            return Err("empty id".to_string());
        }
        let url = |i: usize| normalize_url(&fields[i]).map_err(|e| e.to_string());
        let fallback_url = |i: usize| normalize_optional_url(&fields[i]).map_err(|e| e.to_string());
        let recorded_on = parse_time(&fields[2], "recorded_on")?
            .ok_or_else(|| "recorded_on is required".to_string())?;
        let hits = parse_u64(&fields[3], "hits")?;
        let resolve_limit = parse_u64(&fields[4], "resolve_limit")?;
        let resolve_count = if resolve_limit > 0 {
            hits.min(resolve_limit.saturating_add(1))
        } else {
            hits
        };

        Ok(Self {
            id: id.to_string(),
            redirect_url: url(1)?,
            recorded_on,
            active_from: recorded_on,
            expires_on: parse_time(&fields[7], "expires_on")?,
            ttl: parse_u64(&fields[6], "ttl")?,
            resolve_limit,
            hits,
            resolve_count,
            expired_redirect_url: fallback_url(8)?,
            exhausted_redirect_url: fallback_url(5)?,
            inactive_redirect_url: String::new(),
        })
    }
}

/// A request to shorten a url
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRequest {
    /// Caller-chosen id; empty to generate one
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub max_requests: u64,
    /// Seconds to live after activation
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub expire_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exhausted_url: String,
    #[serde(default)]
    pub expired_url: String,
    #[serde(default)]
    pub inactive_url: String,
}

impl UrlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_expire_on(mut self, expire_on: DateTime<Utc>) -> Self {
        self.expire_on = Some(expire_on);
        self
    }

    pub fn with_active_from(mut self, active_from: DateTime<Utc>) -> Self {
        self.active_from = Some(active_from);
        self
    }

    pub fn with_exhausted_url(mut self, url: impl Into<String>) -> Self {
        self.exhausted_url = url.into();
        self
    }

    pub fn with_expired_url(mut self, url: impl Into<String>) -> Self {
        self.expired_url = url.into();
        self
    }

    pub fn with_inactive_url(mut self, url: impl Into<String>) -> Self {
        self.inactive_url = url.into();
        self
    }

    /// Parse an import row: `url,id,max_requests,ttl,expire_on`.
    ///
    /// Only the url is mandatory; missing trailing columns take defaults.
    pub fn from_csv_row(fields: &[String]) -> std::result::Result<Self, String> {
        let url = fields
            .first()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "missing url".to_string())?;
        let field = |i: usize| fields.get(i).map(String::as_str).unwrap_or("");

        Ok(Self {
            url: url.to_string(),
            id: field(1).trim().to_string(),
            max_requests: parse_u64(field(2), "max_requests")?,
            ttl: parse_u64(field(3), "ttl")?,
            expire_on: parse_time(field(4), "expire_on")?,
            ..Default::default()
        })
    }
}

fn format_u64(value: u64) -> String {
    if value == 0 {
        String::new()
    } else {
        value.to_string()
    }
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_default()
}

fn parse_u64(raw: &str, column: &str) -> std::result::Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse()
        .map_err(|e| format!("invalid {} {:?}: {}", column, raw, e))
}

fn parse_time(raw: &str, column: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| format!("invalid {} {:?}: {}", column, raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn strings(row: &[&str]) -> Vec<String> {
        row.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_csv_row_layout() {
        let mut record = Record::new("abc123", "https://example.com/a", base_time());
        record.hits = 4;
        record.resolve_limit = 10;
        record.ttl = 60;
        record.expires_on = Some(base_time() + Duration::seconds(60));
        record.exhausted_redirect_url = "https://example.com/x".to_string();

        let row = record.to_csv_row();
        assert_eq!(row.len(), RECORD_CSV_COLUMNS);
        assert_eq!(row[0], "abc123");
        assert_eq!(row[2], "2024-03-01T12:00:00Z");
        assert_eq!(row[3], "4");
        assert_eq!(row[4], "10");
        assert_eq!(row[5], "https://example.com/x");
        assert_eq!(row[6], "60");
        assert_eq!(row[7], "2024-03-01T12:01:00Z");
        assert_eq!(row[8], "");
    }

    #[test]
    fn test_csv_restore_puts_expiration_back() {
        let row = strings(&[
            "abc123",
            "https://example.com/a",
            "2024-03-01T12:00:00Z",
            "",
            "",
            "",
            "",
            "2024-04-01T00:00:00Z",
            "",
        ]);
        let record = Record::from_csv_row(&row).unwrap();
        assert_eq!(record.recorded_on, base_time());
        assert_eq!(
            record.expires_on,
            Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(record.hits, 0);
    }

    #[test]
    fn test_csv_restore_rejects_bad_rows() {
        assert!(Record::from_csv_row(&strings(&["a", "b"])).is_err());
        let mut row = Record::new("abc", "https://e.com", base_time()).to_csv_row();
        row[3] = "many".to_string();
        assert!(Record::from_csv_row(&row).is_err());
        row[3] = String::new();
        row[2] = String::new();
        assert!(Record::from_csv_row(&row).is_err());
        // restored urls pass the same checks as new ones
        let mut row = Record::new("abc", "https://e.com/", base_time()).to_csv_row();
        row[1] = "javascript:alert(1)".to_string();
        assert!(Record::from_csv_row(&row).is_err());
        row[1] = "https://e.com/".to_string();
        row[8] = "not a url".to_string();
        assert!(Record::from_csv_row(&row).is_err());
        row[8] = String::new();
        row[1] = String::new();
        assert!(Record::from_csv_row(&row).is_err());
    }

    #[test]
    fn test_request_row_defaults() {
        let req = UrlRequest::from_csv_row(&strings(&["https://example.com"])).unwrap();
        assert_eq!(req.url, "https://example.com");
        assert!(req.id.is_empty());
        assert_eq!(req.max_requests, 0);

        let req = UrlRequest::from_csv_row(&strings(&[
            "https://example.com",
            " myid ",
            "3",
            "120",
            "2030-01-01T00:00:00Z",
        ]))
        .unwrap();
        assert_eq!(req.id, "myid");
        assert_eq!(req.max_requests, 3);
        assert_eq!(req.ttl, 120);
        assert!(req.expire_on.is_some());

        assert!(UrlRequest::from_csv_row(&strings(&[""])).is_err());
        assert!(UrlRequest::from_csv_row(&strings(&["https://e.com", "", "x"])).is_err());
    }

    #[test]
    fn test_register_hit_window() {
        let start = base_time();
        let mut record = Record::new("abc", "https://e.com", start);
        record.active_from = start + Duration::seconds(10);
        record.expires_on = Some(start + Duration::seconds(20));

        record.register_hit(start);
        assert_eq!((record.hits, record.resolve_count), (1, 0));
        record.register_hit(start + Duration::seconds(15));
        assert_eq!((record.hits, record.resolve_count), (2, 1));
        record.register_hit(start + Duration::seconds(20));
        assert_eq!((record.hits, record.resolve_count), (3, 1));
    }

    #[test]
    fn test_register_hit_pins_to_limit() {
        let mut record = Record::new("abc", "https://e.com", base_time());
        record.resolve_limit = 2;
        for _ in 0..10 {
            record.register_hit(base_time());
        }
        assert_eq!(record.hits, 10);
        assert_eq!(record.resolve_count, 3);
    }

    prop_compose! {
        fn arb_time()(secs in 0i64..4_000_000_000, nanos in 0u32..1_000_000_000) -> DateTime<Utc> {
            Utc.timestamp_opt(secs, nanos).unwrap()
        }
    }

    prop_compose! {
        fn arb_record()(
            id in "[a-zA-Z0-9]{1,12}",
            redirect_url in "https://[a-z]{1,10}\\.com/[a-z0-9]{0,8}",
            recorded_on in arb_time(),
            expires_on in proptest::option::of(arb_time()),
            ttl in any::<u64>(),
            resolve_limit in any::<u64>(),
            hits in any::<u64>(),
            resolve_count in any::<u64>(),
            expired in "(https://[a-z]{1,8}\\.org/)?",
            exhausted in "(https://[a-z]{1,8}\\.org/)?",
            inactive in "(https://[a-z]{1,8}\\.org/)?",
        ) -> Record {
            Record {
                id,
                redirect_url,
                recorded_on,
                active_from: recorded_on,
                expires_on,
                ttl,
                resolve_limit,
                hits,
                resolve_count,
                expired_redirect_url: expired,
                exhausted_redirect_url: exhausted,
                inactive_redirect_url: inactive,
            }
        }
    }

    proptest! {
        #[test]
        fn test_binary_roundtrip(record in arb_record()) {
            let bytes = record.marshal_binary().unwrap();
            prop_assert_eq!(Record::unmarshal_binary(&bytes).unwrap(), record);
        }

        #[test]
        fn test_csv_roundtrip_keeps_exported_fields(record in arb_record()) {
            let restored = Record::from_csv_row(&record.to_csv_row()).unwrap();
            prop_assert_eq!(&restored.id, &record.id);
            prop_assert_eq!(&restored.redirect_url, &record.redirect_url);
            prop_assert_eq!(restored.recorded_on, record.recorded_on);
            prop_assert_eq!(restored.expires_on, record.expires_on);
            prop_assert_eq!(restored.ttl, record.ttl);
            prop_assert_eq!(restored.resolve_limit, record.resolve_limit);
            prop_assert_eq!(restored.hits, record.hits);
            prop_assert_eq!(&restored.expired_redirect_url, &record.expired_redirect_url);
            prop_assert_eq!(&restored.exhausted_redirect_url, &record.exhausted_redirect_url);
        }
    }
}
