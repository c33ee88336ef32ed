/// Record lifecycle rules
///
/// Expiration is fixed when a record is written; state is recomputed from the
/// clock and counters on every read and never stored.

use crate::config::ShortIdConfig;
use crate::error::Verdict;
use crate::record::{Record, UrlRequest};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use url::Url;

/// Outcome of resolving a short id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The record is active; go to its target
    Redirect(String),
    /// The record exists but must not resolve; go to the fallback if any
    Fallback {
        verdict: Verdict,
        target: Option<String>,
    },
}

impl Resolution {
    /// Where the caller should be sent, if anywhere
    pub fn target(&self) -> Option<&str> {
        match self {
            Resolution::Redirect(url) => Some(url),
            Resolution::Fallback { target, .. } => target.as_deref(),
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Resolution::Redirect(_) => None,
            Resolution::Fallback { verdict, .. } => Some(*verdict),
        }
    }
}

/// Parse `raw` as an absolute url with a host and return its normalized form
pub fn normalize_url(raw: &str) -> Result<String> {
    let invalid = |reason: String| Error::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url.into()),
        _ => Err(invalid("empty hostname in url".to_string())),
    }
}

pub(crate) fn normalize_optional_url(raw: &str) -> Result<String> {
    if raw.trim().is_empty() {
        Ok(String::new())
    } else {
        normalize_url(raw)
    }
}

/// Expiration of a record active from `active_from`.
///
/// None when neither a ttl nor an explicit date is given; otherwise the later
/// of `active_from + ttl` and `expires_on`.
pub fn calculate_expiration(
    active_from: DateTime<Utc>,
    ttl: u64,
    expires_on: Option<DateTime<Utc>>,
) -> Result<Option<DateTime<Utc>>> {
    if ttl == 0 && expires_on.is_none() {
        return Ok(None);
    }

    let candidate = i64::try_from(ttl)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| active_from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    match expires_on {
        Some(explicit) if active_from > explicit => Err(Error::SubmittedAlreadyExpired),
        Some(explicit) => Ok(Some(candidate.max(explicit))),
        None => Ok(Some(candidate)),
    }
}

/// State of `record` at `now`; None when it resolves normally.
///
/// Inactive wins over expired, expired wins over exhausted.
pub fn evaluate(record: &Record, now: DateTime<Utc>) -> Option<Verdict> {
    if now < record.active_from {
        return Some(Verdict::Inactive);
    }
    if record.expires_on.is_some_and(|exp| now >= exp) {
        return Some(Verdict::Expired);
    }
    if record.resolve_limit > 0 && record.resolve_count > record.resolve_limit {
        return Some(Verdict::Exhausted);
    }
    None
}

/// Resolution for `record` given its verdict
pub fn resolution(record: &Record, verdict: Option<Verdict>, config: &ShortIdConfig) -> Resolution {
    let Some(verdict) = verdict else {
        return Resolution::Redirect(record.redirect_url.clone());
    };
    let (local, global) = match verdict {
        Verdict::Inactive => (&record.inactive_redirect_url, &config.inactive_redirect_url),
        Verdict::Expired => (&record.expired_redirect_url, &config.expired_redirect_url),
        Verdict::Exhausted => (&record.exhausted_redirect_url, &config.exhausted_redirect_url),
    };
    let target = if local.is_empty() {
        global.clone().filter(|url| !url.is_empty())
    } else {
        Some(local.clone())
    };
    Resolution::Fallback { verdict, target }
}

/// Build a record from a request at `now`.
///
/// The id is trimmed but left empty when not supplied. Request values take
/// precedence; the configured ttl and expiration apply only when the request
/// sets neither.
pub fn build_record(request: &UrlRequest, config: &ShortIdConfig, now: DateTime<Utc>) -> Result<Record> {
    let mut record = Record::new(request.id.trim(), normalize_url(&request.url)?, now);
    record.exhausted_redirect_url = normalize_optional_url(&request.exhausted_url)?;
    record.expired_redirect_url = normalize_optional_url(&request.expired_url)?;
    record.inactive_redirect_url = normalize_optional_url(&request.inactive_url)?;

    record.active_from = request.active_from.map_or(now, |from| from.max(now));

    let (ttl, expire_on) = if request.ttl == 0 && request.expire_on.is_none() {
        (config.ttl, config.expire_on)
    } else {
        (request.ttl, request.expire_on)
    };
    record.ttl = ttl;
    record.expires_on = calculate_expiration(record.active_from, ttl, expire_on)?;

    record.resolve_limit = if request.max_requests > 0 {
        request.max_requests
    } else {
        config.max_requests
    };

    Ok(record)
}

/// Check a caller-supplied id against the alphabet and length policy
pub fn check_id_policy(id: &str, config: &ShortIdConfig) -> Result<()> {
    let violation = |reason: String| Error::IdConstraintViolation {
        id: id.to_string(),
        reason,
    };
    if config.enforce_alphabet {
        if let Some(c) = id.chars().find(|c| !config.alphabet.contains(*c)) {
            return Err(violation(format!("character {:?} is not in the alphabet", c)));
        }
    }
    if config.enforce_length && id.chars().count() != config.length {
        return Err(violation(format!(
            "length is {}, required {}",
            id.chars().count(),
            config.length
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn secs(s: i64) -> Duration {
        Duration::seconds(s)
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com/");
        assert_eq!(
            normalize_url("  https://Example.com/a?b=c ").unwrap(),
            "https://example.com/a?b=c"
        );
        assert!(matches!(normalize_url("example.com"), Err(Error::InvalidUrl { .. })));
        assert!(normalize_url("mailto:someone@example.com").is_err());
        assert!(normalize_url("").is_err());
    }

    #[test]
    fn test_expiration_rules() {
        assert_eq!(calculate_expiration(t0(), 0, None).unwrap(), None);
        assert_eq!(calculate_expiration(t0(), 60, None).unwrap(), Some(t0() + secs(60)));

        // explicit date later than ttl wins
        let later = t0() + secs(600);
        assert_eq!(calculate_expiration(t0(), 60, Some(later)).unwrap(), Some(later));
        // ttl later than explicit date wins
        let sooner = t0() + secs(10);
        assert_eq!(
            calculate_expiration(t0(), 60, Some(sooner)).unwrap(),
            Some(t0() + secs(60))
        );

        assert!(matches!(
            calculate_expiration(t0(), 60, Some(t0() - secs(1))),
            Err(Error::SubmittedAlreadyExpired)
        ));
        assert_eq!(
            calculate_expiration(t0(), u64::MAX, None).unwrap(),
            Some(DateTime::<Utc>::MAX_UTC)
        );
    }

    #[test]
    fn test_evaluation_order() {
        let mut record = Record::new("abc", "https://a.com/", t0());
        record.active_from = t0() + secs(100);
        record.expires_on = Some(t0() + secs(50));
        record.resolve_limit = 1;
        record.resolve_count = 5;

        assert_eq!(evaluate(&record, t0()), Some(Verdict::Inactive));
        assert_eq!(evaluate(&record, t0() + secs(200)), Some(Verdict::Expired));

        record.expires_on = None;
        assert_eq!(evaluate(&record, t0() + secs(200)), Some(Verdict::Exhausted));

        record.resolve_count = 1;
        assert_eq!(evaluate(&record, t0() + secs(200)), None);
    }

    #[test]
    fn test_expired_at_boundary() {
        let mut record = Record::new("abc", "https://a.com/", t0());
        record.expires_on = Some(t0() + secs(10));
        assert_eq!(evaluate(&record, t0() + secs(9)), None);
        assert_eq!(evaluate(&record, t0() + secs(10)), Some(Verdict::Expired));
    }

    #[test]
    fn test_fallback_prefers_record_url() {
        let config = ShortIdConfig {
            exhausted_redirect_url: Some("https://global.com/exhausted".to_string()),
            inactive_redirect_url: None,
            ..Default::default()
        };
        let mut record = Record::new("abc", "https://a.com/", t0());

        assert_eq!(
            resolution(&record, None, &config),
            Resolution::Redirect("https://a.com/".to_string())
        );
        let res = resolution(&record, Some(Verdict::Exhausted), &config);
        assert_eq!(res.target(), Some("https://global.com/exhausted"));
        assert_eq!(res.verdict(), Some(Verdict::Exhausted));

        record.exhausted_redirect_url = "https://local.com/".to_string();
        let res = resolution(&record, Some(Verdict::Exhausted), &config);
        assert_eq!(res.target(), Some("https://local.com/"));

        let res = resolution(&record, Some(Verdict::Inactive), &config);
        assert_eq!(res.target(), None);
    }

    #[test]
    fn test_build_record_defaults() {
        let config = ShortIdConfig {
            ttl: 30,
            max_requests: 7,
            ..Default::default()
        };

        let record = build_record(&UrlRequest::new("https://a.com"), &config, t0()).unwrap();
        assert!(record.id.is_empty());
        assert_eq!(record.redirect_url, "https://a.com/");
        assert_eq!(record.active_from, t0());
        assert_eq!(record.expires_on, Some(t0() + secs(30)));
        assert_eq!(record.ttl, 30);
        assert_eq!(record.resolve_limit, 7);

        // local values take precedence over the global pair
        let request = UrlRequest::new("https://a.com")
            .with_id("  mine ")
            .with_expire_on(t0() + secs(5))
            .with_max_requests(2);
        let record = build_record(&request, &config, t0()).unwrap();
        assert_eq!(record.id, "mine");
        assert_eq!(record.ttl, 0);
        assert_eq!(record.expires_on, Some(t0() + secs(5)));
        assert_eq!(record.resolve_limit, 2);
    }

    #[test]
    fn test_build_record_activation() {
        let config = ShortIdConfig::default();

        // activation in the past is pulled up to now
        let request = UrlRequest::new("https://a.com").with_active_from(t0() - secs(100));
        assert_eq!(build_record(&request, &config, t0()).unwrap().active_from, t0());

        let request = UrlRequest::new("https://a.com")
            .with_active_from(t0() + secs(100))
            .with_ttl(10);
        let record = build_record(&request, &config, t0()).unwrap();
        assert_eq!(record.active_from, t0() + secs(100));
        assert_eq!(record.expires_on, Some(t0() + secs(110)));

        let request = UrlRequest::new("https://a.com")
            .with_active_from(t0() + secs(100))
            .with_expire_on(t0() + secs(50));
        assert!(matches!(
            build_record(&request, &config, t0()),
            Err(Error::SubmittedAlreadyExpired)
        ));
    }

    #[test]
    fn test_build_record_validates_urls() {
        let config = ShortIdConfig::default();
        assert!(build_record(&UrlRequest::new("nope"), &config, t0()).is_err());
        let request = UrlRequest::new("https://a.com").with_expired_url("also nope");
        assert!(matches!(
            build_record(&request, &config, t0()),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_id_policy() {
        let config = ShortIdConfig {
            alphabet: "abc".to_string(),
            length: 3,
            ..Default::default()
        };
        assert!(check_id_policy("abc", &config).is_ok());
        assert!(matches!(
            check_id_policy("abz", &config),
            Err(Error::IdConstraintViolation { .. })
        ));
        assert!(check_id_policy("abca", &config).is_err());

        let relaxed = ShortIdConfig {
            enforce_alphabet: false,
            enforce_length: false,
            ..config
        };
        assert!(check_id_policy("anything-goes", &relaxed).is_ok());
    }

    proptest! {
        #[test]
        fn test_expiration_is_monotonic(
            ttl in 0u64..1_000_000,
            extra_ttl in 0u64..1_000_000,
            explicit in proptest::option::of(0i64..2_000_000),
            extra_explicit in 0i64..1_000_000,
        ) {
            let explicit = explicit.map(|s| t0() + secs(s));
            let base = calculate_expiration(t0(), ttl, explicit).unwrap();

            let more_ttl = calculate_expiration(t0(), ttl + extra_ttl, explicit).unwrap();
            prop_assert!(more_ttl >= base);

            if let Some(e) = explicit {
                let later = calculate_expiration(t0(), ttl, Some(e + secs(extra_explicit))).unwrap();
                prop_assert!(later >= base);
            }
        }

        #[test]
        fn test_unlimited_records_never_exhaust(gets in 0usize..500) {
            let mut record = Record::new("abc", "https://a.com/", t0());
            for _ in 0..gets {
                record.register_hit(t0());
                prop_assert_ne!(evaluate(&record, t0()), Some(Verdict::Exhausted));
            }
        }
    }
}
