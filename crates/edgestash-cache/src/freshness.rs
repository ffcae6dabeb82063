use crate::key::{parse_vary, VarySpec};
use http::header::{CACHE_CONTROL, EXPIRES};
use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// Default freshness window for responses that carry no explicit lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Verdict for one origin response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub cacheable: bool,
    pub expires_at: SystemTime,
}

/// Computes how long a response may be served from the store.
///
/// Lifetime precedence:
/// 1. `Cache-Control: s-maxage=N`, then `max-age=N` → `now + N`
/// 2. `Expires: <http-date>` → that instant (never earlier than `now`)
/// 3. otherwise `now + default_ttl`
///
/// Status codes play no part: a 404 is stored exactly like a 200. Malformed
/// directives and dates are ignored and fall through to the next rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub default_ttl: Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl FreshnessPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self { default_ttl }
    }

    pub fn evaluate(&self, headers: &HeaderMap, now: SystemTime) -> Freshness {
        let cc = cache_control(headers);

        if cc.restricted || parse_vary(headers) == VarySpec::Any {
            return Freshness {
                cacheable: false,
                expires_at: now,
            };
        }

        if let Some(expires_at) = cc.lifetime().and_then(|ttl| now.checked_add(ttl)) {
            return Freshness {
                cacheable: true,
                expires_at,
            };
        }

        if let Some(expires) = expires(headers) {
            return Freshness {
                cacheable: true,
                expires_at: expires.max(now),
            };
        }

        Freshness {
            cacheable: true,
            expires_at: now.checked_add(self.default_ttl).unwrap_or(now),
        }
    }
}

/// Parsed `Cache-Control` directives relevant to a shared cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store`, `no-cache` or `private` was present.
    pub restricted: bool,
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
}

impl CacheControl {
    /// The lifetime a shared cache should use: `s-maxage` over `max-age`.
    pub fn lifetime(&self) -> Option<Duration> {
        self.s_maxage.or(self.max_age)
    }
}

/// Parse a Cache-Control header value.
pub fn parse_cache_control(value: &str) -> CacheControl {
    let mut result = CacheControl::default();

    for directive in value.split(',').map(|s| s.trim().to_ascii_lowercase()) {
        let (name, arg) = match directive.split_once('=') {
            Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
            None => (directive.as_str(), None),
        };

        match (name, arg) {
            ("no-store" | "no-cache" | "private", _) => result.restricted = true,
            ("max-age", Some(arg)) => {
                if let Ok(secs) = arg.parse::<u64>() {
                    result.max_age = Some(Duration::from_secs(secs));
                }
            }
            ("s-maxage", Some(arg)) => {
                if let Ok(secs) = arg.parse::<u64>() {
                    result.s_maxage = Some(Duration::from_secs(secs));
                }
            }
            _ => {}
        }
    }

    result
}

fn cache_control(headers: &HeaderMap) -> CacheControl {
    let joined: Vec<String> = headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_owned)
        .collect();
    parse_cache_control(&joined.join(","))
}

fn expires(headers: &HeaderMap) -> Option<SystemTime> {
    let value = headers.get(EXPIRES)?.to_str().ok()?;
    httpdate::parse_http_date(value.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::VARY;
    use http::HeaderValue;
    use std::time::UNIX_EPOCH;

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn http_date(at: SystemTime) -> String {
        httpdate::fmt_http_date(at)
    }

    #[test]
    fn no_headers_uses_default_ttl() {
        let policy = FreshnessPolicy::new(Duration::from_secs(120));
        let verdict = policy.evaluate(&HeaderMap::new(), now());
        assert!(verdict.cacheable);
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(120));
    }

    #[test]
    fn max_age_sets_expiry() {
        let h = headers(&[("cache-control", "public, max-age=5".into())]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert!(verdict.cacheable);
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(5));
    }

    #[test]
    fn max_age_beats_longer_expires() {
        let h = headers(&[
            ("expires", http_date(now() + Duration::from_secs(10))),
            ("cache-control", "max-age=5".into()),
        ]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(5));
    }

    #[test]
    fn max_age_beats_shorter_expires() {
        let h = headers(&[
            ("expires", http_date(now() + Duration::from_secs(2))),
            ("cache-control", "max-age=30".into()),
        ]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(30));
    }

    #[test]
    fn s_maxage_beats_max_age() {
        let h = headers(&[("cache-control", "max-age=5, s-maxage=50".into())]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(50));
    }

    #[test]
    fn expires_sets_absolute_expiry() {
        let at = now() + Duration::from_secs(5);
        let h = headers(&[("expires", http_date(at))]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert!(verdict.cacheable);
        assert_eq!(verdict.expires_at, at);
    }

    #[test]
    fn past_expires_is_clamped_to_now() {
        let h = headers(&[("expires", http_date(now() - Duration::from_secs(60)))]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert!(verdict.cacheable);
        assert_eq!(verdict.expires_at, now());
    }

    #[test]
    fn malformed_values_fall_back_to_default() {
        let policy = FreshnessPolicy::new(Duration::from_secs(90));
        let default_expiry = now() + Duration::from_secs(90);

        for h in [
            headers(&[("cache-control", "max-age=soon".into())]),
            headers(&[("cache-control", "max-age=-3".into())]),
            headers(&[("expires", "0".into())]),
            headers(&[("expires", "next tuesday".into())]),
        ] {
            let verdict = policy.evaluate(&h, now());
            assert!(verdict.cacheable);
            assert_eq!(verdict.expires_at, default_expiry);
        }
    }

    #[test]
    fn malformed_max_age_still_honours_expires() {
        let at = now() + Duration::from_secs(7);
        let h = headers(&[
            ("cache-control", "max-age=abc".into()),
            ("expires", http_date(at)),
        ]);
        assert_eq!(FreshnessPolicy::default().evaluate(&h, now()).expires_at, at);
    }

    #[test]
    fn quoted_max_age_is_accepted() {
        let h = headers(&[("cache-control", "max-age=\"15\"".into())]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(15));
    }

    #[test]
    fn restricted_directives_are_not_cacheable() {
        for value in ["no-store", "private, max-age=60", "No-Cache"] {
            let h = headers(&[("cache-control", value.into())]);
            let verdict = FreshnessPolicy::default().evaluate(&h, now());
            assert!(!verdict.cacheable, "{value} should not be cacheable");
        }
    }

    #[test]
    fn vary_star_is_not_cacheable() {
        let mut h = HeaderMap::new();
        h.insert(VARY, HeaderValue::from_static("*"));
        assert!(!FreshnessPolicy::default().evaluate(&h, now()).cacheable);
    }

    #[test]
    fn split_cache_control_headers_are_combined() {
        let h = headers(&[
            ("cache-control", "public".into()),
            ("cache-control", "max-age=8".into()),
        ]);
        let verdict = FreshnessPolicy::default().evaluate(&h, now());
        assert_eq!(verdict.expires_at, now() + Duration::from_secs(8));
    }

    #[test]
    fn parse_cache_control_directives() {
        let cc = parse_cache_control("public, max-age=3600, s-maxage=7200");
        assert!(!cc.restricted);
        assert_eq!(cc.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(cc.s_maxage, Some(Duration::from_secs(7200)));
        assert_eq!(cc.lifetime(), Some(Duration::from_secs(7200)));

        assert_eq!(parse_cache_control("public"), CacheControl::default());
    }
}
