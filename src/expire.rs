//! Expiration values and per-URL expiration patterns.

use std::time::{Duration, SystemTime};

use regex::Regex;
use url::Url;

use crate::error::Error;

/// When a stored response should become stale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExpireAfter {
    /// Cache without expiring.
    Never,
    /// Do not store at all.
    Immediate,
    /// Expire a fixed interval after the response is stored.
    After(Duration),
    /// Expire at an absolute instant.
    At(SystemTime),
}

impl ExpireAfter {
    /// Interpret an integer number of seconds: `-1` means never expire and
    /// `0` means do not store.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            -1 => ExpireAfter::Never,
            0 => ExpireAfter::Immediate,
            n if n < 0 => ExpireAfter::Never,
            n => ExpireAfter::After(Duration::from_secs(n as u64)),
        }
    }

    /// Project onto an absolute expiration, anchored at `now`.
    pub fn resolve(&self, now: SystemTime) -> ResolvedExpiration {
        match self {
            ExpireAfter::Never => ResolvedExpiration::Never,
            ExpireAfter::Immediate => ResolvedExpiration::SkipStore,
            ExpireAfter::After(interval) => ResolvedExpiration::At(now + *interval),
            ExpireAfter::At(instant) => ResolvedExpiration::At(*instant),
        }
    }
}

impl From<Duration> for ExpireAfter {
    fn from(interval: Duration) -> Self {
        if interval.is_zero() {
            ExpireAfter::Immediate
        } else {
            ExpireAfter::After(interval)
        }
    }
}

impl From<SystemTime> for ExpireAfter {
    fn from(instant: SystemTime) -> Self {
        ExpireAfter::At(instant)
    }
}

/// An `ExpireAfter` anchored to a store time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedExpiration {
    Never,
    SkipStore,
    At(SystemTime),
}

impl ResolvedExpiration {
    pub fn instant(&self) -> Option<SystemTime> {
        match self {
            ResolvedExpiration::At(instant) => Some(*instant),
            _ => None,
        }
    }
}

/// A glob matched against a request's base URL (scheme stripped, query
/// ignored). `*` matches within a host label or path segment, `**` matches
/// across them, and a pattern matches any URL it is a prefix of.
///
/// Patterns are compiled to a regex eagerly so that a malformed pattern is
/// rejected at configuration time, not on the request path.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    original: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn compile(pattern: &str) -> Result<Self, Error> {
        let stripped = pattern
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(pattern)
            .trim_end_matches('*');
        if stripped.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern has no host".to_string(),
            });
        }

        let (host, path) = match stripped.split_once('/') {
            Some((host, path)) => (host, Some(path)),
            None => (stripped, None),
        };

        let mut regex = String::from("^");
        push_glob(&mut regex, host, '.');
        if let Some(path) = path {
            regex.push('/');
            push_glob(&mut regex, path, '/');
        }
        regex.push_str(".*$");

        let regex = Regex::new(&regex).map_err(|err| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            original: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, url: &Url) -> bool {
        self.regex.is_match(&base_url(url))
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }
}

/// Translate a glob fragment, where `*` stops at `separator` and `**` does
/// not.
fn push_glob(regex: &mut String, fragment: &str, separator: char) {
    let mut chars = fragment.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str(&format!("[^{}]*", regex::escape(&separator.to_string())));
                }
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
}

/// The matched portion of a URL: host, non-default port, and path.
fn base_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}{}", host, port, url.path()),
        None => format!("{}{}", host, url.path()),
    }
}

/// First matching pattern wins; table order is insertion order.
pub fn match_url_expiration(
    patterns: &[(UrlPattern, ExpireAfter)],
    url: &Url,
) -> Option<ExpireAfter> {
    patterns
        .iter()
        .find(|(pattern, _)| pattern.matches(url))
        .map(|(_, expire_after)| *expire_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn from_secs_sentinels() {
        assert_eq!(ExpireAfter::from_secs(-1), ExpireAfter::Never);
        assert_eq!(ExpireAfter::from_secs(0), ExpireAfter::Immediate);
        assert_eq!(
            ExpireAfter::from_secs(60),
            ExpireAfter::After(Duration::from_secs(60))
        );
    }

    #[test]
    fn resolve_anchors_durations() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert_eq!(ExpireAfter::Never.resolve(now), ResolvedExpiration::Never);
        assert_eq!(
            ExpireAfter::Immediate.resolve(now),
            ResolvedExpiration::SkipStore
        );
        assert_eq!(
            ExpireAfter::After(Duration::from_secs(10)).resolve(now),
            ResolvedExpiration::At(now + Duration::from_secs(10))
        );
        let at = now + Duration::from_secs(99);
        assert_eq!(ExpireAfter::At(at).resolve(now), ResolvedExpiration::At(at));
    }

    #[test]
    fn host_wildcard_matches_one_label() {
        let pattern = UrlPattern::compile("*.example.com").unwrap();
        assert!(pattern.matches(&url("https://api.example.com/x")));
        assert!(pattern.matches(&url("http://cdn.example.com/")));
        assert!(!pattern.matches(&url("http://a.b.example.com/")));
        assert!(!pattern.matches(&url("http://example.com/")));
    }

    #[test]
    fn path_pattern_is_a_prefix_glob() {
        let pattern = UrlPattern::compile("example.com/static").unwrap();
        assert!(pattern.matches(&url("http://example.com/static/y")));
        assert!(!pattern.matches(&url("http://example.com/dynamic")));
        assert!(!pattern.matches(&url("http://other.com/static")));
    }

    #[test]
    fn scheme_is_stripped_and_segment_wildcards_work() {
        let pattern = UrlPattern::compile("https://site.test/*/v1").unwrap();
        assert!(pattern.matches(&url("http://site.test/api/v1")));
        assert!(!pattern.matches(&url("http://site.test/api/nested/v1")));
        let recursive = UrlPattern::compile("site.test/**/v1").unwrap();
        assert!(recursive.matches(&url("http://site.test/api/nested/v1")));
    }

    #[test]
    fn invalid_pattern_is_rejected_eagerly() {
        assert!(matches!(
            UrlPattern::compile("***"),
            Err(Error::InvalidPattern { .. })
        ));
        assert!(matches!(
            UrlPattern::compile("http://"),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn first_match_wins() {
        let table = vec![
            (
                UrlPattern::compile("*.example.com").unwrap(),
                ExpireAfter::from_secs(60),
            ),
            (
                UrlPattern::compile("api.example.com").unwrap(),
                ExpireAfter::Never,
            ),
        ];
        assert_eq!(
            match_url_expiration(&table, &url("http://api.example.com/x")),
            Some(ExpireAfter::After(Duration::from_secs(60)))
        );
        assert_eq!(match_url_expiration(&table, &url("http://other.com/")), None);
    }
}
