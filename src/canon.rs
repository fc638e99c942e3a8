//! Forge URL canonicalization.
//!
//! Pure string functions: normalize a user-supplied repository URL into its
//! canonical `https://github.com/<owner>/<name>` form and extract the owner
//! and name segments. Normalization runs before validation and is required
//! to reach a fixed point, so no accepted URL can smuggle traversal through
//! case tricks, percent-encoding, or extra separators.

use crate::error::{Error, Result};

const CANONICAL_HOST: &str = "github.com";

/// A validated, normalized repository URL with its extracted segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalUrl {
    pub url: String,
    pub owner: String,
    pub name: String,
}

fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// True iff every character is in the owner/name character class.
/// Shared with the forge client, which refuses to substitute anything
/// outside this class into a query.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment.chars().all(is_valid_segment_char)
}

/// Canonicalizes a repository URL.
///
/// Accepts `http`/`https` (or no scheme, implying `https`), an optional
/// `www.` host prefix, exactly two path segments, an optional trailing `/`
/// and an optional `.git` suffix. Everything else is rejected with
/// [`Error::InvalidUrl`].
///
/// Idempotent: `canonicalize(canonicalize(s)?.url)` returns the same value.
pub fn canonicalize(input: &str) -> Result<CanonicalUrl> {
    if input.is_empty() {
        return Err(Error::InvalidUrl("url is empty".to_string()));
    }
    if input.chars().any(char::is_whitespace) {
        return Err(Error::InvalidUrl(
            "url must not contain whitespace".to_string(),
        ));
    }
    // Percent-encoding could hide separators from the segment checks below.
    if input.contains('%') {
        return Err(Error::InvalidUrl(
            "url must not contain percent-encoded characters".to_string(),
        ));
    }

    let lower = input.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);

    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, p),
        None => {
            return Err(Error::InvalidUrl(format!(
                "expected {CANONICAL_HOST}/<owner>/<name>, got '{input}'"
            )));
        }
    };

    let host = host.strip_prefix("www.").unwrap_or(host);
    if host != CANONICAL_HOST {
        return Err(Error::InvalidUrl(format!(
            "unsupported host '{host}', only {CANONICAL_HOST} is tracked"
        )));
    }

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let path = path.trim_end_matches('/');

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != 2 {
        return Err(Error::InvalidUrl(format!(
            "expected exactly <owner>/<name> after the host, got '{path}'"
        )));
    }

    let (owner, name) = (segments[0], segments[1]);
    for segment in [owner, name] {
        if !is_valid_segment(segment) {
            return Err(Error::InvalidUrl(format!(
                "segment '{segment}' may only contain ASCII letters, digits, '-', '_' and '.'"
            )));
        }
    }

    Ok(CanonicalUrl {
        url: format!("https://{CANONICAL_HOST}/{owner}/{name}"),
        owner: owner.to_string(),
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(input: &str) -> String {
        canonicalize(input).unwrap().url
    }

    #[test]
    fn test_accepts_basic_forms() {
        assert_eq!(
            url("https://github.com/octocat/hello-world"),
            "https://github.com/octocat/hello-world"
        );
        assert_eq!(
            url("http://github.com/octocat/hello-world"),
            "https://github.com/octocat/hello-world"
        );
        assert_eq!(
            url("github.com/octocat/hello-world"),
            "https://github.com/octocat/hello-world"
        );
        assert_eq!(
            url("https://www.github.com/octocat/hello-world"),
            "https://github.com/octocat/hello-world"
        );
    }

    #[test]
    fn test_strips_suffixes() {
        assert_eq!(
            url("https://github.com/octocat/hello-world.git"),
            "https://github.com/octocat/hello-world"
        );
        assert_eq!(
            url("https://github.com/octocat/hello-world/"),
            "https://github.com/octocat/hello-world"
        );
        assert_eq!(
            url("https://github.com/octocat/hello-world.git/"),
            "https://github.com/octocat/hello-world"
        );
    }

    #[test]
    fn test_lowercases_owner_and_name() {
        let c = canonicalize("https://github.com/OctoCat/Hello-World").unwrap();
        assert_eq!(c.owner, "octocat");
        assert_eq!(c.name, "hello-world");
        assert_eq!(c.url, "https://github.com/octocat/hello-world");
    }

    #[test]
    fn test_idempotent() {
        for input in [
            "https://github.com/Owner/Repo.git",
            "http://www.github.com/a/b/",
            "github.com/x/y",
        ] {
            let once = canonicalize(input).unwrap();
            let twice = canonicalize(&once.url).unwrap();
            assert_eq!(once, twice, "not a fixed point for {input}");
        }
    }

    #[test]
    fn test_rejects_other_hosts() {
        assert!(canonicalize("https://gitlab.com/owner/repo").is_err());
        assert!(canonicalize("https://github.com.evil.io/owner/repo").is_err());
    }

    #[test]
    fn test_rejects_wrong_segment_count() {
        assert!(canonicalize("https://github.com/owner").is_err());
        assert!(canonicalize("https://github.com/owner/").is_err());
        assert!(canonicalize("https://github.com/").is_err());
        assert!(canonicalize("https://github.com").is_err());
        assert!(canonicalize("https://github.com/a/b/c").is_err());
        assert!(canonicalize("https://github.com/a//b").is_err());
    }

    #[test]
    fn test_rejects_percent_encoding() {
        assert!(canonicalize("https://github.com/owner%2F..%2F/repo").is_err());
        assert!(canonicalize("https://github.com/owner/re%20po").is_err());
    }

    #[test]
    fn test_rejects_whitespace_and_empty() {
        assert!(canonicalize("").is_err());
        assert!(canonicalize("https://github.com/owner/re po").is_err());
        assert!(canonicalize(" https://github.com/owner/repo").is_err());
    }

    #[test]
    fn test_rejects_traversal_segments() {
        assert!(canonicalize("https://github.com/../repo").is_err());
        assert!(canonicalize("https://github.com/owner/..").is_err());
        assert!(canonicalize("https://github.com/./repo").is_err());
    }

    #[test]
    fn test_rejects_invalid_segment_chars() {
        assert!(canonicalize("https://github.com/own:er/repo").is_err());
        assert!(canonicalize("https://github.com/owner/repo?x=1").is_err());
        assert!(canonicalize("https://github.com/öwner/repo").is_err());
    }

    #[test]
    fn test_segment_class() {
        assert!(is_valid_segment("repo-name_1.2"));
        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment(".."));
        assert!(!is_valid_segment("a\"b"));
    }
}
