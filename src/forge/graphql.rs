//! Batched repository lookups as a single GraphQL query.
//!
//! Each repository gets a numeric alias (`r0`, `r1`, ...), so one request
//! covers up to a whole chunk. Owner and name are validated against the
//! canonical segment character class before substitution; nothing outside
//! that class ever reaches the query string.

use serde_json::Value;

use crate::canon;
use crate::error::{Error, Result};
use crate::types::RepoInfo;

/// Builds the query document for one chunk of (owner, name) pairs.
pub fn build_query(pairs: &[(String, String)]) -> Result<String> {
    let mut parts = Vec::with_capacity(pairs.len());
    for (idx, (owner, name)) in pairs.iter().enumerate() {
        if !canon::is_valid_segment(owner) || !canon::is_valid_segment(name) {
            return Err(Error::ForgeApi(format!(
                "refusing to query invalid repository segment '{owner}/{name}'"
            )));
        }
        parts.push(format!(
            "r{idx}: repository(owner: \"{owner}\", name: \"{name}\") {{ description isArchived isPrivate }}"
        ));
    }
    Ok(format!("query {{ {} }}", parts.join(" ")))
}

/// Maps a GraphQL response back onto the request order. A null alias means
/// the repository was not found (or is invisible to the token).
pub fn parse_response(body: &Value, count: usize) -> Result<Vec<RepoInfo>> {
    let data = body
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::ForgeApi("graphql response has no data object".to_string()))?;

    let mut results = Vec::with_capacity(count);
    for idx in 0..count {
        let alias = format!("r{idx}");
        let info = match data.get(&alias) {
            Some(Value::Object(repo)) => RepoInfo {
                description: repo
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                archived: repo
                    .get("isArchived")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                is_private: repo
                    .get("isPrivate")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                not_found: false,
            },
            _ => RepoInfo {
                not_found: true,
                ..RepoInfo::default()
            },
        };
        results.push(info);
    }
    Ok(results)
}
