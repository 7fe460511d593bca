//! Validation and normalization of cohort queries.
//!
//! A query string is opaque to the protocol except for its projection clause:
//! only queries starting with a configured prefix (case-insensitive) are
//! accepted, and on the record-linkage path the count projection is rewritten
//! into an identifier projection so that the row set can be pseudonymized.
//!
//! Both operations are pure: the same input always yields the same decision
//! and the same rewritten query.

use thiserror::Error;

/// The default required projection prefix for accepted queries.
pub const DEFAULT_QUERY_PREFIX: &str = "select count";

/// The projection substituted for the count clause on the identifier path.
pub const IDENTIFIER_PROJECTION: &str = "select e/ehr_id/value as EHRID";

#[derive(Debug, Error, Eq, PartialEq)]
pub enum QueryError {
    #[error("expected query to start with '{prefix}', but got '{query}'")]
    WrongPrefix { prefix: String, query: String },

    #[error("no 'from' clause found in query '{query}', cannot rewrite projection")]
    MissingFromClause { query: String },
}

/// Checks that `query` starts with `prefix`, ignoring ASCII case.
pub fn check(query: &str, prefix: &str) -> Result<(), QueryError> {
    if starts_with_ignore_case(query, prefix) {
        Ok(())
    } else {
        Err(QueryError::WrongPrefix {
            prefix: prefix.to_string(),
            query: query.to_string(),
        })
    }
}

/// Rewrites a count query into an identifier query by substituting everything
/// before the `from` clause with [`IDENTIFIER_PROJECTION`].
///
/// Idempotent: a query that already carries the identifier projection is
/// returned unchanged. A query without a `from` clause fails closed.
pub fn rewrite_for_identifiers(query: &str, prefix: &str) -> Result<String, QueryError> {
    if starts_with_ignore_case(query, IDENTIFIER_PROJECTION) {
        return Ok(query.to_string());
    }
    check(query, prefix)?;

    // `to_ascii_lowercase` preserves byte offsets, so the index found on the
    // lowered copy is valid on the original.
    let lowered = query.to_ascii_lowercase();
    let from = lowered
        .find(" from ")
        .ok_or_else(|| QueryError::MissingFromClause {
            query: query.to_string(),
        })?;

    Ok(format!("{}{}", IDENTIFIER_PROJECTION, &query[from..]))
}

fn starts_with_ignore_case(query: &str, prefix: &str) -> bool {
    match query.get(..prefix.len()) {
        Some(head) => head.eq_ignore_ascii_case(prefix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_accepts_prefix_case_insensitive() {
        assert!(check("select count(e) from ehr e", DEFAULT_QUERY_PREFIX).is_ok());
        assert!(check("SELECT COUNT(e) FROM EHR e", DEFAULT_QUERY_PREFIX).is_ok());
        assert!(check("Select Count(e/ehr_id) from ehr e", DEFAULT_QUERY_PREFIX).is_ok());
    }

    #[test]
    fn test_check_rejects_wrong_prefix() {
        let err = check("select name from ehr", DEFAULT_QUERY_PREFIX).unwrap_err();
        assert_eq!(
            err,
            QueryError::WrongPrefix {
                prefix: DEFAULT_QUERY_PREFIX.to_string(),
                query: "select name from ehr".to_string(),
            }
        );
    }

    #[test]
    fn test_rewrite_substitutes_projection() {
        let rewritten = rewrite_for_identifiers(
            "select count(e/ehr_id/value) from ehr e where e/x = 1",
            DEFAULT_QUERY_PREFIX,
        )
        .unwrap();
        assert_eq!(
            rewritten,
            "select e/ehr_id/value as EHRID from ehr e where e/x = 1"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite_for_identifiers(
            "select count(e/ehr_id/value) from ehr e",
            DEFAULT_QUERY_PREFIX,
        )
        .unwrap();
        let twice = rewrite_for_identifiers(&once, DEFAULT_QUERY_PREFIX).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_rewrite_fails_closed_without_from_clause() {
        let err = rewrite_for_identifiers("select count(e)", DEFAULT_QUERY_PREFIX).unwrap_err();
        assert_eq!(
            err,
            QueryError::MissingFromClause {
                query: "select count(e)".to_string(),
            }
        );
    }

    #[test]
    fn test_rewrite_is_pure() {
        let query = "select count(e) from ehr e";
        let first = rewrite_for_identifiers(query, DEFAULT_QUERY_PREFIX).unwrap();
        let second = rewrite_for_identifiers(query, DEFAULT_QUERY_PREFIX).unwrap();
        assert_eq!(first, second);
    }
}
