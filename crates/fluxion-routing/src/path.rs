//! Request path parsing and safety checks.
//!
//! Any path that decodes badly or contains a forbidden segment is treated as
//! "no route" rather than an error: the caller answers 404 and nothing else
//! happens. Underscore-prefixed segments hide private trees; dot segments
//! and encoded separators block traversal.

/// A validated request path: the original pathname plus its decoded
/// segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub pathname: String,
    pub segments: Vec<String>,
}

/// Parse a request pathname into safe segments.
///
/// Returns `None` when any segment fails to percent-decode or violates the
/// safety rules. `/` parses to zero segments.
pub fn parse_request_path(pathname: &str) -> Option<ParsedPath> {
    let mut segments = Vec::new();
    for raw in pathname.split('/') {
        if raw.is_empty() {
            continue;
        }
        let decoded = match urlencoding::decode(raw) {
            Ok(value) => value.into_owned(),
            Err(_) => return None,
        };
        if !segment_is_safe(&decoded) {
            return None;
        }
        segments.push(decoded);
    }
    Some(ParsedPath {
        pathname: pathname.to_string(),
        segments,
    })
}

fn segment_is_safe(segment: &str) -> bool {
    if segment.is_empty() || segment == "." || segment == ".." {
        return false;
    }
    if segment.contains('/') || segment.contains('\\') {
        return false;
    }
    if segment.starts_with('_') {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_drops_empty_segments() {
        let parsed = parse_request_path("/a//b/c/").unwrap();
        assert_eq!(parsed.segments, vec!["a", "b", "c"]);
        assert_eq!(parsed.pathname, "/a//b/c/");
    }

    #[test]
    fn root_parses_to_zero_segments() {
        let parsed = parse_request_path("/").unwrap();
        assert!(parsed.segments.is_empty());
    }

    #[test]
    fn percent_decodes_segments() {
        let parsed = parse_request_path("/caf%C3%A9/menu").unwrap();
        assert_eq!(parsed.segments, vec!["café", "menu"]);
    }

    #[test]
    fn invalid_encoding_fails_the_whole_parse() {
        assert!(parse_request_path("/ok/%FF%FE").is_none());
    }

    #[test]
    fn rejects_dot_segments() {
        assert!(parse_request_path("/a/../b").is_none());
        assert!(parse_request_path("/a/./b").is_none());
        assert!(parse_request_path("/%2e%2e/etc").is_none());
    }

    #[test]
    fn rejects_encoded_separators() {
        assert!(parse_request_path("/a%2Fb").is_none());
        assert!(parse_request_path("/a%5Cb").is_none());
    }

    #[test]
    fn rejects_underscore_prefixed_segments() {
        assert!(parse_request_path("/_lib/secret").is_none());
        assert!(parse_request_path("/a/_private/b").is_none());
        assert!(parse_request_path("/%5Flib/secret").is_none());
    }
}
