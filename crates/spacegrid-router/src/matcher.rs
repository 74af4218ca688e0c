//! Structural path matching.
//!
//! Patterns and paths are split on `/`. Static segments must be equal and
//! `:name` segments bind the corresponding path segment. Segment counts
//! must match exactly, so `/a/:b` never matches `/a/b/c`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use spacegrid_state::Route;

static PARAM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("param name regex")
});

/// Match `path` against `pattern`, returning the bound parameters.
pub fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_segments: Vec<&str> = segments(pattern).collect();
    let path_segments: Vec<&str> = segments(path).collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = HashMap::new();
    for (pat, seg) in pattern_segments.iter().zip(&path_segments) {
        match param_name(pat) {
            Some(name) => {
                if seg.is_empty() {
                    return None;
                }
                params.insert(name.to_string(), (*seg).to_string());
            }
            None if pat == seg => {}
            None => return None,
        }
    }
    Some(params)
}

/// Whether `route` accepts the request method. An empty method matches all.
pub fn method_matches(route: &Route, method: &str) -> bool {
    route.method.is_empty() || route.method.eq_ignore_ascii_case(method)
}

/// First route (in declaration order) matching the request.
pub fn find_route<'a>(
    routes: &'a [Route],
    method: &str,
    path: &str,
) -> Option<(&'a Route, HashMap<String, String>)> {
    routes
        .iter()
        .filter(|r| method_matches(r, method))
        .find_map(|r| match_path(&r.path, path).map(|params| (r, params)))
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.trim_matches('/').split('/')
}

fn param_name(segment: &str) -> Option<&str> {
    segment
        .strip_prefix(':')
        .filter(|name| PARAM_NAME.is_match(name))
}
