//! Canonical route keys shared by the cache and the queue

/// Normalize a request path into the canonical cache/job key.
///
/// Query strings and fragments are dropped, repeated slashes collapse and a
/// trailing slash is removed (except for the root route).
pub fn normalize_route(raw: &str) -> String {
    let path = raw
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim();

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut route = String::with_capacity(path.len() + 1);
    for segment in segments {
        route.push('/');
        route.push_str(segment);
    }
    route
}

/// Whether `route` is `prefix` itself or lives underneath it.
pub fn route_has_prefix(route: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return route == "/";
    }

    match route.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
