//! Slash-separated entry name helpers.

/// Returns the shortest equivalent of a slash-separated path.
///
/// Repeated separators collapse, `.` segments disappear and `..` segments
/// remove the segment before them. A rooted path stays rooted; `..` never
/// climbs above the root. An empty result becomes `"."`.
pub fn clean(name: &str) -> String {
    let rooted = name.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Returns every ancestor directory of `name`, outermost first.
///
/// `"a/b/c.txt"` yields `["a", "a/b"]`.
pub fn ancestors(name: &str) -> Vec<String> {
    let segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
    let mut dirs = Vec::new();
    for i in 1..segments.len() {
        dirs.push(segments[..i].join("/"));
    }
    dirs
}
