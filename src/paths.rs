//! Slash-separated object path helpers.
//!
//! Object names are treated lexically, the same way for cache keys, backend
//! URLs and redirect targets, so all three always agree on a name.

/// Lexically clean a slash-separated path.
///
/// Repeated slashes collapse, `.` elements are dropped and `..` removes the
/// preceding element. A rooted path never climbs above `/`. An empty result
/// is `"."` for relative input and `"/"` for rooted input.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
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
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join path elements with `/` and clean the result. Empty elements are
/// ignored; joining nothing but empty elements yields an empty string.
pub fn join(elems: &[&str]) -> String {
    let parts: Vec<&str> = elems.iter().copied().filter(|e| !e.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    clean(&parts.join("/"))
}

/// Normalize a requested object name so that it stays inside its bucket.
///
/// The name is cleaned as if rooted, then the leading slash is removed:
/// `"/a/../../b"` becomes `"b"`.
pub fn object_name(name: &str) -> String {
    clean(&format!("/{}", name))
        .trim_start_matches('/')
        .to_string()
}

/// Path of an object inside its bucket, e.g. `bucket/dir/index.html`
pub fn bucket_path(bucket: &str, name: &str) -> String {
    join(&[bucket, &object_name(name)])
}

/// Whether the final path segment contains a `.`
pub fn has_extension(name: &str) -> bool {
    name.rsplit('/').next().is_some_and(|segment| segment.contains('.'))
}

/// Directory form of a name used as a redirect target: `dir` -> `/dir/`
pub fn directory_url(name: &str) -> String {
    let rooted = clean(&format!("/{}", name));
    if rooted == "/" {
        rooted
    } else {
        format!("{}/", rooted)
    }
}
