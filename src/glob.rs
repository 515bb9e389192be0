//! Shared glob matching
//!
//! One engine behind two concerns: the smart-sync preserve-set matcher and
//! the webhook `DeployOnPaths` file-path matcher. Both specify the same
//! `*`/`**` semantics, extended here to path-aware matching rather than
//! the simpler single-segment glob filters used for branch names
//! elsewhere in this codebase.

/// Match a normalised (forward-slash) path against a preserve pattern:
///
/// - a pattern ending in `/**` matches the directory itself and everything
///   beneath it
/// - a single `*` segment matches any run of non-slash characters
/// - otherwise the pattern matches the path exactly, or the path is a
///   descendant of the pattern (directory-prefix match)
pub fn matches_preserve_pattern(path: &str, pattern: &str) -> bool {
    let path = normalise(path);
    let pattern = normalise(pattern);

    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix || path.starts_with(&format!("{prefix}/"));
    }

    if pattern.contains('*') {
        return glob_segment_match(&path, &pattern) || is_descendant(&path, &pattern);
    }

    path == pattern || is_descendant(&path, &pattern)
}

/// Match a file path against a `DeployOnPaths` glob: `*` matches exactly one
/// path segment, `**` matches any depth (including zero segments).
pub fn matches_deploy_glob(path: &str, pattern: &str) -> bool {
    let path_segments: Vec<&str> = normalise(path).split('/').filter(|s| !s.is_empty()).collect();
    let pattern_segments: Vec<&str> = normalise(pattern).split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&path_segments, &pattern_segments)
}

fn match_segments(path: &[&str], pattern: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=path.len()).any(|skip| match_segments(&path[skip..], &pattern[1..]))
        }
        Some(seg) => {
            let Some((head, rest)) = path.split_first() else {
                return false;
            };
            segment_matches(head, seg) && match_segments(rest, &pattern[1..])
        }
    }
}

fn segment_matches(segment: &str, pattern_segment: &str) -> bool {
    if pattern_segment == "*" {
        return !segment.is_empty();
    }
    glob_segment_match(segment, pattern_segment)
}

/// Single-`*` wildcard match within one string (full wildcard, prefix,
/// suffix, or a two-part `a*b` split), falling back to exact match.
fn glob_segment_match(value: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if !prefix.contains('*') {
            return value.starts_with(prefix);
        }
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if !suffix.contains('*') {
            return value.ends_with(suffix);
        }
    }
    if let Some(star) = pattern.find('*') {
        let (before, after) = (&pattern[..star], &pattern[star + 1..]);
        if !after.contains('*') {
            return value.starts_with(before) && value.ends_with(after) && value.len() >= before.len() + after.len();
        }
    }
    value == pattern
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.starts_with(&format!("{ancestor}/"))
}

fn normalise(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}
