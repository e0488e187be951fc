//! Helpers for `/`-separated storage paths.
//!
//! Paths handled here are keys rather than OS paths: prefix stores have no real directories and
//! the local backend maps them below its root, so a trailing separator is kept by callers as a
//! hint ("copy the contents") and stripped by [`clean_path_prefix`].

use anyhow::bail;

pub const SEPARATOR: char = '/';

pub fn has_trailing_slash(path: &str) -> bool {
    path.ends_with(SEPARATOR)
}

/// Last component of `path`, ignoring trailing separators.
pub fn base(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Everything before the last component of `path`, or an empty string at the top level.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => trimmed[..idx].trim_end_matches(SEPARATOR),
        None => "",
    }
}

/// Joins two paths with a single separator; an empty side yields the other one.
pub fn join(left: &str, right: &str) -> String {
    let left = left.trim_end_matches(SEPARATOR);
    let right = right.trim_start_matches(SEPARATOR);
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (false, true) => left.to_string(),
        (false, false) => format!("{left}{SEPARATOR}{right}"),
    }
}

/// Normalizes a storage path: drops the leading separator, empty and `.` components and resolves
/// `..` against the components seen so far.
///
/// Paths starting with `~` or `.` are rejected since they only make sense relative to some
/// working directory. The result never starts or ends with a separator.
pub fn clean_path_prefix(path: &str) -> anyhow::Result<String> {
    let path = path.trim_start_matches(SEPARATOR);
    if path.is_empty() {
        return Ok(String::new());
    }
    if path.starts_with('~') || path.starts_with('.') {
        bail!("path cannot start with ~, . or ..: {:?}", path);
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(SEPARATOR) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_and_parent() {
        assert_eq!(base("a/b"), "b");
        assert_eq!(base("a/b/"), "b");
        assert_eq!(base("b"), "b");
        assert_eq!(base(""), "");
        assert_eq!(parent("a/b"), "a");
        assert_eq!(parent("a/b/"), "a");
        assert_eq!(parent("a/b/c.txt"), "a/b");
        assert_eq!(parent("b"), "");
    }

    #[test]
    fn join_handles_empty_and_separators() {
        assert_eq!(join("a", "b"), "a/b");
        assert_eq!(join("a/", "/b"), "a/b");
        assert_eq!(join("", "b"), "b");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a/b", "c/d.txt"), "a/b/c/d.txt");
    }

    #[test]
    fn clean_path_prefix_normalizes() -> anyhow::Result<()> {
        assert_eq!(clean_path_prefix("")?, "");
        assert_eq!(clean_path_prefix("/")?, "");
        assert_eq!(clean_path_prefix("/a/b/")?, "a/b");
        assert_eq!(clean_path_prefix("a//b/./c")?, "a/b/c");
        assert_eq!(clean_path_prefix("a/b/../c")?, "a/c");
        assert_eq!(clean_path_prefix("a/../../c")?, "c");
        Ok(())
    }

    #[test]
    fn clean_path_prefix_rejects_relative_starts() {
        assert!(clean_path_prefix("~/a").is_err());
        assert!(clean_path_prefix("./a").is_err());
        assert!(clean_path_prefix("../a").is_err());
        assert!(clean_path_prefix("/../a").is_err());
    }
}
