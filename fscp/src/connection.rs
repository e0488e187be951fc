//! Addresses of files on a storage backend and what the backends report about them.

use anyhow::bail;

/// Scheme of the local filesystem backend; bare paths use it.
pub const FILE_SCHEME: &str = "file";

/// Scheme of the in-memory prefix store.
pub const MEM_SCHEME: &str = "mem";

/// Host used for bare local paths.
pub const LOCAL_HOST: &str = "local";

/// A path on a given host of a given backend, e.g. `mem://bucket/photos/2024/`.
///
/// A trailing slash on `path` is significant: copying `dir/` copies the contents of `dir`, while
/// copying `dir` copies the directory itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub scheme: String,
    pub host: String,
    pub path: String,
}

impl Connection {
    pub fn new(scheme: &str, host: &str, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            path: path.to_string(),
        }
    }

    /// Parses `scheme://host/path`; anything without a scheme is a local path.
    pub fn parse(uri: &str) -> anyhow::Result<Self> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            if uri.is_empty() {
                bail!("empty path");
            }
            return Ok(Self::new(FILE_SCHEME, LOCAL_HOST, uri));
        };
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("invalid scheme in {:?}", uri);
        }
        let (host, path) = match rest.split_once('/') {
            Some((host, path)) => (host, path),
            None => (rest, ""),
        };
        let host = if host.is_empty() && scheme == FILE_SCHEME {
            LOCAL_HOST
        } else {
            host
        };
        if host.is_empty() {
            bail!("missing host in {:?}", uri);
        }
        Ok(Self::new(scheme, host, path))
    }

    pub fn has_trailing_slash(&self) -> bool {
        common::path::has_trailing_slash(&self.path)
    }

    /// Same scheme and host, different path.
    pub fn with_path(&self, path: &str) -> Self {
        Self::new(&self.scheme, &self.host, path)
    }

    pub fn same_host(&self, other: &Connection) -> bool {
        self.scheme == other.scheme && self.host == other.host
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}/{}",
            self.scheme,
            self.host,
            self.path.trim_start_matches('/')
        )
    }
}

/// Result of a `stat`. A missing path is reported with `not_found` set rather than as an error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
    pub is_dir: bool,
    pub not_found: bool,
}

impl FileInfo {
    pub fn not_found(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: common::path::base(path).to_string(),
            not_found: true,
            ..Default::default()
        }
    }
}

/// Options of a copy or move. `overwrite` and `merge` are mutually exclusive.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileCopyOpts {
    /// Required to copy, move or delete directories
    pub recursive: bool,
    /// Delete a conflicting destination before copying
    pub overwrite: bool,
    /// Copy a directory into an existing directory of the same name
    pub merge: bool,
    /// Upper bound of a streaming copy between backends
    pub timeout: Option<std::time::Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uri() {
        let conn = Connection::parse("mem://bucket/photos/2024/").unwrap();
        assert_eq!(conn, Connection::new(MEM_SCHEME, "bucket", "photos/2024/"));
        assert!(conn.has_trailing_slash());
        assert_eq!(conn.to_string(), "mem://bucket/photos/2024/");
        let conn = Connection::parse("mem://bucket").unwrap();
        assert_eq!(conn.path, "");
        assert!(!conn.has_trailing_slash());
    }

    #[test]
    fn parse_local() {
        let conn = Connection::parse("/tmp/data").unwrap();
        assert_eq!(conn, Connection::new(FILE_SCHEME, LOCAL_HOST, "/tmp/data"));
        let conn = Connection::parse("file:///tmp/data/").unwrap();
        assert_eq!(conn, Connection::new(FILE_SCHEME, LOCAL_HOST, "tmp/data/"));
        assert_eq!(conn.to_string(), "file://local/tmp/data/");
    }

    #[test]
    fn parse_errors() {
        assert!(Connection::parse("").is_err());
        assert!(Connection::parse("://host/path").is_err());
        assert!(Connection::parse("mem:///path").is_err());
        assert!(Connection::parse("s-3://bucket/key").is_err());
    }

    #[test]
    fn with_path_keeps_host() {
        let conn = Connection::new(MEM_SCHEME, "bucket", "a/b");
        let other = conn.with_path("c");
        assert!(conn.same_host(&other));
        assert_eq!(other.path, "c");
        assert!(!conn.same_host(&Connection::new(MEM_SCHEME, "other", "a/b")));
    }
}
