//! Fixtures shared by the unit and integration tests of the fscp crates.

/// Contents of every file created by [`setup_test_dir`], keyed by path relative to the temp dir.
pub const TEST_FILES: &[(&str, &str)] = &[
    ("foo/0.txt", "0"),
    ("foo/bar/1.txt", "1"),
    ("foo/bar/2.txt", "2"),
    ("foo/bar/3.txt", "3"),
    ("foo/baz/4.txt", "4"),
    ("foo/baz/5.txt", "5"),
    ("foo/baz/6.txt", "6"),
];

/// Creates a temporary directory with the following layout:
///
/// ```text
/// foo
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
///    |- 3.txt
/// |- baz
///    |- 4.txt
///    |- 5.txt
///    |- 6.txt
/// ```
///
/// The directory is removed when the returned guard is dropped.
pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::Builder::new().prefix("fscp_test").tempdir()?;
    for (path, contents) in TEST_FILES {
        let path = tmp_dir.path().join(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
    }
    Ok(tmp_dir)
}

/// Lists all files below `root` as sorted `(relative path, contents)` pairs.
pub async fn read_tree(root: &std::path::Path) -> anyhow::Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            files.push((relative, tokio::fs::read_to_string(&path).await?));
        }
    }
    files.sort();
    Ok(files)
}
