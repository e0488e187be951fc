use anyhow::{Context, Result};
use async_recursion::async_recursion;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_removed: usize,
    pub directories_removed: usize,
}

impl Summary {
    pub fn entries_removed(&self) -> usize {
        self.files_removed + self.directories_removed
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_removed: self.files_removed + other.files_removed,
            directories_removed: self.directories_removed + other.directories_removed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "files removed: {}\ndirectories removed: {}",
            self.files_removed, self.directories_removed
        )
    }
}

/// Removes `path` and, if it is a directory, everything below it.
///
/// Children are removed concurrently. The first failure aborts the removals still running and is
/// returned as is.
#[async_recursion]
pub async fn rm(path: &std::path::Path) -> Result<Summary> {
    tracing::debug!("remove: {:?}", path);
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &path))?;
    if !metadata.is_dir() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", &path))?;
        return Ok(Summary {
            files_removed: 1,
            ..Default::default()
        });
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    let mut join_set = tokio::task::JoinSet::new();
    let mut summary = Summary::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))?
    {
        let entry_path = entry.path();
        let do_rm = || async move { rm(&entry_path).await };
        join_set.spawn(do_rm());
    }
    while let Some(res) = join_set.join_next().await {
        match res? {
            Ok(child_summary) => summary = summary + child_summary,
            Err(error) => {
                tracing::debug!("remove: {:?} failed with: {:#}", path, &error);
                join_set.abort_all();
                return Err(error);
            }
        }
    }
    tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", &path))?;
    tracing::debug!("remove: {:?} succeeded!", path);
    Ok(summary
        + Summary {
            directories_removed: 1,
            ..Default::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn removes_tree() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let summary = rm(&tmp_dir.path().join("foo")).await?;
        assert_eq!(summary.files_removed, 7);
        assert_eq!(summary.directories_removed, 3);
        assert_eq!(summary.entries_removed(), 10);
        assert!(!tmp_dir.path().join("foo").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn removes_single_file() -> Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let file = tmp_dir.path().join("foo").join("0.txt");
        let summary = rm(&file).await?;
        assert_eq!(summary.files_removed, 1);
        assert!(!file.exists());
        assert!(tmp_dir.path().join("foo").join("bar").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_path_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let error = rm(&tmp_dir.path().join("nope")).await.unwrap_err();
        assert!(error.to_string().starts_with("failed reading metadata from"));
    }
}
