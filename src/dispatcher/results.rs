use std::path::PathBuf;

use crate::error::Result;

/// Directory of test results, one file per commit id.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, commit_id: &str) -> PathBuf {
        self.dir.join(commit_id)
    }

    /// Write the payload for `commit_id`, creating the directory on first use.
    /// Field separators in the payload become line breaks in the file.
    pub async fn store(&self, commit_id: &str, payload: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(commit_id);
        tokio::fs::write(&path, format_payload(payload)).await?;
        tracing::info!(commit_id, path = %path.display(), bytes = payload.len(), "Stored test results");
        Ok(path)
    }
}

pub fn format_payload(payload: &[u8]) -> Vec<u8> {
    payload
        .iter()
        .map(|&b| if b == b':' { b'\n' } else { b })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_become_newlines() {
        assert_eq!(format_payload(b"passed:3:failed:0"), b"passed\n3\nfailed\n0");
        assert_eq!(format_payload(b"no separators"), b"no separators");
    }

    #[tokio::test]
    async fn store_creates_directory_and_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path().join("nested").join("results"));

        let path = store.store("abc123", b"ok:all good").await.unwrap();

        assert_eq!(path, store.path_for("abc123"));
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, b"ok\nall good");
    }

    #[tokio::test]
    async fn store_overwrites_previous_results() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ResultStore::new(tmp.path());

        store.store("abc123", b"first").await.unwrap();
        store.store("abc123", b"second").await.unwrap();

        let written = tokio::fs::read_to_string(store.path_for("abc123")).await.unwrap();
        assert_eq!(written, "second");
    }
}
