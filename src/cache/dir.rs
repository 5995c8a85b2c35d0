use crate::cache::{Cache, CacheError, CacheKey};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Stores every entry as one file directly below a root directory.
///
/// Entries contain private keys, so the directory is created owner-only and files are written
/// with mode 0600. Writes go to a temporary sibling first and are renamed into place, readers
/// never see a partially written entry.
#[derive(Debug, Clone)]
pub struct DirCache {
    root: PathBuf,
}

impl DirCache {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        Ok(self.root.join(key.validated_name()?))
    }

    async fn ensure_root(&self) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.root).await
    }
}

fn not_found_to_miss(err: io::Error) -> CacheError {
    if err.kind() == io::ErrorKind::NotFound {
        CacheError::NotFound
    } else {
        CacheError::Io(err)
    }
}

#[async_trait]
impl Cache for DirCache {
    async fn get(&self, key: &CacheKey) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(not_found_to_miss)
    }

    async fn put(&self, key: &CacheKey, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        self.ensure_root().await?;
        let tmp_path = self
            .root
            .join(format!(".{}.tmp-{}", key.validated_name()?, rand::random::<u32>()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let write_result = async {
            let mut file = options.open(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        }
        .await;
        if let Err(err) = write_result {
            // Best effort, the original error is the interesting one
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        debug!("Wrote cache entry {}", path.display());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path).await.map_err(not_found_to_miss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_creates_private_directory_and_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("certcache");
        let cache = DirCache::new(&root);

        cache.put(&CacheKey::Account, b"secret").await?;

        assert_eq!(std::fs::read(root.join("acme_account+key"))?, b"secret");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(root.join("acme_account+key"))?
                .permissions()
                .mode();
            assert_eq!(file_mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(&root)?.permissions().mode();
            assert_eq!(dir_mode & 0o077, 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_no_temporary_files_left_behind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = DirCache::new(temp.path());

        cache.put(&CacheKey::certificate("example.com"), b"one").await?;
        cache.put(&CacheKey::certificate("example.com"), b"two").await?;

        let names = std::fs::read_dir(temp.path())?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(names, vec!["example.com".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_traversal_never_touches_filesystem() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("cache");
        let cache = DirCache::new(&root);

        let err = cache
            .put(&CacheKey::Raw("../escape".to_string()), b"x")
            .await
            .unwrap_err();

        assert!(matches!(err, CacheError::InvalidKey(_)));
        assert!(!temp.path().join("escape").exists());
        assert!(!root.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_reports_not_found() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cache = DirCache::new(temp.path());

        let err = cache
            .delete(&CacheKey::certificate("missing.example"))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        Ok(())
    }
}
