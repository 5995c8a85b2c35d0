use crate::acme::ChallengeResponder;
use crate::cache::{Cache, CacheKey, tolerate_missing};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct PendingChallenge {
    domain: String,
    key_authorization: String,
}

/// Key authorizations of the challenges being validated, mirrored into the cache so another
/// instance sharing it can answer the CA.
#[derive(Debug)]
pub struct ChallengeStore {
    pending: RwLock<HashMap<String, PendingChallenge>>,
    cache: Arc<dyn Cache>,
}

pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn token_from_path(path: &str) -> Option<&str> {
    path.strip_prefix(ACME_CHALLENGE_PREFIX)
        .filter(|token| is_valid_token(token))
}

impl ChallengeStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            cache,
        }
    }

    pub async fn response(&self, token: &str) -> Option<String> {
        if !is_valid_token(token) {
            return None;
        }
        let local = self
            .pending
            .read()
            .get(token)
            .map(|pending| pending.key_authorization.clone());
        if local.is_some() {
            return local;
        }
        match self.cache.get(&CacheKey::http_token(token)).await {
            Ok(stored) => String::from_utf8(stored).ok(),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                warn!("Looking up challenge token in cache failed: {err:#}");
                None
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub async fn purge_domain(&self, domain: &str) {
        let tokens = {
            let mut pending = self.pending.write();
            let tokens = pending
                .iter()
                .filter(|(_, challenge)| challenge.domain == domain)
                .map(|(token, _)| token.clone())
                .collect::<Vec<_>>();
            for token in &tokens {
                pending.remove(token);
            }
            tokens
        };
        for token in tokens {
            self.delete_cached(&token).await;
        }
    }

    async fn delete_cached(&self, token: &str) {
        if let Err(err) = tolerate_missing(self.cache.delete(&CacheKey::http_token(token)).await) {
            warn!("Removing challenge token from cache failed: {err:#}");
        }
    }
}

#[async_trait]
impl ChallengeResponder for ChallengeStore {
    async fn present(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> anyhow::Result<()> {
        if !is_valid_token(token) {
            anyhow::bail!("CA sent a malformed challenge token");
        }
        debug!("Publishing HTTP-01 challenge for {domain}");
        self.pending.write().insert(
            token.to_string(),
            PendingChallenge {
                domain: domain.to_string(),
                key_authorization: key_authorization.to_string(),
            },
        );
        if let Err(err) = self
            .cache
            .put(&CacheKey::http_token(token), key_authorization.as_bytes())
            .await
        {
            warn!("Storing challenge token in cache failed, only this instance can answer: {err:#}");
        }
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &str) -> anyhow::Result<()> {
        debug!("Removing HTTP-01 challenge for {domain}");
        self.pending.write().remove(token);
        self.delete_cached(token).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use rstest::rstest;

    #[rstest]
    #[case("/.well-known/acme-challenge/abc_DEF-123", Some("abc_DEF-123"))]
    #[case("/.well-known/acme-challenge/", None)]
    #[case("/.well-known/acme-challenge/a/b", None)]
    #[case("/.well-known/acme-challenge/../x", None)]
    #[case("/.well-known/acme-challenge", None)]
    #[case("/other/abc", None)]
    fn test_token_from_path(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(token_from_path(path), expected);
    }

    #[tokio::test]
    async fn test_present_and_cleanup() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let store = ChallengeStore::new(cache.clone());

        store.present("example.com", "tok", "tok.thumb").await?;
        assert_eq!(store.response("tok").await.as_deref(), Some("tok.thumb"));
        assert_eq!(cache.get(&CacheKey::http_token("tok")).await?, b"tok.thumb");

        store.cleanup("example.com", "tok").await?;
        assert_eq!(store.response("tok").await, None);
        assert!(cache.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_answers_from_shared_cache() -> anyhow::Result<()> {
        let cache = Arc::new(MemoryCache::new());
        let issuing = ChallengeStore::new(cache.clone());
        let other_instance = ChallengeStore::new(cache);

        issuing.present("example.com", "shared", "shared.thumb").await?;

        assert_eq!(
            other_instance.response("shared").await.as_deref(),
            Some("shared.thumb")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_only_touches_domain() -> anyhow::Result<()> {
        let store = ChallengeStore::new(Arc::new(MemoryCache::new()));
        store.present("a.example", "t1", "k1").await?;
        store.present("a.example", "t2", "k2").await?;
        store.present("b.example", "t3", "k3").await?;

        store.purge_domain("a.example").await;

        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.response("t1").await, None);
        assert_eq!(store.response("t3").await.as_deref(), Some("k3"));
        Ok(())
    }
}
