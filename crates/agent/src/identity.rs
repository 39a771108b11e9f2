use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::OnceCell;

use opsdesk_core::config::ServiceAccountConfig;

/// The account the agent acts as when a turn carries no user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub user_id: String,
    pub company_id: Option<String>,
}

#[async_trait]
pub trait ServiceIdentityResolver: Send + Sync {
    async fn resolve(&self) -> Result<ServiceIdentity>;
}

#[derive(Clone, Debug)]
pub struct ConfiguredServiceIdentity {
    identity: ServiceIdentity,
}

impl ConfiguredServiceIdentity {
    pub fn new(identity: ServiceIdentity) -> Self {
        Self { identity }
    }
}

impl From<&ServiceAccountConfig> for ConfiguredServiceIdentity {
    fn from(config: &ServiceAccountConfig) -> Self {
        Self::new(ServiceIdentity {
            user_id: config.user_id.clone(),
            company_id: config.company_id.clone(),
        })
    }
}

#[async_trait]
impl ServiceIdentityResolver for ConfiguredServiceIdentity {
    async fn resolve(&self) -> Result<ServiceIdentity> {
        Ok(self.identity.clone())
    }
}

/// Resolves the service identity once per runtime. Concurrent first callers
/// share one resolution; a failed resolution is retried by the next caller.
pub struct MemoizedServiceIdentity {
    resolver: Arc<dyn ServiceIdentityResolver>,
    cell: OnceCell<ServiceIdentity>,
}

impl MemoizedServiceIdentity {
    pub fn new(resolver: Arc<dyn ServiceIdentityResolver>) -> Self {
        Self { resolver, cell: OnceCell::new() }
    }

    pub async fn get(&self) -> Result<&ServiceIdentity> {
        self.cell.get_or_try_init(|| self.resolver.resolve()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::{MemoizedServiceIdentity, ServiceIdentity, ServiceIdentityResolver};

    struct SlowResolver {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl ServiceIdentityResolver for SlowResolver {
        async fn resolve(&self) -> Result<ServiceIdentity> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_first && call == 0 {
                return Err(anyhow!("directory unavailable"));
            }
            Ok(ServiceIdentity { user_id: "svc-1".to_string(), company_id: None })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_resolve_once() {
        let resolver = Arc::new(SlowResolver { calls: AtomicUsize::new(0), fail_first: false });
        let memo = MemoizedServiceIdentity::new(resolver.clone());

        let (left, right, third) = tokio::join!(memo.get(), memo.get(), memo.get());

        assert_eq!(left.expect("left").user_id, "svc-1");
        assert_eq!(right.expect("right").user_id, "svc-1");
        assert_eq!(third.expect("third").user_id, "svc-1");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_resolution_is_retried() {
        let resolver = Arc::new(SlowResolver { calls: AtomicUsize::new(0), fail_first: true });
        let memo = MemoizedServiceIdentity::new(resolver.clone());

        assert!(memo.get().await.is_err());
        assert_eq!(memo.get().await.expect("second attempt").user_id, "svc-1");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }
}
