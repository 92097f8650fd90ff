//! Pool bookkeeping: warm-instance templates and the coordinator that
//! serializes reservation against concurrent lifecycle operations.
//!
//! No in-memory inventory is kept. The provider's tags are the source of
//! truth; the coordinator's lock only makes the provider's read-then-mark
//! reservation sequence atomic across concurrent setup calls.

use tokio::sync::Mutex;

use crate::provider::{Credentials, Instance, Provisioner};
use crate::spec::ResourceSpec;

/// A named, pre-warmed group of reusable instances.
#[derive(Clone, Debug)]
pub struct Pool {
    /// Template used when creating replacement instances.
    pub template: ResourceSpec,
    /// Count of ready, free instances the pool maintains.
    pub target_size: usize,
}

impl Pool {
    /// Creates a pool definition.
    #[must_use]
    pub const fn new(template: ResourceSpec, target_size: usize) -> Self {
        Self {
            template,
            target_size,
        }
    }
}

/// Serializes all pool-state queries and mutations behind one lock shared
/// across every lifecycle operation for every pool.
///
/// The lock is asynchronous because it must stay held across the provider's
/// tag read-then-mark calls; nothing else runs under it.
#[derive(Debug, Default)]
pub struct PoolCoordinator {
    lock: Mutex<()>,
}

impl PoolCoordinator {
    /// Creates a coordinator with an unheld lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: Mutex::const_new(()),
        }
    }

    /// Reserves a free instance from `pool_name`, marking it in-progress so
    /// no concurrent setup can claim it.
    ///
    /// `Ok(None)` signals an empty pool and is not an error: the caller
    /// falls back to ad-hoc provisioning.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the reservation query fails.
    pub async fn try_reserve<P: Provisioner>(
        &self,
        provider: &P,
        creds: &Credentials,
        pool_name: &str,
    ) -> Result<Option<Instance>, P::Error> {
        let _guard = self.lock.lock().await;
        provider.try_reserve(creds, pool_name).await
    }

    /// Counts free instances in `pool_name` under the shared lock so the
    /// read cannot interleave with a concurrent reservation.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the count query fails.
    pub async fn count_free<P: Provisioner>(
        &self,
        provider: &P,
        creds: &Credentials,
        pool_name: &str,
    ) -> Result<usize, P::Error> {
        let _guard = self.lock.lock().await;
        provider.count_free(creds, pool_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvisioner;
    use rstest::rstest;

    fn creds() -> Credentials {
        Credentials::new("access", "secret", "eu-west-1")
    }

    #[rstest]
    #[tokio::test]
    async fn try_reserve_returns_marked_instance() {
        let provider = FakeProvisioner::new();
        provider.push_reservation(Some(Instance::new("i-1", "10.0.0.1")));

        let coordinator = PoolCoordinator::new();
        let reserved = coordinator
            .try_reserve(&provider, &creds(), "warm")
            .await
            .expect("reservation should succeed");
        assert_eq!(reserved, Some(Instance::new("i-1", "10.0.0.1")));
    }

    #[rstest]
    #[tokio::test]
    async fn concurrent_reservations_claim_one_instance_each() {
        let provider = FakeProvisioner::new();
        provider.push_reservation(Some(Instance::new("i-1", "10.0.0.1")));
        provider.push_reservation(None);

        let coordinator = PoolCoordinator::new();
        let credentials = creds();
        let (first, second) = tokio::join!(
            coordinator.try_reserve(&provider, &credentials, "warm"),
            coordinator.try_reserve(&provider, &credentials, "warm"),
        );
        let outcomes = [
            first.expect("first reservation"),
            second.expect("second reservation"),
        ];
        let claimed = outcomes.iter().filter(|found| found.is_some()).count();
        assert_eq!(claimed, 1, "exactly one caller may claim the free instance");
    }

    #[rstest]
    #[tokio::test]
    async fn count_free_reads_under_the_lock() {
        let provider = FakeProvisioner::new();
        provider.set_free_count("warm", 3);

        let coordinator = PoolCoordinator::new();
        let count = coordinator
            .count_free(&provider, &creds(), "warm")
            .await
            .expect("count should succeed");
        assert_eq!(count, 3);
    }
}
