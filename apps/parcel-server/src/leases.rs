use parcel_core::{ByteRange, CoverageSet, ReleaseOutcome};
use parcel_kernel::{AcquireOutcome, Kernel, Lease, ReleaseResult};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub(crate) enum LeaseError {
    #[error("token not found")]
    TokenNotFound,
    #[error("token already completed")]
    TokenAlreadyCompleted,
    #[error("token is held by another session")]
    TokenLocked,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Per-token mutual exclusion on top of the kernel's conditional writes.
#[derive(Clone)]
pub(crate) struct LeaseManager {
    kernel: Kernel,
}

impl LeaseManager {
    pub(crate) fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    pub(crate) async fn try_acquire(&self, token: &str) -> Result<Lease, LeaseError> {
        match self.kernel.try_acquire_async(token).await? {
            AcquireOutcome::Acquired(lease) => Ok(lease),
            AcquireOutcome::NotFound => Err(LeaseError::TokenNotFound),
            AcquireOutcome::AlreadyCompleted => Err(LeaseError::TokenAlreadyCompleted),
            AcquireOutcome::Locked => Err(LeaseError::TokenLocked),
        }
    }

    /// Merge the delivered interval while the lease is still current.
    /// `None` means another path already resolved the lease.
    pub(crate) async fn record_delivery(
        &self,
        lease: &Lease,
        delivered: Option<ByteRange>,
    ) -> anyhow::Result<Option<CoverageSet>> {
        self.kernel
            .record_coverage_async(&lease.token, &lease.lease_id, delivered)
            .await
    }

    pub(crate) async fn release(
        &self,
        lease: &Lease,
        outcome: ReleaseOutcome,
    ) -> anyhow::Result<ReleaseResult> {
        self.kernel
            .release_async(&lease.token, &lease.lease_id, outcome)
            .await
    }
}

/// Short stable fingerprint for logging a token without exposing it.
pub(crate) fn token_tag(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}
