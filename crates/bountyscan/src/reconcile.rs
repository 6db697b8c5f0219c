use std::collections::BTreeSet;

use uuid::Uuid;

use crate::profile::UserProfile;
use crate::repository::{FaceVectorStore, ProfileStore};
use crate::store::StoreError;

/// Give every enrolled face a profile.
///
/// Enrollment writes the descriptor first and the profile second, without a
/// transaction. This repairs the gap by creating an empty pending profile for
/// each descriptor owner that has none. Returns the repaired user ids.
pub async fn reconcile_orphans(
    vectors: &dyn FaceVectorStore,
    profiles: &dyn ProfileStore,
) -> Result<Vec<Uuid>, StoreError> {
    let owners: BTreeSet<Uuid> = vectors
        .scan_all()
        .await?
        .into_iter()
        .map(|record| record.user_id)
        .collect();

    let mut repaired = Vec::new();
    for user_id in owners {
        if profiles.get(user_id).await?.is_some() {
            continue;
        }
        match profiles.create(&UserProfile::pending(user_id)).await {
            Ok(()) => {
                tracing::info!(%user_id, "created profile for orphaned face vector");
                repaired.push(user_id);
            }
            // Raced with the identity form
            Err(StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }
    }

    if !repaired.is_empty() {
        tracing::info!(count = repaired.len(), "orphan reconciliation finished");
    }
    Ok(repaired)
}
