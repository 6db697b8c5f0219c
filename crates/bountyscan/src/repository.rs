//! Repository interfaces for face vectors and user profiles.
//!
//! The resolution flow only talks to these traits, so the linear-scan
//! matcher can be replaced by an indexed store without touching it.

use std::collections::HashMap;

use async_trait::async_trait;
use bounty_core::{CosineMatcher, FaceDescriptor, MatchResult, Matcher};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::profile::{ProfileUpdate, UserProfile};
use crate::store::StoreError;

/// One enrolled face. Records are append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFaceRecord {
    pub id: Uuid,
    pub descriptor: FaceDescriptor,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait FaceVectorStore: Send + Sync {
    async fn insert(
        &self,
        descriptor: &FaceDescriptor,
        user_id: Uuid,
    ) -> Result<StoredFaceRecord, StoreError>;

    /// Every stored record. No pagination.
    async fn scan_all(&self) -> Result<Vec<StoredFaceRecord>, StoreError>;

    async fn count_faces(&self) -> Result<u64, StoreError>;

    /// Best match for `query` across the whole store.
    ///
    /// The default is a full scan with the cosine arg-max matcher.
    async fn find_best_match(&self, query: &FaceDescriptor) -> Result<MatchResult, StoreError> {
        let records = self.scan_all().await?;
        let result = CosineMatcher::default().compare(
            query.values(),
            records.iter().map(|r| (r.user_id, r.descriptor.values())),
        );
        tracing::debug!(
            candidates = records.len(),
            similarity = result.similarity,
            matched = result.matched,
            "face vector scan finished"
        );
        Ok(result)
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError>;

    async fn create(&self, profile: &UserProfile) -> Result<(), StoreError>;

    /// Apply a partial update. Returns `false` if no profile exists.
    async fn update(&self, user_id: Uuid, update: &ProfileUpdate) -> Result<bool, StoreError>;

    async fn count_profiles(&self) -> Result<u64, StoreError>;
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    faces: Mutex<Vec<StoredFaceRecord>>,
    profiles: Mutex<HashMap<Uuid, UserProfile>>,
}

#[async_trait]
impl FaceVectorStore for MemoryStore {
    async fn insert(
        &self,
        descriptor: &FaceDescriptor,
        user_id: Uuid,
    ) -> Result<StoredFaceRecord, StoreError> {
        let record = StoredFaceRecord {
            id: Uuid::new_v4(),
            descriptor: descriptor.clone(),
            user_id,
            created_at: Utc::now(),
        };
        self.faces.lock().await.push(record.clone());
        Ok(record)
    }

    async fn scan_all(&self) -> Result<Vec<StoredFaceRecord>, StoreError> {
        Ok(self.faces.lock().await.clone())
    }

    async fn count_faces(&self) -> Result<u64, StoreError> {
        Ok(self.faces.lock().await.len() as u64)
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.profiles.lock().await.get(&user_id).cloned())
    }

    async fn create(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let mut profiles = self.profiles.lock().await;
        if profiles.contains_key(&profile.user_id) {
            return Err(StoreError::AlreadyExists(profile.user_id));
        }
        profiles.insert(profile.user_id, profile.clone());
        Ok(())
    }

    async fn update(&self, user_id: Uuid, update: &ProfileUpdate) -> Result<bool, StoreError> {
        let mut profiles = self.profiles.lock().await;
        match profiles.get_mut(&user_id) {
            Some(profile) => {
                update.apply(profile, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_profiles(&self) -> Result<u64, StoreError> {
        Ok(self.profiles.lock().await.len() as u64)
    }
}
