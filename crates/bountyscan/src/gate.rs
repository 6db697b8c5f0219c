use uuid::Uuid;

use crate::profile::{parse_user_id, CompletenessPolicy};
use crate::repository::ProfileStore;
use crate::resolve::Route;
use crate::session::SessionManager;

/// Decide whether `user_id` may see the dashboard.
///
/// Fails closed: anything unreadable sends the user back to the face scan.
pub async fn dashboard_gate(
    user_id: Option<&str>,
    sessions: &SessionManager,
    profiles: &dyn ProfileStore,
    policy: CompletenessPolicy,
) -> Route {
    let Some(user_id) = user_id.and_then(parse_user_id) else {
        tracing::debug!("dashboard gate: no valid user id");
        return Route::FaceScan;
    };

    match sessions.current() {
        Ok(Some(session)) if session.user_id == user_id => {}
        Ok(Some(session)) => {
            tracing::warn!(
                %user_id,
                session_user = %session.user_id,
                "dashboard gate: session belongs to another user"
            );
            return Route::FaceScan;
        }
        Ok(None) => return Route::FaceScan,
        Err(e) => {
            tracing::warn!(error = %e, "dashboard gate: session storage unreadable");
            return Route::FaceScan;
        }
    }

    gate_on_profile(user_id, profiles, policy).await
}

async fn gate_on_profile(
    user_id: Uuid,
    profiles: &dyn ProfileStore,
    policy: CompletenessPolicy,
) -> Route {
    match profiles.get(user_id).await {
        Ok(Some(profile)) if profile.is_complete(policy) => Route::Dashboard(user_id),
        Ok(_) => Route::Identity(user_id),
        Err(e) => {
            tracing::warn!(%user_id, error = %e, "dashboard gate: profile lookup failed");
            Route::FaceScan
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileFields, UserProfile};
    use crate::repository::MemoryStore;
    use crate::resolve::tests::complete_fields;

    async fn store_with(user_id: Uuid, fields: ProfileFields) -> MemoryStore {
        let store = MemoryStore::default();
        let mut profile = UserProfile::pending(user_id);
        profile.profile = fields;
        store.create(&profile).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_complete_profile_with_session_reaches_dashboard() {
        let id = Uuid::new_v4();
        let store = store_with(id, complete_fields()).await;
        let sessions = SessionManager::in_memory();
        sessions.create(id).unwrap();

        let route = dashboard_gate(
            Some(&id.to_string()),
            &sessions,
            &store,
            CompletenessPolicy::Extended,
        )
        .await;
        assert_eq!(route, Route::Dashboard(id));
    }

    #[tokio::test]
    async fn test_missing_or_invalid_id_goes_to_face_scan() {
        let store = MemoryStore::default();
        let sessions = SessionManager::in_memory();
        for raw in [None, Some("garbage"), Some("00000000-0000-0000-0000-000000000000")] {
            let route = dashboard_gate(raw, &sessions, &store, CompletenessPolicy::Basic).await;
            assert_eq!(route, Route::FaceScan, "{raw:?}");
        }
    }

    #[tokio::test]
    async fn test_session_for_other_user_is_rejected() {
        let id = Uuid::new_v4();
        let store = store_with(id, complete_fields()).await;
        let sessions = SessionManager::in_memory();
        sessions.create(Uuid::new_v4()).unwrap();

        let route = dashboard_gate(
            Some(&id.to_string()),
            &sessions,
            &store,
            CompletenessPolicy::Basic,
        )
        .await;
        assert_eq!(route, Route::FaceScan);
    }

    #[tokio::test]
    async fn test_policy_decides_between_identity_and_dashboard() {
        let id = Uuid::new_v4();
        let fields = ProfileFields {
            phone: String::new(),
            role: String::new(),
            ..complete_fields()
        };
        let store = store_with(id, fields).await;
        let sessions = SessionManager::in_memory();
        sessions.create(id).unwrap();
        let raw = id.to_string();

        let basic = dashboard_gate(Some(&raw), &sessions, &store, CompletenessPolicy::Basic).await;
        let extended =
            dashboard_gate(Some(&raw), &sessions, &store, CompletenessPolicy::Extended).await;
        assert_eq!(basic, Route::Dashboard(id));
        assert_eq!(extended, Route::Identity(id));
    }

    #[tokio::test]
    async fn test_missing_profile_goes_to_identity() {
        let id = Uuid::new_v4();
        let store = MemoryStore::default();
        let sessions = SessionManager::in_memory();
        sessions.create(id).unwrap();

        let route = dashboard_gate(
            Some(&id.to_string()),
            &sessions,
            &store,
            CompletenessPolicy::Extended,
        )
        .await;
        assert_eq!(route, Route::Identity(id));
    }
}
