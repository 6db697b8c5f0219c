//! Identity resolution: match a live face against enrolled vectors and
//! decide where the user goes next.
//!
//! Store writes ([`IdentityResolver::match_identity`]) and the session write
//! ([`IdentityResolver::bind_session`]) are separate steps, so a scan that is
//! abandoned mid-resolution can finish enrolling without touching the session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bounty_core::{DescriptorError, FaceDescriptor};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{DetectionSource, EngineError};
use crate::profile::{CompletenessPolicy, UserProfile};
use crate::repository::{FaceVectorStore, ProfileStore};
use crate::session::{Session, SessionError, SessionManager};
use crate::store::StoreError;

pub const EXISTING_USER_REDIRECT_DELAY: Duration = Duration::from_millis(1000);
pub const NEW_USER_REDIRECT_DELAY: Duration = Duration::from_millis(1500);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector returned no descriptor")]
    MissingDescriptor,
    #[error("invalid face descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("face vector store: {0}")]
    Store(#[from] StoreError),
    #[error("session storage: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Dashboard(Uuid),
    Identity(Uuid),
    FaceScan,
}

impl Route {
    pub fn path(&self) -> String {
        match self {
            Self::Dashboard(id) => format!("/dashboard?id={id}"),
            Self::Identity(id) => format!("/identity?id={id}"),
            Self::FaceScan => "/face-scan".to_string(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Where a face resolved to, before a session is bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Identified {
    pub user_id: Uuid,
    pub route: Route,
    pub similarity: Option<f32>,
    pub profile_pending: bool,
    pub redirect_after: Duration,
}

/// Outcome of a completed resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub user_id: Uuid,
    pub route: Route,
    pub session: Session,
    /// Similarity of the matched record; `None` for a new user.
    pub similarity: Option<f32>,
    /// The new user's profile write failed and is left to the identity form.
    pub profile_pending: bool,
    pub redirect_after: Duration,
}

impl Resolution {
    pub fn is_new_user(&self) -> bool {
        self.similarity.is_none()
    }
}

/// Progress notifications, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveStep {
    ComputingEmbedding,
    DescriptorCaptured,
    QueryingStore,
    MatchFound { user_id: Uuid, similarity: f32 },
    NoMatch { best_similarity: f32 },
    SessionCleared,
    CheckingProfile,
    ProfileComplete,
    ProfileIncomplete,
    ProfileMissing,
    ProfileLookupFailed,
    UserIdGenerated(Uuid),
    DescriptorStored(Uuid),
    ProfileCreated,
    ProfileDeferred,
    SessionCreated(String),
    Redirecting(Route),
}

pub type StepSender = mpsc::UnboundedSender<ResolveStep>;

fn emit(steps: &StepSender, step: ResolveStep) {
    // Nobody listening is fine
    let _ = steps.send(step);
}

pub struct IdentityResolver {
    vectors: Arc<dyn FaceVectorStore>,
    profiles: Arc<dyn ProfileStore>,
    sessions: SessionManager,
    policy: CompletenessPolicy,
}

impl IdentityResolver {
    pub fn new(
        vectors: Arc<dyn FaceVectorStore>,
        profiles: Arc<dyn ProfileStore>,
        sessions: SessionManager,
        policy: CompletenessPolicy,
    ) -> Self {
        Self {
            vectors,
            profiles,
            sessions,
            policy,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Capture a fresh descriptor from `source`, then resolve it.
    pub async fn identify(
        &self,
        source: &dyn DetectionSource,
        steps: &StepSender,
    ) -> Result<Resolution, ResolveError> {
        let descriptor = self.capture(source, steps).await?;
        self.resolve(&descriptor, steps).await
    }

    /// Re-run detection with descriptors and take the first face.
    pub async fn capture(
        &self,
        source: &dyn DetectionSource,
        steps: &StepSender,
    ) -> Result<FaceDescriptor, ResolveError> {
        emit(steps, ResolveStep::ComputingEmbedding);
        let faces = source.detect(true).await?;
        let face = faces.into_iter().next().ok_or(ResolveError::NoFaceDetected)?;
        let descriptor = face
            .face_descriptor()?
            .ok_or(ResolveError::MissingDescriptor)?;
        emit(steps, ResolveStep::DescriptorCaptured);
        Ok(descriptor)
    }

    /// Match, enroll if needed, and bind a fresh session.
    pub async fn resolve(
        &self,
        descriptor: &FaceDescriptor,
        steps: &StepSender,
    ) -> Result<Resolution, ResolveError> {
        let identified = self.match_identity(descriptor, steps).await?;
        self.bind_session(identified, steps)
    }

    /// Store side of a resolution: match against enrolled vectors, or enroll
    /// a new user. Local session storage is not touched.
    pub async fn match_identity(
        &self,
        descriptor: &FaceDescriptor,
        steps: &StepSender,
    ) -> Result<Identified, ResolveError> {
        emit(steps, ResolveStep::QueryingStore);
        let result = self.vectors.find_best_match(descriptor).await?;

        match result.user_id {
            Some(user_id) if result.matched => {
                tracing::info!(%user_id, similarity = result.similarity, "face matched");
                emit(
                    steps,
                    ResolveStep::MatchFound {
                        user_id,
                        similarity: result.similarity,
                    },
                );
                Ok(self.existing_user(user_id, result.similarity, steps).await)
            }
            _ => {
                tracing::info!(best_similarity = result.similarity, "no matching face");
                emit(
                    steps,
                    ResolveStep::NoMatch {
                        best_similarity: result.similarity,
                    },
                );
                self.new_user(descriptor, steps).await
            }
        }
    }

    /// Replace whatever session is stored with one bound to the identified
    /// user.
    pub fn bind_session(
        &self,
        identified: Identified,
        steps: &StepSender,
    ) -> Result<Resolution, ResolveError> {
        self.sessions.clear()?;
        emit(steps, ResolveStep::SessionCleared);

        // Bound on face match even when the profile still needs completing
        let session = self.sessions.create(identified.user_id)?;
        emit(steps, ResolveStep::SessionCreated(session.session_id.clone()));
        emit(steps, ResolveStep::Redirecting(identified.route));
        tracing::info!(user_id = %identified.user_id, route = %identified.route, "session bound");

        Ok(Resolution {
            user_id: identified.user_id,
            route: identified.route,
            session,
            similarity: identified.similarity,
            profile_pending: identified.profile_pending,
            redirect_after: identified.redirect_after,
        })
    }

    async fn existing_user(
        &self,
        user_id: Uuid,
        similarity: f32,
        steps: &StepSender,
    ) -> Identified {
        emit(steps, ResolveStep::CheckingProfile);
        let complete = match self.profiles.get(user_id).await {
            Ok(Some(profile)) => {
                let complete = profile.is_complete(self.policy);
                emit(
                    steps,
                    if complete {
                        ResolveStep::ProfileComplete
                    } else {
                        ResolveStep::ProfileIncomplete
                    },
                );
                complete
            }
            Ok(None) => {
                emit(steps, ResolveStep::ProfileMissing);
                false
            }
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "profile lookup failed, treating as incomplete");
                emit(steps, ResolveStep::ProfileLookupFailed);
                false
            }
        };

        Identified {
            user_id,
            route: if complete {
                Route::Dashboard(user_id)
            } else {
                Route::Identity(user_id)
            },
            similarity: Some(similarity),
            profile_pending: false,
            redirect_after: EXISTING_USER_REDIRECT_DELAY,
        }
    }

    async fn new_user(
        &self,
        descriptor: &FaceDescriptor,
        steps: &StepSender,
    ) -> Result<Identified, ResolveError> {
        let user_id = Uuid::new_v4();
        emit(steps, ResolveStep::UserIdGenerated(user_id));

        self.vectors.insert(descriptor, user_id).await?;
        emit(steps, ResolveStep::DescriptorStored(user_id));

        // Best effort: a missing profile is recreated by the identity form
        // or by orphan reconciliation.
        let profile_pending = match self.profiles.create(&UserProfile::pending(user_id)).await {
            Ok(()) => {
                emit(steps, ResolveStep::ProfileCreated);
                false
            }
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "profile creation failed, deferring to identity form");
                emit(steps, ResolveStep::ProfileDeferred);
                true
            }
        };
        tracing::info!(%user_id, profile_pending, "new user enrolled");

        Ok(Identified {
            user_id,
            route: Route::Identity(user_id),
            similarity: None,
            profile_pending,
            redirect_after: NEW_USER_REDIRECT_DELAY,
        })
    }
}
