//! Face scan onboarding.
//!
//! A scan arms the camera on a dedicated engine thread, runs the blink and
//! head-turn liveness challenge, then resolves the face against the encrypted
//! vector store: a match resumes the existing account, anything else enrolls
//! a new one. Profiles and the local session decide where the user lands.

pub mod camera;
pub mod config;
pub mod controller;
pub mod engine;
pub mod gate;
pub mod profile;
pub mod reconcile;
pub mod replay;
pub mod repository;
pub mod resolve;
pub mod session;
pub mod store;

pub use config::Config;
pub use controller::{ScanController, ScanEvent, ScanHandle, ScanSettings, ScanView};
pub use engine::{spawn_engine, DetectionSource, EngineError, EngineHandle};
pub use gate::dashboard_gate;
pub use profile::{complete_profile, CompletenessPolicy, ProfileFields, UserProfile};
pub use reconcile::reconcile_orphans;
pub use repository::{FaceVectorStore, MemoryStore, ProfileStore};
pub use resolve::{IdentityResolver, Resolution, ResolveError, Route};
pub use session::{FileSessionStorage, SessionManager};
pub use store::{SqliteStore, StoreError};
