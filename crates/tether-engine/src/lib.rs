//! Session lifecycle orchestration: creates, pairs, monitors, reconnects
//! and tears down many concurrent protocol connections, enforces the
//! per-owner quota, and fans lifecycle events out to subscribers.

pub mod broadcast;
pub mod config;
mod context;
pub mod error;
pub mod health;
mod locks;
pub mod orchestrator;
pub mod pairing;
pub mod quota;
pub mod registry;
pub mod render;
mod worker;

pub use broadcast::{EventBroadcaster, Subscription};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, RestoreError};
pub use health::SweepReport;
pub use orchestrator::{EngineStats, Orchestrator, SessionOrchestrator};
pub use quota::{LimitExceeded, QuotaGuard, Reservation};
pub use registry::{SessionHandle, SessionRegistry};
pub use render::{PairingRenderer, QrSvgRenderer, RenderError};
