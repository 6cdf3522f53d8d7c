pub mod config;
pub mod errors;
pub mod ids;
pub mod message;
pub mod ports;
pub mod session;

pub use config::{ConfigError, SyncConfig};
pub use errors::{ApiError, SyncError};
pub use ids::{DeviceId, LocalSessionId, ServerSessionId};
pub use message::{Message, TimerUpdate, TIMER_UPDATE};
pub use ports::{Identity, NotificationPort, SessionApi, UiPort};
pub use session::{
    CadenceDurations, CreateSessionRequest, SessionKind, SessionSnapshot, SessionStatus, TaskRef,
    TimerSession, UpdateSessionRequest,
};
