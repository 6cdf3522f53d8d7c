pub mod coordinator;
pub mod engine;
pub mod machine;
pub mod rest;
pub mod ticker;

pub mod mock;

pub use coordinator::{CreateOutcome, PersistRetry, SyncCoordinator, COMPLETE_TITLE};
pub use engine::{EnginePorts, SyncEngine};
pub use machine::{RemoteOutcome, SessionEffect, SessionStateMachine};
pub use rest::HttpSessionApi;
pub use ticker::{TickHandle, TickId, Ticker};
