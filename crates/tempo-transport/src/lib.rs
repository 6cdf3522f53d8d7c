pub mod backoff;
pub mod connector;
pub mod dispatcher;
pub mod manager;

pub mod mock;

pub use backoff::BackoffPolicy;
pub use connector::{Connector, Link, TransportError, WsConnector};
pub use dispatcher::{Callback, CallbackResult, DispatchReport, EventDispatcher, SubscriptionHandle};
pub use manager::{endpoint_url, ConnectionInfo, ConnectionState, TransportManager};
