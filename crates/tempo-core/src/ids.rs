use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Time-ordered, so ids minted later sort later.
            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether this id was minted by an engine rather than received
            /// from another client.
            pub fn is_generated(&self) -> bool {
                self.0
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .is_some_and(|uuid| Uuid::parse_str(uuid).is_ok())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// Client-generated; never leaves this process except as a log field.
    LocalSessionId,
    "sess"
);
prefixed_id!(
    /// Identifies one engine instance among the user's devices. Carried as
    /// `origin` on outgoing `timer_update`s so echoes can be dropped.
    DeviceId,
    "dev"
);

/// Row id the backend assigns to a persisted timer session.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerSessionId(pub i64);

impl fmt::Display for ServerSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_session_id_has_prefix() {
        let id = LocalSessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn device_id_has_prefix() {
        let id = DeviceId::new();
        assert!(id.as_str().starts_with("dev_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = LocalSessionId::new();
        let b = LocalSessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn foreign_origins_round_trip_verbatim() {
        let id: DeviceId = serde_json::from_str(r#""web-tab-3""#).unwrap();
        assert_eq!(id.as_str(), "web-tab-3");
        assert!(!id.is_generated());
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""web-tab-3""#);
    }

    #[test]
    fn minted_ids_are_recognised_as_generated() {
        assert!(DeviceId::new().is_generated());
        assert!(LocalSessionId::new().is_generated());
        let wrong_prefix: DeviceId =
            serde_json::from_str(&format!("\"sess_{}\"", Uuid::now_v7())).unwrap();
        assert!(!wrong_prefix.is_generated());
    }

    #[test]
    fn later_ids_sort_after_earlier_ones() {
        let a = LocalSessionId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = LocalSessionId::new();
        assert!(a.as_str() < b.as_str());
    }

    #[test]
    fn server_session_id_is_a_bare_number_on_the_wire() {
        let json = serde_json::to_string(&ServerSessionId(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: ServerSessionId = serde_json::from_str("17").unwrap();
        assert_eq!(parsed, ServerSessionId(17));
    }
}
