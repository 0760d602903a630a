//! Identifier types shared across the client

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully qualified identity of a target database.
///
/// Opaque to the client: the service defines the format (typically
/// `"<instance>/<database>"`). Used as the key for per-database session
/// pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Create a database identity from its service-side name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the underlying name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Handle to a server-side session.
///
/// The name is assigned by the service at creation time and is the only
/// thing subsequent RPCs need to address the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    name: String,
}

impl SessionHandle {
    /// Wrap a server-assigned session name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The server-assigned session name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifier of a transaction begun on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Wrap a server-assigned transaction id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_round_trip_through_serde() {
        let database = DatabaseId::new("inst/db-main");
        let json = serde_json::to_string(&database).expect("serialize");
        let back: DatabaseId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(database, back);

        let handle = SessionHandle::new("inst/db-main/sessions/0");
        let json = serde_json::to_string(&handle).expect("serialize");
        let back: SessionHandle = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(handle, back);
        assert_eq!(back.name(), "inst/db-main/sessions/0");
    }

    #[test]
    fn identifiers_render_their_names() {
        assert_eq!(DatabaseId::new("inst/db-a").to_string(), "inst/db-a");
        assert_eq!(TransactionId::new("txn-7").to_string(), "txn-7");
    }
}
