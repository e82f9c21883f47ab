use std::fmt;

use crate::error::{Result, WireError};

/// A `database.collection` pair.
///
/// Only the first `.` separates the two: collection names may themselves
/// contain dots (`db.sub.coll` is collection `sub.coll` in database `db`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Split a full collection name into database and collection.
    pub fn parse(full_name: &str) -> Result<Self> {
        match full_name.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self::new(database, collection))
            }
            _ => Err(WireError::InvalidNamespace(full_name.to_string())),
        }
    }

    /// Whether this is the pseudo-collection commands are addressed to.
    pub fn is_command(&self) -> bool {
        self.collection == "$cmd"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
