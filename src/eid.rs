use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, ops::Deref};

/// Sortable unique id (ULID) for journal entries and temp files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(Ulid::generate().to_string())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}
