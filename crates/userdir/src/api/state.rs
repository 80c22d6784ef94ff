//! Application state shared across handlers.

use crate::user::UserDirectory;

/// Application state shared across handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// The user directory every route operates on.
    pub users: UserDirectory,
    /// Origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(users: UserDirectory) -> Self {
        Self {
            users,
            allowed_origins: Vec::new(),
        }
    }

    /// Set the CORS origins.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
