//! User management module.
//!
//! Provides the user directory (CRUD, credential checks, id generation) and
//! the stores it can run on.

mod directory;
mod error;
mod memory;
mod models;
mod repository;
mod store;

pub use directory::{PasswordPolicy, USER_ID_PREFIX, UserDirectory, normalize_email};
pub use error::{UserError, UserResult};
pub use memory::MemoryUserStore;
pub use models::{
    CreateUserRequest, LoginRequest, NewUser, User, UserChanges, UserInfo, UserListQuery,
    UserPatch, UserRole,
};
pub use repository::UserRepository;
pub use store::UserStore;
