//! Domain types
//!
//! - [`Session`] - an authenticated user context as issued by the provider
//! - [`User`] - the identity attached to a session

pub mod session;

pub use session::{Session, User};
