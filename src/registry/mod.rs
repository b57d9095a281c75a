//! Registry client module
//!
//! Everything that talks to the registry: the [`RegistryApi`] operations, their HTTP
//! implementation, challenge-driven authentication with a shared credential cache,
//! and the retry decorator.

pub mod api;
pub mod auth;
pub mod client;
pub mod retry;
pub mod token_manager;

pub use api::{RegistryApi, UploadSession};
pub use auth::{Auth, Challenge, Credential};
pub use client::{RegistryClient, RegistryClientBuilder};
pub use retry::{RetryPolicy, RetryingRegistry};
pub use token_manager::TokenManager;
