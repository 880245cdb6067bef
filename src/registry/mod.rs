//! Docker/OCI v2 distribution protocol client.
//!
//! A stateless HTTP client parameterised by a credential resolver: token
//! acquisition, manifest GET with content-type negotiation, and blob
//! streaming with optional ranged continuation.

pub mod auth;
pub mod client;
pub mod manifest;

pub use auth::Auth;
pub use client::RegistryClient;
pub use manifest::{select_platform, ManifestDocument};
