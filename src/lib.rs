//! Framemark - video annotation backend
//!
//! Projects, uploaded videos, and timestamped annotation points, gated by an
//! external identity provider. This library exposes all modules for testing
//! purposes.

pub mod entities;
pub mod errors;
pub mod idp;
pub mod jwks;
pub mod session;
pub mod settings;
pub mod storage;
pub mod verifier;
pub mod web;
