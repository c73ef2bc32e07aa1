//! # Keywarden Client
//!
//! Shared entity types for the Keywarden SSH access authority.
//! The supervision core (`bin/core`), the transport lib and the
//! web frontend all consume the types in [entities].

pub mod entities;
