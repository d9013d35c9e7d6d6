//! # credstore-core
//!
//! Core library for the credstore secret record store providing:
//! - Secret models, commands and queries (with the lookup identifier rule)
//! - The error taxonomy shared by every credstore crate
//! - An in-process bus for request dispatch and lifecycle events
//! - The permission filter contract
//! - Configuration loading (YAML + `CREDSTORE_*` environment overrides)
//! - Tracing initialisation

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod permissions;
pub mod telemetry;

pub use bus::{Bus, EventPublisher, Handler, Message};
pub use config::{ConfigLoader, StoreConfig};
pub use error::{Error, Result};
pub use events::SecretEvent;
pub use models::{
    AddSecretCommand, DeleteSecretCommand, GetSecretQuery, GetSecretsQuery, Secret,
    SecretIdentifier, SecureJsonData, UpdateSecretCommand,
};
pub use permissions::{OrgRole, PredicateFilter, SecretPermissionFilter, SignedInUser};
