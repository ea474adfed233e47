//! Core domain models and invariants for the feed simulator.
//!
//! This crate defines the serializable entities a simulation step reads and
//! produces, the configuration shared by every stage, the error taxonomy, and
//! the repository contract the step engine is written against.

pub mod config;
pub mod error;
pub mod model;
pub mod repository;

pub use config::{
    AuctionConfig, BehaviorConfig, EndpointConfig, ModerationConfig, NetworkConfig, SimConfig,
};
pub use error::{PersistenceError, PredictionError, RepositoryError, SimError, ValidationError};
pub use model::*;
pub use repository::{Candidate, Neighborhood, Repository};
