//! Control-plane library for routing, caching and orchestrating queries
//! across a fleet of local LLM servers.
//!
//! See the component modules for the pieces that compose into a running
//! system: [`fleet`] tracks model lifecycle and health, [`router`] picks a
//! model under admission rules, [`cgrag`] assembles retrieval context,
//! [`cache`] reuses prior responses, [`dialogue`] runs standard/debate/
//! council turns, [`events`] fans out what happened, and [`coordinator`]
//! wires all of it together per request.

pub mod cache;
pub mod cgrag;
pub mod client;
pub mod complexity;
pub mod config;
pub mod coordinator;
pub mod dialogue;
pub mod embed;
pub mod error;
pub mod events;
pub mod fleet;
pub mod model;
pub mod request;
pub mod router;
pub mod vector;

pub use config::ControlPlaneConfig;
pub use coordinator::{QueryCoordinator, QueryOutcome};
pub use error::{Result, SynapseError};
pub use events::EventBus;
pub use request::{Mode, QueryRequest};
