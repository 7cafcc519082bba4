// src/agentmesh/mod.rs

pub mod bus;
pub mod circuit_breaker;
pub mod config;
pub mod conversation;
pub mod error;
pub mod error_handler;
pub mod event;
pub mod load_balancer;
pub mod message;
pub mod router;
pub mod rules;
pub mod status;
pub mod subscription;

// Let's explicitly export the three entry points so callers can write
// agentmesh::MessageBus instead of agentmesh::bus::MessageBus
pub use bus::MessageBus;
pub use error_handler::CommunicationErrorHandler;
pub use router::MessageRouter;
