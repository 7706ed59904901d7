//! Swarm automation agent: converts standalone containers into managed
//! services and keeps them reconciled with Dokploy metadata so Traefik
//! routing stays aligned with what the management plane declares.

pub mod comparator;
pub mod config;
pub mod errors;
pub mod metadata;
pub mod orchestrator;
pub mod reconciler;
pub mod rules;
pub mod scheduler;
pub mod spec_builder;
pub mod types;
