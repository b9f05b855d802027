//! Cordwire Core - shared plumbing for the Cordwire client crates
//!
//! This crate contains the pieces every Cordwire crate needs but that do not
//! belong to a particular transport:
//! - **Configuration** - `Config` with YAML loading, defaults, validation and a builder
//! - **Logging** - tracing subscriber setup driven by `LoggingConfig`
//! - **Clock** - wall-clock abstraction so rate-limit deadlines can be faked in tests
//! - **Ports** - traits for collaborators such as the entity cache
//!
//! # Architecture
//!
//! Ports define trait interfaces that adapter crates implement. The REST
//! crate depends on this one; nothing here knows about HTTP.

pub mod clock;
pub mod config;
pub mod logging;
pub mod ports;
