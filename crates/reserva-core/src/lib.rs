//! Reserva Core - configuration and domain types
//!
//! This crate holds the pieces of the session layer that carry no I/O:
//! - **Configuration** - the YAML-backed [`config::Config`] with validation
//!   and a builder for programmatic use
//! - **Domain** - the [`domain::Session`] and [`domain::User`] values handed
//!   out by the session refresh coordinator

pub mod config;
pub mod domain;
