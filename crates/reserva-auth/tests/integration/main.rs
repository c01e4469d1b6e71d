//! Integration tests for reserva-auth
//!
//! Uses wiremock to simulate the auth provider's REST API and verifies
//! caching, coalescing, rate limiting and deferred refresh exchanges end to
//! end, with a virtual clock driving every wait.

mod common;

mod test_coordinator;
mod test_transport;
