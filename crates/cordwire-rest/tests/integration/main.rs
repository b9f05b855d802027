//! Integration tests for cordwire-rest
//!
//! Uses wiremock to stand in for the REST API and verifies end-to-end
//! behavior of the RestClient: request shape, error decoding, the entity
//! cache hook, and rate-limit admission against real HTTP responses.

mod common;

mod test_execute;
mod test_rate_limits;
