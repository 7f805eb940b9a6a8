//! Integration tests for the service catalog controller
//!
//! These tests tell the story of how platform operators and application
//! teams use the catalog against a real API server.
//!
//! # Test Organization
//!
//! - `crd_operations`: Stories about creating, reading and updating catalog
//!   resources through the Kubernetes API, including optimistic concurrency
//!
//! - `catalog_lifecycle`: Stories where the controller runs in-process against
//!   a fake broker, relists its catalog and provisions an instance
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored
//!
//! # Only the controller stories
//! cargo test --test kind catalog_lifecycle -- --ignored --nocapture
//! ```

mod catalog_lifecycle;
mod crd_operations;
mod helpers;
