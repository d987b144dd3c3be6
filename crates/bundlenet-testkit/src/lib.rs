//! # bundlenet Testkit
//!
//! Testing utilities for bundlenet.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Golden vectors**: fixed container and bundle-id encodings
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: a backend with endpoints and relays wired over memory links
//! - **Harness**: scripted contact schedules checked for exactly-once delivery
//!
//! ## Golden Vectors
//!
//! ```rust
//! use bundlenet_testkit::vectors::verify_all_vectors;
//!
//! for (name, ok, hex) in verify_all_vectors() {
//!     assert!(ok, "{name}: {hex}");
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use bundlenet_testkit::generators::bundle_id;
//!
//! proptest! {
//!     #[test]
//!     fn encoded_ids_have_fixed_length(id in bundle_id()) {
//!         prop_assert_eq!(id.encode().len(), bundlenet_core::BUNDLE_ID_LEN);
//!     }
//! }
//! ```
//!
//! ## Scenarios
//!
//! ```rust,no_run
//! use bundlenet_testkit::harness::{Scenario, Step};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut scenario = Scenario::new(1, 1);
//! scenario
//!     .run(&[
//!         Step::Send { endpoint: 0, app: "mail", data: b"hi".to_vec() },
//!         Step::ViaRelay { endpoint: 0, relay: 0 },
//!         Step::RelaySync { relay: 0 },
//!     ])
//!     .await?;
//! scenario.settle().await?;
//! scenario.check_delivery()?;
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod vectors;

pub use fixtures::{identity, Inbox, TestNet};
pub use harness::{Scenario, Step};
pub use vectors::{all_vectors, verify_all_vectors, GoldenVector};
