//! Test utilities for transaction pruning.
//!
//! This module provides a fixture that seeds an in-memory database with
//! transactions, the documents they touched and their stash entries.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::TxnFixture;
//!
//! let fixture = TxnFixture::new("txns");
//! let id = fixture
//!     .add_txn(TxnState::Applied, fixture.hours_ago(2), &[("widgets", "w1".into())])
//!     .await?;
//! ```

mod fixture;

pub use fixture::TxnFixture;
