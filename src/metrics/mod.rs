//! Prometheus metrics for the storage service.
//!
//! # Example
//!
//! ```ignore
//! use query_storage::metrics::StorageMetrics;
//!
//! let metrics = StorageMetrics::new()?;
//! metrics.record_checkpoint();
//! let text = metrics.gather_text();
//! ```

pub mod prometheus;

pub use self::prometheus::StorageMetrics;
