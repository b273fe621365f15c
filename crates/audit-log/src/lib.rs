//! Append-only JSON-lines audit trail for access decisions.
//!
//! Every evaluated request, rejected request, published snapshot and
//! rejected policy can be recorded as one newline-terminated JSON object.
//! Producers hand entries to a cloneable [`AuditSink`]; a background task
//! owns the file and flushes it periodically.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/policy-gate/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::SnapshotPublished,
//!     AuditSource::new("policy-gate"),
//!     serde_json::json!({"generation": 1}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource, DecisionRecord};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
