//! Process-wide tracing/logging setup shared by outbox binaries.

pub mod tracing;

/// Initialize observability with defaults (JSON logs, `info` level,
/// overridable via `RUST_LOG`).
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}
