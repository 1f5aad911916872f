//! Top-level error taxonomy.
//!
//! Every component gets its own `thiserror` enum; this module wraps them
//! and attaches the classification from the error-handling design (kind,
//! not type) so the controller can decide retry vs. terminal vs. exit code.

/// Coarse classification used to decide retry/terminal/exit-code policy.
///
/// Mirrors the table in the error handling design: each kind carries its
/// own propagation rule, independent of which component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect reset, 5xx, read timeout, partial read. Retry with backoff.
    Transient,
    /// 404/410 on project JSON. Terminal for the project, treated as deletion.
    UpstreamNotFound,
    /// Returned serial regressed below what was expected.
    StaleMetadata,
    /// sha256 mismatch after download.
    Integrity,
    /// Disk full, permission denied. Fails the run; `status` is not advanced.
    LocalIo,
    /// Missing required config key, invalid specifier. Fail fast.
    Configuration,
    /// Malformed regex, unknown plugin. Fail fast at load.
    Filter,
    /// User interrupt or `stop-on-error`. Abort drain, preserve `todo`.
    Cancellation,
}

/// Shared exit-code mapping for the per-component error enums
/// (`ControllerError`, `VerifyError`, ...): usage/configuration problems
/// exit 2, everything else that isn't a more specific case (lock
/// contention, handled separately by the caller) exits 1.
pub fn exit_code_for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Configuration | ErrorKind::Filter => 2,
        _ => 1,
    }
}
