//! Stable exit codes for ledger CLI commands.

use crate::envelope::Envelope;

/// Command succeeded (a forced rollback is still a success).
pub const OK: i32 = 0;
/// The ledger rejected the request: unknown task, illegal transition,
/// conflict, invalid input, or failed history validation.
pub const REJECTED: i32 = 1;
/// The store failed; the request may succeed if re-issued after re-reading state.
pub const STORAGE: i32 = 3;

/// Exit code for a command that produced `envelope`.
pub fn for_envelope(envelope: &Envelope) -> i32 {
    if envelope.is_success() {
        return OK;
    }
    match envelope.error_kind() {
        Some("storage") => STORAGE,
        _ => REJECTED,
    }
}
