// =============================================================================
// Error taxonomy for the per-signal execution boundary
// =============================================================================
//
// The engine never crashes on a per-signal error; instead every failure is
// classified so the signal loop knows what to do with it:
//
//   Transient  — network timeouts, 429s, 5xx. Already retried at the client
//                layer; surfacing here marks the order FAILED.
//   Validation — no route, impact too high, risk flag, guard rejection.
//                Never retried; the signal is acked.
//   Contract   — signing failure or malformed remote response. FAILED with
//                context, no retry.
//   Rejected   — admission or duplicate rejection before any order state
//                exists; the signal is acked without an order record.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("validation failure: {0}")]
    Validation(String),

    #[error("contract failure: {0}")]
    Contract(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

impl ExecError {
    /// Whether an order reached a state that must be persisted as FAILED.
    /// Rejections happen before any order record exists.
    pub fn is_order_failure(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_order_failures() {
        assert!(!ExecError::Rejected("dup".into()).is_order_failure());
        assert!(ExecError::Transient("timeout".into()).is_order_failure());
        assert!(ExecError::Validation("impact".into()).is_order_failure());
        assert!(ExecError::Contract("sign".into()).is_order_failure());
    }
}
