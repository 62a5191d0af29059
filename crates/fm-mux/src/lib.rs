//! Terminal-multiplexer adapter — the only component that talks to tmux.
//!
//! Everything here is fire-and-forget: success means the keystrokes were
//! handed to the multiplexer, never that the attached assistant acted on
//! them. Callers that need certainty reconcile through the audit instead.

pub mod testing;
pub mod tmux;

pub use tmux::{MuxError, Multiplexer, TmuxMultiplexer};

/// Replace every non-alphanumeric character with `_` so the name is safe
/// for tmux targets and for the audit's suffix matching.
pub fn sanitize_session_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Session name for a worker: `<agent_id>-<last4(admin_token).lower()>`.
/// The suffix scopes audit queries to sessions created by this server.
pub fn agent_session_name(agent_id: &str, admin_token: &str) -> String {
    let token = admin_token.to_lowercase();
    let start = token.len().saturating_sub(4);
    format!("{}-{}", sanitize_session_name(agent_id), &token[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_specials() {
        assert_eq!(sanitize_session_name("worker-1"), "worker_1");
        assert_eq!(sanitize_session_name("a.b:c d"), "a_b_c_d");
        assert_eq!(sanitize_session_name("Plain99"), "Plain99");
    }

    #[test]
    fn session_name_uses_lowercased_token_tail() {
        let name = agent_session_name("worker-1", "0123456789ABCDEF");
        assert_eq!(name, "worker_1-cdef");
    }

    #[test]
    fn short_admin_token_does_not_panic() {
        assert_eq!(agent_session_name("w", "ab"), "w-ab");
    }
}
