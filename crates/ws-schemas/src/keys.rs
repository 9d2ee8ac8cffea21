//! Registry key encoding (§4.1, §6).
//!
//! Centralized here so the Registry client, the leader-election lock, and
//! any operational tooling that needs to poke at these keys by hand all
//! agree on the same strings.

/// `ws:user_fd:<U>` — forward mapping, user to connection handle (§4.1 R1).
pub fn user_fd(user_id: &str) -> String {
    format!("ws:user_fd:{user_id}")
}

/// `ws:fd_user_map:<H>` — inverse mapping, handle to user (§4.1 R2).
pub fn fd_user_map(handle: i64) -> String {
    format!("ws:fd_user_map:{handle}")
}

/// `ws:notification_queue:<U>` — offline queue Q(U) (§4.1 Q1).
pub fn notification_queue(user_id: &str) -> String {
    format!("ws:notification_queue:{user_id}")
}

/// `ws:active_users` — Set of every user with a live forward binding on any
/// server process, resolving the incomplete `getAllUserFds` gap (§9 Open
/// Questions, SPEC_FULL §4.1.1).
pub fn active_users() -> &'static str {
    "ws:active_users"
}

/// `ws:lock:db_poller` — short-TTL leader-election lock so exactly one
/// server process runs Feeder B's SQL poll per tick (SPEC_FULL §4.4.1).
pub fn db_poller_lock() -> &'static str {
    "ws:lock:db_poller"
}

/// Pub/sub channel Feeder A subscribes to; carries `{userId, message}` (§4.4, §6).
pub fn broker_channel() -> &'static str {
    "ws:notification_queue:"
}

/// `ws:handle_seq` — a process-global counter used to allocate connection
/// handles `H`. The wire contract keys `ws:fd_user_map:<H>` by `H` alone
/// with no server component, so `H` must be unique across every server
/// process, not just within one (SPEC_FULL §4.1.1) — a plain in-process
/// counter would collide across processes.
pub fn handle_sequence() -> &'static str {
    "ws:handle_seq"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_wire_contract() {
        assert_eq!(user_fd("u-1"), "ws:user_fd:u-1");
        assert_eq!(fd_user_map(42), "ws:fd_user_map:42");
        assert_eq!(notification_queue("u-1"), "ws:notification_queue:u-1");
        assert_eq!(active_users(), "ws:active_users");
        assert_eq!(db_poller_lock(), "ws:lock:db_poller");
        assert_eq!(broker_channel(), "ws:notification_queue:");
        assert_eq!(handle_sequence(), "ws:handle_seq");
    }
}
