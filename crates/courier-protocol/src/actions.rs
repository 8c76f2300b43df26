//! Well-known action identifiers.

/// Action stamped on faults produced by the dispatch core and operations.
pub const FAULT: &str = "urn:courier:fault";

/// Action stamped on addressing faults (unreachable destination, unsupported action).
pub const ADDRESSING_FAULT: &str = "urn:courier:addressing:fault";

/// Action of the synthetic notification dispatched when a session channel opens.
pub const SESSION_OPENED: &str = "urn:courier:session:opened";

/// Suffix appended to a request action to form the default reply action.
pub const REPLY_SUFFIX: &str = "Response";

/// Default reply action for a request action.
pub fn reply_action_for(action: &str) -> String {
    format!("{action}{REPLY_SUFFIX}")
}

/// Returns true for actions generated by the dispatch core itself.
pub fn is_internal(action: &str) -> bool {
    action == SESSION_OPENED
}
