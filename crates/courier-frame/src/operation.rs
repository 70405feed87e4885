//! Operation id ranges.
//!
//! Ids `0xFFFF_FF00..=0xFFFF_FFFF` are reserved for built-in operations.
//! Everything below is available to applications.

/// First reserved operation id.
pub const RESERVED_OPERATION_START: u32 = 0xFFFF_FF00;

/// Built-in reflection operation: lists the daemon's registered operations.
pub const LIST_OPERATIONS: u32 = RESERVED_OPERATION_START;

/// Returns true if the operation id is in the reserved range.
pub fn is_reserved(id: u32) -> bool {
    id >= RESERVED_OPERATION_START
}

/// Returns the name of a built-in operation, if `id` is one.
pub fn builtin_name(id: u32) -> Option<&'static str> {
    match id {
        LIST_OPERATIONS => Some("list_operations"),
        _ => None,
    }
}
