//! Reserved type handles.

/// Null reference
pub const NULL: i16 = 0;

pub const BOOL: i16 = 1;
pub const I32: i16 = 2;
pub const I64: i16 = 3;
pub const F64: i16 = 4;
pub const STRING: i16 = 5;
pub const BYTES: i16 = 6;
pub const DATETIME: i16 = 7;
pub const LIST: i16 = 8;
pub const MAP: i16 = 9;

/// Unregistered type: name plus length-prefixed fields
pub const NATIVE: i16 = 10;

// Storage types
pub const CACHE_ENTRY: i16 = 100;
pub const LOCK_INFO: i16 = 101;

// Cluster messages
pub const KEY_REQUEST: i16 = 200;
pub const WRITE_REQUEST: i16 = 201;
pub const LOCK_REQUEST: i16 = 202;
pub const OP_REPLY: i16 = 203;
pub const REPLICATE_WRITE: i16 = 204;
pub const STATE_TRANSFER_REQUEST: i16 = 205;
pub const STATE_TRANSFER_CHUNK: i16 = 206;

/// First handle available to user types
pub const CUSTOM_TYPE_RANGE: i16 = 1000;

pub fn is_builtin(handle: i16) -> bool {
    (0..CUSTOM_TYPE_RANGE).contains(&handle)
}
