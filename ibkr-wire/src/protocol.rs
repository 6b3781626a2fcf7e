//! Protocol constants for the TWS socket API.
//!
//! Only the message ids and server version gates used by this crate are
//! listed. Values match the ones published with the official client.

// ============================================================================
// Client / Protocol Constants
// ============================================================================

/// Minimum client version offered during the handshake.
pub const MIN_CLIENT_VER: i32 = 100;

/// Maximum client version offered during the handshake.
///
/// Kept below the protobuf and split historical-data versions so that
/// every message stays text encoded.
pub const MAX_CLIENT_VER: i32 = 176;

/// Message header length (4-byte big-endian message length prefix).
pub const HEADER_LEN: usize = 4;

/// Maximum message length: 16 MB - 1 byte.
pub const MAX_MSG_LEN: usize = 0xFFFFFF;

/// API protocol signature sent at connection start.
pub const API_SIGN: &[u8; 4] = b"API\0";

// ============================================================================
// Incoming Message IDs (server -> client)
// ============================================================================

pub mod incoming {
    pub const ERR_MSG: i32 = 4;
    pub const NEXT_VALID_ID: i32 = 9;
    pub const CONTRACT_DATA: i32 = 10;
    pub const MANAGED_ACCTS: i32 = 15;
    pub const HISTORICAL_DATA: i32 = 17;
    pub const CURRENT_TIME: i32 = 49;
    pub const CONTRACT_DATA_END: i32 = 52;
    pub const POSITION_DATA: i32 = 61;
    pub const POSITION_END: i32 = 62;
    pub const SYMBOL_SAMPLES: i32 = 79;
    pub const HISTORICAL_DATA_END: i32 = 108;
}

// ============================================================================
// Outgoing Message IDs (client -> server)
// ============================================================================

pub mod outgoing {
    pub const REQ_CONTRACT_DATA: i32 = 9;
    pub const REQ_MANAGED_ACCTS: i32 = 17;
    pub const REQ_HISTORICAL_DATA: i32 = 20;
    pub const CANCEL_HISTORICAL_DATA: i32 = 25;
    pub const REQ_CURRENT_TIME: i32 = 49;
    pub const REQ_POSITIONS: i32 = 61;
    pub const CANCEL_POSITIONS: i32 = 64;
    pub const START_API: i32 = 71;
    pub const REQ_MATCHING_SYMBOLS: i32 = 81;
}

// ============================================================================
// Minimum Server Version Constants
// ============================================================================

/// Server version gates that control which fields are sent or expected.
///
/// Only gates above `MIN_CLIENT_VER` are listed; older ones always hold.
pub mod server_version {
    pub const REQ_MATCHING_SYMBOLS: i32 = 108;
    pub const MD_SIZE_MULTIPLIER: i32 = 110;
    pub const SYNT_REALTIME_BARS: i32 = 124;
    pub const SIZE_RULES: i32 = 164;
    pub const BOND_ISSUERID: i32 = 176;
    pub const LAST_TRADE_DATE: i32 = 182;
    pub const HISTORICAL_DATA_END: i32 = 196;
}
