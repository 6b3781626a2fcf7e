//! Events decoded from server messages.

use rust_decimal::Decimal;

use crate::models::{Bar, Contract, ContractDescription, ContractDetails};

/// A decoded server message, or a change in the connection itself.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Error or notice. `req_id` is -1 when not tied to a request.
    Error {
        req_id: i32,
        code: i32,
        message: String,
    },
    /// First message after START_API; the session is ready for requests.
    NextValidId { order_id: i64 },
    /// Comma-separated account codes, sent unsolicited at connect.
    ManagedAccounts { accounts: String },
    CurrentTime { time: i64 },
    Position {
        account: String,
        contract: Box<Contract>,
        position: Decimal,
        avg_cost: f64,
    },
    PositionEnd,
    ContractDetails {
        req_id: i32,
        details: Box<ContractDetails>,
    },
    ContractDetailsEnd { req_id: i32 },
    SymbolSamples {
        req_id: i32,
        descriptions: Vec<ContractDescription>,
    },
    /// Bars for one request. `complete` is set when the server sends the
    /// whole window in this message and no end marker will follow.
    HistoricalData {
        req_id: i32,
        bars: Vec<Bar>,
        complete: bool,
    },
    HistoricalDataEnd {
        req_id: i32,
        start: String,
        end: String,
    },
    /// The socket closed or the reader hit an unrecoverable error.
    ConnectionClosed,
    /// A message this crate does not decode.
    Unknown { msg_id: i32 },
}

impl GatewayEvent {
    /// Split a `ManagedAccounts` payload into account codes.
    pub fn parse_accounts(accounts: &str) -> Vec<String> {
        accounts
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
