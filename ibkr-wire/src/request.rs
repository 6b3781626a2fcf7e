//! Typed outgoing requests.
//!
//! Each variant knows how to encode itself for a negotiated server version.
//! The handshake refuses servers below `MIN_CLIENT_VER` (100), so version
//! gates older than that are implied and not checked here.

use bytes::BytesMut;

use crate::encoder::FrameBuilder;
use crate::errors::{Result, WireError};
use crate::models::Contract;
use crate::protocol::{outgoing, server_version};

/// Parameters of a `reqHistoricalData` call.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalDataRequest {
    pub req_id: i32,
    pub contract: Contract,
    /// `yyyyMMdd-HH:mm:ss` in UTC, or empty for "now".
    pub end_date_time: String,
    pub duration: String,
    pub bar_size: String,
    pub what_to_show: String,
    pub use_rth: bool,
    /// 1 = formatted strings, 2 = epoch seconds for intraday bars.
    pub format_date: i32,
}

/// A request the proxy can send to TWS/Gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayRequest {
    CurrentTime,
    ManagedAccounts,
    Positions,
    CancelPositions,
    ContractDetails { req_id: i32, contract: Contract },
    MatchingSymbols { req_id: i32, pattern: String },
    HistoricalData(HistoricalDataRequest),
    CancelHistoricalData { req_id: i32 },
}

impl GatewayRequest {
    /// Request id carried on the wire, if the message has one.
    pub fn req_id(&self) -> Option<i32> {
        match self {
            Self::ContractDetails { req_id, .. }
            | Self::MatchingSymbols { req_id, .. }
            | Self::CancelHistoricalData { req_id } => Some(*req_id),
            Self::HistoricalData(req) => Some(req.req_id),
            Self::CurrentTime | Self::ManagedAccounts | Self::Positions | Self::CancelPositions => {
                None
            }
        }
    }

    /// Upstream API name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CurrentTime => "reqCurrentTime",
            Self::ManagedAccounts => "reqManagedAccts",
            Self::Positions => "reqPositions",
            Self::CancelPositions => "cancelPositions",
            Self::ContractDetails { .. } => "reqContractDetails",
            Self::MatchingSymbols { .. } => "reqMatchingSymbols",
            Self::HistoricalData(_) => "reqHistoricalData",
            Self::CancelHistoricalData { .. } => "cancelHistoricalData",
        }
    }

    /// Encode into a complete framed message.
    pub fn encode(&self, sv: i32) -> Result<BytesMut> {
        let frame = match self {
            Self::CurrentTime => versioned(outgoing::REQ_CURRENT_TIME, 1),
            Self::ManagedAccounts => versioned(outgoing::REQ_MANAGED_ACCTS, 1),
            Self::Positions => versioned(outgoing::REQ_POSITIONS, 1),
            Self::CancelPositions => versioned(outgoing::CANCEL_POSITIONS, 1),
            Self::ContractDetails { req_id, contract } => {
                let mut frame = versioned(outgoing::REQ_CONTRACT_DATA, 8);
                frame
                    .push(req_id)
                    .contract(contract)
                    .push(&contract.sec_id_type)
                    .push(&contract.sec_id);
                if sv >= server_version::BOND_ISSUERID {
                    frame.push(&contract.issuer_id);
                }
                frame
            }
            Self::MatchingSymbols { req_id, pattern } => {
                check_server_version(sv, server_version::REQ_MATCHING_SYMBOLS, self.name())?;
                let mut frame = FrameBuilder::new(outgoing::REQ_MATCHING_SYMBOLS);
                frame.push(req_id).push(pattern);
                frame
            }
            Self::HistoricalData(req) => historical_data_frame(sv, req),
            Self::CancelHistoricalData { req_id } => {
                let mut frame = versioned(outgoing::CANCEL_HISTORICAL_DATA, 1);
                frame.push(req_id);
                frame
            }
        };
        frame.finish()
    }
}

/// Message id followed by the message's own version field.
fn versioned(msg_id: i32, version: i32) -> FrameBuilder {
    let mut frame = FrameBuilder::new(msg_id);
    frame.push(&version);
    frame
}

fn historical_data_frame(sv: i32, req: &HistoricalDataRequest) -> FrameBuilder {
    let streaming_era = sv >= server_version::SYNT_REALTIME_BARS;
    let mut frame = if streaming_era {
        FrameBuilder::new(outgoing::REQ_HISTORICAL_DATA)
    } else {
        versioned(outgoing::REQ_HISTORICAL_DATA, 6)
    };
    frame
        .push(&req.req_id)
        .contract(&req.contract)
        .push(&req.end_date_time)
        .push(&req.bar_size)
        .push(&req.duration)
        .push(&req.use_rth)
        .push(&req.what_to_show)
        .push(&req.format_date);
    if req.contract.sec_type == "BAG" {
        frame.push(&0i32); // combo legs
    }
    if streaming_era {
        frame.push(&false); // keepUpToDate
    }
    frame.push(""); // chartOptions
    frame
}

fn check_server_version(sv: i32, required: i32, request: &'static str) -> Result<()> {
    if sv < required {
        return Err(WireError::RequestNotSupported {
            request,
            required,
            negotiated: sv,
        });
    }
    Ok(())
}
