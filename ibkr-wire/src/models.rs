//! Data structures exchanged with TWS/Gateway.
//!
//! Security type and option right are carried as their wire strings
//! ("STK", "OPT", "C", "P") since the proxy only forwards them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Contract
// ============================================================================

/// Instrument identity as sent in requests and returned in replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub last_trade_date_or_contract_month: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    pub right: String,
    pub multiplier: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    pub include_expired: bool,
    pub sec_id_type: String,
    pub sec_id: String,
    pub description: String,
    pub issuer_id: String,
}

impl Contract {
    /// A contract identified only by its IB contract id.
    pub fn with_con_id(con_id: i64) -> Self {
        Self {
            con_id,
            ..Default::default()
        }
    }
}

// ============================================================================
// ContractDetails
// ============================================================================

/// Descriptive data returned by `reqContractDetails`.
///
/// Fields after `liquid_hours` on the wire are not decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDetails {
    pub contract: Contract,
    pub market_name: String,
    pub min_tick: f64,
    pub order_types: String,
    pub valid_exchanges: String,
    pub price_magnifier: i64,
    pub under_con_id: i32,
    pub long_name: String,
    pub contract_month: String,
    pub industry: String,
    pub category: String,
    pub subcategory: String,
    pub time_zone_id: String,
    pub trading_hours: String,
    pub liquid_hours: String,
}

// ============================================================================
// ContractDescription
// ============================================================================

/// One symbol search hit, returned by `reqMatchingSymbols`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDescription {
    pub contract: Contract,
    pub derivative_sec_types: Vec<String>,
}

// ============================================================================
// Bar
// ============================================================================

/// OHLCV bar as delivered by `reqHistoricalData`.
///
/// `time` is the raw wire string: epoch seconds or `yyyyMMdd` with
/// `formatDate=2`, `yyyyMMdd  HH:mm:ss` with `formatDate=1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wap: Option<Decimal>,
    pub count: i32,
}
