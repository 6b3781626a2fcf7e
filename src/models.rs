//! Public JSON shapes returned by the REST layer.
//!
//! Upstream records from `ibkr-wire` are converted here; quantities carried
//! as `Decimal` on the wire become `f64` at the JSON boundary.

use ibkr_wire::{Contract, ContractDescription, ContractDetails};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Accounts & Positions
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountsResponse {
    pub accounts: Vec<AccountEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEntry {
    pub id: String,
    pub account_id: String,
}

impl AccountsResponse {
    pub fn from_ids(ids: &[String]) -> Self {
        Self {
            accounts: ids
                .iter()
                .map(|id| AccountEntry {
                    id: id.clone(),
                    account_id: id.clone(),
                })
                .collect(),
        }
    }
}

/// Instrument fields carried on a position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionContract {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub currency: String,
    pub local_symbol: String,
}

/// One position row as reported by `reqPositions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    pub account: String,
    pub contract: PositionContract,
    pub position: f64,
    pub avg_cost: f64,
}

impl PositionRecord {
    pub fn new(account: String, contract: &Contract, position: Decimal, avg_cost: f64) -> Self {
        Self {
            account,
            contract: PositionContract {
                con_id: contract.con_id,
                symbol: contract.symbol.clone(),
                sec_type: contract.sec_type.clone(),
                exchange: contract.exchange.clone(),
                currency: contract.currency.clone(),
                local_symbol: contract.local_symbol.clone(),
            },
            position: position.to_f64().unwrap_or_default(),
            avg_cost,
        }
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// A symbol search hit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDescriptor {
    pub con_id: i64,
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
    pub sec_type: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub derivative_sec_types: Vec<String>,
}

impl From<&ContractDescription> for ContractDescriptor {
    fn from(desc: &ContractDescription) -> Self {
        let c = &desc.contract;
        // Search results only fill primaryExchange.
        let exchange = if c.exchange.is_empty() {
            c.primary_exchange.clone()
        } else {
            c.exchange.clone()
        };
        let display_name = if c.description.is_empty() {
            c.symbol.clone()
        } else {
            c.description.clone()
        };
        Self {
            con_id: c.con_id,
            symbol: c.symbol.clone(),
            exchange,
            currency: c.currency.clone(),
            sec_type: c.sec_type.clone(),
            display_name,
            derivative_sec_types: desc.derivative_sec_types.clone(),
        }
    }
}

/// Detail record for `/getSymbolInfo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
    pub local_symbol: String,
    pub trading_class: String,
    pub long_name: String,
    pub market_name: String,
    pub min_tick: f64,
    pub price_magnifier: i64,
    pub order_types: String,
    pub valid_exchanges: String,
    pub industry: String,
    pub category: String,
    pub subcategory: String,
    pub time_zone_id: String,
    pub trading_hours: String,
    pub liquid_hours: String,
}

impl From<&ContractDetails> for SymbolInfo {
    fn from(d: &ContractDetails) -> Self {
        let c = &d.contract;
        Self {
            con_id: c.con_id,
            symbol: c.symbol.clone(),
            sec_type: c.sec_type.clone(),
            exchange: c.exchange.clone(),
            primary_exchange: c.primary_exchange.clone(),
            currency: c.currency.clone(),
            local_symbol: c.local_symbol.clone(),
            trading_class: c.trading_class.clone(),
            long_name: d.long_name.clone(),
            market_name: d.market_name.clone(),
            min_tick: d.min_tick,
            price_magnifier: d.price_magnifier,
            order_types: d.order_types.clone(),
            valid_exchanges: d.valid_exchanges.clone(),
            industry: d.industry.clone(),
            category: d.category.clone(),
            subcategory: d.subcategory.clone(),
            time_zone_id: d.time_zone_id.clone(),
            trading_hours: d.trading_hours.clone(),
            liquid_hours: d.liquid_hours.clone(),
        }
    }
}

// ============================================================================
// Historical Data
// ============================================================================

/// OHLCV bar with `time` in epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub proxy: String,
    pub status: String,
    pub ib_connected: bool,
    pub state: String,
    pub ib_host: String,
    pub ib_port: u16,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub client_id: i32,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i32>,
}

// ============================================================================
// API Response Wrappers
// ============================================================================

/// JSON envelope used for error bodies.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn error(message: impl Into<String>, code: i32, kind: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_code: Some(code),
            error: Some(kind.into()),
        }
    }
}
