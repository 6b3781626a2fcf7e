//! Wire decoder for incoming messages.
//!
//! A message body is a sequence of NUL-terminated ASCII fields read with a
//! cursor. Only the messages listed in [`crate::protocol::incoming`] are
//! decoded; trailing fields a decoder does not need are left unread.

// Decoders assign fields in wire order onto defaulted structs.
#![allow(clippy::field_reassign_with_default)]

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::errors::{Result, WireError};
use crate::events::GatewayEvent;
use crate::models::{Bar, Contract, ContractDescription, ContractDetails};
use crate::protocol::{incoming, server_version};

// ============================================================================
// MessageDecoder
// ============================================================================

/// Cursor over the fields of one message body (length header removed).
pub struct MessageDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    server_version: i32,
}

impl<'a> MessageDecoder<'a> {
    pub fn new(data: &'a [u8], server_version: i32) -> Self {
        Self {
            data,
            pos: 0,
            server_version,
        }
    }

    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    /// Return the next field as `&str` and move past its terminator.
    fn read_field_str(&mut self) -> Result<&'a str> {
        if !self.has_remaining() {
            return Err(WireError::Decoding("unexpected end of message".into()));
        }
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|offset| self.pos + offset)
            .ok_or_else(|| WireError::Decoding("field not null-terminated".into()))?;
        let field = std::str::from_utf8(&self.data[self.pos..end])
            .map_err(|e| WireError::Decoding(format!("invalid UTF-8: {e}")))?;
        self.pos = end + 1;
        Ok(field)
    }

    pub fn decode_string(&mut self) -> Result<String> {
        self.read_field_str().map(|s| s.to_string())
    }

    /// Empty field decodes as 0, like `atoi("")` on the server side.
    pub fn decode_i32(&mut self) -> Result<i32> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<i32>()
            .map_err(|e| WireError::Decoding(format!("invalid i32 '{s}': {e}")))
    }

    pub fn decode_i64(&mut self) -> Result<i64> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(0);
        }
        s.parse::<i64>()
            .map_err(|e| WireError::Decoding(format!("invalid i64 '{s}': {e}")))
    }

    pub fn decode_f64(&mut self) -> Result<f64> {
        Ok(self.decode_f64_max()?.unwrap_or(0.0))
    }

    pub fn decode_decimal(&mut self) -> Result<Decimal> {
        Ok(self.decode_decimal_max()?.unwrap_or(Decimal::ZERO))
    }

    /// Empty field is `None` (the protocol's "unset" value).
    pub fn decode_f64_max(&mut self) -> Result<Option<f64>> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(None);
        }
        if s == "Infinity" {
            return Ok(Some(f64::INFINITY));
        }
        s.parse::<f64>()
            .map(Some)
            .map_err(|e| WireError::Decoding(format!("invalid f64 '{s}': {e}")))
    }

    pub fn decode_decimal_max(&mut self) -> Result<Option<Decimal>> {
        let s = self.read_field_str()?;
        if s.is_empty() {
            return Ok(None);
        }
        Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .map(Some)
            .map_err(|e| WireError::Decoding(format!("invalid Decimal '{s}': {e}")))
    }

    pub fn skip_field(&mut self) -> Result<()> {
        self.read_field_str().map(|_| ())
    }

    pub fn skip_fields(&mut self, n: usize) -> Result<()> {
        for _ in 0..n {
            self.skip_field()?;
        }
        Ok(())
    }
}

// ============================================================================
// Server Message Dispatch
// ============================================================================

/// Decode a complete server message into a [`GatewayEvent`].
///
/// Malformed messages are logged and returned as `Unknown { msg_id: -1 }`
/// so one bad frame never stops the reader.
pub fn decode_server_msg(data: &[u8], server_version: i32) -> GatewayEvent {
    match decode_server_msg_inner(data, server_version) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("failed to decode server message: {e}");
            GatewayEvent::Unknown { msg_id: -1 }
        }
    }
}

fn decode_server_msg_inner(data: &[u8], server_version: i32) -> Result<GatewayEvent> {
    let mut dec = MessageDecoder::new(data, server_version);
    let msg_id = dec.decode_i32()?;

    match msg_id {
        incoming::ERR_MSG => decode_err_msg(&mut dec),
        incoming::NEXT_VALID_ID => {
            let _version = dec.decode_i32()?;
            let order_id = dec.decode_i64()?;
            Ok(GatewayEvent::NextValidId { order_id })
        }
        incoming::MANAGED_ACCTS => {
            let _version = dec.decode_i32()?;
            let accounts = dec.decode_string()?;
            Ok(GatewayEvent::ManagedAccounts { accounts })
        }
        incoming::CURRENT_TIME => {
            let _version = dec.decode_i32()?;
            let time = dec.decode_i64()?;
            Ok(GatewayEvent::CurrentTime { time })
        }
        incoming::POSITION_DATA => decode_position_data(&mut dec),
        incoming::POSITION_END => Ok(GatewayEvent::PositionEnd),
        incoming::CONTRACT_DATA => decode_contract_data(&mut dec),
        incoming::CONTRACT_DATA_END => {
            let _version = dec.decode_i32()?;
            let req_id = dec.decode_i32()?;
            Ok(GatewayEvent::ContractDetailsEnd { req_id })
        }
        incoming::SYMBOL_SAMPLES => decode_symbol_samples(&mut dec),
        incoming::HISTORICAL_DATA => decode_historical_data(&mut dec),
        incoming::HISTORICAL_DATA_END => {
            let req_id = dec.decode_i32()?;
            let start = dec.decode_string()?;
            let end = dec.decode_string()?;
            Ok(GatewayEvent::HistoricalDataEnd { req_id, start, end })
        }
        _ => {
            tracing::trace!(msg_id, "ignoring unhandled server message");
            Ok(GatewayEvent::Unknown { msg_id })
        }
    }
}

// ============================================================================
// Individual Message Decoders
// ============================================================================

/// ERR_MSG (4). Version 1 carried only a text message.
fn decode_err_msg(dec: &mut MessageDecoder) -> Result<GatewayEvent> {
    let version = dec.decode_i32()?;
    if version < 2 {
        let message = dec.decode_string()?;
        return Ok(GatewayEvent::Error {
            req_id: -1,
            code: 0,
            message,
        });
    }
    let req_id = dec.decode_i32()?;
    let code = dec.decode_i32()?;
    let message = dec.decode_string()?;
    Ok(GatewayEvent::Error {
        req_id,
        code,
        message,
    })
}

/// POSITION_DATA (61).
fn decode_position_data(dec: &mut MessageDecoder) -> Result<GatewayEvent> {
    let version = dec.decode_i32()?;
    let account = dec.decode_string()?;
    let mut contract = Contract::default();
    contract.con_id = dec.decode_i64()?;
    contract.symbol = dec.decode_string()?;
    contract.sec_type = dec.decode_string()?;
    contract.last_trade_date_or_contract_month = dec.decode_string()?;
    contract.strike = dec.decode_f64_max()?;
    contract.right = dec.decode_string()?;
    contract.multiplier = dec.decode_string()?;
    contract.exchange = dec.decode_string()?;
    contract.currency = dec.decode_string()?;
    contract.local_symbol = dec.decode_string()?;
    if version >= 2 {
        contract.trading_class = dec.decode_string()?;
    }
    let position = dec.decode_decimal()?;
    let avg_cost = if version >= 3 { dec.decode_f64()? } else { 0.0 };
    Ok(GatewayEvent::Position {
        account,
        contract: Box::new(contract),
        position,
        avg_cost,
    })
}

/// CONTRACT_DATA (10). Servers from `SIZE_RULES` on drop the version field.
fn decode_contract_data(dec: &mut MessageDecoder) -> Result<GatewayEvent> {
    let sv = dec.server_version();
    let version = if sv < server_version::SIZE_RULES {
        dec.decode_i32()?
    } else {
        sv
    };
    let req_id = if version >= 3 { dec.decode_i32()? } else { -1 };

    let mut d = ContractDetails::default();
    d.contract.symbol = dec.decode_string()?;
    d.contract.sec_type = dec.decode_string()?;
    if sv >= server_version::LAST_TRADE_DATE {
        dec.skip_field()?; // lastTradeDate
    }
    d.contract.last_trade_date_or_contract_month = dec.decode_string()?;
    d.contract.strike = dec.decode_f64_max()?;
    d.contract.right = dec.decode_string()?;
    d.contract.exchange = dec.decode_string()?;
    d.contract.currency = dec.decode_string()?;
    d.contract.local_symbol = dec.decode_string()?;
    d.market_name = dec.decode_string()?;
    d.contract.trading_class = dec.decode_string()?;
    d.contract.con_id = dec.decode_i64()?;
    d.min_tick = dec.decode_f64()?;
    if (server_version::MD_SIZE_MULTIPLIER..server_version::SIZE_RULES).contains(&sv) {
        dec.skip_field()?; // mdSizeMultiplier
    }
    d.contract.multiplier = dec.decode_string()?;
    d.order_types = dec.decode_string()?;
    d.valid_exchanges = dec.decode_string()?;
    d.price_magnifier = dec.decode_i64()?;
    if version >= 4 {
        d.under_con_id = dec.decode_i32()?;
    }
    if version >= 5 {
        d.long_name = dec.decode_string()?;
        d.contract.primary_exchange = dec.decode_string()?;
    }
    if version >= 6 {
        d.contract_month = dec.decode_string()?;
        d.industry = dec.decode_string()?;
        d.category = dec.decode_string()?;
        d.subcategory = dec.decode_string()?;
        d.time_zone_id = dec.decode_string()?;
        d.trading_hours = dec.decode_string()?;
        d.liquid_hours = dec.decode_string()?;
    }
    Ok(GatewayEvent::ContractDetails {
        req_id,
        details: Box::new(d),
    })
}

/// SYMBOL_SAMPLES (79).
fn decode_symbol_samples(dec: &mut MessageDecoder) -> Result<GatewayEvent> {
    let sv = dec.server_version();
    let req_id = dec.decode_i32()?;
    let count = dec.decode_i32()?.max(0) as usize;
    let mut descriptions = Vec::with_capacity(count);
    for _ in 0..count {
        let mut c = Contract::default();
        c.con_id = dec.decode_i64()?;
        c.symbol = dec.decode_string()?;
        c.sec_type = dec.decode_string()?;
        c.primary_exchange = dec.decode_string()?;
        c.currency = dec.decode_string()?;
        let n_types = dec.decode_i32()?.max(0) as usize;
        let mut types = Vec::with_capacity(n_types);
        for _ in 0..n_types {
            types.push(dec.decode_string()?);
        }
        if sv >= server_version::BOND_ISSUERID {
            c.description = dec.decode_string()?;
            c.issuer_id = dec.decode_string()?;
        }
        descriptions.push(ContractDescription {
            contract: c,
            derivative_sec_types: types,
        });
    }
    Ok(GatewayEvent::SymbolSamples {
        req_id,
        descriptions,
    })
}

/// HISTORICAL_DATA (17).
///
/// Before `HISTORICAL_DATA_END` the message carries the window's start and
/// end and all of its bars, so it completes the request by itself.
fn decode_historical_data(dec: &mut MessageDecoder) -> Result<GatewayEvent> {
    let sv = dec.server_version();
    if sv < server_version::SYNT_REALTIME_BARS {
        dec.skip_field()?; // version
    }
    let req_id = dec.decode_i32()?;
    let complete = sv < server_version::HISTORICAL_DATA_END;
    if complete {
        dec.skip_fields(2)?; // startDateStr, endDateStr
    }
    let item_count = dec.decode_i32()?.max(0) as usize;
    let mut bars = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        let time = dec.decode_string()?;
        let open = dec.decode_f64()?;
        let high = dec.decode_f64()?;
        let low = dec.decode_f64()?;
        let close = dec.decode_f64()?;
        let volume = dec.decode_decimal_max()?;
        let wap = dec.decode_decimal_max()?;
        if sv < server_version::SYNT_REALTIME_BARS {
            dec.skip_field()?; // hasGaps
        }
        let count = dec.decode_i32()?;
        bars.push(Bar {
            time,
            open,
            high,
            low,
            close,
            volume,
            wap,
            count,
        });
    }
    Ok(GatewayEvent::HistoricalData {
        req_id,
        bars,
        complete,
    })
}

// ============================================================================
// Tests
// ============================================================================
