//! Outgoing message framing.
//!
//! A message body is a sequence of ASCII fields, each terminated by NUL,
//! preceded on the wire by its 4-byte big-endian length.

use bytes::{BufMut, BytesMut};

use crate::errors::{Result, WireError};
use crate::models::Contract;
use crate::protocol::{API_SIGN, HEADER_LEN, MAX_CLIENT_VER, MAX_MSG_LEN, MIN_CLIENT_VER};

/// A value that can be written as one wire field.
pub trait WireField {
    fn write_to(&self, buf: &mut BytesMut);
}

impl WireField for str {
    fn write_to(&self, buf: &mut BytesMut) {
        if self.bytes().any(|b| !is_wire_safe(b)) {
            tracing::warn!(field = self, "control or non-ASCII bytes in outgoing field");
        }
        buf.extend_from_slice(self.as_bytes());
    }
}

impl WireField for String {
    fn write_to(&self, buf: &mut BytesMut) {
        self.as_str().write_to(buf)
    }
}

impl WireField for bool {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(if *self { b'1' } else { b'0' });
    }
}

macro_rules! integer_field {
    ($($t:ty),*) => {$(
        impl WireField for $t {
            fn write_to(&self, buf: &mut BytesMut) {
                buf.extend_from_slice(self.to_string().as_bytes());
            }
        }
    )*};
}

integer_field!(i32, i64);

/// Shortest round-trip form; positive infinity is spelled `Infinity`.
impl WireField for f64 {
    fn write_to(&self, buf: &mut BytesMut) {
        if *self == f64::INFINITY {
            buf.extend_from_slice(b"Infinity");
        } else {
            buf.extend_from_slice(self.to_string().as_bytes());
        }
    }
}

/// `None` is the protocol's "unset" marker: an empty field.
impl<T: WireField> WireField for Option<T> {
    fn write_to(&self, buf: &mut BytesMut) {
        if let Some(v) = self {
            v.write_to(buf);
        }
    }
}

fn is_wire_safe(b: u8) -> bool {
    matches!(b, 32..=126 | b'\t' | b'\n' | b'\r')
}

/// Builds one length-prefixed outgoing message.
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    /// Start a message. The id is a text field on text-encoded servers.
    pub fn new(msg_id: i32) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_bytes(0, HEADER_LEN);
        let mut frame = Self { buf };
        frame.push(&msg_id);
        frame
    }

    pub fn push<F: WireField + ?Sized>(&mut self, field: &F) -> &mut Self {
        field.write_to(&mut self.buf);
        self.buf.put_u8(0);
        self
    }

    /// The contract block shared by contract-details and historical
    /// requests.
    pub fn contract(&mut self, c: &Contract) -> &mut Self {
        self.push(&c.con_id)
            .push(&c.symbol)
            .push(&c.sec_type)
            .push(&c.last_trade_date_or_contract_month)
            .push(&c.strike)
            .push(&c.right)
            .push(&c.multiplier)
            .push(&c.exchange)
            .push(&c.primary_exchange)
            .push(&c.currency)
            .push(&c.local_symbol)
            .push(&c.trading_class)
            .push(&c.include_expired)
    }

    /// Fill in the length header.
    pub fn finish(mut self) -> Result<BytesMut> {
        let body_len = self.buf.len() - HEADER_LEN;
        if body_len > MAX_MSG_LEN {
            return Err(WireError::Encoding(format!(
                "{body_len} byte message exceeds the {MAX_MSG_LEN} byte limit"
            )));
        }
        self.buf[..HEADER_LEN].copy_from_slice(&(body_len as u32).to_be_bytes());
        Ok(self.buf)
    }
}

/// Handshake: `API\0`, then the length-prefixed version range with no
/// trailing NUL.
pub fn build_connect_request(connect_options: Option<&str>) -> Result<BytesMut> {
    let mut range = format!("v{MIN_CLIENT_VER}..{MAX_CLIENT_VER}");
    if let Some(opts) = connect_options.filter(|o| !o.is_empty()) {
        range.push(' ');
        range.push_str(opts);
    }
    if range.len() > MAX_MSG_LEN {
        return Err(WireError::Encoding("connect options too long".into()));
    }

    let mut buf = BytesMut::with_capacity(API_SIGN.len() + HEADER_LEN + range.len());
    buf.extend_from_slice(API_SIGN);
    buf.put_u32(range.len() as u32);
    buf.extend_from_slice(range.as_bytes());
    Ok(buf)
}
