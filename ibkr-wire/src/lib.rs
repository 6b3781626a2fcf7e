//! ibkr-wire -- async client for the IB TWS/Gateway socket API.
//!
//! Only the messages the REST proxy needs are implemented: account and
//! position queries, contract lookup, symbol search, historical bars and
//! the current-time request used as a keep-alive.
//!
//! ## Modules
//!
//! - [`protocol`] -- message ids, server version gates, framing constants
//! - [`errors`] -- error type for the crate
//! - [`encoder`] / [`decoder`] -- field-level wire encoding
//! - [`request`] -- typed outgoing requests
//! - [`events`] -- typed incoming events
//! - [`transport`] -- TCP framing and the connection handshake
//! - [`reader`] -- background task turning frames into events
//! - [`client`] -- `WireClient`, the connection entry point

pub mod client;
pub mod decoder;
pub mod encoder;
pub mod errors;
pub mod events;
pub mod models;
pub mod protocol;
pub mod reader;
pub mod request;
pub mod transport;

pub use client::WireClient;
pub use errors::{Result, WireError};
pub use events::GatewayEvent;
pub use models::{Bar, Contract, ContractDescription, ContractDetails};
pub use request::{GatewayRequest, HistoricalDataRequest};
