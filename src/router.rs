//! Routes gateway events into the correlation tables.
//!
//! Tagged replies carry the request id they answer, which is the
//! correlation id the dispatcher registered. Untagged replies (positions,
//! managed accounts, current time) carry no id on the wire; every caller
//! waiting on that kind receives a copy and the terminating event completes
//! all of them. Each untagged kind has its own table so its ids never
//! collide with ids sent upstream.

use std::sync::RwLock;
use std::time::Duration;

use ibkr_wire::{Bar, ContractDescription, ContractDetails, GatewayEvent};
use tokio::sync::watch;

use crate::correlation::{CorrelationTable, Pending, Shape};
use crate::error::ProxyError;
use crate::models::PositionRecord;

/// A value delivered to a waiting request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Details(Box<ContractDetails>),
    Symbol(ContractDescription),
    Bar(Bar),
    Position(PositionRecord),
    Accounts(Vec<String>),
    Time(i64),
}

/// Replies that arrive without a request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Untagged {
    Positions,
    ManagedAccounts,
    CurrentTime,
}

impl Untagged {
    fn shape(self) -> Shape {
        match self {
            Self::Positions => Shape::Stream,
            Self::ManagedAccounts | Self::CurrentTime => Shape::Scalar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Continue,
    /// The link reported that the socket is gone.
    LinkClosed,
}

pub struct EventRouter {
    tagged: CorrelationTable<Reply>,
    positions: CorrelationTable<Reply>,
    accounts: CorrelationTable<Reply>,
    current_time: CorrelationTable<Reply>,
    managed_accounts: RwLock<Vec<String>>,
    ready: watch::Sender<bool>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            tagged: CorrelationTable::new(),
            positions: CorrelationTable::new(),
            accounts: CorrelationTable::new(),
            current_time: CorrelationTable::new(),
            managed_accounts: RwLock::new(Vec::new()),
            ready: watch::channel(false).0,
        }
    }

    fn waiters(&self, kind: Untagged) -> &CorrelationTable<Reply> {
        match kind {
            Untagged::Positions => &self.positions,
            Untagged::ManagedAccounts => &self.accounts,
            Untagged::CurrentTime => &self.current_time,
        }
    }

    /// Register a request whose replies carry the returned id.
    pub fn register_tagged(&self, shape: Shape) -> Pending<Reply> {
        self.tagged.register(shape)
    }

    /// Register a waiter for the next untagged reply of `kind`.
    pub fn register_untagged(&self, kind: Untagged) -> Pending<Reply> {
        self.waiters(kind).register(kind.shape())
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn fail_all(&self, err: ProxyError) -> usize {
        [&self.tagged, &self.positions, &self.accounts, &self.current_time]
            .into_iter()
            .map(|table| table.fail_all(err.clone()))
            .sum()
    }

    /// Account codes from the most recent managed-accounts message.
    pub fn managed_accounts(&self) -> Vec<String> {
        self.managed_accounts
            .read()
            .map(|a| a.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn reset_ready(&self) {
        self.ready.send_replace(false);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the gateway has sent NextValidId. False on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }

    pub fn route(&self, event: GatewayEvent) -> RouteOutcome {
        match event {
            GatewayEvent::Error {
                req_id,
                code,
                message,
            } => self.route_error(req_id, code, message),

            GatewayEvent::NextValidId { order_id } => {
                tracing::debug!(order_id, "gateway ready");
                self.ready.send_replace(true);
            }

            GatewayEvent::ManagedAccounts { accounts } => {
                let accounts = GatewayEvent::parse_accounts(&accounts);
                tracing::info!(accounts = ?accounts, "managed accounts");
                match self.managed_accounts.write() {
                    Ok(mut cached) => *cached = accounts.clone(),
                    Err(e) => *e.into_inner() = accounts.clone(),
                }
                self.fan_out(Untagged::ManagedAccounts, Reply::Accounts(accounts));
            }

            GatewayEvent::CurrentTime { time } => {
                self.fan_out(Untagged::CurrentTime, Reply::Time(time));
            }

            GatewayEvent::Position {
                account,
                contract,
                position,
                avg_cost,
            } => {
                let record = PositionRecord::new(account, &contract, position, avg_cost);
                self.fan_out(Untagged::Positions, Reply::Position(record));
            }

            GatewayEvent::PositionEnd => {
                for id in self.positions.pending_ids() {
                    self.positions.complete(id);
                }
            }

            GatewayEvent::ContractDetails { req_id, details } => {
                self.tagged.resolve(req_id, Reply::Details(details));
            }

            GatewayEvent::ContractDetailsEnd { req_id } => self.tagged.complete(req_id),

            GatewayEvent::SymbolSamples {
                req_id,
                descriptions,
            } => {
                let replies = descriptions.into_iter().map(Reply::Symbol).collect();
                self.tagged.resolve_list(req_id, replies);
            }

            GatewayEvent::HistoricalData {
                req_id,
                bars,
                complete,
            } => {
                tracing::debug!(req_id, bars = bars.len(), complete, "historical data");
                for bar in bars {
                    self.tagged.resolve(req_id, Reply::Bar(bar));
                }
                if complete {
                    self.tagged.complete(req_id);
                }
            }

            GatewayEvent::HistoricalDataEnd { req_id, start, end } => {
                tracing::debug!(req_id, %start, %end, "historical data end");
                self.tagged.complete(req_id);
            }

            GatewayEvent::ConnectionClosed => return RouteOutcome::LinkClosed,

            GatewayEvent::Unknown { msg_id } => {
                tracing::trace!(msg_id, "ignoring unhandled message");
            }
        }
        RouteOutcome::Continue
    }

    fn fan_out(&self, kind: Untagged, reply: Reply) {
        let table = self.waiters(kind);
        for id in table.pending_ids() {
            table.resolve(id, reply.clone());
        }
    }

    fn route_error(&self, req_id: i32, code: i32, message: String) {
        if is_informational(code) {
            tracing::info!(code, %message, "gateway notice");
            return;
        }
        if req_id > 0 && self.tagged.is_pending(req_id) {
            if is_empty_result(code, &message) {
                tracing::debug!(req_id, code, %message, "request returned no data");
                self.tagged.complete(req_id);
            } else {
                tracing::warn!(req_id, code, %message, "request rejected by gateway");
                self.tagged.fail(req_id, ProxyError::UpstreamRejected { code, message });
            }
            return;
        }
        tracing::warn!(req_id, code, %message, "gateway error");
    }
}

/// Connectivity and data-farm status notices.
fn is_informational(code: i32) -> bool {
    matches!(code, 1100..=1102 | 2103..=2108 | 2119 | 2158)
}

/// Errors that mean "nothing matched" rather than failure.
fn is_empty_result(code: i32, message: &str) -> bool {
    match code {
        200 => true,
        162 => message.to_ascii_lowercase().contains("no data"),
        _ => false,
    }
}
