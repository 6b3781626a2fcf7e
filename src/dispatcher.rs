//! Typed operations against the gateway.
//!
//! Every operation follows the same path: make sure the session is up,
//! register a correlation entry, send the request, then wait for the router
//! to resolve the entry or the per-operation timeout to fire.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ibkr_wire::{Bar, Contract, ContractDetails, GatewayRequest, HistoricalDataRequest};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::correlation::Shape;
use crate::error::{ProxyError, Result};
use crate::models::{ContractDescriptor, HistoricalBar, PositionRecord, SymbolInfo};
use crate::paginator::{parse_bar_time, parse_duration, to_historical, BarInterval, BarSource, Window};
use crate::router::{Reply, Untagged};
use crate::session::SessionManager;

/// Per-operation wait bounds.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub accounts: Duration,
    pub positions: Duration,
    pub search: Duration,
    pub contract_details: Duration,
    pub historical: Duration,
    pub current_time: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            accounts: Duration::from_secs(5),
            positions: Duration::from_secs(10),
            search: Duration::from_secs(10),
            contract_details: Duration::from_secs(10),
            historical: Duration::from_secs(60),
            current_time: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    session: Arc<SessionManager>,
    timeouts: Timeouts,
    /// Untagged replies fan out to every waiter, so one upstream request of
    /// each kind at a time.
    positions_gate: Mutex<()>,
    accounts_gate: Mutex<()>,
}

impl Dispatcher {
    pub fn new(session: Arc<SessionManager>, timeouts: Timeouts) -> Self {
        Self {
            session,
            timeouts,
            positions_gate: Mutex::new(()),
            accounts_gate: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    // ========================================================================
    // Accounts & Positions
    // ========================================================================

    pub async fn list_accounts(&self) -> Result<Vec<String>> {
        self.session.ensure_connected().await?;
        let _gate = self.accounts_gate.lock().await;

        let pending = self.session.router().register_untagged(Untagged::ManagedAccounts);
        self.session.send(GatewayRequest::ManagedAccounts).await?;
        match pending.wait_one(self.timeouts.accounts).await {
            Ok(Reply::Accounts(accounts)) => Ok(accounts),
            Ok(other) => Err(unexpected(&other)),
            Err(ProxyError::Timeout(t)) => {
                let cached = self.session.router().managed_accounts();
                if cached.is_empty() {
                    return Err(ProxyError::Timeout(t));
                }
                tracing::warn!(?t, "managed accounts refresh timed out, serving cached list");
                Ok(cached)
            }
            Err(e) => Err(e),
        }
    }

    /// Positions held in `account`. Unknown accounts are `NotFound`.
    pub async fn list_positions(&self, account: &str) -> Result<Vec<PositionRecord>> {
        self.session.ensure_connected().await?;
        let mut known = self.session.router().managed_accounts();
        if known.is_empty() {
            known = self.list_accounts().await?;
        }
        if !known.iter().any(|a| a == account) {
            return Err(ProxyError::NotFound(format!("account {account}")));
        }

        let rows = self.all_positions().await?;
        Ok(rows.into_iter().filter(|p| p.account == account).collect())
    }

    async fn all_positions(&self) -> Result<Vec<PositionRecord>> {
        self.session.ensure_connected().await?;
        let _gate = self.positions_gate.lock().await;

        let pending = self.session.router().register_untagged(Untagged::Positions);
        self.session.send(GatewayRequest::Positions).await?;
        let replies = pending.wait(self.timeouts.positions).await;

        if let Err(e) = self.session.send(GatewayRequest::CancelPositions).await {
            tracing::debug!(error = %e, "cancelPositions failed");
        }

        replies?
            .into_iter()
            .map(|reply| match reply {
                Reply::Position(row) => Ok(row),
                other => Err(unexpected(&other)),
            })
            .collect()
    }

    pub async fn current_time(&self) -> Result<i64> {
        self.session.ensure_connected().await?;
        let pending = self.session.router().register_untagged(Untagged::CurrentTime);
        self.session.send(GatewayRequest::CurrentTime).await?;
        match pending.wait_one(self.timeouts.current_time).await? {
            Reply::Time(t) => Ok(t),
            other => Err(unexpected(&other)),
        }
    }

    // ========================================================================
    // Contracts
    // ========================================================================

    /// Search by symbol. Short symbols also try `SYM*` and `SYM?`.
    pub async fn search_contracts(&self, symbol: &str) -> Result<Vec<ContractDescriptor>> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ProxyError::InvalidArgument("symbol must not be empty".into()));
        }
        self.session.ensure_connected().await?;

        let mut patterns = vec![symbol.clone()];
        if symbol.chars().count() <= 3 {
            patterns.push(format!("{symbol}*"));
            patterns.push(format!("{symbol}?"));
        }

        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for pattern in patterns {
            match self.matching_symbols(&pattern).await {
                Ok(found) => {
                    for desc in found {
                        if seen.insert(desc.con_id) {
                            results.push(desc);
                        }
                    }
                }
                Err(e @ (ProxyError::UpstreamRejected { .. } | ProxyError::Timeout(_))) => {
                    tracing::warn!(%pattern, error = %e, "symbol pattern failed, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(%symbol, found = results.len(), "symbol search complete");
        Ok(results)
    }

    async fn matching_symbols(&self, pattern: &str) -> Result<Vec<ContractDescriptor>> {
        let pending = self.session.router().register_tagged(Shape::List);
        self.session
            .send(GatewayRequest::MatchingSymbols {
                req_id: pending.id(),
                pattern: pattern.to_string(),
            })
            .await?;
        pending
            .wait(self.timeouts.search)
            .await?
            .into_iter()
            .map(|reply| match reply {
                Reply::Symbol(desc) => Ok(ContractDescriptor::from(&desc)),
                other => Err(unexpected(&other)),
            })
            .collect()
    }

    pub async fn contract_details(&self, contract: Contract) -> Result<Vec<ContractDetails>> {
        self.session.ensure_connected().await?;
        let pending = self.session.router().register_tagged(Shape::Stream);
        self.session
            .send(GatewayRequest::ContractDetails {
                req_id: pending.id(),
                contract,
            })
            .await?;
        pending
            .wait(self.timeouts.contract_details)
            .await?
            .into_iter()
            .map(|reply| match reply {
                Reply::Details(details) => Ok(*details),
                other => Err(unexpected(&other)),
            })
            .collect()
    }

    async fn first_details(&self, con_id: i64) -> Result<ContractDetails> {
        self.contract_details(Contract::with_con_id(con_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::NotFound(format!("contract {con_id}")))
    }

    /// Full contract for a contract id.
    pub async fn resolve_contract(&self, con_id: i64) -> Result<Contract> {
        let mut contract = self.first_details(con_id).await?.contract;
        if contract.exchange.is_empty() {
            contract.exchange = contract.primary_exchange.clone();
        }
        Ok(contract)
    }

    pub async fn symbol_info(&self, con_id: i64) -> Result<SymbolInfo> {
        Ok(SymbolInfo::from(&self.first_details(con_id).await?))
    }

    // ========================================================================
    // Historical data
    // ========================================================================

    /// One historical request. Cancelled upstream if it times out.
    pub async fn fetch_historical(&self, mut request: HistoricalDataRequest) -> Result<Vec<Bar>> {
        self.session.ensure_connected().await?;
        let pending = self.session.router().register_tagged(Shape::Stream);
        let req_id = pending.id();
        request.req_id = req_id;

        tracing::debug!(
            req_id,
            con_id = request.contract.con_id,
            end = %request.end_date_time,
            duration = %request.duration,
            bar_size = %request.bar_size,
            "requesting historical data"
        );
        self.session
            .send(GatewayRequest::HistoricalData(request))
            .await?;

        match pending.wait(self.timeouts.historical).await {
            Ok(replies) => replies
                .into_iter()
                .map(|reply| match reply {
                    Reply::Bar(bar) => Ok(bar),
                    other => Err(unexpected(&other)),
                })
                .collect(),
            Err(e @ ProxyError::Timeout(_)) => {
                if let Err(cancel) = self
                    .session
                    .send(GatewayRequest::CancelHistoricalData { req_id })
                    .await
                {
                    tracing::debug!(req_id, error = %cancel, "cancelHistoricalData failed");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Dynamic invoke
    // ========================================================================

    /// Call an allow-listed method by name. Query values are converted to
    /// integer, then float, else kept as strings.
    pub async fn invoke(&self, method_path: &str, raw_params: &[(String, String)]) -> Result<Value> {
        let Some(method) = DynamicMethod::lookup(method_path) else {
            tracing::warn!(method = method_path, "rejected dynamic call");
            return Err(ProxyError::UnsupportedMethod(method_path.to_string()));
        };

        let params: Map<String, Value> = raw_params
            .iter()
            .map(|(k, v)| (k.clone(), convert_param(v)))
            .collect();
        tracing::info!(method = method_path, params = %serde_json::Value::Object(params.clone()), "dynamic call");

        let result = match method {
            DynamicMethod::IsConnected => json!(self.session.is_connected()),
            DynamicMethod::CurrentTime => json!(self.current_time().await?),
            DynamicMethod::ManagedAccounts => json!(self.list_accounts().await?),
            DynamicMethod::Positions => json!(self.all_positions().await?),
            DynamicMethod::MatchingSymbols => {
                let pattern = param_string(&params, "pattern")?;
                self.session.ensure_connected().await?;
                json!(self.matching_symbols(&pattern).await?)
            }
            DynamicMethod::ContractDetails => {
                let con_id = param_i64(&params, "conId")?;
                let details = self.contract_details(Contract::with_con_id(con_id)).await?;
                json!(details.iter().map(SymbolInfo::from).collect::<Vec<_>>())
            }
            DynamicMethod::HistoricalData => json!(self.dynamic_historical(&params).await?),
        };

        Ok(json!({
            "result": result,
            "method": method_path,
            "params": params,
        }))
    }

    async fn dynamic_historical(&self, params: &Map<String, Value>) -> Result<Vec<HistoricalBar>> {
        let con_id = param_i64(params, "conId")?;
        let interval: BarInterval = param_string(params, "barSize")?.parse()?;
        let duration = parse_duration(&param_string(params, "durationStr")?)?;
        let end_date_time = optional_string(params, "endDateTime").unwrap_or_default();
        let what_to_show = optional_string(params, "whatToShow").unwrap_or_else(|| "TRADES".into());
        let use_rth = match params.get("useRTH") {
            None => true,
            Some(Value::Number(n)) => n.as_i64() != Some(0),
            Some(Value::String(s)) => !matches!(s.to_ascii_lowercase().as_str(), "false" | "no"),
            Some(other) => return Err(ProxyError::InvalidArgument(format!("invalid useRTH {other}"))),
        };

        let contract = self.resolve_contract(con_id).await?;
        let bars = self
            .fetch_historical(HistoricalDataRequest {
                req_id: 0,
                contract,
                end_date_time,
                duration,
                bar_size: interval.to_string(),
                what_to_show,
                use_rth,
                format_date: 2,
            })
            .await?;
        bars.iter()
            .map(|bar| Ok(to_historical(parse_bar_time(&bar.time)?, bar)))
            .collect()
    }
}

#[async_trait]
impl BarSource for Dispatcher {
    async fn resolve(&self, con_id: i64) -> Result<Contract> {
        self.resolve_contract(con_id).await
    }

    async fn fetch_window(&self, contract: &Contract, window: &Window) -> Result<Vec<Bar>> {
        self.fetch_historical(HistoricalDataRequest {
            req_id: 0,
            contract: contract.clone(),
            end_date_time: window.end_date_time.clone(),
            duration: window.duration.clone(),
            bar_size: window.bar_size.clone(),
            what_to_show: "TRADES".into(),
            use_rth: true,
            format_date: 2,
        })
        .await
    }
}

fn unexpected(reply: &Reply) -> ProxyError {
    ProxyError::Protocol(format!("unexpected reply {reply:?}"))
}

// ============================================================================
// Allow-list
// ============================================================================

/// Methods reachable through `/dynamic/{method}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicMethod {
    IsConnected,
    CurrentTime,
    ManagedAccounts,
    Positions,
    MatchingSymbols,
    ContractDetails,
    HistoricalData,
}

const DYNAMIC_METHODS: &[(&str, DynamicMethod)] = &[
    ("isConnected", DynamicMethod::IsConnected),
    ("reqCurrentTime", DynamicMethod::CurrentTime),
    ("currentTime", DynamicMethod::CurrentTime),
    ("managedAccounts", DynamicMethod::ManagedAccounts),
    ("reqPositions", DynamicMethod::Positions),
    ("positions", DynamicMethod::Positions),
    ("reqMatchingSymbols", DynamicMethod::MatchingSymbols),
    ("reqContractDetails", DynamicMethod::ContractDetails),
    ("reqHistoricalData", DynamicMethod::HistoricalData),
];

impl DynamicMethod {
    pub fn lookup(name: &str) -> Option<Self> {
        DYNAMIC_METHODS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, m)| *m)
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        DYNAMIC_METHODS.iter().map(|(n, _)| *n)
    }
}

fn convert_param(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return json!(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => Value::String(raw.to_string()),
    }
}

fn optional_string(params: &Map<String, Value>, name: &str) -> Option<String> {
    match params.get(name)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn param_string(params: &Map<String, Value>, name: &str) -> Result<String> {
    optional_string(params, name)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::InvalidArgument(format!("missing parameter '{name}'")))
}

fn param_i64(params: &Map<String, Value>, name: &str) -> Result<i64> {
    match params.get(name) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| ProxyError::InvalidArgument(format!("parameter '{name}' must be an integer"))),
        Some(_) => Err(ProxyError::InvalidArgument(format!("parameter '{name}' must be an integer"))),
        None => Err(ProxyError::InvalidArgument(format!("missing parameter '{name}'"))),
    }
}
