//! REST API and dashboard.

use crate::context::{AppContext, BacktestRequest, BatchBacktestRequest, DEFAULT_HORIZON_DAYS};
use crate::error::MarketError;
use crate::models::HistoryRange;
use crate::strategy::available_strategies;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use tokio::net::TcpListener;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub struct ApiError(MarketError);

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(MarketError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(MarketError::InvalidRequest(rejection.body_text()))
    }
}

pub fn status_for(err: &MarketError) -> StatusCode {
    match err {
        MarketError::InvalidSymbol(_) | MarketError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MarketError::DataUnavailable { .. } => StatusCode::NOT_FOUND,
        MarketError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        MarketError::Provider { .. } | MarketError::Network(_) | MarketError::Json(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("Request failed ({}): {}", status, self.0);
        } else {
            log::warn!("Request rejected ({}): {}", status, self.0);
        }
        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    range: Option<String>,
}

impl RangeQuery {
    fn range(&self) -> Result<HistoryRange, MarketError> {
        self.range
            .as_deref()
            .map(HistoryRange::parse)
            .transpose()
            .map(Option::unwrap_or_default)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    symbol: Option<String>,
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RiskQuery {
    vix: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    symbol: String,
    horizon_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    symbol: String,
    range: HistoryRange,
    count: usize,
    candles: Value,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/api/health", get(health))
        .route("/api/stock/:symbol", get(stock))
        .route("/api/history/:symbol", get(history))
        .route("/api/indicators/:symbol", get(indicators))
        .route("/api/predict", post(predict))
        .route("/api/predictions/accuracy", get(prediction_accuracy))
        .route("/api/predictions/:symbol", get(predictions))
        .route("/api/backtest", post(backtest))
        .route("/api/backtest/batch", post(backtest_batch))
        .route("/api/backtests", get(backtests))
        .route("/api/strategies", get(strategies))
        .route("/api/risk/:symbol", get(risk))
        .route("/api/market/gap", get(market_gap))
        .with_state(ctx)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn serve_on<F>(listener: TcpListener, ctx: AppContext, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let address = ctx.settings().bind_address();
    let listener = TcpListener::bind(&address).await?;
    log::info!(
        "market-desk listening on http://{} (provider: {})",
        listener.local_addr()?,
        ctx.provider_name()
    );
    serve_on(listener, ctx, shutdown_signal()).await?;
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Ctrl-C received, shutting down"),
        Err(err) => log::error!("Unable to listen for shutdown signal: {}", err),
    }
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn health(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "provider": ctx.provider_name(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stock(
    State(ctx): State<AppContext>,
    Path(symbol): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let overview = ctx.stock_overview(&symbol, query.range()?).await?;
    Ok(Json(serde_json::to_value(overview).map_err(MarketError::from)?))
}

async fn history(
    State(ctx): State<AppContext>,
    Path(symbol): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<HistoryResponse> {
    let Query(query) = query?;
    let range = query.range()?;
    let candles = ctx.history(&symbol, range).await?;
    Ok(Json(HistoryResponse {
        symbol: symbol.trim().to_ascii_uppercase(),
        range,
        count: candles.len(),
        candles: serde_json::to_value(candles.as_ref()).map_err(MarketError::from)?,
    }))
}

async fn indicators(
    State(ctx): State<AppContext>,
    Path(symbol): Path<String>,
    query: Result<Query<RangeQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let snapshot = ctx.indicators(&symbol, query.range()?).await?;
    Ok(Json(serde_json::to_value(snapshot).map_err(MarketError::from)?))
}

async fn predict(
    State(ctx): State<AppContext>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(request) = payload?;
    let horizon = request.horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS);
    let prediction = ctx.predict(&request.symbol, horizon).await?;
    Ok(Json(serde_json::to_value(prediction).map_err(MarketError::from)?))
}

async fn predictions(
    State(ctx): State<AppContext>,
    Path(symbol): Path<String>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let records = ctx.list_predictions(Some(&symbol), query.limit()).await?;
    Ok(Json(serde_json::to_value(records).map_err(MarketError::from)?))
}

async fn prediction_accuracy(
    State(ctx): State<AppContext>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let accuracy = ctx.prediction_accuracy(query.symbol.as_deref()).await?;
    Ok(Json(json!({
        "symbol": query.symbol.map(|s| s.trim().to_ascii_uppercase()),
        "evaluated": accuracy.evaluated,
        "direction_hits": accuracy.direction_hits,
        "direction_accuracy": accuracy.direction_accuracy,
        "mean_absolute_percent_error": accuracy.mean_absolute_percent_error,
    })))
}

async fn backtest(
    State(ctx): State<AppContext>,
    payload: Result<Json<BacktestRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(request) = payload?;
    let report = ctx.backtest(request).await?;
    Ok(Json(serde_json::to_value(report).map_err(MarketError::from)?))
}

async fn backtest_batch(
    State(ctx): State<AppContext>,
    payload: Result<Json<BatchBacktestRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(request) = payload?;
    let items = ctx.backtest_batch(request).await?;
    Ok(Json(serde_json::to_value(items).map_err(MarketError::from)?))
}

async fn backtests(
    State(ctx): State<AppContext>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let summaries = ctx
        .list_backtests(query.symbol.as_deref(), query.limit())
        .await?;
    Ok(Json(serde_json::to_value(summaries).map_err(MarketError::from)?))
}

async fn strategies() -> Json<Value> {
    Json(json!({ "strategies": available_strategies() }))
}

async fn risk(
    State(ctx): State<AppContext>,
    Path(symbol): Path<String>,
    query: Result<Query<RiskQuery>, QueryRejection>,
) -> ApiResult<Value> {
    let Query(query) = query?;
    let assessment = ctx.event_risk(&symbol, query.vix).await?;
    Ok(Json(serde_json::to_value(assessment).map_err(MarketError::from)?))
}

async fn market_gap(State(ctx): State<AppContext>) -> ApiResult<Value> {
    let gap = ctx.gap_prediction().await?;
    Ok(Json(serde_json::to_value(gap).map_err(MarketError::from)?))
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>market-desk</title>
    <style>
        body { font-family: -apple-system, 'Segoe UI', sans-serif; background: #0f1115; color: #e6e6e6; margin: 0 auto; max-width: 1100px; padding: 32px; }
        h1 { font-weight: 600; border-bottom: 1px solid #2a2f3a; padding-bottom: 12px; }
        .controls { display: flex; gap: 8px; flex-wrap: wrap; margin-bottom: 24px; }
        input, select, button { background: #1a1d24; color: #e6e6e6; border: 1px solid #2a2f3a; border-radius: 4px; padding: 8px 10px; }
        button { cursor: pointer; }
        button:hover { border-color: #4f8cff; }
        .grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(320px, 1fr)); gap: 16px; }
        .card { background: #161920; border: 1px solid #2a2f3a; border-radius: 6px; padding: 16px; }
        .card h3 { margin-top: 0; font-size: 15px; color: #9aa4b2; }
        .stat { display: flex; justify-content: space-between; padding: 4px 0; }
        .label { color: #9aa4b2; }
        .up { color: #3ecf8e; }
        .down { color: #ff5c5c; }
        .error { color: #ff5c5c; }
        table { width: 100%; border-collapse: collapse; font-size: 13px; }
        td, th { text-align: left; padding: 4px; border-bottom: 1px solid #2a2f3a; }
    </style>
</head>
<body>
    <h1>market-desk</h1>
    <div class="controls">
        <input id="symbol" value="AAPL" size="8">
        <select id="range">
            <option>3mo</option><option>6mo</option><option selected>1y</option><option>2y</option><option>5y</option>
        </select>
        <input id="horizon" type="number" value="5" min="1" max="30" style="width:60px">
        <select id="strategy"></select>
        <button onclick="refresh()">Analyze</button>
        <button onclick="runBacktest()">Backtest</button>
    </div>
    <div class="grid">
        <div class="card"><h3>Quote &amp; indicators</h3><div id="stock">-</div></div>
        <div class="card"><h3>Ensemble prediction</h3><div id="prediction">-</div></div>
        <div class="card"><h3>Event risk</h3><div id="risk">-</div></div>
        <div class="card"><h3>ASX 200 overnight gap</h3><div id="gap">-</div></div>
        <div class="card"><h3>Backtest</h3><div id="backtest">-</div></div>
        <div class="card"><h3>Recent backtests</h3><div id="history">-</div></div>
    </div>
    <script>
        const fmt = (v, d = 2) => (v === null || v === undefined) ? 'n/a' : Number(v).toFixed(d);
        const stat = (label, value, cls = '') => `<div class="stat"><span class="label">${label}</span><span class="${cls}">${value}</span></div>`;
        const sign = v => v > 0 ? 'up' : (v < 0 ? 'down' : '');

        async function api(path, options) {
            const resp = await fetch(path, options);
            const data = await resp.json();
            if (!resp.ok) throw new Error(data.error || resp.statusText);
            return data;
        }

        async function show(id, loader) {
            const el = document.getElementById(id);
            el.textContent = 'Loading...';
            try {
                el.innerHTML = await loader();
            } catch (e) {
                el.innerHTML = `<span class="error">${e.message}</span>`;
            }
        }

        const symbol = () => document.getElementById('symbol').value.trim().toUpperCase();
        const range = () => document.getElementById('range').value;

        function refresh() {
            show('stock', async () => {
                const s = await api(`/api/stock/${symbol()}?range=${range()}`);
                return stat('Price', fmt(s.current_price)) +
                    stat('Change', `${fmt(s.change)} (${fmt(s.change_percent)}%)`, sign(s.change)) +
                    stat('RSI(14)', fmt(s.rsi, 1)) +
                    stat('MACD', `${fmt(s.macd, 3)} / ${fmt(s.macd_signal, 3)}`) +
                    stat('Bollinger', `${fmt(s.bollinger_lower)} - ${fmt(s.bollinger_upper)}`) +
                    stat('Signal', s.indicators.signal.action);
            });
            show('prediction', async () => {
                const horizon = Number(document.getElementById('horizon').value);
                const p = await api('/api/predict', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({ symbol: symbol(), horizon_days: horizon })
                });
                return stat('Target date', p.target_date) +
                    stat('Predicted price', fmt(p.predicted_price)) +
                    stat('Expected return', `${fmt(p.predicted_return * 100)}%`, sign(p.predicted_return)) +
                    stat('Direction', p.direction) +
                    stat('Confidence', `${fmt(p.confidence * 100, 0)}%`) +
                    p.models.map(m => stat(m.model, `${fmt(m.expected_return * 100)}% @ ${fmt(m.confidence, 2)}`)).join('');
            });
            show('risk', async () => {
                const r = await api(`/api/risk/${symbol()}`);
                return stat('Level', r.risk_level) +
                    stat('Score', fmt(r.risk_score)) +
                    stat('Position size', `${fmt(r.position_multiplier * 100, 0)}%`) +
                    r.conditions.filter(c => c.triggered).map(c => stat(c.name, c.detail, 'down')).join('');
            });
            show('gap', async () => {
                const g = await api('/api/market/gap');
                return stat('Predicted gap', `${fmt(g.predicted_gap_percent)}%`, sign(g.predicted_gap_percent)) +
                    stat('Direction', `${g.direction} (${g.strength})`) +
                    stat('Predicted open', fmt(g.predicted_open)) +
                    stat('Confidence', `${fmt(g.confidence * 100, 0)}%`) +
                    g.indices.map(i => stat(i.symbol, `${fmt(i.change_percent)}%`, sign(i.change_percent))).join('');
            });
            loadHistory();
        }

        function runBacktest() {
            show('backtest', async () => {
                const b = await api('/api/backtest', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({ symbol: symbol(), strategy: document.getElementById('strategy').value, range: range() })
                });
                loadHistory();
                return stat('Total return', `${fmt(b.total_return_percent)}%`, sign(b.total_return_percent)) +
                    stat('Buy &amp; hold', `${fmt(b.performance.buy_and_hold_return_percent)}%`) +
                    stat('Sharpe', fmt(b.sharpe_ratio)) +
                    stat('Max drawdown', `${fmt(b.max_drawdown_percent)}%`, 'down') +
                    stat('Win rate', `${fmt(b.win_rate * 100, 0)}%`) +
                    stat('Trades', b.total_trades);
            });
        }

        function loadHistory() {
            show('history', async () => {
                const rows = await api(`/api/backtests?limit=10`);
                if (!rows.length) return 'No backtests yet';
                return '<table><tr><th>Symbol</th><th>Strategy</th><th>Return</th><th>Sharpe</th></tr>' +
                    rows.map(r => `<tr><td>${r.symbol}</td><td>${r.strategy_id}</td><td class="${sign(r.total_return_percent)}">${fmt(r.total_return_percent)}%</td><td>${fmt(r.sharpe_ratio)}</td></tr>`).join('') +
                    '</table>';
            });
        }

        api('/api/strategies').then(d => {
            document.getElementById('strategy').innerHTML = d.strategies.map(s => `<option>${s}</option>`).join('');
        });
        loadHistory();
    </script>
</body>
</html>
"#;
