use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use market_desk::config::ServiceSettings;
use market_desk::context::AppContext;
use market_desk::database::Database;
use market_desk::models::Candle;
use market_desk::provider::StaticProvider;
use market_desk::server;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Value};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn candles(symbol: &str, len: usize, base: f64, drift: f64) -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2023, 1, 2, 21, 0, 0).unwrap();
    (0..len)
        .map(|i| {
            let close = base * (1.0 + drift).powi(i as i32) * (1.0 + 0.02 * (i as f64 * 0.7).sin());
            Candle {
                symbol: symbol.to_string(),
                date: start + ChronoDuration::days(i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                adj_close: Some(close),
                volume: 1_000_000,
            }
        })
        .collect()
}

struct TestServer {
    base_url: String,
    http: HttpClient,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let provider = StaticProvider::new()
            .with_history("AAPL", candles("AAPL", 260, 150.0, 0.002))
            .with_history("MSFT", candles("MSFT", 260, 300.0, -0.001))
            .with_history("^GSPC", candles("^GSPC", 30, 5000.0, 0.001))
            .with_history("^IXIC", candles("^IXIC", 30, 16000.0, 0.001))
            .with_history("^DJI", candles("^DJI", 30, 38000.0, 0.001));
        let ctx = AppContext::with_components(
            ServiceSettings::default(),
            Arc::new(provider),
            Database::in_memory()?,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server::serve_on(listener, ctx, async move {
            let _ = shutdown_rx.await;
        }));
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build API test client")?;

        Ok(Self {
            base_url,
            http,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let response = self.http.get(self.url(path)).send().await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn post(&self, path: &str, body: &Value) -> Result<(StatusCode, Value)> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await??;
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_dashboard_and_strategies() -> Result<()> {
    ensure_test_env();
    let server = TestServer::start().await?;

    let (status, health) = server.get("/api/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["provider"], "static");

    let page = server.http.get(server.url("/")).send().await?;
    assert_eq!(page.status(), StatusCode::OK);
    assert!(page.text().await?.contains("<html"));

    let (status, body) = server.get("/api/strategies").await?;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["strategies"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    for expected in ["rsi", "macd", "bollinger"] {
        assert!(ids.contains(&expected), "missing strategy {}", expected);
    }

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stock_history_and_indicators() -> Result<()> {
    ensure_test_env();
    let server = TestServer::start().await?;

    let (status, stock) = server.get("/api/stock/aapl").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stock["symbol"], "AAPL");
    for key in ["current_price", "rsi", "macd", "bollinger_upper", "bollinger_lower"] {
        assert!(stock[key].is_number(), "stock response missing {}", key);
    }

    let (status, history) = server.get("/api/history/AAPL?range=1mo").await?;
    assert_eq!(status, StatusCode::OK);
    let count = history["count"].as_u64().unwrap();
    assert!(count > 0 && count <= 32);
    assert_eq!(history["candles"].as_array().unwrap().len() as u64, count);

    let (status, indicators) = server.get("/api/indicators/MSFT").await?;
    assert_eq!(status, StatusCode::OK);
    assert!(indicators.is_object());

    let (status, error) = server.get("/api/history/AAPL?range=7w").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"].is_string());

    let (status, error) = server.get("/api/stock/ZZZZ").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["kind"], "data_unavailable");

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn predictions_are_served_and_listed() -> Result<()> {
    ensure_test_env();
    let server = TestServer::start().await?;

    let (status, prediction) = server
        .post("/api/predict", &json!({"symbol": "AAPL", "horizon_days": 3}))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(prediction["symbol"], "AAPL");
    assert_eq!(prediction["horizon_days"], 3);
    assert!(prediction["predicted_price"].as_f64().unwrap() > 0.0);
    let confidence = prediction["confidence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&confidence));

    let (status, listed) = server.get("/api/predictions/aapl").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, accuracy) = server.get("/api/predictions/accuracy").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accuracy["evaluated"], 0);

    let (status, _) = server
        .post("/api/predict", &json!({"symbol": "AAPL", "horizon_days": 0}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.post("/api/predict", &json!({"horizon_days": 5})).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backtests_run_and_persist() -> Result<()> {
    ensure_test_env();
    let server = TestServer::start().await?;

    let (status, report) = server
        .post(
            "/api/backtest",
            &json!({"symbol": "AAPL", "strategy": "rsi", "range": "max"}),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["symbol"], "AAPL");
    assert_eq!(report["strategy_id"], "rsi");
    assert!(report["trades"].is_array());

    let (status, items) = server
        .post(
            "/api/backtest/batch",
            &json!({
                "symbols": ["AAPL", "MSFT", "ZZZZ"],
                "strategies": ["macd"],
                "range": "max"
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert!(items[0]["result"].is_object());
    assert!(items[1]["result"].is_object());
    assert_eq!(items[2]["failure"]["kind"], "data_unavailable");

    let (status, stored) = server.get("/api/backtests?limit=10").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored.as_array().unwrap().len(), 3);

    let (status, stored) = server.get("/api/backtests?symbol=msft").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored.as_array().unwrap().len(), 1);

    let (status, error) = server
        .post("/api/backtest", &json!({"symbol": "AAPL", "strategy": "nope"}))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "invalid_request");

    let (status, error) = server
        .post(
            "/api/backtest",
            &json!({
                "symbol": "AAPL",
                "strategy": "sma_crossover",
                "parameters": {"fastPeriod": 1e20}
            }),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["kind"], "invalid_request");

    server.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn risk_and_gap_endpoints() -> Result<()> {
    ensure_test_env();
    let server = TestServer::start().await?;

    let (status, risk) = server.get("/api/risk/AAPL?vix=35").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(risk["symbol"], "AAPL");
    assert!(risk["risk_level"].is_string());
    assert!(risk["conditions"].as_array().unwrap().len() >= 4);

    let (status, gap) = server.get("/api/market/gap").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(gap["indices"].as_array().unwrap().len(), 3);
    assert!(gap["asx_last_close"].is_null());
    assert!(gap["direction"].is_string());

    server.stop().await
}
