use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use market_desk::commands::{backtest, evaluate_predictions, export_history};
use market_desk::config::ServiceSettings;
use market_desk::context::AppContext;
use market_desk::database::Database;
use market_desk::error::MarketError;
use market_desk::gap_monitor::{GapDirection, GapStrength};
use market_desk::models::{HistoryRange, PredictionRecord, SignalAction};
use market_desk::provider::{MarketDataProvider, YahooClient};
use market_desk::snapshot::HistorySnapshot;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::{mpsc, Arc, Once};
use std::thread;
use std::time::Duration;

const HISTORY_DAYS: usize = 300;
const LAST_SESSION: (i32, u32, u32) = (2024, 6, 28);

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn last_session() -> NaiveDate {
    let (y, m, d) = LAST_SESSION;
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// `len` weekdays ending on the fixed last session.
fn session_dates(len: usize) -> Vec<NaiveDate> {
    let mut dates = Vec::with_capacity(len);
    let mut day = last_session();
    while dates.len() < len {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            dates.push(day);
        }
        day -= ChronoDuration::days(1);
    }
    dates.reverse();
    dates
}

fn wavy_closes(len: usize, base: f64, drift: f64) -> Vec<f64> {
    (0..len)
        .map(|i| base * (1.0 + drift).powi(i as i32) * (1.0 + 0.02 * (i as f64 * 0.7).sin()))
        .collect()
}

/// Index series whose final session closes exactly 1% above the one before.
fn index_closes(base: f64) -> Vec<f64> {
    let mut closes = wavy_closes(HISTORY_DAYS - 1, base, 0.0005);
    let last = *closes.last().unwrap();
    closes.push(last * 1.01);
    closes
}

fn chart_json(closes: &[f64]) -> String {
    let timestamps: Vec<i64> = session_dates(closes.len())
        .iter()
        .map(|date| date.and_hms_opt(14, 30, 0).unwrap().and_utc().timestamp())
        .collect();
    let opens: Vec<f64> = closes
        .iter()
        .enumerate()
        .map(|(i, close)| if i == 0 { *close } else { closes[i - 1] })
        .collect();
    let highs: Vec<f64> = closes
        .iter()
        .zip(&opens)
        .map(|(c, o)| c.max(*o) * 1.005)
        .collect();
    let lows: Vec<f64> = closes
        .iter()
        .zip(&opens)
        .map(|(c, o)| c.min(*o) * 0.995)
        .collect();
    let volumes: Vec<u64> = (0..closes.len()).map(|i| 1_000_000 + i as u64 * 100).collect();

    json!({
        "chart": {
            "result": [{
                "meta": {"currency": "USD"},
                "timestamp": timestamps,
                "indicators": {
                    "quote": [{
                        "open": opens,
                        "high": highs,
                        "low": lows,
                        "close": closes,
                        "volume": volumes,
                    }],
                    "adjclose": [{"adjclose": closes}]
                }
            }],
            "error": null
        }
    })
    .to_string()
}

fn calendar_json(earnings_in_days: i64) -> String {
    let earnings = (Utc::now() + ChronoDuration::days(earnings_in_days)).timestamp();
    json!({
        "quoteSummary": {
            "result": [{
                "calendarEvents": {
                    "earnings": {"earningsDate": [{"raw": earnings, "fmt": "soon"}]},
                    "exDividendDate": {"raw": 1_700_000_000i64},
                    "dividendDate": {"raw": 1_700_500_000i64}
                }
            }],
            "error": null
        }
    })
    .to_string()
}

const NOT_FOUND_CHART: &str = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;

/// Sessions of a series ending on the last session that fall inside `range`,
/// counted back from the newest bar the way Yahoo does.
fn sessions_in_range(len: usize, range: &str) -> usize {
    let days = HistoryRange::parse(range)
        .ok()
        .and_then(|range| range.approx_days());
    let Some(days) = days else {
        return len;
    };
    let cutoff = last_session() - ChronoDuration::days(days);
    session_dates(len)
        .iter()
        .filter(|date| **date >= cutoff)
        .count()
}

#[derive(Default)]
struct YahooStubResponses {
    charts: HashMap<String, Vec<f64>>,
    calendars: HashMap<String, String>,
}

impl YahooStubResponses {
    fn market() -> Self {
        let mut responses = Self::default();
        responses
            .charts
            .insert("AAPL".into(), wavy_closes(HISTORY_DAYS, 150.0, 0.002));
        responses
            .charts
            .insert("MSFT".into(), wavy_closes(HISTORY_DAYS, 300.0, -0.001));
        for (symbol, base) in [("^GSPC", 5000.0), ("^IXIC", 16000.0), ("^DJI", 38000.0)] {
            responses
                .charts
                .insert(symbol.into(), index_closes(base));
        }
        responses
            .charts
            .insert("^AXJO".into(), wavy_closes(HISTORY_DAYS, 7700.0, 0.0));
        responses.calendars.insert("AAPL".into(), calendar_json(2));
        responses
    }
}

struct YahooStub {
    base_url: String,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl YahooStub {
    fn start(responses: YahooStubResponses) -> Result<Self> {
        let mut listener: Option<TcpListener> = None;
        for _ in 0..64 {
            let port = fastrand::u16(40_000..60_000);
            if let Ok(bound) = TcpListener::bind(("127.0.0.1", port)) {
                listener = Some(bound);
                break;
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind("127.0.0.1:0")?,
        };
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let base_url = format!("http://{}", addr);
        let (shutdown, shutdown_rx) = mpsc::channel();
        let shared = Arc::new(responses);

        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let responses = Arc::clone(&shared);
                    let _ = stream.set_nonblocking(false);
                    let _ = handle_yahoo_request(stream, &responses);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        });

        Ok(Self {
            base_url,
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for YahooStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_yahoo_request(
    mut stream: std::net::TcpStream,
    responses: &YahooStubResponses,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Ok(());
    }
    let method = parts[0];
    let (path_only, query) = parts[1].split_once('?').unwrap_or((parts[1], ""));
    let range = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("range="))
        .unwrap_or("max");
    let path = path_only.replace("%5E", "^").replace("%5e", "^");

    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
    }

    if method != "GET" {
        return write_json_response(&mut stream, "405 Method Not Allowed", "{}");
    }
    if let Some(symbol) = path.strip_prefix("/v8/finance/chart/") {
        return match responses.charts.get(symbol) {
            Some(closes) => {
                let keep = sessions_in_range(closes.len(), range);
                let body = chart_json(&closes[closes.len() - keep..]);
                write_json_response(&mut stream, "200 OK", &body)
            }
            None => write_json_response(&mut stream, "404 Not Found", NOT_FOUND_CHART),
        };
    }
    if let Some(symbol) = path.strip_prefix("/v10/finance/quoteSummary/") {
        return match responses.calendars.get(symbol) {
            Some(body) => write_json_response(&mut stream, "200 OK", body),
            None => write_json_response(
                &mut stream,
                "404 Not Found",
                r#"{"quoteSummary":{"result":null,"error":{"code":"Not Found","description":"Quote not found"}}}"#,
            ),
        };
    }
    write_json_response(&mut stream, "404 Not Found", "{}")
}

fn write_json_response(
    stream: &mut std::net::TcpStream,
    status: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    stream.flush()
}

fn yahoo_context(stub: &YahooStub, db_path: &Path) -> Result<AppContext> {
    let http = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("failed to build stub HTTP client")?;
    let provider = YahooClient::with_base_url(http, stub.base_url.clone());
    let settings = ServiceSettings {
        database_path: db_path.display().to_string(),
        ..ServiceSettings::default()
    };
    let database = Database::open(db_path)?;
    Ok(AppContext::with_components(
        settings,
        Arc::new(provider),
        database,
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn yahoo_quote_indicators_and_prediction_are_logged() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    let expected_last = *wavy_closes(HISTORY_DAYS, 150.0, 0.002).last().unwrap();
    let overview = app.stock_overview("aapl", HistoryRange::OneYear).await?;
    assert_eq!(overview.symbol, "AAPL");
    assert!((overview.current_price - expected_last).abs() < 1e-9);
    assert!((0.0..=100.0).contains(&overview.rsi));
    assert!(overview.bollinger_upper >= overview.bollinger_lower);

    let prediction = app.predict("AAPL", 5).await?;
    assert_eq!(prediction.symbol, "AAPL");
    assert_eq!(prediction.horizon_days, 5);
    assert!((0.0..=1.0).contains(&prediction.confidence));
    assert!(prediction.target_date > last_session());
    assert!(prediction.predicted_price > 0.0);

    let logged = app.list_predictions(Some("aapl"), 10).await?;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].id.len(), 36);
    assert!((logged[0].predicted_price - prediction.predicted_price).abs() < 1e-9);
    assert!(logged[0].actual_price.is_none());

    // A reopened database still holds the prediction.
    drop(app);
    let reopened = Database::open(dir.path().join("desk.db"))?;
    assert_eq!(reopened.list_predictions(None, 10).await?.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_symbol_is_reported_without_fallback_data() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    match app.quote("NOPE").await {
        Err(MarketError::InvalidSymbol(symbol)) => assert_eq!(symbol, "NOPE"),
        other => return Err(anyhow!("expected InvalidSymbol, got {:?}", other.map(|q| q.symbol))),
    }
    assert!(matches!(
        app.quote("BAD SYMBOL!").await,
        Err(MarketError::InvalidSymbol(_))
    ));
    assert!(app.list_predictions(None, 10).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn event_risk_reads_the_yahoo_calendar() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    let assessment = app.event_risk("AAPL", Some(30.0)).await?;
    assert_eq!(assessment.days_to_earnings, Some(2));
    let triggered: Vec<&str> = assessment.triggered().map(|c| c.name.as_str()).collect();
    assert!(triggered.contains(&"earnings_proximity"));
    assert!(assessment.risk_score > 0.0);
    assert!(assessment.position_multiplier < 1.0);

    // No calendar for MSFT; the assessment still succeeds.
    let fallback = app.event_risk("MSFT", None).await?;
    assert!(fallback.next_earnings_date.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gap_prediction_combines_us_indices() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    let gap = app.gap_prediction().await?;
    assert_eq!(gap.indices.len(), 3);
    assert!((gap.weighted_change_percent - 1.0).abs() < 1e-9);
    assert!((gap.predicted_gap_percent - 0.65).abs() < 1e-9);
    assert_eq!(gap.direction, GapDirection::Up);
    assert_eq!(gap.strength, GapStrength::Moderate);

    let asx_last = *wavy_closes(HISTORY_DAYS, 7700.0, 0.0).last().unwrap();
    assert!((gap.asx_last_close.unwrap() - asx_last).abs() < 1e-9);
    assert!((gap.predicted_open.unwrap() - asx_last * 1.0065).abs() < 1e-6);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exported_snapshot_replays_backtests_offline() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let snapshot_path = dir.path().join("snapshots").join("history.bin");
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
    export_history::run(&app, &symbols, HistoryRange::TwoYears, &snapshot_path).await?;
    // The stub is gone; replays must come from the file.
    drop(stub);

    let snapshot = HistorySnapshot::load_from_file(&snapshot_path)?;
    assert_eq!(snapshot.symbols(), symbols);
    assert_eq!(snapshot.total_candles(), HISTORY_DAYS * 2);

    backtest::run(
        &app,
        &symbols,
        "sma_crossover",
        None,
        Some(snapshot_path.as_path()),
        &["fastPeriod=5".to_string(), "slowPeriod=20".to_string()],
    )
    .await?;
    backtest::run(
        &app,
        &symbols[..1],
        "buy_and_hold",
        None,
        Some(snapshot_path.as_path()),
        &[],
    )
    .await?;

    let stored = app.list_backtests(None, 10).await?;
    assert_eq!(stored.len(), 3);
    let aapl = app.list_backtests(Some("aapl"), 10).await?;
    assert_eq!(aapl.len(), 2);
    let hold = aapl
        .iter()
        .find(|summary| summary.strategy_id == "buy_and_hold")
        .ok_or_else(|| anyhow!("buy_and_hold result missing"))?;
    assert!(hold.total_return_percent > 0.0);
    assert_eq!(hold.end_date.date_naive(), last_session());

    let missing = dir.path().join("missing.bin");
    assert!(
        backtest::run(&app, &symbols, "rsi", None, Some(missing.as_path()), &[])
            .await
            .is_err()
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn matured_predictions_are_scored() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    let closes = wavy_closes(HISTORY_DAYS, 150.0, 0.002);
    let dates = session_dates(HISTORY_DAYS);
    let base_index = HISTORY_DAYS - 10;
    let target_index = HISTORY_DAYS - 5;
    let record = PredictionRecord {
        id: "0b7b6f2e-0000-4000-8000-000000000001".to_string(),
        symbol: "AAPL".to_string(),
        created_at: dates[base_index].and_hms_opt(21, 0, 0).unwrap().and_utc(),
        horizon_days: 5,
        target_date: dates[target_index],
        current_price: closes[base_index],
        predicted_price: closes[base_index] * 1.02,
        predicted_return: 0.02,
        confidence: 0.6,
        direction: SignalAction::Buy,
        model_version: "test".to_string(),
        components: Value::Null,
        actual_price: None,
        evaluated_at: None,
    };
    app.database().insert_prediction(&record).await?;

    evaluate_predictions::run(&app, Some(last_session())).await?;

    let stored = app.list_predictions(Some("AAPL"), 10).await?;
    assert_eq!(stored.len(), 1);
    let actual = stored[0]
        .actual_price
        .ok_or_else(|| anyhow!("prediction was not scored"))?;
    assert!((actual - closes[target_index]).abs() < 1e-9);
    assert!(stored[0].evaluated_at.is_some());

    let accuracy = app.prediction_accuracy(None).await?;
    assert_eq!(accuracy.evaluated, 1);
    let hit = (closes[target_index] > closes[base_index]) as u32;
    assert_eq!(accuracy.direction_hits, hit);

    // Already scored predictions are not picked up again.
    let summary = app.evaluate_due_predictions(last_session()).await?;
    assert_eq!(summary.due, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn past_as_of_scores_against_the_target_session() -> Result<()> {
    ensure_test_env();
    let stub = YahooStub::start(YahooStubResponses::market())?;
    let dir = tempfile::tempdir()?;
    let app = yahoo_context(&stub, &dir.path().join("desk.db"))?;

    // The stub trims like Yahoo: short ranges only hold the newest sessions.
    let month = app.history("AAPL", HistoryRange::OneMonth).await?;
    assert!(month.len() < 30);

    let closes = wavy_closes(HISTORY_DAYS, 150.0, 0.002);
    let dates = session_dates(HISTORY_DAYS);
    let (base_index, target_index, as_of_index) = (195, 200, 205);
    let record = PredictionRecord {
        id: "0b7b6f2e-0000-4000-8000-000000000002".to_string(),
        symbol: "AAPL".to_string(),
        created_at: dates[base_index].and_hms_opt(21, 0, 0).unwrap().and_utc(),
        horizon_days: 5,
        target_date: dates[target_index],
        current_price: closes[base_index],
        predicted_price: closes[base_index] * 0.98,
        predicted_return: -0.02,
        confidence: 0.55,
        direction: SignalAction::Sell,
        model_version: "test".to_string(),
        components: Value::Null,
        actual_price: None,
        evaluated_at: None,
    };
    app.database().insert_prediction(&record).await?;

    let summary = app.evaluate_due_predictions(dates[as_of_index]).await?;
    assert_eq!(summary.evaluated, 1);
    let stored = app.list_predictions(Some("AAPL"), 10).await?;
    let actual = stored[0]
        .actual_price
        .ok_or_else(|| anyhow!("prediction was not scored"))?;
    assert!((actual - closes[target_index]).abs() < 1e-9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires network access to Yahoo Finance"]
async fn live_yahoo_history() -> Result<()> {
    ensure_test_env();
    let http = HttpClient::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let client = YahooClient::new(http);
    let candles = client.fetch_history("AAPL", HistoryRange::OneMonth).await?;
    assert!(candles.len() >= 15);
    assert!(candles.windows(2).all(|w| w[0].date < w[1].date));
    Ok(())
}
