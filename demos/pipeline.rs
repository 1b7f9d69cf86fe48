//! Low-cap correlation analysis on synthetic market data.
//!
//! One job per timeframe: the reference is the BTC close series, sub-units are
//! the low-cap coins of a synthetic listing, discovered when the run starts.
//! The join computes the Pearson correlation of returns and keeps coins above
//! the configured threshold.
//!
//! Agents:
//! - `universe` lists coins at or below a market-cap percentile, BTC excluded;
//! - `market-data` produces seeded random-walk series (one coin is delisted);
//! - `store` owns an in-memory series store, reached only through events;
//! - `display` prints the final table and acknowledges presentation.
//!
//! Run with: `RUST_LOG=info cargo run --example pipeline --features logging`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pipevisor::{
    Agent, AnalysisParams, Bus, Config, CorrelationKey, Event, JobPlan, Orchestrator, WorkContext,
    WorkError, WorkItem, Worker, contract,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tracing::{info, warn};

const LISTING: &[(&str, f64)] = &[
    ("btc", 1_300_000.0),
    ("eth", 420_000.0),
    ("sol", 80_000.0),
    ("ada", 25_000.0),
    ("dot", 11_000.0),
    ("link", 9_500.0),
    ("xlm", 3_300.0),
    ("algo", 1_500.0),
    ("zil", 400.0),
    ("one", 250.0),
    ("delisted", 120.0),
];

/// `percentile` of `sorted`, interpolating linearly between ranks.
fn percentile(sorted: &[f64], percentile: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = (percentile / 100.0).clamp(0.0, 1.0) * last as f64;
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

fn returns(series: &[f64]) -> Vec<f64> {
    series.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect()
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean = |xs: &[f64]| xs.iter().sum::<f64>() / n as f64;
    let (ma, mb) = (mean(a), mean(b));
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    let denom = (va * vb).sqrt();
    (denom > 0.0).then(|| cov / denom)
}

fn closes(value: &Value) -> Vec<f64> {
    value["closes"]
        .as_array()
        .map(|xs| xs.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default()
}

/// Joins a coin series with the BTC reference.
struct Correlation {
    threshold: f64,
}

impl pipevisor::Joiner<Value, Value> for Correlation {
    fn join(&mut self, unit: &str, reference: &Value, prerequisite: &Value) -> Result<Option<Value>, String> {
        let r = pearson(&returns(&closes(reference)), &returns(&closes(prerequisite)))
            .ok_or_else(|| format!("{unit}: series too short to correlate"))?;
        if r.abs() < self.threshold {
            return Ok(None);
        }
        Ok(Some(json!({
            "symbol": unit,
            "correlation": (r * 1000.0).round() / 1000.0,
            "market_cap": prerequisite["market_cap"],
        })))
    }
}

type Request = (CorrelationKey, String, Value);

/// Turns `WorkRequested` of one of `kinds` into requests.
fn requests(ev: &Event, kinds: &[&str]) -> Option<Request> {
    let kind = ev.str_field("kind")?;
    if !kinds.contains(&kind) {
        return None;
    }
    Some((ev.correlation_key()?.clone(), kind.to_string(), ev.field("args")?.clone()))
}

/// Synthetic coin listing; answers sub-unit discovery.
struct Universe;

#[async_trait]
impl Worker for Universe {
    type Op = Request;

    fn name(&self) -> &str {
        "universe"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["low_caps".into()]
    }

    async fn execute(&mut self, (key, kind, args): Request, ctx: &WorkContext) -> Result<(), WorkError> {
        let mut caps: Vec<f64> = LISTING.iter().map(|(_, cap)| *cap).collect();
        caps.sort_by(f64::total_cmp);
        let percent = args["percentile"].as_f64().unwrap_or(25.0);
        let threshold = percentile(&caps, percent).unwrap_or(f64::INFINITY);
        info!(job = %key.job(), threshold, "low-cap threshold");

        let coins: Vec<Value> = LISTING
            .iter()
            .filter(|(symbol, cap)| *symbol != "btc" && *cap <= threshold)
            .map(|(symbol, cap)| json!({ "unit": symbol, "args": { "symbol": symbol, "market_cap": cap } }))
            .collect();
        ctx.bus.publish(contract::work_completed(self.name(), key, &kind, Value::Array(coins)));
        Ok(())
    }

    fn on_failed(&mut self, (key, kind, _): &Request, err: &WorkError, bus: &Bus) {
        bus.publish(contract::work_failed(self.name(), key.clone(), kind, &err.to_string()));
    }
}

/// Synthetic market data source.
struct MarketData {
    points: usize,
}

#[async_trait]
impl Worker for MarketData {
    type Op = Request;

    fn name(&self) -> &str {
        "market-data"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["btc_series".into(), "coin_series".into()]
    }

    async fn execute(&mut self, (key, kind, args): Request, ctx: &WorkContext) -> Result<(), WorkError> {
        let symbol = args["symbol"].as_str().unwrap_or("btc");
        if symbol == "delisted" {
            return Err(WorkError::permanent(format!("{symbol} is not listed")));
        }
        // Simulated provider latency.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let timeframe = key.job().to_string();
        let seed = format!("{timeframe}/{symbol}");
        let mut rng = StdRng::seed_from_u64(seed.bytes().map(u64::from).sum::<u64>());
        let mut btc = StdRng::seed_from_u64(timeframe.bytes().map(u64::from).sum::<u64>());

        let beta: f64 = if symbol == "btc" { 1.0 } else { rng.random_range(-0.2..1.5) };
        let mut price = 100.0;
        let mut series = Vec::with_capacity(self.points);
        for _ in 0..self.points {
            let market: f64 = btc.random_range(-0.03..0.03);
            let own: f64 = rng.random_range(-0.02..0.02);
            price *= 1.0 + beta * market + if symbol == "btc" { 0.0 } else { own };
            series.push((price * 100.0).round() / 100.0);
        }

        let result = json!({ "closes": series, "market_cap": args["market_cap"] });
        ctx.bus.publish(contract::work_completed(self.name(), key, &kind, result));
        Ok(())
    }

    fn on_failed(&mut self, (key, kind, _): &Request, err: &WorkError, bus: &Bus) {
        bus.publish(contract::work_failed(self.name(), key.clone(), kind, &err.to_string()));
    }
}

#[derive(Clone)]
enum StoreOp {
    Open(String),
    Save(CorrelationKey, Vec<f64>),
}

impl std::fmt::Debug for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreOp::Open(run) => write!(f, "Open({run})"),
            StoreOp::Save(key, series) => write!(f, "Save({key}, {} points)", series.len()),
        }
    }
}

/// Sole owner of the series store.
#[derive(Default)]
struct Store {
    run: Option<String>,
    series: HashMap<CorrelationKey, Vec<f64>>,
}

#[async_trait]
impl Worker for Store {
    type Op = StoreOp;

    fn name(&self) -> &str {
        "store"
    }

    fn kinds(&self) -> Vec<String> {
        vec!["persist".into()]
    }

    async fn execute(&mut self, op: StoreOp, _ctx: &WorkContext) -> Result<(), WorkError> {
        match op {
            StoreOp::Open(run) => {
                info!(%run, "store opened");
                self.run = Some(run);
            }
            StoreOp::Save(key, series) => {
                if self.run.is_none() {
                    return Err(WorkError::permanent("store not opened"));
                }
                self.series.insert(key, series);
            }
        }
        Ok(())
    }

    fn on_failed(&mut self, op: &StoreOp, err: &WorkError, _bus: &Bus) {
        warn!(?op, %err, "series not stored");
    }
}

/// Orders result rows by descending |correlation|, then ascending market cap.
fn strongest_first(rows: &mut [&Value]) {
    let strength = |row: &Value| row["output"]["correlation"].as_f64().unwrap_or(0.0).abs();
    let cap = |row: &Value| row["output"]["market_cap"].as_f64().unwrap_or(0.0);
    rows.sort_by(|a, b| strength(*b).total_cmp(&strength(*a)).then(cap(*a).total_cmp(&cap(*b))));
}

/// Prints final results, strongest correlation first, and acknowledges them.
struct Display;

#[async_trait]
impl Worker for Display {
    type Op = Value;

    fn name(&self) -> &str {
        "display"
    }

    async fn execute(&mut self, payload: Value, ctx: &WorkContext) -> Result<(), WorkError> {
        let mut rows: Vec<&Value> = payload["results"].as_array().into_iter().flatten().collect();
        strongest_first(&mut rows);

        println!("\nrun {}", payload["run_id"].as_str().unwrap_or("?"));
        println!("{:<10} {:<10} {:>12} {:>12}", "timeframe", "symbol", "correlation", "market cap");
        for row in rows {
            println!(
                "{:<10} {:<10} {:>12} {:>12}",
                row["job"].as_str().unwrap_or("?"),
                row["output"]["symbol"].as_str().unwrap_or("?"),
                row["output"]["correlation"],
                row["output"]["market_cap"]
            );
        }
        for row in payload["failures"].as_array().into_iter().flatten() {
            println!(
                "{:<10} {:<10} failed: {}",
                row["job"].as_str().unwrap_or("?"),
                row["unit"].as_str().unwrap_or("*"),
                row["cause"].as_str().unwrap_or("?")
            );
        }
        ctx.bus.publish(contract::presentation_done(self.name()));
        Ok(())
    }

    fn on_failed(&mut self, _payload: &Value, err: &WorkError, bus: &Bus) {
        warn!(%err, "results not displayed");
        bus.publish(contract::presentation_done(self.name()));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pipevisor::init_tracing();

    let cfg = Config {
        agent_stop_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(200),
        ..Config::default()
    };
    let params = AnalysisParams {
        weeks: 12,
        correlation_threshold: 0.5,
        timeframes: vec!["1h".into(), "4h".into(), "1d".into()],
        low_cap_percentile: 50.0,
        ..AnalysisParams::default()
    };

    let plans = params.timeframes.iter().map(|tf| {
        JobPlan::new(tf.as_str(), WorkItem::new("btc_series", json!({ "symbol": "btc" }))).discover(
            WorkItem::new("low_caps", json!({ "percentile": params.low_cap_percentile })),
            "coin_series",
        )
    });

    let builder = Orchestrator::builder(cfg.clone())
        .parameters(&params)
        .jobs(plans)
        .with_log_writer();
    let bus = builder.bus().clone();

    let store = Agent::new(Store::default(), bus.clone(), cfg.clone());
    store.listen(contract::CONFIG_BROADCAST, |ev| {
        ev.str_field("run_id").map(|run| StoreOp::Open(run.to_string()))
    })?;
    store.listen(contract::WORK_COMPLETED, |ev| {
        let closes = ev.field("result")?.get("closes")?.as_array()?;
        let series = closes.iter().filter_map(Value::as_f64).collect();
        Some(StoreOp::Save(ev.correlation_key()?.clone(), series))
    })?;

    let universe = Agent::new(Universe, bus.clone(), cfg.clone());
    universe.listen(contract::WORK_REQUESTED, |ev| requests(ev, &["low_caps"]))?;

    let market = Agent::new(MarketData { points: params.weeks as usize * 7 }, bus.clone(), cfg.clone());
    market.listen(contract::WORK_REQUESTED, |ev| requests(ev, &["btc_series", "coin_series"]))?;

    let display = Agent::new(Display, bus.clone(), cfg.clone());
    display.listen(contract::FINAL_RESULTS_READY, |ev| Some(Value::Object(ev.payload().clone())))?;

    let orchestrator = builder
        .agent(store)
        .agent(universe)
        .agent(market)
        .agent(display)
        .build(Correlation {
            threshold: params.correlation_threshold,
        })?;

    let report = orchestrator.run().await?;
    for agent in &report.agents {
        info!(agent = %agent.agent, processed = agent.processed, dropped = agent.dropped, "agent report");
    }
    if !report.diagnostics.is_empty() {
        warn!(diagnostics = ?report.diagnostics, "run recorded diagnostics");
    }
    Ok(())
}
