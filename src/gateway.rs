// ===============================
// src/gateway.rs (broker adapters + order dispatcher)
// ===============================
//
// - Broker trait   : place_order / cancel_order / order_status
// - PaperBroker    : fill simulasi di harga order setelah `fill_ms`
// - RestBroker     : REST API broker (orders/sync, orders?id=)
// - run            : terima Order dari engine, spawn task per order,
//                    kirim ExecReport (Ack -> Filled/Rejected) balik ke engine.
//
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::domain::{from_px, to_px, ExecReport, ExecStatus, Order, Side};
use crate::metrics::{BROKER_ERRORS, EXECS};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker api error: {0}")]
    Api(String),
    #[error("unknown order id {0}")]
    UnknownOrder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderResult {
    Accepted(String),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    Working,
    Filled { qty: i64, avg_px: i64 },
    Rejected(String),
    Cancelled,
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;
    async fn place_order(&self, order: &Order) -> Result<OrderResult, BrokerError>;
    async fn cancel_order(&self, id: &str) -> Result<(), BrokerError>;
    async fn order_status(&self, id: &str) -> Result<OrderState, BrokerError>;
}

// ---------------- Paper ----------------

struct PaperOrder {
    qty: i64,
    px: i64,
    placed: Instant,
    cancelled: bool,
}

pub struct PaperBroker {
    fill_after: Duration,
    reject_reason: Option<String>,
    seq: AtomicU64,
    book: Mutex<HashMap<String, PaperOrder>>,
}

impl PaperBroker {
    pub fn new(fill_ms: u64) -> Self {
        Self {
            fill_after: Duration::from_millis(fill_ms),
            reject_reason: None,
            seq: AtomicU64::new(0),
            book: Mutex::new(HashMap::new()),
        }
    }

    /// Broker yang menolak semua order (uji jalur retry/eskalasi)
    pub fn rejecting(reason: &str) -> Self {
        Self { reject_reason: Some(reason.to_string()), ..Self::new(0) }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn place_order(&self, order: &Order) -> Result<OrderResult, BrokerError> {
        if let Some(r) = &self.reject_reason {
            return Ok(OrderResult::Rejected(r.clone()));
        }
        let id = format!("PAPER-{}", self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        let po = PaperOrder { qty: order.qty, px: order.px, placed: Instant::now(), cancelled: false };
        self.book.lock().map_err(|_| BrokerError::Api("paper book poisoned".into()))?.insert(id.clone(), po);
        Ok(OrderResult::Accepted(id))
    }

    async fn cancel_order(&self, id: &str) -> Result<(), BrokerError> {
        let mut book = self.book.lock().map_err(|_| BrokerError::Api("paper book poisoned".into()))?;
        let po = book.get_mut(id).ok_or_else(|| BrokerError::UnknownOrder(id.to_string()))?;
        po.cancelled = true;
        Ok(())
    }

    async fn order_status(&self, id: &str) -> Result<OrderState, BrokerError> {
        let mut book = self.book.lock().map_err(|_| BrokerError::Api("paper book poisoned".into()))?;
        let po = book.get(id).ok_or_else(|| BrokerError::UnknownOrder(id.to_string()))?;
        let state = if po.cancelled {
            OrderState::Cancelled
        } else if po.placed.elapsed() >= self.fill_after {
            OrderState::Filled { qty: po.qty, avg_px: po.px }
        } else {
            OrderState::Working
        };
        // status terminal cukup dilaporkan sekali; buang supaya book tidak tumbuh sepanjang sesi
        if state != OrderState::Working {
            book.remove(id);
        }
        Ok(state)
    }
}

// ---------------- REST ----------------

#[derive(Debug, Deserialize)]
struct ApiReply {
    s: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "orderBook", default)]
    order_book: Vec<ApiOrder>,
}

#[derive(Debug, Deserialize)]
struct ApiOrder {
    id: String,
    status: i64,
    #[serde(rename = "filledQty", default)]
    filled_qty: i64,
    #[serde(rename = "tradedPrice", default)]
    traded_price: f64,
    #[serde(default)]
    message: Option<String>,
}

/// Kode status order: 1 cancelled, 2 traded, 5 rejected, lainnya masih working.
fn order_state(o: &ApiOrder) -> OrderState {
    match o.status {
        2 => OrderState::Filled { qty: o.filled_qty, avg_px: to_px(o.traded_price) },
        5 => OrderState::Rejected(o.message.clone().unwrap_or_else(|| "rejected".into())),
        1 => OrderState::Cancelled,
        _ => OrderState::Working,
    }
}

pub struct RestBroker {
    http: reqwest::Client,
    base: String,
    auth: String,
}

impl RestBroker {
    pub fn new(cfg: &BrokerConfig) -> Result<Self, BrokerError> {
        let client_id = cfg.client_id.clone().ok_or_else(|| BrokerError::Api("BROKER_CLIENT_ID not set".into()))?;
        let token = cfg.access_token.clone().ok_or_else(|| BrokerError::Api("BROKER_ACCESS_TOKEN not set".into()))?;
        let http = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, base: cfg.rest_url.trim_end_matches('/').to_string(), auth: format!("{client_id}:{token}") })
    }

    fn order_body(order: &Order) -> serde_json::Value {
        json!({
            "symbol": order.symbol,
            "qty": order.qty,
            "type": 2,              // market
            "side": match order.side { Side::Buy => 1, Side::Sell => -1 },
            "productType": "INTRADAY",
            "limitPrice": 0,
            "stopPrice": 0,
            "validity": "DAY",
            "disclosedQty": 0,
            "offlineOrder": false,
            "orderTag": order.cl_id.replace('-', ""),
        })
    }
}

#[async_trait]
impl Broker for RestBroker {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn place_order(&self, order: &Order) -> Result<OrderResult, BrokerError> {
        let url = format!("{}/orders/sync", self.base);
        debug!(cl_id = %order.cl_id, px = from_px(order.px), "POST orders/sync");
        let reply: ApiReply = self
            .http
            .post(&url)
            .header("Authorization", &self.auth)
            .json(&Self::order_body(order))
            .send()
            .await?
            .json()
            .await?;
        Ok(match (reply.s.as_str(), reply.id) {
            ("ok", Some(id)) => OrderResult::Accepted(id),
            _ => OrderResult::Rejected(reply.message.unwrap_or_else(|| "order rejected".into())),
        })
    }

    async fn cancel_order(&self, id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/orders/sync", self.base);
        let reply: ApiReply = self
            .http
            .delete(&url)
            .header("Authorization", &self.auth)
            .json(&json!({ "id": id }))
            .send()
            .await?
            .json()
            .await?;
        if reply.s == "ok" {
            Ok(())
        } else {
            Err(BrokerError::Api(reply.message.unwrap_or_else(|| "cancel failed".into())))
        }
    }

    async fn order_status(&self, id: &str) -> Result<OrderState, BrokerError> {
        let url = format!("{}/orders", self.base);
        let reply: ApiReply = self
            .http
            .get(&url)
            .header("Authorization", &self.auth)
            .query(&[("id", id)])
            .send()
            .await?
            .json()
            .await?;
        if reply.s != "ok" {
            return Err(BrokerError::Api(reply.message.unwrap_or_else(|| "status failed".into())));
        }
        reply
            .order_book
            .iter()
            .find(|o| o.id == id)
            .map(order_state)
            .ok_or_else(|| BrokerError::UnknownOrder(id.to_string()))
    }
}

// ---------------- Dispatcher ----------------

#[derive(Clone, Debug)]
pub struct DispatchCfg {
    /// interval polling status setelah order diterima
    pub poll: Duration,
    /// berhenti polling setelah ini; timeout ditangani engine (eskalasi)
    pub give_up: Duration,
}

impl DispatchCfg {
    pub fn from_broker(cfg: &BrokerConfig) -> Self {
        Self { poll: cfg.status_poll, give_up: cfg.ack_timeout * 2 }
    }
}

fn report(o: &Order, status: ExecStatus, filled_qty: i64, avg_px: i64) -> ExecReport {
    ExecReport { cl_id: o.cl_id.clone(), symbol: o.symbol.clone(), status, filled_qty, avg_px, ts: Utc::now() }
}

async fn emit(exec_tx: &mpsc::Sender<ExecReport>, broker: &str, rep: ExecReport) {
    let label = match &rep.status {
        ExecStatus::Ack => "ack",
        ExecStatus::Filled => "filled",
        ExecStatus::Rejected(_) => "rejected",
        ExecStatus::Unknown(_) => "unknown",
    };
    EXECS.with_label_values(&[label, broker]).inc();
    if exec_tx.send(rep).await.is_err() {
        debug!("exec channel closed, report dropped");
    }
}

/// Satu order: place -> Ack -> poll status sampai terminal.
pub async fn execute(broker: Arc<dyn Broker>, o: Order, exec_tx: mpsc::Sender<ExecReport>, cfg: DispatchCfg) {
    let name = broker.name();
    let id = match broker.place_order(&o).await {
        Ok(OrderResult::Accepted(id)) => id,
        Ok(OrderResult::Rejected(why)) => {
            info!(cl_id = %o.cl_id, reason = %why, "order rejected by broker");
            emit(&exec_tx, name, report(&o, ExecStatus::Rejected(why), 0, 0)).await;
            return;
        }
        Err(e) => {
            BROKER_ERRORS.with_label_values(&["place_order"]).inc();
            warn!(cl_id = %o.cl_id, error = %e, "place_order failed, order state unknown");
            emit(&exec_tx, name, report(&o, ExecStatus::Unknown(e.to_string()), 0, 0)).await;
            return;
        }
    };
    emit(&exec_tx, name, report(&o, ExecStatus::Ack, 0, 0)).await;

    let deadline = Instant::now() + cfg.give_up;
    loop {
        sleep(cfg.poll).await;
        match broker.order_status(&id).await {
            Ok(OrderState::Filled { qty, avg_px }) => {
                let avg_px = if avg_px > 0 { avg_px } else { o.px };
                emit(&exec_tx, name, report(&o, ExecStatus::Filled, qty, avg_px)).await;
                return;
            }
            Ok(OrderState::Rejected(why)) => {
                emit(&exec_tx, name, report(&o, ExecStatus::Rejected(why), 0, 0)).await;
                return;
            }
            Ok(OrderState::Cancelled) => {
                emit(&exec_tx, name, report(&o, ExecStatus::Rejected("cancelled".into()), 0, 0)).await;
                return;
            }
            Ok(OrderState::Working) => {}
            Err(e) => {
                BROKER_ERRORS.with_label_values(&["order_status"]).inc();
                warn!(cl_id = %o.cl_id, %id, error = %e, "order_status failed");
            }
        }
        if Instant::now() >= deadline {
            warn!(cl_id = %o.cl_id, %id, "no terminal status, cancelling");
            if let Err(e) = broker.cancel_order(&id).await {
                BROKER_ERRORS.with_label_values(&["cancel_order"]).inc();
                warn!(%id, error = %e, "cancel_order failed");
            }
            let why = format!("no terminal status for broker order {id}");
            emit(&exec_tx, name, report(&o, ExecStatus::Unknown(why), 0, 0)).await;
            return;
        }
    }
}

/// Loop gateway: setiap order dieksekusi di task sendiri agar tidak saling blok.
pub async fn run(
    mut rx: mpsc::Receiver<Order>,
    exec_tx: mpsc::Sender<ExecReport>,
    broker: Arc<dyn Broker>,
    cfg: DispatchCfg,
) {
    info!(broker = broker.name(), "gateway started");
    while let Some(o) = rx.recv().await {
        tokio::spawn(execute(broker.clone(), o, exec_tx.clone(), cfg.clone()));
    }
    info!("gateway: order channel closed");
}
