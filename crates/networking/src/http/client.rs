//! Kotak Neo HTTP client
//!
//! Bearer-token authenticated JSON client. Auth failures are sniffed from
//! both the HTTP status and the error description in the body so that the
//! session guard can tell a revoked token apart from an order rejection.

use crate::api::{BrokerApi, ScripTable, SessionToken};
use async_trait::async_trait;
use chrono::Utc;
use neodip_core::config::Credentials;
use neodip_core::errors::{is_auth_description, Error, Result};
use neodip_core::models::{
    BrokerOrder, Holding, OrderAck, OrderRequest, OrderSide, OrderStatus, OrderType, OrderVariety,
    Quote,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

/// HTTP client for the Kotak Neo trade API
pub struct KotakNeoClient {
    http: Client,
    api_base: String,
    consumer_key: String,
    /// Shared with SessionGuard, which refreshes it on re-login
    token: Arc<RwLock<Option<SessionToken>>>,
}

impl KotakNeoClient {
    pub fn new(api_base: &str, consumer_key: &str, token: Arc<RwLock<Option<SessionToken>>>) -> Self {
        let http = Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            consumer_key: consumer_key.to_string(),
            token,
        }
    }

    /// Headers for authenticated requests
    async fn auth_headers(&self) -> Result<HeaderMap> {
        let token = self.token.read().await;
        let session = token
            .as_ref()
            .ok_or_else(|| Error::AuthExpired("no active session".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", session.jwt))
                .map_err(|e| Error::InvalidData(e.to_string()))?,
        );
        headers.insert(
            "neo-fin-key",
            HeaderValue::from_str(&self.consumer_key)
                .map_err(|e| Error::InvalidData(e.to_string()))?,
        );
        headers.insert(
            "sid",
            HeaderValue::from_str(&session.session_id)
                .map_err(|e| Error::InvalidData(e.to_string()))?,
        );
        Ok(headers)
    }

    /// Check if a response indicates a revoked or invalid session
    async fn check_auth_error(response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AuthExpired(format!("HTTP {}: {}", status, body)));
        }
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            if is_auth_description(&body) {
                return Err(Error::AuthExpired(format!("HTTP {}: {}", status, body)));
            }
            if status.as_u16() == 429 {
                return Err(Error::RateLimited(format!("HTTP {}: {}", status, body)));
            }
            if status.is_server_error() {
                return Err(Error::Transient(format!("HTTP {}: {}", status, body)));
            }
            return Err(Error::BrokerReject(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .headers(self.auth_headers().await?)
            .send()
            .await?;
        let response = Self::check_auth_error(response).await?;
        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", url, e);
            Error::InvalidData(e.to_string())
        })
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .post(&url)
            .headers(self.auth_headers().await?)
            .json(body)
            .send()
            .await?;
        let response = Self::check_auth_error(response).await?;
        response.json::<T>().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", url, e);
            Error::InvalidData(e.to_string())
        })
    }
}

// ─── Wire models ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginResponse {
    data: LoginData,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
    sid: String,
}

#[derive(Debug, Deserialize)]
struct HoldingsResponse {
    #[serde(default)]
    data: Vec<HoldingRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HoldingRow {
    #[serde(alias = "trdSym", alias = "displaySymbol")]
    trading_symbol: String,
    #[serde(alias = "quantity")]
    qty: f64,
    #[serde(default, alias = "averagePrice")]
    avg_price: f64,
}

#[derive(Debug, Deserialize)]
struct OrderBookResponse {
    #[serde(default)]
    data: Vec<OrderRow>,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    #[serde(alias = "nOrdNo")]
    order_id: String,
    #[serde(alias = "trdSym")]
    trading_symbol: String,
    /// B / S or BUY / SELL depending on the endpoint
    #[serde(alias = "trnsTp")]
    side: String,
    #[serde(alias = "prcTp")]
    price_type: String,
    #[serde(default, alias = "prc")]
    price: Option<f64>,
    #[serde(alias = "qty")]
    qty: f64,
    #[serde(alias = "ordSt")]
    status: String,
    #[serde(default, alias = "avgPrc")]
    avg_price: Option<f64>,
}

impl OrderRow {
    fn into_order(self) -> Option<BrokerOrder> {
        let side = match self.side.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            "S" | "SELL" => OrderSide::Sell,
            other => {
                debug!("unknown order side '{}', skipping row", other);
                return None;
            }
        };
        let order_type = match self.price_type.to_uppercase().as_str() {
            "L" | "LIMIT" => OrderType::Limit,
            _ => OrderType::Market,
        };
        Some(BrokerOrder {
            order_id: self.order_id,
            trading_symbol: self.trading_symbol,
            side,
            order_type,
            price: self.price.filter(|p| *p > 0.0),
            qty: self.qty.max(0.0) as u32,
            status: OrderStatus::parse_lenient(&self.status),
            exec_price: self.avg_price.filter(|p| *p > 0.0),
            placed_at: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    #[serde(alias = "nOrdNo")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(alias = "ltp")]
    last_price: f64,
    #[serde(default, alias = "avgTrdVol")]
    avg_volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LimitsResponse {
    #[serde(alias = "Net", alias = "availableCash")]
    available_cash: f64,
}

#[derive(Debug, Deserialize)]
struct ScripRow {
    #[serde(alias = "pSymbolName")]
    trading_symbol: String,
    #[serde(alias = "pSymbol")]
    token: String,
}

// ─── BrokerApi impl ──────────────────────────────────────────────────

#[async_trait]
impl BrokerApi for KotakNeoClient {
    #[instrument(skip(self, credentials))]
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken> {
        let url = format!("{}/login/1.0/login/v2/validate", self.api_base);
        debug!("Logging in via {}", url);

        let body = serde_json::json!({
            "mobileNumber": credentials.mobile_number,
            "password": credentials.password,
            "mpin": credentials.mpin,
        });
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header("neo-fin-key", &self.consumer_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Login failed: HTTP {} — {}", status, text);
            if is_auth_description(&text) || status == StatusCode::UNAUTHORIZED {
                return Err(Error::AuthExpired(format!("login rejected: {}", text)));
            }
            return Err(Error::Transient(format!("login failed: HTTP {}", status)));
        }

        let parsed: LoginResponse = response.json().await.map_err(|e| {
            error!("Failed to parse login response: {}", e);
            Error::InvalidData(e.to_string())
        })?;

        let session = SessionToken {
            session_id: parsed.data.sid,
            jwt: parsed.data.token,
            issued_at: Utc::now(),
        };
        debug!("Login succeeded, session {}", session.session_id);
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn holdings(&self) -> Result<Vec<Holding>> {
        let parsed: HoldingsResponse = self.get_json("/portfolio/1.0/holdings").await?;
        let holdings = parsed
            .data
            .into_iter()
            .map(|row| Holding {
                trading_symbol: row.trading_symbol,
                qty: row.qty.max(0.0) as u32,
                avg_price: row.avg_price,
            })
            .collect::<Vec<_>>();
        debug!("Fetched {} holdings", holdings.len());
        Ok(holdings)
    }

    #[instrument(skip(self))]
    async fn orders(&self) -> Result<Vec<BrokerOrder>> {
        let parsed: OrderBookResponse = self.get_json("/Orders/2.0/quick/user/orders").await?;
        let orders: Vec<BrokerOrder> = parsed
            .data
            .into_iter()
            .filter_map(OrderRow::into_order)
            .collect();
        debug!("Fetched {} orders", orders.len());
        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn order_status(&self, order_id: &str) -> Result<BrokerOrder> {
        // Single-order endpoint does not exist; refresh from the book
        let orders = self.orders().await?;
        orders
            .into_iter()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| Error::NoData(format!("order {} not in book", order_id)))
    }

    #[instrument(skip(self, request), fields(symbol = %request.trading_symbol))]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        let body = serde_json::json!({
            "am": if request.variety == OrderVariety::Amo { "YES" } else { "NO" },
            "ts": request.trading_symbol,
            "tt": match request.side { OrderSide::Buy => "B", OrderSide::Sell => "S" },
            "pt": match request.order_type { OrderType::Market => "MKT", OrderType::Limit => "L" },
            "pr": request.price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "0".into()),
            "qt": request.qty.to_string(),
            "pc": request.product,
            "es": "nse_cm",
        });
        let parsed: PlaceOrderResponse = self
            .post_json("/Orders/2.0/quick/order/rule/ms/place", &body)
            .await?;
        debug!(
            "Order placed: {:?} {:?} {} x{} -> {}",
            request.side, request.order_type, request.trading_symbol, request.qty, parsed.order_id
        );
        Ok(OrderAck {
            order_id: parsed.order_id,
        })
    }

    #[instrument(skip(self))]
    async fn modify_order(
        &self,
        order_id: &str,
        price: Option<f64>,
        qty: Option<u32>,
    ) -> Result<OrderAck> {
        let body = serde_json::json!({
            "no": order_id,
            "pr": price.map(|p| format!("{:.2}", p)),
            "qt": qty.map(|q| q.to_string()),
        });
        let parsed: PlaceOrderResponse = self
            .post_json("/Orders/2.0/quick/order/vr/modify", &body)
            .await?;
        Ok(OrderAck {
            order_id: parsed.order_id,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let body = serde_json::json!({ "on": order_id });
        let response = self
            .http
            .post(format!("{}/Orders/2.0/quick/order/cancel", self.api_base))
            .headers(self.auth_headers().await?)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!("Order {} cancel acknowledged", order_id);
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        // cancelling an already-dead order acks as a no-op
        if text.to_lowercase().contains("already cancelled")
            || text.to_lowercase().contains("not open")
        {
            debug!("Order {} already cancelled", order_id);
            return Ok(());
        }
        if is_auth_description(&text) || status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthExpired(format!("HTTP {}: {}", status, text)));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!("HTTP {}: {}", status, text)));
        }
        Err(Error::BrokerReject(format!("HTTP {}: {}", status, text)))
    }

    #[instrument(skip(self))]
    async fn quote(&self, trading_symbol: &str) -> Result<Quote> {
        let parsed: QuoteResponse = self
            .get_json(&format!(
                "/quotes/1.0/quote?symbol={}&exchange=nse_cm",
                trading_symbol
            ))
            .await?;
        Ok(Quote {
            ltp: parsed.last_price,
            avg_volume: parsed.avg_volume,
        })
    }

    #[instrument(skip(self))]
    async fn limits(&self) -> Result<f64> {
        let parsed: LimitsResponse = self
            .post_json("/Orders/2.0/quick/user/limits", &serde_json::json!({"seg": "CASH"}))
            .await?;
        Ok(parsed.available_cash)
    }

    #[instrument(skip(self))]
    async fn scrip_master(&self) -> Result<ScripTable> {
        let rows: Vec<ScripRow> = self
            .get_json("/Files/1.0/masterscrip/v2/file-paths?segment=nse_cm")
            .await?;
        if rows.is_empty() {
            return Err(Error::NoData("empty scrip master".to_string()));
        }
        let table = rows
            .into_iter()
            .map(|r| (r.trading_symbol, r.token))
            .collect::<ScripTable>();
        debug!("Scrip master loaded: {} symbols", table.len());
        Ok(table)
    }
}
