//! Historical chart and fundamentals client
//!
//! Talks to a Yahoo-style chart API keyed by the base ticker with an `.NS`
//! listing suffix. The provider throttles with `401 Invalid Crumb`
//! responses, which classify as `RateLimited` so the retry policy backs
//! off instead of giving up.

use neodip_core::errors::{Error, Result};
use neodip_core::models::{Candle, Fundamentals, Interval};
use neodip_core::symbols;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error};

const CHART_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

pub struct HistoryClient {
    http: Client,
    base_url: String,
}

impl HistoryClient {
    pub fn new(base_url: &str) -> Self {
        let http = Client::builder()
            .user_agent(CHART_USER_AGENT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch OHLCV bars for `ticker`. Bars with missing fields (halted
    /// sessions) are dropped; output is ordered oldest first.
    pub async fn fetch_chart(
        &self,
        ticker: &str,
        interval: Interval,
        years: u32,
    ) -> Result<Vec<Candle>> {
        let symbol = symbols::history_symbol(ticker);
        let url = format!(
            "{}/v8/finance/chart/{}?range={}y&interval={}",
            self.base_url,
            symbol,
            years,
            interval.as_chart_param()
        );
        debug!("Fetching chart: {}", url);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || body.to_lowercase().contains("invalid crumb") {
                return Err(Error::RateLimited(format!("chart API: HTTP {}", status)));
            }
            if status.as_u16() == 404 {
                return Err(Error::NoData(format!("{} not found on chart API", symbol)));
            }
            if status.is_server_error() {
                return Err(Error::Transient(format!("chart API: HTTP {}", status)));
            }
            error!("Chart request failed: HTTP {} — {}", status, body);
            return Err(Error::InvalidData(format!("chart API: HTTP {}", status)));
        }

        let body = response.text().await.map_err(|e| {
            error!("Failed to read chart response for {}: {}", symbol, e);
            Error::InvalidData(e.to_string())
        })?;
        let candles = parse_chart(&body, &symbol)?;
        debug!("Chart fetched: {} {:?} bars for {}", candles.len(), interval, symbol);
        Ok(candles)
    }

    /// Fetch PE/PB. Missing modules leave the respective side `None`.
    pub async fn fetch_fundamentals(&self, ticker: &str) -> Result<Fundamentals> {
        let symbol = symbols::history_symbol(ticker);
        let url = format!(
            "{}/v10/finance/quoteSummary/{}?modules=summaryDetail,defaultKeyStatistics",
            self.base_url, symbol
        );
        debug!("Fetching fundamentals: {}", url);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || body.to_lowercase().contains("invalid crumb") {
                return Err(Error::RateLimited(format!(
                    "fundamentals API: HTTP {}",
                    status
                )));
            }
            if status.as_u16() == 404 {
                return Err(Error::NoData(format!("{} has no fundamentals", symbol)));
            }
            return Err(Error::Transient(format!("fundamentals API: HTTP {}", status)));
        }

        let parsed: QuoteSummaryResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidData(e.to_string()))?;

        let result = parsed
            .quote_summary
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .unwrap_or_default();

        Ok(Fundamentals {
            pe: result
                .summary_detail
                .and_then(|d| d.trailing_pe)
                .map(|v| v.raw),
            pb: result
                .default_key_statistics
                .and_then(|d| d.price_to_book)
                .map(|v| v.raw),
        })
    }
}

/// Decode a chart payload into ordered candles. Rows with a missing OHLC
/// side (halted sessions) are dropped.
fn parse_chart(body: &str, symbol: &str) -> Result<Vec<Candle>> {
    let parsed: ChartResponse =
        serde_json::from_str(body).map_err(|e| Error::InvalidData(e.to_string()))?;

    let result = parsed
        .chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| Error::NoData(format!("empty chart result for {}", symbol)))?;

    let quote = result
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoData(format!("no quote block for {}", symbol)))?;

    let mut candles = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let (Some(open), Some(high), Some(low), Some(close)) = (
            quote.open.get(i).copied().flatten(),
            quote.high.get(i).copied().flatten(),
            quote.low.get(i).copied().flatten(),
            quote.close.get(i).copied().flatten(),
        ) else {
            continue;
        };
        let volume = quote.volume.get(i).copied().flatten().unwrap_or(0.0);
        let Some(ts) = DateTime::<Utc>::from_timestamp(*ts, 0) else {
            continue;
        };
        candles.push(Candle {
            ts,
            open,
            high,
            low,
            close,
            volume,
        });
    }
    Ok(candles)
}

// ─── Wire models ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct QuoteSummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: QuoteSummaryEnvelope,
}

#[derive(Debug, Deserialize)]
struct QuoteSummaryEnvelope {
    #[serde(default)]
    result: Option<Vec<QuoteSummaryResult>>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSummaryResult {
    #[serde(default, rename = "summaryDetail")]
    summary_detail: Option<SummaryDetail>,
    #[serde(default, rename = "defaultKeyStatistics")]
    default_key_statistics: Option<KeyStatistics>,
}

#[derive(Debug, Deserialize)]
struct SummaryDetail {
    #[serde(default, rename = "trailingPE")]
    trailing_pe: Option<RawValue>,
}

#[derive(Debug, Deserialize)]
struct KeyStatistics {
    #[serde(default, rename = "priceToBook")]
    price_to_book: Option<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    raw: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_payload_decodes_in_order() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1718595000, 1718681400, 1718767800],
                    "indicators": {
                        "quote": [{
                            "open":   [2440.0, 2455.0, 2460.5],
                            "high":   [2460.0, 2470.0, 2480.0],
                            "low":    [2430.0, 2445.0, 2450.0],
                            "close":  [2450.5, 2462.0, 2475.25],
                            "volume": [1200000, 980000, 1500000]
                        }]
                    }
                }]
            }
        }"#;
        let candles = parse_chart(body, "RELIANCE.NS").unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0].close, 2450.5);
        assert_eq!(candles[2].close, 2475.25);
        assert!(candles[0].ts < candles[2].ts);
    }

    #[test]
    fn halted_sessions_are_dropped() {
        let body = r#"{
            "chart": {
                "result": [{
                    "timestamp": [1718595000, 1718681400],
                    "indicators": {
                        "quote": [{
                            "open":   [2440.0, null],
                            "high":   [2460.0, null],
                            "low":    [2430.0, null],
                            "close":  [2450.5, null],
                            "volume": [1200000, null]
                        }]
                    }
                }]
            }
        }"#;
        let candles = parse_chart(body, "RELIANCE.NS").unwrap();
        assert_eq!(candles.len(), 1);
    }

    #[test]
    fn empty_result_is_no_data() {
        let body = r#"{"chart": {"result": []}}"#;
        assert!(matches!(
            parse_chart(body, "NOPE.NS"),
            Err(Error::NoData(_))
        ));
        let body = r#"{"chart": {"result": null}}"#;
        assert!(matches!(
            parse_chart(body, "NOPE.NS"),
            Err(Error::NoData(_))
        ));
    }

    #[test]
    fn garbage_body_is_invalid_data() {
        assert!(matches!(
            parse_chart("<html>rate limited</html>", "X.NS"),
            Err(Error::InvalidData(_))
        ));
    }

    #[test]
    fn quote_summary_sides_are_optional() {
        let body = r#"{
            "quoteSummary": {
                "result": [{
                    "summaryDetail": { "trailingPE": { "raw": 24.5 } }
                }]
            }
        }"#;
        let parsed: QuoteSummaryResponse = serde_json::from_str(body).unwrap();
        let result = parsed.quote_summary.result.unwrap().remove(0);
        assert_eq!(result.summary_detail.unwrap().trailing_pe.unwrap().raw, 24.5);
        assert!(result.default_key_statistics.is_none());
    }
}
