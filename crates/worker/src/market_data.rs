use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use taskpilot_core::{models::Endpoint, SchedulerError, SchedulerResult};
use tracing::debug;

/// 行情数据源
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// 按时间升序返回最近 `limit` 根 K 线的收盘价
    async fn closing_prices(
        &self,
        endpoint: &Endpoint,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<f64>>;
}

/// Binance 风格的 `/api/v3/klines` 数据源
#[derive(Clone, Default)]
pub struct BinanceKlines {
    client: Client,
}

impl BinanceKlines {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// `BTC/USDT` → `BTCUSDT`
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase()
}

fn close_of(row: &Value) -> Option<f64> {
    match row.get(4)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl MarketDataSource for BinanceKlines {
    async fn closing_prices(
        &self,
        endpoint: &Endpoint,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> SchedulerResult<Vec<f64>> {
        let pair = exchange_symbol(symbol);
        if pair.is_empty() {
            return Err(SchedulerError::Validation(format!("无效的交易对: {symbol}")));
        }
        let url = format!("{}/api/v3/klines", endpoint.base_url);
        debug!("拉取K线 {} {} x{} @ {}", pair, interval, limit, endpoint.name);

        let limit = limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", pair.as_str()),
                ("interval", interval),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SchedulerError::Network(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        if status.as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Validation(format!(
                "行情接口拒绝请求 ({pair}): {body}"
            )));
        }
        if !status.is_success() {
            return Err(SchedulerError::Network(format!("行情接口返回 {status}")));
        }

        let rows: Vec<Value> = response
            .json()
            .await
            .map_err(|e| SchedulerError::Network(format!("解析K线数据失败: {e}")))?;
        let closes: Vec<f64> = rows.iter().filter_map(close_of).collect();
        if closes.len() != rows.len() {
            return Err(SchedulerError::Network(format!(
                "K线数据格式异常: {} 行中只有 {} 行包含收盘价",
                rows.len(),
                closes.len()
            )));
        }
        Ok(closes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exchange_symbol() {
        assert_eq!(exchange_symbol("btc/usdt"), "BTCUSDT");
        assert_eq!(exchange_symbol("ETH-USDT"), "ETHUSDT");
    }

    #[tokio::test]
    async fn test_klines_extract_close_column() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/klines")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                mockito::Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"[[1,"100.0","110.0","95.0","105.5","12.0"],[2,"105.5","112.0","101.0","111.25","9.0"]]"#,
            )
            .create_async()
            .await;

        let endpoint = Endpoint {
            name: "binance".to_string(),
            base_url: server.url(),
            credential: None,
            model: None,
            priority: 1,
            timeout: Duration::from_secs(5),
        };
        let closes = BinanceKlines::default()
            .closing_prices(&endpoint, "BTC/USDT", "1h", 2)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(closes, vec![105.5, 111.25]);
    }
}
