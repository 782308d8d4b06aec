//! Fetching and parsing CSV price files, optionally LZ4-framed.

use crate::domain::{Decimal, Denom, PriceObservation, UnixSecs};
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriceFeedError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(u16),
    #[error("lz4 decode error: {0}")]
    Lz4(String),
    #[error("csv parse error: {0}")]
    Csv(String),
}

/// Downloads `token,price,observed_at` CSV files.
#[derive(Debug, Clone)]
pub struct HttpPriceFeed {
    client: reqwest::Client,
    url: String,
}

impl HttpPriceFeed {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch_bytes(&self) -> Result<Vec<u8>, PriceFeedError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| PriceFeedError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PriceFeedError::HttpStatus(status.as_u16()));
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PriceFeedError::Http(e.to_string()))
    }

    /// Fetch and parse the file; `.lz4` URLs are decompressed first.
    pub async fn fetch_prices(&self) -> Result<Vec<PriceObservation>, PriceFeedError> {
        let bytes = self.fetch_bytes().await?;
        if self.url.ends_with(".lz4") {
            let csv = decompress_lz4_frame(&bytes)?;
            parse_price_csv(&csv)
        } else {
            parse_price_csv(&bytes)
        }
    }
}

pub fn decompress_lz4_frame(lz4_bytes: &[u8]) -> Result<Vec<u8>, PriceFeedError> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(lz4_bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PriceFeedError::Lz4(e.to_string()))?;
    Ok(out)
}

pub fn parse_price_csv(csv_bytes: &[u8]) -> Result<Vec<PriceObservation>, PriceFeedError> {
    #[derive(Debug, serde::Deserialize)]
    struct Row {
        token: String,
        price: String,
        observed_at: i64,
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_bytes);

    let mut prices = Vec::new();
    for record in reader.deserialize::<Row>() {
        let row = record.map_err(|e| PriceFeedError::Csv(e.to_string()))?;
        let token: Denom = row
            .token
            .parse()
            .map_err(|e| PriceFeedError::Csv(format!("invalid token: {}", e)))?;
        let price = Decimal::from_str_canonical(&row.price)
            .map_err(|e| PriceFeedError::Csv(format!("invalid price: {}", e)))?;
        if price.is_negative() {
            return Err(PriceFeedError::Csv(format!("negative price for {}", token)));
        }

        prices.push(PriceObservation::new(
            token,
            price,
            UnixSecs::new(row.observed_at),
        ));
    }

    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn compress_lz4_frame(input: &[u8]) -> Vec<u8> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(input).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn lz4_decompress_fixture_roundtrip() {
        let csv = b"token,price,observed_at\nuluna,0.52,1700000000\n";
        let lz4 = compress_lz4_frame(csv);

        let out = decompress_lz4_frame(&lz4).unwrap();
        assert_eq!(out, csv);
    }

    #[test]
    fn csv_parsing_valid_rows() {
        let csv = b"token,price,observed_at\nuluna, 0.52 ,1700000000\nastro,1.1,1700000060\n";
        let prices = parse_price_csv(csv).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].token.as_str(), "uluna");
        assert_eq!(prices[0].price.to_canonical_string(), "0.52");
        assert_eq!(prices[1].observed_at, UnixSecs::new(1_700_000_060));
    }

    #[test]
    fn csv_parsing_invalid_price_errors() {
        let csv = b"token,price,observed_at\nuluna,abc,1700000000\n";
        let err = parse_price_csv(csv).unwrap_err();
        assert!(matches!(err, PriceFeedError::Csv(_)));

        let csv = b"token,price,observed_at\nuluna,-1,1700000000\n";
        assert!(parse_price_csv(csv).is_err());
    }
}
