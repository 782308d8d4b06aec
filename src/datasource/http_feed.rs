//! HTTP client for a remote normalized-event feed.

use super::{EventFeed, EventSourceError};
use crate::domain::{ChainId, EventPosition, LedgerEvent};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Event feed served as JSON arrays of kind-tagged events.
///
/// `GET {base_url}/events?chainId=..&afterHeight=..&afterTx=..&afterEvent=..&limit=..`
///
/// The feed answers with events positioned strictly after the given position.
#[derive(Debug, Clone)]
pub struct HttpEventFeed {
    client: Client,
    base_url: String,
    chain_id: ChainId,
}

impl HttpEventFeed {
    pub fn new(base_url: String, chain_id: ChainId) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            chain_id,
        }
    }

    async fn get_json(
        &self,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, EventSourceError> {
        let url = format!("{}/events", self.base_url);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(|e| {
                    backoff::Error::transient(EventSourceError::NetworkError(e.to_string()))
                })?;

            let status = response.status();
            if status == 429 {
                warn!(url = %url, "Event feed rate limited, backing off");
                return Err(backoff::Error::transient(EventSourceError::RateLimited));
            }
            if status.is_server_error() {
                return Err(backoff::Error::transient(EventSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Server error".to_string(),
                }));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(EventSourceError::HttpError {
                    status: status.as_u16(),
                    message: "Client error".to_string(),
                }));
            }

            response.json::<serde_json::Value>().await.map_err(|e| {
                backoff::Error::permanent(EventSourceError::ParseError(e.to_string()))
            })
        })
        .await
    }
}

#[async_trait]
impl EventFeed for HttpEventFeed {
    async fn fetch_events_after(
        &self,
        after: EventPosition,
        limit: usize,
    ) -> Result<Vec<LedgerEvent>, EventSourceError> {
        debug!(chain = %self.chain_id, after = %after, limit, "Fetching events from feed");

        let response = self.get_json(&page_query(&self.chain_id, after, limit)).await?;

        parse_events(&response, &self.chain_id)
    }
}

fn page_query(chain_id: &ChainId, after: EventPosition, limit: usize) -> Vec<(&'static str, String)> {
    vec![
        ("chainId", chain_id.to_string()),
        ("afterHeight", after.height.to_string()),
        ("afterTx", after.tx_index.to_string()),
        ("afterEvent", after.event_index.to_string()),
        ("limit", limit.to_string()),
    ]
}

/// Decode a feed page. Malformed entries and other chains are skipped with a warning.
pub(crate) fn parse_events(
    response: &serde_json::Value,
    chain_id: &ChainId,
) -> Result<Vec<LedgerEvent>, EventSourceError> {
    let items = response
        .as_array()
        .ok_or_else(|| EventSourceError::ParseError("Expected array response".to_string()))?;

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<LedgerEvent>(item.clone()) {
            Ok(event) if &event.key.chain_id == chain_id => events.push(event),
            Ok(event) => {
                warn!(event = %event.key, expected = %chain_id, "Skipping event from another chain");
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse feed event");
            }
        }
    }
    Ok(events)
}
