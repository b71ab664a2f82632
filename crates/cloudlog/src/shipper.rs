use std::sync::mpsc as sync_mpsc;
use tokio::sync::mpsc as async_mpsc;

use google_logging2::api::WriteLogEntriesRequest;

use chrono::{DateTime, TimeDelta, Utc};

use reqwest::{Client, Response};

use crate::error::Error;

const TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const WRITE_ENTRIES_URL: &str = "https://logging.googleapis.com/v2/entries:write";

const QUEUE_CAPACITY: usize = 100;
/// Upper bound of entries sent in one `entries:write` call.
const MAX_BATCH_ENTRIES: usize = 500;

/// Token caching
#[derive(Default)]
pub struct Token {
    token: Option<String>,
    renew_after: DateTime<Utc>,
}

async fn get_error_response(response: Response, context: String) -> Error {
    let status = response.status();

    let body = match response.bytes().await {
        Ok(bytes) => match serde_json::from_slice::<String>(&bytes) {
            Ok(json) => json,
            Err(_) => String::from_utf8_lossy(&bytes).to_string(),
        },
        Err(e) => format!("could not decode body of HTTP Error response: {e}"),
    };

    Error::HttpResponseError {
        context,
        status,
        body,
    }
}

impl Token {
    // Renew a minute before the token expires.
    fn renew_after_from_expires_in(expires_in: u64) -> DateTime<Utc> {
        let renew_after = TimeDelta::seconds(expires_in.saturating_sub(60) as i64);
        Utc::now() + renew_after
    }

    async fn fetch_access_token(&mut self, client: &Client) -> Result<String, Error> {
        if let Some(token) = &self.token {
            if Utc::now() < self.renew_after {
                return Ok(token.clone());
            }
        }

        let response = client.get(TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
            Error::ShipperReqwestError {
                context: "performing HTTP GET token credentials from metadata server".to_string(),
                source: e,
            }
        })?;

        if response.status().is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| Error::ShipperReqwestError {
                    context: "consuming response body of access token request".to_string(),
                    source: e,
                })?;
            let token_data: serde_json::Value =
                serde_json::from_str(&body).map_err(|e| Error::ShipperSerializeError {
                    context: "deserializing token data".to_string(),
                    source: e,
                })?;
            let token_str = token_data["access_token"]
                .as_str()
                .ok_or(Error::ShipperTokenNotFound)?
                .to_string();
            let expires_in = token_data["expires_in"]
                .as_u64()
                .ok_or(Error::ShipperTokenExpiryNotFound)?;
            self.token = Some(token_str.clone());
            self.renew_after = Self::renew_after_from_expires_in(expires_in);
            Ok(token_str)
        } else {
            Err(get_error_response(response, "fetching token".to_string()).await)
        }
    }
}

/// A sync to async channel bridge.
/// Forwards the log entries from the [Drain's log function](crate::logger::Logger) to the [`Shipper`]
pub struct Bridge {
    sync_rx: sync_mpsc::Receiver<WriteLogEntriesRequest>,
    async_tx: async_mpsc::Sender<WriteLogEntriesRequest>,
}

impl Bridge {
    /// Forwards log messages from the drain to the shipper. Blocks while the shipper's queue is
    /// full and returns once either side is gone. Run it on a blocking thread.
    /// For usage see the [`example`](crate::logger::Builder::build_with_async_shipper).
    pub fn run_sync_to_async_bridge(self) {
        while let Ok(message) = self.sync_rx.recv() {
            if self.async_tx.blocking_send(message).is_err() {
                eprintln!("Log shipper stopped, log entries are no longer sent to Cloud Logging");
                return;
            }
        }
    }
}

/// Sends the log entries to the Cloud Logging API
pub struct Shipper {
    client: Client,
    token: Token,
    sync_rx: Option<sync_mpsc::Receiver<WriteLogEntriesRequest>>,
    async_rx: async_mpsc::Receiver<WriteLogEntriesRequest>,
    async_tx: Option<async_mpsc::Sender<WriteLogEntriesRequest>>,
}

impl Shipper {
    /// Takes the sync receiver and async sender from the Shipper struct into the [`Bridge`]
    /// For usage see the [`example`](crate::logger::Builder::build_with_async_shipper).
    /// Returns `None` when the bridge was already taken.
    pub fn yield_bridge(&mut self) -> Option<Bridge> {
        match (self.sync_rx.take(), self.async_tx.take()) {
            (Some(sync_rx), Some(async_tx)) => Some(Bridge { sync_rx, async_tx }),
            _ => None,
        }
    }

    /// Creates a `Shipper`
    pub fn new(sync_rx: sync_mpsc::Receiver<WriteLogEntriesRequest>) -> Self {
        let (async_tx, async_rx) = async_mpsc::channel::<WriteLogEntriesRequest>(QUEUE_CAPACITY);

        Shipper {
            client: Client::new(),
            token: Token::default(),
            sync_rx: Some(sync_rx),
            async_rx,
            async_tx: Some(async_tx),
        }
    }

    async fn send_log_entry(
        &mut self,
        token: &str,
        body: WriteLogEntriesRequest,
    ) -> Result<(), Error> {
        let response = self
            .client
            .post(WRITE_ENTRIES_URL)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ShipperReqwestError {
                context: "performing HTTP POST request to the Cloud Logging API".to_string(),
                source: e,
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(get_error_response(
                response,
                "response when sending log entry to Cloud Logging API".to_string(),
            )
            .await)
        }
    }

    /// The process that receives log entries and sends them to the Google Logging API. Requests
    /// that queued up while the previous call was in flight go out together.
    pub async fn run_log_shipper(mut self) {
        while let Some(batch) = self.next_batch().await {
            match self.token.fetch_access_token(&self.client).await {
                Ok(token) => {
                    if let Err(e) = self.send_log_entry(&token, batch).await {
                        eprintln!("Failed to send log entries: {}", e);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to fetch access token: {}", e);
                }
            }
        }
    }

    // Waits for a request, then takes whatever else is already queued.
    async fn next_batch(&mut self) -> Option<WriteLogEntriesRequest> {
        let first = self.async_rx.recv().await?;
        let mut batch = vec![first];
        let mut entries = entry_count(&batch[0]);
        while entries < MAX_BATCH_ENTRIES {
            match self.async_rx.try_recv() {
                Ok(request) => {
                    entries += entry_count(&request);
                    batch.push(request);
                }
                Err(_) => break,
            }
        }
        Some(merge_requests(batch))
    }
}

fn entry_count(request: &WriteLogEntriesRequest) -> usize {
    request.entries.as_ref().map_or(0, Vec::len)
}

/// Folds requests into one. The request level log name, resource and labels move onto the
/// entries, so requests for different logs can share a call.
fn merge_requests(requests: Vec<WriteLogEntriesRequest>) -> WriteLogEntriesRequest {
    let mut merged = Vec::new();
    for request in requests {
        for mut entry in request.entries.unwrap_or_default() {
            if entry.log_name.is_none() {
                entry.log_name = request.log_name.clone();
            }
            if entry.resource.is_none() {
                entry.resource = request.resource.clone();
            }
            if let Some(labels) = &request.labels {
                let entry_labels = entry.labels.get_or_insert_with(Default::default);
                for (key, value) in labels {
                    entry_labels
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            merged.push(entry);
        }
    }
    WriteLogEntriesRequest {
        entries: Some(merged),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_logging2::api::LogEntry;
    use std::collections::HashMap;
    use std::sync::mpsc::sync_channel;
    use std::time::{Duration, Instant};

    #[test]
    fn renews_a_minute_early() {
        let renew_after = Token::renew_after_from_expires_in(3600);
        let remaining = renew_after - Utc::now();
        assert!(remaining <= TimeDelta::seconds(3540));
        assert!(remaining > TimeDelta::seconds(3530));
        assert!(Token::renew_after_from_expires_in(10) <= Utc::now());
    }

    #[test]
    fn bridge_is_yielded_once() {
        let (_tx, rx) = sync_channel(1);
        let mut shipper = Shipper::new(rx);
        assert!(shipper.yield_bridge().is_some());
        assert!(shipper.yield_bridge().is_none());
    }

    fn request(log_name: &str, message: &str) -> WriteLogEntriesRequest {
        WriteLogEntriesRequest {
            log_name: Some(log_name.to_string()),
            entries: Some(vec![LogEntry {
                text_payload: Some(message.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn bridge_blocks_while_the_shipper_queue_is_full() {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY + 10);
        let mut shipper = Shipper::new(rx);
        let bridge = shipper.yield_bridge().unwrap();

        for i in 0..=QUEUE_CAPACITY {
            tx.send(request("projects/p/logs/relay", &i.to_string()))
                .unwrap();
        }
        drop(tx);
        let forwarder = std::thread::spawn(move || bridge.run_sync_to_async_bridge());

        let deadline = Instant::now() + Duration::from_secs(5);
        while shipper.async_rx.len() < QUEUE_CAPACITY && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(shipper.async_rx.len(), QUEUE_CAPACITY);
        assert!(!forwarder.is_finished());

        let first = shipper.async_rx.blocking_recv().unwrap();
        assert_eq!(entry_count(&first), 1);
        forwarder.join().unwrap();
        assert_eq!(shipper.async_rx.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn bridge_stops_when_the_shipper_is_gone() {
        let (tx, rx) = sync_channel(2);
        let mut shipper = Shipper::new(rx);
        let bridge = shipper.yield_bridge().unwrap();
        drop(shipper);

        tx.send(request("projects/p/logs/relay", "lost")).unwrap();
        bridge.run_sync_to_async_bridge();
    }

    #[tokio::test]
    async fn queued_requests_go_out_as_one() {
        let (_tx, rx) = sync_channel(1);
        let mut shipper = Shipper::new(rx);
        let bridge = shipper.yield_bridge().unwrap();
        bridge
            .async_tx
            .send(request("projects/p/logs/a", "one"))
            .await
            .unwrap();
        bridge
            .async_tx
            .send(request("projects/p/logs/b", "two"))
            .await
            .unwrap();

        let batch = shipper.next_batch().await.unwrap();
        assert_eq!(batch.log_name, None);
        let entries = batch.entries.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_name.as_deref(), Some("projects/p/logs/a"));
        assert_eq!(entries[0].text_payload.as_deref(), Some("one"));
        assert_eq!(entries[1].log_name.as_deref(), Some("projects/p/logs/b"));

        drop(bridge);
        assert!(shipper.next_batch().await.is_none());
    }

    #[test]
    fn merged_entries_keep_their_own_labels() {
        let mut shared = request("projects/p/logs/a", "x");
        shared.labels = Some(HashMap::from([
            ("env".to_string(), "prod".to_string()),
            ("team".to_string(), "core".to_string()),
        ]));
        if let Some(entries) = shared.entries.as_mut() {
            entries[0].labels = Some(HashMap::from([("env".to_string(), "test".to_string())]));
        }

        let merged = merge_requests(vec![shared]);
        let labels = merged.entries.unwrap().remove(0).labels.unwrap();
        assert_eq!(labels["env"], "test");
        assert_eq!(labels["team"], "core");
    }
}
