//! # Simulation Records
//!
//! Start and finish of every run, handed to a record service. Recording is
//! best-effort: failures are logged by the caller and never stop a run.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, SimError};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunOutcome {
    /// Every vehicle arrived.
    Completed,
    /// Stopped or cleared before every vehicle arrived.
    Stopped,
}

/// One run of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRecord {
    pub run_id: Uuid,
    pub simulation_id: Uuid,
    pub session_id: Uuid,
    pub vehicle_count: usize,
    pub speed_multiplier: f64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default)]
    pub completed_journeys: usize,
}

impl SimulationRecord {
    #[must_use]
    pub fn started(
        simulation_id: Uuid,
        session_id: Uuid,
        vehicle_count: usize,
        speed_multiplier: f64,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            simulation_id,
            session_id,
            vehicle_count,
            speed_multiplier,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            completed_journeys: 0,
        }
    }

    #[must_use]
    pub fn finished(self, outcome: RunOutcome, completed_journeys: usize) -> Self {
        Self {
            finished_at: Some(Utc::now()),
            outcome: Some(outcome),
            completed_journeys,
            ..self
        }
    }
}

/// Destination for run records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn record_started(&self, record: &SimulationRecord) -> Result<()>;

    async fn record_finished(&self, record: &SimulationRecord) -> Result<()>;
}

// =============================================================================
// HTTP
// =============================================================================

/// Posts records as JSON to `{base_url}/simulations`.
#[derive(Debug, Clone)]
pub struct HttpRecordStore {
    client: Client,
    endpoint: String,
}

impl HttpRecordStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/simulations", base_url.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, record: &SimulationRecord) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(record).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SimError::Records(format!(
                "{} returned status {status}",
                self.endpoint
            )));
        }

        debug!(run_id = %record.run_id, %status, "simulation record stored");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn record_started(&self, record: &SimulationRecord) -> Result<()> {
        self.post(record).await
    }

    async fn record_finished(&self, record: &SimulationRecord) -> Result<()> {
        self.post(record).await
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Keeps records in memory. Used when no record service is configured.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    started: Mutex<Vec<SimulationRecord>>,
    finished: Mutex<Vec<SimulationRecord>>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<SimulationRecord> {
        lock(&self.started).clone()
    }

    pub fn finished(&self) -> Vec<SimulationRecord> {
        lock(&self.finished).clone()
    }
}

fn lock(records: &Mutex<Vec<SimulationRecord>>) -> MutexGuard<'_, Vec<SimulationRecord>> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn record_started(&self, record: &SimulationRecord) -> Result<()> {
        lock(&self.started).push(record.clone());
        Ok(())
    }

    async fn record_finished(&self, record: &SimulationRecord) -> Result<()> {
        lock(&self.finished).push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, answer with `status_line`, return the raw request.
    async fn serve_once(listener: TcpListener, status_line: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut chunk = [0_u8; 4096];

        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&request);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
        }

        let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8(request).unwrap()
    }

    fn record() -> SimulationRecord {
        SimulationRecord::started(Uuid::new_v4(), Uuid::new_v4(), 3, 2.0)
    }

    #[test]
    fn test_finished_record_keeps_identity() {
        let started = record();
        let finished = started.clone().finished(RunOutcome::Completed, 3);

        assert_eq!(finished.run_id, started.run_id);
        assert_eq!(finished.started_at, started.started_at);
        assert_eq!(finished.outcome, Some(RunOutcome::Completed));
        assert!(finished.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryRecordStore::new();
        let r = record();
        store.record_started(&r).await.unwrap();
        store
            .record_finished(&r.clone().finished(RunOutcome::Stopped, 0))
            .await
            .unwrap();

        assert_eq!(store.started(), vec![r]);
        assert_eq!(store.finished()[0].outcome, Some(RunOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_http_store_posts_json() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 201 Created"));

        let store = HttpRecordStore::new(&format!("http://{addr}/"));
        let r = record();
        store.record_started(&r).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /simulations HTTP/1.1"));
        assert!(request.contains(&r.run_id.to_string()));
        assert!(request.contains("\"vehicleCount\":3"));
    }

    #[tokio::test]
    async fn test_http_store_reports_failure_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 503 Service Unavailable"));

        let store = HttpRecordStore::new(&format!("http://{addr}"));
        let result = store.record_finished(&record()).await;
        server.await.unwrap();

        assert!(matches!(result, Err(SimError::Records(_))));
    }
}
