use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::credentials::{CredentialError, Credentials};
use crate::db::{LoadOutcome, StorageError, Store};
use crate::extract::{ApodClient, ExtractionError};
use crate::settings::Settings;
use crate::transform::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    SchemaReady,
    Extracted,
    Transformed,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Schema,
    Extract,
    Load,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Schema => "schema",
            Stage::Extract => "extract",
            Stage::Load => "load",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema stage failed: {0}")]
    Schema(#[source] StorageError),
    #[error("extract stage failed: {0}")]
    Extract(#[source] ExtractionError),
    #[error("load stage failed: {0}")]
    Load(#[source] StorageError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Schema(_) => Stage::Schema,
            PipelineError::Extract(_) => Stage::Extract,
            PipelineError::Load(_) => Stage::Load,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Schema(e) | PipelineError::Load(e) => e.kind(),
            PipelineError::Extract(e) => e.kind(),
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Succeeded { date: String, outcome: LoadOutcome },
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every state the run entered, in order, starting at `NotStarted`.
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
}

#[cfg(test)]
impl RunReport {
    fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded { .. })
    }

    fn state(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::NotStarted)
    }

    fn reached(&self, state: RunState) -> bool {
        self.states.contains(&state)
    }
}

/// Errors raised while wiring a pipeline, before any stage runs.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("cannot build HTTP client: {0}")]
    Client(#[from] ExtractionError),
}

/// Schema + extract, then transform, then load. One instance per run.
pub struct Pipeline {
    client: ApodClient,
    store_dsn: String,
    busy_timeout: Duration,
}

impl Pipeline {
    pub fn new(client: ApodClient, store_dsn: &str, busy_timeout: Duration) -> Self {
        Self {
            client,
            store_dsn: store_dsn.to_string(),
            busy_timeout,
        }
    }

    /// Resolve the API key and storage DSN through `creds`; nothing is read from the environment here.
    pub fn from_settings(settings: &Settings, creds: &impl Credentials) -> Result<Self, SetupError> {
        let api_key = creds.api_key(&settings.api.conn_id)?;
        let dsn = creds.storage_dsn(&settings.storage.conn_id)?;
        let client = ApodClient::from_settings(&settings.api, &api_key)?;
        Ok(Self::new(
            client,
            &dsn,
            Duration::from_millis(settings.storage.busy_timeout_ms),
        ))
    }

    pub fn client(&self) -> &ApodClient {
        &self.client
    }

    fn open_store(&self) -> Result<Store, StorageError> {
        Store::open(&self.store_dsn, self.busy_timeout)
    }

    pub async fn run(&self) -> RunReport {
        let run_id = new_run_id();
        let started_at = Utc::now();
        let mut states = vec![RunState::NotStarted];
        info!(run_id = %run_id, "Pipeline run started");

        let outcome = match self.execute(&run_id, &mut states).await {
            Ok((date, outcome)) => {
                info!(run_id = %run_id, date = %date, ?outcome, "Pipeline run succeeded");
                RunOutcome::Succeeded { date, outcome }
            }
            Err(e) => {
                states.push(RunState::Failed);
                error!(run_id = %run_id, stage = %e.stage(), kind = e.kind(), "Pipeline run failed: {}", e);
                RunOutcome::Failed(e)
            }
        };

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            states,
            outcome,
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        states: &mut Vec<RunState>,
    ) -> Result<(String, LoadOutcome), PipelineError> {
        // Independent branches; both gate the transform.
        let schema = async {
            let store = self.open_store()?;
            store.ensure_schema()?;
            Ok::<_, StorageError>(store)
        };
        let (store, raw) = tokio::join!(schema, self.client.extract());

        let store = store.map_err(PipelineError::Schema)?;
        states.push(RunState::SchemaReady);
        info!(run_id, "Table apod_data ready");

        let raw = raw.map_err(PipelineError::Extract)?;
        states.push(RunState::Extracted);
        info!(run_id, "APOD data fetched");

        let record = transform(raw);
        states.push(RunState::Transformed);
        if record.date.is_empty() {
            warn!(run_id, "Source record has no date");
        }

        let outcome = store.load(&record).map_err(PipelineError::Load)?;
        states.push(RunState::Loaded);
        match outcome {
            LoadOutcome::Inserted => info!(run_id, date = %record.date, "Data inserted"),
            LoadOutcome::AlreadyPresent => {
                info!(run_id, date = %record.date, "Data already present, nothing written")
            }
        }

        Ok((record.date, outcome))
    }
}

pub fn new_run_id() -> String {
    let now = Utc::now();
    format!("run-{}-{:03}", now.format("%Y%m%dT%H%M%S"), now.timestamp_subsec_millis())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::credentials::ConnectionInfo;
    use crate::extract::testing::StubServer;

    const SCENARIO_A: &str = r#"{"title":"Moon","explanation":"...","url":"http://x/1.jpg","date":"2024-01-01","media_type":"image"}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        dsn: String,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let dsn = dir.path().join("apod.sqlite").to_string_lossy().into_owned();
            Self { _dir: dir, dsn }
        }

        fn pipeline(&self, url: &str) -> Pipeline {
            let client = ApodClient::new(url, "k3y", Duration::from_secs(5)).unwrap();
            Pipeline::new(client, &self.dsn, Duration::from_secs(5))
        }

        fn store(&self) -> Store {
            Store::open(&self.dsn, Duration::from_secs(5)).unwrap()
        }
    }

    #[tokio::test]
    async fn scenario_a_inserts_one_row() {
        let fx = Fixture::new();
        let server = StubServer::start(200, SCENARIO_A).await;
        let report = fx.pipeline(&server.url).run().await;

        assert!(report.succeeded());
        assert_eq!(
            report.states,
            [
                RunState::NotStarted,
                RunState::SchemaReady,
                RunState::Extracted,
                RunState::Transformed,
                RunState::Loaded,
            ]
        );
        assert!(matches!(
            report.outcome,
            RunOutcome::Succeeded { ref date, outcome: LoadOutcome::Inserted } if date == "2024-01-01"
        ));

        let row = fx.store().fetch_by_date("2024-01-01").unwrap().unwrap();
        assert_eq!(row.title, "Moon");
        assert_eq!(row.explanation, "...");
        assert_eq!(row.media_url, "http://x/1.jpg");
        assert_eq!(row.media_type, "image");
    }

    #[tokio::test]
    async fn scenario_b_defaults_are_stored() {
        let fx = Fixture::new();
        let server = StubServer::start(200, r#"{"date":"2024-01-02"}"#).await;
        assert!(fx.pipeline(&server.url).run().await.succeeded());

        let row = fx.store().fetch_by_date("2024-01-02").unwrap().unwrap();
        assert_eq!(row.title, "");
        assert_eq!(row.explanation, "");
        assert_eq!(row.media_url, "");
        assert_eq!(row.media_type, "unknown");
    }

    #[tokio::test]
    async fn scenario_c_rerun_is_idempotent() {
        let fx = Fixture::new();
        let server = StubServer::start(200, SCENARIO_A).await;
        let pipeline = fx.pipeline(&server.url);

        let first = pipeline.run().await;
        let second = pipeline.run().await;
        assert!(matches!(
            first.outcome,
            RunOutcome::Succeeded { outcome: LoadOutcome::Inserted, .. }
        ));
        assert!(matches!(
            second.outcome,
            RunOutcome::Succeeded { outcome: LoadOutcome::AlreadyPresent, .. }
        ));
        assert_eq!(server.hits(), 2);
        assert_eq!(fx.store().get_stats().unwrap().rows, 1);
    }

    #[tokio::test]
    async fn scenario_d_http_500_stops_before_transform() {
        let fx = Fixture::new();
        let server = StubServer::start(500, "").await;
        let report = fx.pipeline(&server.url).run().await;

        assert_eq!(report.state(), RunState::Failed);
        assert!(!report.reached(RunState::Extracted));
        assert!(!report.reached(RunState::Transformed));
        assert!(!report.reached(RunState::Loaded));
        match &report.outcome {
            RunOutcome::Failed(e) => {
                assert_eq!(e.stage(), Stage::Extract);
                assert!(matches!(
                    e,
                    PipelineError::Extract(ExtractionError::HttpStatus { code: 500 })
                ));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(fx.store().get_stats().unwrap().rows, 0);
    }

    #[tokio::test]
    async fn malformed_body_fails_extract() {
        let fx = Fixture::new();
        let server = StubServer::start(200, "{not json").await;
        let report = fx.pipeline(&server.url).run().await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed(PipelineError::Extract(ExtractionError::Decode(_)))
        ));
    }

    #[tokio::test]
    async fn missing_date_fails_at_load() {
        let fx = Fixture::new();
        let server = StubServer::start(200, r#"{"title":"Undated"}"#).await;
        let report = fx.pipeline(&server.url).run().await;

        assert!(report.reached(RunState::Transformed));
        assert!(!report.reached(RunState::Loaded));
        match &report.outcome {
            RunOutcome::Failed(e) => {
                assert_eq!(e.stage(), Stage::Load);
                assert_eq!(e.kind(), "constraint");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(fx.store().get_stats().unwrap().rows, 0);
    }

    #[tokio::test]
    async fn unreachable_storage_fails_schema() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let dsn = dir.path().to_string_lossy().into_owned();
        let server = StubServer::start(200, SCENARIO_A).await;
        let client = ApodClient::new(&server.url, "k3y", Duration::from_secs(5)).unwrap();
        let report = Pipeline::new(client, &dsn, Duration::from_millis(100)).run().await;

        match &report.outcome {
            RunOutcome::Failed(e) => assert_eq!(e.stage(), Stage::Schema),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(!report.reached(RunState::Transformed));
    }

    #[test]
    fn from_settings_requires_api_key() {
        let settings = Settings {
            api: crate::settings::ApiSettings {
                endpoint: "http://127.0.0.1:9/apod".into(),
                conn_id: "nasa_api".into(),
                timeout_secs: 1,
            },
            storage: crate::settings::StorageSettings {
                conn_id: "apod_storage".into(),
                busy_timeout_ms: 100,
            },
            connections: HashMap::new(),
        };
        let mut creds = HashMap::from([(
            "apod_storage".to_string(),
            ConnectionInfo {
                api_key: None,
                dsn: Some("/tmp/x.sqlite".into()),
            },
        )]);
        assert!(matches!(
            Pipeline::from_settings(&settings, &creds),
            Err(SetupError::Credential(CredentialError::UnknownConnection(_)))
        ));

        creds.insert(
            "nasa_api".to_string(),
            ConnectionInfo {
                api_key: Some("k3y".into()),
                dsn: None,
            },
        );
        assert!(Pipeline::from_settings(&settings, &creds).is_ok());
    }
}
