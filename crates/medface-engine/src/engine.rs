use crate::audit;
use crate::command::CommandExtractor;
use crate::config::{Config, ConfigError};
use crate::db::SqliteStore;
use medface_core::{
    EnrollmentRecord, EuclideanMatcher, ExtractorError, IdentityKey, MatchResult, PipelineError,
    ResolutionPipeline, StoreError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending requests each worker will queue before senders wait.
const WORKER_QUEUE_DEPTH: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("enrollment store: {0}")]
    Store(#[from] StoreError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Snapshot of engine state for operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub model_version: String,
    pub enrolled: usize,
    pub descriptor_dim: usize,
    pub distance_threshold: f32,
    pub confidence_floor: f32,
    pub workers: usize,
}

/// Messages sent from callers to the engine workers.
enum EngineRequest {
    Enroll {
        key: IdentityKey,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollmentRecord, PipelineError>>,
    },
    Verify {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<MatchResult, PipelineError>>,
    },
}

/// Clone-safe handle to the engine workers.
///
/// Enroll and verify run on worker threads (extraction is the expensive,
/// blocking step) and are bounded by the configured timeout. Store-only
/// operations run inline.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
    next: Arc<AtomicUsize>,
    pipeline: Arc<ResolutionPipeline>,
    timeout: Duration,
}

impl EngineHandle {
    /// Request enrollment: extract the single face and store it for `key`.
    ///
    /// If the timeout fires after the worker has started, the enrollment may
    /// still be committed.
    pub async fn enroll(
        &self,
        key: IdentityKey,
        image: Vec<u8>,
    ) -> Result<EnrollmentRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Enroll { key, image, reply }, rx)
            .await
    }

    /// Request verification of a probe photo against all enrolled identities.
    pub async fn verify(&self, image: Vec<u8>) -> Result<MatchResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(EngineRequest::Verify { image, reply }, rx).await
    }

    pub fn remove(&self, key: &IdentityKey) -> Result<bool, EngineError> {
        Ok(self.pipeline.remove(key)?)
    }

    pub fn lookup(&self, key: &IdentityKey) -> Result<Option<EnrollmentRecord>, EngineError> {
        Ok(self.pipeline.lookup(key)?)
    }

    pub fn list(&self) -> Result<Vec<EnrollmentRecord>, EngineError> {
        let mut records = self.pipeline.enrolled()?;
        records.sort_by(|a, b| a.identity_key.cmp(&b.identity_key));
        Ok(records)
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let config = self.pipeline.config();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            model_version: self.pipeline.model_version().to_string(),
            enrolled: self.pipeline.enrolled_count()?,
            descriptor_dim: config.descriptor_dim,
            distance_threshold: config.distance_threshold,
            confidence_floor: config.confidence_floor,
            workers: self.workers.len(),
        })
    }

    async fn dispatch<T>(
        &self,
        request: EngineRequest,
        rx: oneshot::Receiver<Result<T, PipelineError>>,
    ) -> Result<T, EngineError> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let tx = &self.workers[idx];

        let exchange = async {
            tx.send(request)
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(reply) => Ok(reply??),
            Err(_) => {
                tracing::warn!(worker = idx, timeout = ?self.timeout, "request timed out");
                Err(EngineError::Timeout(self.timeout))
            }
        }
    }
}

/// Validate `config`, open the enrollment database, build the extractor and
/// pipeline, and start the workers.
///
/// The extraction helper shares the request timeout, so a hung helper is
/// killed instead of pinning its worker.
pub fn start(config: &Config) -> Result<EngineHandle, EngineError> {
    config.validate()?;
    let store = SqliteStore::open(
        &config.db_path,
        config.descriptor_dim,
        config.store_key.as_deref(),
    )?;
    let extractor = CommandExtractor::new(&config.extractor_command, config.descriptor_dim)?
        .with_timeout(config.verify_timeout());
    let matcher =
        EuclideanMatcher::new(config.distance_threshold).with_tie_epsilon(config.tie_epsilon);

    let pipeline = ResolutionPipeline::with_matcher(
        Arc::new(extractor),
        Arc::new(store),
        Arc::new(matcher),
        config.pipeline_config(),
    )?;

    spawn_engine(Arc::new(pipeline), config.workers, config.verify_timeout())
}

/// Spawn `workers` engine threads sharing `pipeline`.
///
/// Requests are dispatched round-robin; each worker processes its queue in
/// order.
pub fn spawn_engine(
    pipeline: Arc<ResolutionPipeline>,
    workers: usize,
    timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let mut senders = Vec::with_capacity(workers.max(1));

    for i in 0..workers.max(1) {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(WORKER_QUEUE_DEPTH);
        let pipeline = Arc::clone(&pipeline);

        std::thread::Builder::new()
            .name(format!("medface-engine-{i}"))
            .spawn(move || {
                tracing::debug!(worker = i, "engine worker started");
                while let Some(req) = rx.blocking_recv() {
                    handle_request(&pipeline, req);
                }
                tracing::debug!(worker = i, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;

        senders.push(tx);
    }

    tracing::info!(
        workers = senders.len(),
        model = pipeline.model_version(),
        "engine started"
    );

    Ok(EngineHandle {
        workers: senders.into(),
        next: Arc::new(AtomicUsize::new(0)),
        pipeline,
        timeout,
    })
}

fn handle_request(pipeline: &ResolutionPipeline, req: EngineRequest) {
    match req {
        EngineRequest::Enroll { key, image, reply } => {
            // Caller already gave up; skip the work.
            if reply.is_closed() {
                return;
            }
            let _ = reply.send(run_enroll(pipeline, key, &image));
        }
        EngineRequest::Verify { image, reply } => {
            if reply.is_closed() {
                return;
            }
            let _ = reply.send(run_verify(pipeline, &image));
        }
    }
}

fn run_enroll(
    pipeline: &ResolutionPipeline,
    key: IdentityKey,
    image: &[u8],
) -> Result<EnrollmentRecord, PipelineError> {
    let digest = audit::probe_digest(image);
    let result = pipeline.enroll(key.clone(), image);
    match &result {
        Ok(_) => audit::record_enroll(&digest, &key, Ok(())),
        Err(PipelineError::ExtractionFailed(reason)) => {
            audit::record_enroll(&digest, &key, Err(reason.as_str()))
        }
        Err(PipelineError::DimensionMismatch { .. }) => {
            audit::record_enroll(&digest, &key, Err("dimension-mismatch"))
        }
        Err(err) => audit::record_error("enroll", &digest, err),
    }
    result
}

fn run_verify(pipeline: &ResolutionPipeline, image: &[u8]) -> Result<MatchResult, PipelineError> {
    let digest = audit::probe_digest(image);
    let started = Instant::now();
    let result = pipeline.verify(image);
    match &result {
        Ok(decision) => audit::record_verify(&digest, decision, started.elapsed()),
        Err(err) => audit::record_error("verify", &digest, err),
    }
    result
}
