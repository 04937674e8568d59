//! The sync daemon: a job table behind its own control socket.
//!
//! Jobs are keyed by `"<owner>|<container-uuid>"`. Each job runs one
//! [`NaiveSyncer`] between two backends; continuous jobs keep watchers
//! alive until stopped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;

use common::control::{CommandError, CommandHandler, ConnectionHandle};
use common::storage::BackendRegistry;

use crate::hashdb::HashDb;
use crate::naive::NaiveSyncer;

/// One running sync job.
struct SyncJob {
    container_name: String,
    syncer: Arc<NaiveSyncer>,
    continuous: bool,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SyncJob {
    fn stop(mut self) {
        self.syncer.stop_sync();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The daemon state: job table plus shared infrastructure.
pub struct SyncDaemon {
    jobs: Mutex<HashMap<String, SyncJob>>,
    registry: BackendRegistry,
    db: Arc<HashDb>,
    shutdown: watch::Sender<bool>,
}

impl SyncDaemon {
    pub fn new(db: Arc<HashDb>) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        (
            Arc::new(Self {
                jobs: Mutex::new(HashMap::new()),
                registry: BackendRegistry::with_defaults(),
                db,
                shutdown,
            }),
            shutdown_rx,
        )
    }

    /// Start a sync job between two storages.
    pub fn start_sync(
        &self,
        container_name: &str,
        job_id: &str,
        continuous: bool,
        unidirectional: bool,
        source: &Value,
        target: &Value,
    ) -> Result<String, CommandError> {
        if self.jobs.lock().contains_key(job_id) {
            return Err(CommandError::new(
                "WildlandError",
                format!("sync for job {} already running", job_id),
            ));
        }

        let source = self.construct_backend(source)?;
        let target = self.construct_backend(target)?;

        // Remember which backends belong to this container.
        let container_uuid = job_id.split('|').nth(1).unwrap_or(job_id);
        if let Err(e) = self.db.update_storages_for_container(
            container_uuid,
            &[
                source.backend_id().to_string(),
                target.backend_id().to_string(),
            ],
        ) {
            tracing::warn!("cannot record container backends: {}", e);
        }

        let syncer = Arc::new(NaiveSyncer::new(
            source,
            target,
            format!("sync:{}", container_name),
            Some(self.db.clone()),
        ));

        let worker = syncer.clone();
        let worker_id = job_id.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("sync-{}", container_name))
            .spawn(move || {
                let result = if continuous {
                    worker.start_sync(unidirectional)
                } else {
                    worker.one_shot_sync(unidirectional)
                };
                if let Err(e) = result {
                    tracing::error!("sync job {} failed: {}", worker_id, e);
                }
            })
            .map_err(|e| CommandError::new("WildlandError", e))?;

        self.jobs.lock().insert(
            job_id.to_string(),
            SyncJob {
                container_name: container_name.to_string(),
                syncer,
                continuous,
                thread: Some(thread),
            },
        );
        tracing::info!("sync started for job {}", job_id);
        Ok(format!("Sync started for job {}", job_id))
    }

    pub fn stop_sync(&self, job_id: &str) -> Result<String, CommandError> {
        let job = self.jobs.lock().remove(job_id).ok_or_else(|| {
            CommandError::new(
                "WildlandError",
                format!("sync for job {} is not running", job_id),
            )
        })?;
        job.stop();
        tracing::info!("sync stopped for job {}", job_id);
        Ok(format!("Sync for job {} stopped", job_id))
    }

    pub fn stop_all(&self) {
        let jobs: Vec<(String, SyncJob)> = self.jobs.lock().drain().collect();
        for (job_id, job) in jobs {
            tracing::info!("stopping sync job {}", job_id);
            job.stop();
        }
    }

    fn construct_backend(
        &self,
        params: &Value,
    ) -> Result<Arc<dyn common::storage::StorageBackend>, CommandError> {
        let yaml: serde_yaml::Value = serde_yaml::to_value(params)
            .map_err(|e| CommandError::new("WildlandError", e))?;
        let mapping = match yaml {
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => {
                return Err(CommandError::new(
                    "WildlandError",
                    "storage params must be a mapping",
                ))
            }
        };
        self.registry
            .construct(mapping)
            .map_err(|e| CommandError::new("WildlandError", e))
    }
}

impl CommandHandler for SyncDaemon {
    fn handle(
        &self,
        cmd: &str,
        args: Value,
        _conn: &Arc<ConnectionHandle>,
    ) -> Result<Value, CommandError> {
        match cmd {
            "start" => {
                let container_name = require_str(&args, "container-name")?;
                let job_id = require_str(&args, "job-id")?;
                let continuous = require_bool(&args, "continuous")?;
                let unidirectional = require_bool(&args, "unidirectional")?;
                let source = args
                    .get("source")
                    .ok_or_else(|| CommandError::control("expecting source"))?;
                let target = args
                    .get("target")
                    .ok_or_else(|| CommandError::control("expecting target"))?;
                let message = self.start_sync(
                    &container_name,
                    &job_id,
                    continuous,
                    unidirectional,
                    source,
                    target,
                )?;
                Ok(json!(message))
            }
            "stop" => {
                let job_id = require_str(&args, "job-id")?;
                Ok(json!(self.stop_sync(&job_id)?))
            }
            "stop-all" => {
                self.stop_all();
                Ok(json!("All syncs stopped"))
            }
            "status" => {
                let jobs = self.jobs.lock();
                let mut lines: Vec<String> = jobs
                    .iter()
                    .map(|(job_id, job)| {
                        format!(
                            "{} {}: {}",
                            job_id,
                            job.container_name,
                            job.syncer.state()
                        )
                    })
                    .collect();
                lines.sort();
                Ok(json!(lines))
            }
            "job-status" => {
                let job_id = require_str(&args, "job-id")?;
                let jobs = self.jobs.lock();
                match jobs.get(&job_id) {
                    Some(job) => {
                        let conflicts: Vec<String> = job
                            .syncer
                            .iter_conflicts()
                            .iter()
                            .map(ToString::to_string)
                            .collect();
                        Ok(json!({
                            "state": job.syncer.state().to_string(),
                            "continuous": job.continuous,
                            "conflicts": conflicts,
                        }))
                    }
                    None => Ok(Value::Null),
                }
            }
            "shutdown" => {
                self.stop_all();
                let _ = self.shutdown.send(true);
                Ok(json!("Sync daemon shutting down"))
            }
            other => Err(CommandError::control(format!("unknown command: {}", other))),
        }
    }
}

fn require_str(args: &Value, name: &str) -> Result<String, CommandError> {
    args.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CommandError::control(format!("expecting {:?}", name)))
}

fn require_bool(args: &Value, name: &str) -> Result<bool, CommandError> {
    args.get(name)
        .and_then(Value::as_bool)
        .ok_or_else(|| CommandError::control(format!("expecting {:?}", name)))
}
