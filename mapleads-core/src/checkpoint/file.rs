use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Checkpoint, CheckpointStore};
use crate::error::{EngineError, Result};
use crate::types::JobId;

/// One JSON document per job under `root`, replaced via tmp file + rename so
/// readers only ever see a complete snapshot.
pub struct FileCheckpointStore {
    root: PathBuf,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("root", &self.root)
            .finish()
    }
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }

    async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            EngineError::Persistence(format!(
                "failed to create checkpoint dir {:?}: {err}",
                self.root
            ))
        })
    }

    async fn read(&self, path: &Path) -> Result<Option<Checkpoint>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(EngineError::Persistence(format!(
                "failed to read checkpoint {:?}: {err}",
                path
            ))),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let lock = self.locks.entry(checkpoint.job_id).or_default().clone();
        let _guard = lock.lock().await;

        self.ensure_root().await?;
        let path = self.path_for(checkpoint.job_id);

        if let Some(current) = self.read(&path).await?
            && current.sequence >= checkpoint.sequence
        {
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.root.join(format!(
            "{}.json.tmp-{}",
            checkpoint.job_id,
            Uuid::new_v4().simple()
        ));

        let mut file = tokio::fs::File::create(&tmp).await.map_err(|err| {
            EngineError::Persistence(format!("failed to create temp checkpoint {:?}: {err}", tmp))
        })?;
        let written = async {
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EngineError::Persistence(format!(
                "failed to write temp checkpoint {:?}: {err}",
                tmp
            )));
        }

        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(EngineError::Persistence(format!(
                "failed to move checkpoint {:?} -> {:?}: {err}",
                tmp, path
            )));
        }

        debug!(
            target: "mapleads::checkpoint",
            job_id = %checkpoint.job_id,
            sequence = checkpoint.sequence,
            completed = checkpoint.completed.len(),
            pending = checkpoint.pending.len(),
            "checkpoint written"
        );
        Ok(true)
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Checkpoint>> {
        self.read(&self.path_for(job_id)).await
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        let lock = self.locks.entry(job_id).or_default().clone();
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.path_for(job_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::Persistence(format!(
                "failed to delete checkpoint for {job_id}: {err}"
            ))),
        }
    }
}
