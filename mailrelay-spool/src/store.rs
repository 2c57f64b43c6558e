use std::path::{Path, PathBuf};

use chrono::Utc;
use mailrelay_common::{
    MailJob,
    address::sanitize_for_filename,
    config::StorageConfig,
    internal,
    job::is_valid_id,
};
use tokio::fs;

use crate::error::{Result, SpoolError};

const RECORD_EXTENSION: &str = ".bin";
const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// File-backed fallback storage.
///
/// Local copies are named `{YYYYMMDD-HHMMSS}_{sender}_{job_id}.eml`; failed
/// records are `{job_id}.bin`. Every write goes to a `.tmp_` file first and
/// is renamed into place, so a crash never leaves a half-written record under
/// its final name.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    local_dir: PathBuf,
    failed_dir: PathBuf,
}

impl FallbackStore {
    pub fn new(local_dir: impl Into<PathBuf>, failed_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            failed_dir: failed_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.local_dir, &config.failed_dir)
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn failed_dir(&self) -> &Path {
        &self.failed_dir
    }

    /// Creates both directories and removes `.deleted` leftovers from an
    /// interrupted delete.
    ///
    /// # Errors
    ///
    /// Fails if a directory cannot be created or read.
    pub fn init(&self) -> Result<()> {
        internal!("Initialising fallback storage ...");

        std::fs::create_dir_all(&self.local_dir)?;
        std::fs::create_dir_all(&self.failed_dir)?;

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.failed_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().ends_with(DELETED_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned .deleted files from {}",
                self.failed_dir.display()
            );
        }

        Ok(())
    }

    /// Writes an envelope-prefixed copy of the message to the local directory.
    ///
    /// # Errors
    ///
    /// Any I/O failure while writing or renaming the file.
    pub async fn save_locally(&self, job: &MailJob) -> Result<PathBuf> {
        let now = Utc::now();
        let filename = format!(
            "{}_{}_{}.eml",
            now.format("%Y%m%d-%H%M%S"),
            sanitize_for_filename(&job.from),
            job.id
        );

        let envelope = format!(
            "From: {}\r\nTo: {}\r\nDate: {}\r\n\r\n",
            job.from,
            job.to.join(", "),
            now.to_rfc2822()
        );

        let mut contents = Vec::with_capacity(envelope.len() + job.data.len());
        contents.extend_from_slice(envelope.as_bytes());
        contents.extend_from_slice(&job.data);

        fs::create_dir_all(&self.local_dir).await?;
        let path = self.local_dir.join(&filename);
        write_atomically(&self.local_dir, &filename, &contents).await?;

        internal!(
            level = INFO,
            "Saved job {} locally to {}",
            job.id,
            path.display()
        );

        Ok(path)
    }

    /// Serializes the whole job to `{job_id}.bin` in the failed directory.
    ///
    /// # Errors
    ///
    /// Fails on an unusable job id, an encoding error, or I/O.
    pub async fn save_failed(&self, job: &MailJob) -> Result<PathBuf> {
        let path = self.failed_path(&job.id)?;
        let bytes = bincode::serde::encode_to_vec(job, bincode::config::standard())?;

        fs::create_dir_all(&self.failed_dir).await?;
        write_atomically(
            &self.failed_dir,
            &format!("{}{RECORD_EXTENSION}", job.id),
            &bytes,
        )
        .await?;

        internal!(
            level = INFO,
            "Saved failed job {} to {}",
            job.id,
            path.display()
        );

        Ok(path)
    }

    /// Ids of every failed-job record, sorted.
    ///
    /// Temporary, deleted, and foreign files are skipped. A missing directory
    /// lists as empty.
    pub async fn list_failed(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.failed_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) {
                continue;
            }

            if let Some(id) = filename.strip_suffix(RECORD_EXTENSION)
                && is_valid_id(id)
            {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    pub async fn count_failed(&self) -> Result<usize> {
        Ok(self.list_failed().await?.len())
    }

    pub async fn read_failed(&self, id: &str) -> Result<MailJob> {
        let path = self.failed_path(id)?;

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let (job, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(job)
    }

    /// Removes a failed-job record in two phases: rename to `.deleted`, then
    /// unlink. An interrupted delete is finished by the next [`Self::init`].
    pub async fn delete_failed(&self, id: &str) -> Result<()> {
        let path = self.failed_path(id)?;
        let deleted = self
            .failed_dir
            .join(format!("{id}{RECORD_EXTENSION}{DELETED_SUFFIX}"));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SpoolError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        fs::remove_file(&deleted).await?;

        internal!(level = DEBUG, "Deleted failed job {id}");

        Ok(())
    }

    /// Where the record for `id` lives.
    ///
    /// # Errors
    ///
    /// Rejects ids that are not safe file name components.
    pub fn failed_path(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(SpoolError::InvalidId(id.to_string()));
        }

        Ok(self.failed_dir.join(format!("{id}{RECORD_EXTENSION}")))
    }
}

async fn write_atomically(dir: &Path, filename: &str, contents: &[u8]) -> Result<()> {
    let temp = dir.join(format!("{TEMP_PREFIX}{filename}"));
    fs::write(&temp, contents).await?;
    fs::rename(&temp, dir.join(filename)).await?;
    Ok(())
}
