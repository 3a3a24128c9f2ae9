//! Where job artifacts live on disk.
//!
//! Every file a job owns is named after its id: uploads and downloads live in the upload
//! directory as `<id>.<ext>`, everything else in the job's working directory
//! `<output_dir>/<id>/`.
use std::{
    io,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::job::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        tokio::fs::create_dir_all(&self.output_dir).await
    }

    /// Bytes and files currently held in the upload and output directories.
    pub async fn usage(&self) -> StorageUsage {
        StorageUsage {
            upload: dir_usage(&self.upload_dir).await,
            output: dir_usage(&self.output_dir).await,
        }
    }

    pub fn job(&self, id: JobId) -> JobFiles {
        JobFiles {
            id,
            download_stem: self.upload_dir.join(id.to_string()),
            work_dir: self.output_dir.join(id.to_string()),
        }
    }

    /// Best-effort removal of every artifact of `job`. Individual failures are logged and
    /// counted, never propagated.
    ///
    /// Besides the recorded inputs this removes anything in the upload directory named after the
    /// job, such as a partial download that never got recorded.
    pub async fn remove_job_files(&self, job: &Job) -> Removal {
        let mut removal = Removal::default();
        for path in job.input_files() {
            removal.record(&path, remove_path(&path).await);
        }
        for path in self.stray_uploads(job.id).await {
            removal.record(&path, remove_path(&path).await);
        }
        let work_dir = self.job(job.id).work_dir;
        removal.record(&work_dir, remove_path(&work_dir).await);
        removal
    }

    async fn stray_uploads(&self, id: JobId) -> Vec<PathBuf> {
        let mut entries = match tokio::fs::read_dir(&self.upload_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                tracing::warn!(?err, %id, "Cannot scan uploads for job {id}: {err}");
                return Vec::new();
            }
        };
        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) if owner_of(&entry.path()) == Some(id) => paths.push(entry.path()),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(?err, %id, "Failed scanning uploads for job {id}: {err}");
                    break;
                }
            }
        }
        paths
    }
}

/// Paths belonging to a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    id: JobId,
    download_stem: PathBuf,
    work_dir: PathBuf,
}

impl JobFiles {
    /// Destination handed to the downloader, without extension.
    pub fn download_stem(&self) -> &Path {
        &self.download_stem
    }

    /// Where an accepted upload with `extension` is stored.
    pub fn upload(&self, extension: &str) -> PathBuf {
        self.download_stem.with_extension(extension)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn canonical(&self) -> PathBuf {
        self.work_dir.join(format!("{}_canonical.wav", self.id))
    }

    pub fn vocals(&self) -> PathBuf {
        self.work_dir.join(format!("{}_vocals.wav", self.id))
    }

    pub fn preview(&self) -> PathBuf {
        self.work_dir.join(format!("{}_preview.wav", self.id))
    }

    pub async fn prepare(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.work_dir).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: usize,
    pub failed: usize,
}

impl Removal {
    fn record(&mut self, path: &Path, result: io::Result<bool>) {
        match result {
            Ok(true) => {
                tracing::debug!(path = %path.display(), "Deleted {}", path.display());
                self.removed += 1;
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(?err, path = %path.display(), "Failed to delete {}: {err}", path.display());
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirUsage {
    pub bytes: u64,
    pub files: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageUsage {
    pub upload: DirUsage,
    pub output: DirUsage,
}

impl StorageUsage {
    pub fn total(&self) -> DirUsage {
        DirUsage {
            bytes: self.upload.bytes + self.output.bytes,
            files: self.upload.files + self.output.files,
        }
    }
}

async fn dir_usage(root: &Path) -> DirUsage {
    let mut usage = DirUsage::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                tracing::warn!(?err, dir = %dir.display(), "Cannot measure {}: {err}", dir.display());
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            match entry.file_type().await {
                Ok(kind) if kind.is_dir() => pending.push(entry.path()),
                Ok(kind) if kind.is_file() => {
                    if let Ok(metadata) = entry.metadata().await {
                        usage.bytes += metadata.len();
                        usage.files += 1;
                    }
                }
                _ => {}
            }
        }
    }
    usage
}

/// Moves `from` to `to`, copying when a rename is not possible (e.g. across file systems).
pub(crate) async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Removes a file or directory tree. `Ok(false)` if nothing was there.
pub(crate) async fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// The job id a file in the upload or output directory belongs to, judged by its name.
pub(crate) fn owner_of(path: &Path) -> Option<JobId> {
    let name = path.file_name()?.to_str()?;
    name.get(..36)?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::{JobInput, JobStatus};
    use chrono::TimeDelta;

    #[test]
    fn job_paths_are_named_after_the_job() {
        let layout = StorageLayout::new("/up", "/out");
        let job = Job::raw_job();
        let files = layout.job(job.id);

        assert_eq!(files.work_dir(), Path::new("/out").join(job.id.to_string()));
        assert_eq!(files.download_stem(), Path::new("/up").join(job.id.to_string()));
        assert_eq!(owner_of(&files.vocals()), Some(job.id));
        assert_eq!(owner_of(&files.work_dir), Some(job.id));
        assert_eq!(owner_of(Path::new("/up/readme.txt")), None);
    }

    #[tokio::test]
    async fn remove_job_files_removes_inputs_and_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("up"), dir.path().join("out"));
        layout.ensure_dirs().await.unwrap();

        let id = crate::job::JobId::new();
        let upload = layout.upload_dir().join(format!("{id}.mp3"));
        tokio::fs::write(&upload, b"audio").await.unwrap();
        let mut job = Job::new(
            id,
            JobInput::Upload {
                path: upload.clone(),
                filename: "song.mp3".to_owned(),
                size: 5,
            },
            TimeDelta::hours(1),
        )
        .with_status(JobStatus::Processing);
        job.set_input_path(upload.clone()).unwrap();

        let files = layout.job(id);
        files.prepare().await.unwrap();
        tokio::fs::write(files.vocals(), b"vocals").await.unwrap();

        let removal = layout.remove_job_files(&job).await;
        assert_eq!(removal, Removal { removed: 2, failed: 0 });
        assert!(!upload.exists());
        assert!(!files.work_dir().exists());

        let again = layout.remove_job_files(&job).await;
        assert_eq!(again, Removal::default());
    }

    #[tokio::test]
    async fn usage_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("up"), dir.path().join("out"));
        assert_eq!(layout.usage().await, StorageUsage::default());

        layout.ensure_dirs().await.unwrap();
        let files = layout.job(JobId::new());
        tokio::fs::write(files.upload("mp3"), b"12345").await.unwrap();
        files.prepare().await.unwrap();
        tokio::fs::write(files.vocals(), b"123").await.unwrap();
        tokio::fs::write(files.preview(), b"1").await.unwrap();

        let usage = layout.usage().await;
        assert_eq!(usage.upload, DirUsage { bytes: 5, files: 1 });
        assert_eq!(usage.output, DirUsage { bytes: 4, files: 2 });
        assert_eq!(usage.total(), DirUsage { bytes: 9, files: 3 });
    }

    #[tokio::test]
    async fn move_file_replaces_source() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("incoming.wav");
        let to = dir.path().join("stored.wav");
        tokio::fs::write(&from, b"audio").await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(tokio::fs::read(&to).await.unwrap(), b"audio");
    }

    #[tokio::test]
    async fn remove_job_files_finds_unrecorded_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("up"), dir.path().join("out"));
        layout.ensure_dirs().await.unwrap();
        let job = Job::raw_job().with_status(JobStatus::Processing);
        let partial = layout.job(job.id).download_stem().with_extension("m4a.part");
        tokio::fs::write(&partial, b"half a song").await.unwrap();
        let other = layout.upload_dir().join(format!("{}.m4a", JobId::new()));
        tokio::fs::write(&other, b"someone else").await.unwrap();

        let removal = layout.remove_job_files(&job).await;
        assert_eq!(removal, Removal { removed: 1, failed: 0 });
        assert!(!partial.exists());
        assert!(other.exists());
    }
}
