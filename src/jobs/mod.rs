mod processor;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinHandle};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::JobError;
use crate::export::AnalysisSummary;

pub use self::processor::{OrtVideoProcessor, VideoProcessor};

pub type JobId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: JobId,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub frames_processed: usize,
    pub total_frames: usize,
    pub message: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub summary: Option<AnalysisSummary>,
    #[serde(skip)]
    input_path: PathBuf,
}

impl Job {
    fn new(id: JobId, filename: String, input_path: PathBuf, output_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename,
            status: JobStatus::Queued,
            progress: 0,
            frames_processed: 0,
            total_frames: 0,
            message: "waiting for a processing slot".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
            output_dir,
            summary: None,
            input_path,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Tracks uploaded videos through analysis. Admission is capped by `max_pending_jobs` and at
/// most `max_concurrent_processing` jobs run at once.
pub struct JobManager {
    jobs: Mutex<HashMap<JobId, Job>>,
    permits: Arc<Semaphore>,
    processor: Arc<dyn VideoProcessor>,
    limits: LimitsConfig,
    output_root: PathBuf,
}

impl JobManager {
    pub fn new(
        processor: Arc<dyn VideoProcessor>,
        limits: LimitsConfig,
        output_root: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(limits.max_concurrent_processing.max(1))),
            processor,
            limits,
            output_root: output_root.into(),
        })
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs that are queued or processing.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|job| !job.status.is_finished())
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .count()
    }

    pub fn has_capacity(&self) -> bool {
        self.pending_count() < self.limits.max_pending_jobs
    }

    /// Queue `input_path` for analysis. Must be called from within a tokio runtime.
    pub fn submit(
        self: &Arc<Self>,
        filename: impl Into<String>,
        input_path: PathBuf,
    ) -> Result<JobId, JobError> {
        let id = Uuid::new_v4();
        {
            let mut jobs = self.lock();
            let pending = jobs.values().filter(|j| !j.status.is_finished()).count();
            if pending >= self.limits.max_pending_jobs {
                return Err(JobError::QueueFull(pending));
            }
            let output_dir = self.output_root.join(id.to_string());
            jobs.insert(id, Job::new(id, filename.into(), input_path, output_dir));
        }
        log::info!("job {id} queued");

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_job(id).await });
        Ok(id)
    }

    pub fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.lock().get(&id).cloned().ok_or(JobError::NotFound(id))
    }

    /// All jobs, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Forget a job and delete everything it wrote.
    pub fn remove(&self, id: JobId) -> Result<Job, JobError> {
        let job = self.lock().remove(&id).ok_or(JobError::NotFound(id))?;
        delete_job_files(&job);
        log::info!("job {id} removed");
        Ok(job)
    }

    /// Path of a completed job's output file.
    pub fn artifact_path(&self, id: JobId, file_name: &str) -> Result<PathBuf, JobError> {
        let job = self.get(id)?;
        if job.status != JobStatus::Completed {
            return Err(JobError::NotFinished(id));
        }
        Ok(job.output_dir.join(file_name))
    }

    /// Drop finished jobs whose last update is older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::seconds(self.limits.job_ttl_secs.min(u32::MAX as u64) as i64);
        let expired: Vec<Job> = {
            let mut jobs = self.lock();
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|job| job.status.is_finished() && now - job.updated_at > ttl)
                .map(|job| job.id)
                .collect();
            ids.iter().filter_map(|id| jobs.remove(id)).collect()
        };

        for job in &expired {
            delete_job_files(job);
        }
        if !expired.is_empty() {
            log::info!("swept {} expired jobs", expired.len());
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs(self.limits.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_expired(Utc::now());
            }
        })
    }

    fn update(&self, id: JobId, apply: impl FnOnce(&mut Job)) {
        if let Some(job) = self.lock().get_mut(&id) {
            apply(job);
            job.touch();
        }
    }

    fn record_progress(&self, id: JobId, processed: usize, total: usize) {
        self.update(id, |job| {
            job.frames_processed = processed;
            job.total_frames = total;
            job.progress = if total == 0 {
                0
            } else {
                (processed.min(total) * 100 / total) as u8
            };
            job.message = format!("processing frame {processed} of {total}");
        });
    }

    async fn run_job(self: Arc<Self>, id: JobId) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                self.fail(id, format!("processing slots unavailable: {err}"));
                return;
            }
        };

        let paths = {
            let mut jobs = self.lock();
            match jobs.get_mut(&id) {
                Some(job) => {
                    job.status = JobStatus::Processing;
                    job.message = "processing started".to_string();
                    job.touch();
                    Some((
                        job.input_path.clone(),
                        job.filename.clone(),
                        job.output_dir.clone(),
                    ))
                }
                None => None,
            }
        };
        let Some((input, filename, output_dir)) = paths else {
            log::debug!("job {id} was removed before it started");
            return;
        };
        log::info!("job {id} processing {}", input.display());

        let manager = Arc::clone(&self);
        let processor = Arc::clone(&self.processor);
        let input_for_task = input.clone();
        let output_for_task = output_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let progress =
                |processed: usize, total: usize| manager.record_progress(id, processed, total);
            processor.process(&input_for_task, &filename, &output_for_task, &progress)
        })
        .await;

        if !self.lock().contains_key(&id) {
            log::info!("job {id} was removed while processing; discarding its outputs");
            if output_dir.exists() {
                if let Err(err) = fs::remove_dir_all(&output_dir) {
                    log::warn!("failed to delete {}: {err}", output_dir.display());
                }
            }
            let _ = fs::remove_file(&input);
            return;
        }

        match outcome {
            Ok(Ok(summary)) => {
                log::info!(
                    "job {id} completed: {}/{} frames detected",
                    summary.detected_frames,
                    summary.total_frames
                );
                self.update(id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.total_frames = summary.total_frames;
                    job.frames_processed = summary.total_frames;
                    job.message = "analysis complete".to_string();
                    job.summary = Some(summary);
                });
            }
            Ok(Err(err)) => self.fail(id, format!("{err:#}")),
            Err(err) => self.fail(id, format!("processing task aborted: {err}")),
        }

        if let Err(err) = fs::remove_file(&input) {
            log::debug!("could not remove upload {}: {err}", input.display());
        }
    }

    fn fail(&self, id: JobId, error: String) {
        log::error!("job {id} failed: {error}");
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.message = "analysis failed".to_string();
            job.error = Some(error);
        });
    }
}

fn delete_job_files(job: &Job) {
    for path in [&job.output_dir, &job.input_path] {
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else if path.exists() {
            fs::remove_file(path)
        } else {
            continue;
        };
        if let Err(err) = result {
            log::warn!("failed to delete {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{Result, anyhow};

    use super::*;
    use crate::pipeline::Mode;

    struct SleepyProcessor {
        delay: Duration,
        fail: bool,
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SleepyProcessor {
        fn new(delay_ms: u64, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }
    }

    impl VideoProcessor for SleepyProcessor {
        fn process(
            &self,
            _input: &Path,
            video_name: &str,
            output_dir: &Path,
            progress: &dyn Fn(usize, usize),
        ) -> Result<AnalysisSummary> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            fs::create_dir_all(output_dir)?;
            for i in 1..=4 {
                std::thread::sleep(self.delay / 4);
                progress(i, 4);
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(anyhow!("decoder exploded"))
            } else {
                fs::create_dir_all(output_dir)
                    .and_then(|_| fs::write(output_dir.join("landmarks.csv"), b"frame_id\n"))
                    .map_err(anyhow::Error::from)
                    .map(|_| {
                        let mut summary =
                            AnalysisSummary::from_frames(video_name, 30.0, Mode::Fast, &[]);
                        summary.total_frames = 4;
                        summary
                    })
            };
            self.finished.fetch_add(1, Ordering::SeqCst);
            result
        }
    }

    fn limits(concurrent: usize, pending: usize) -> LimitsConfig {
        LimitsConfig {
            max_concurrent_processing: concurrent,
            max_pending_jobs: pending,
            job_ttl_secs: 60,
            sweep_interval_secs: 60,
        }
    }

    async fn wait_finished(manager: &JobManager, id: JobId) -> Job {
        for _ in 0..200 {
            let job = manager.get(id).unwrap();
            if job.status.is_finished() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn job_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("upload.mp4");
        fs::write(&input, b"video").unwrap();
        let manager = JobManager::new(SleepyProcessor::new(20, false), limits(2, 10), dir.path());

        let id = manager.submit("clip.mp4", input.clone()).unwrap();
        let job = wait_finished(&manager, id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.frames_processed, 4);
        assert_eq!(job.filename, "clip.mp4");
        assert_eq!(job.summary.unwrap().video, "clip.mp4");
        assert!(!input.exists());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn processor_error_marks_job_failed() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(SleepyProcessor::new(4, true), limits(1, 10), dir.path());
        let id = manager.submit("bad.mp4", dir.path().join("bad.mp4")).unwrap();
        let job = wait_finished(&manager, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("decoder exploded"));
    }

    #[tokio::test]
    async fn queue_limit_rejects_extra_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(SleepyProcessor::new(200, false), limits(1, 1), dir.path());
        let first = manager.submit("a.mp4", dir.path().join("a.mp4")).unwrap();
        assert!(!manager.has_capacity());
        assert_eq!(
            manager.submit("b.mp4", dir.path().join("b.mp4")),
            Err(JobError::QueueFull(1))
        );
        wait_finished(&manager, first).await;
        assert!(manager.has_capacity());
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_permits() {
        let dir = tempfile::tempdir().unwrap();
        let processor = SleepyProcessor::new(40, false);
        let manager = JobManager::new(processor.clone(), limits(1, 10), dir.path());
        let ids: Vec<JobId> = (0..3)
            .map(|i| {
                manager
                    .submit(format!("{i}.mp4"), dir.path().join(format!("{i}.mp4")))
                    .unwrap()
            })
            .collect();
        for id in ids {
            wait_finished(&manager, id).await;
        }
        assert_eq!(processor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_and_unfinished_jobs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(SleepyProcessor::new(200, false), limits(1, 10), dir.path());
        let missing = Uuid::new_v4();
        assert_eq!(manager.get(missing).unwrap_err(), JobError::NotFound(missing));

        let id = manager.submit("a.mp4", dir.path().join("a.mp4")).unwrap();
        assert_eq!(
            manager.artifact_path(id, "landmarks.csv"),
            Err(JobError::NotFinished(id))
        );
        wait_finished(&manager, id).await;
        assert!(manager.artifact_path(id, "landmarks.csv").is_ok());
    }

    #[tokio::test]
    async fn remove_and_sweep_delete_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = JobManager::new(SleepyProcessor::new(4, false), limits(2, 10), dir.path());
        let a = manager.submit("a.mp4", dir.path().join("a.mp4")).unwrap();
        let b = manager.submit("b.mp4", dir.path().join("b.mp4")).unwrap();
        let job_a = wait_finished(&manager, a).await;
        let job_b = wait_finished(&manager, b).await;
        assert!(job_a.output_dir.exists());

        manager.remove(a).unwrap();
        assert!(!job_a.output_dir.exists());
        assert_eq!(manager.remove(a).unwrap_err(), JobError::NotFound(a));

        assert_eq!(manager.sweep_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(manager.sweep_expired(later), 1);
        assert!(!job_b.output_dir.exists());
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn removing_a_running_job_discards_its_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let processor = SleepyProcessor::new(200, false);
        let manager = JobManager::new(processor.clone(), limits(1, 10), dir.path());
        let id = manager.submit("a.mp4", dir.path().join("a.mp4")).unwrap();

        let mut job = manager.get(id).unwrap();
        for _ in 0..200 {
            if job.status == JobStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            job = manager.get(id).unwrap();
        }
        assert_eq!(job.status, JobStatus::Processing);

        manager.remove(id).unwrap();
        assert_eq!(manager.get(id).unwrap_err(), JobError::NotFound(id));

        for _ in 0..200 {
            if processor.finished.load(Ordering::SeqCst) == 1 && !job.output_dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.finished.load(Ordering::SeqCst), 1);
        assert!(!job.output_dir.exists());
        assert!(manager.list().is_empty());
        assert_eq!(manager.pending_count(), 0);
    }
}
