use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

const POSE_MODEL_FILENAME: &str = "pose_estimation_mediapipe_2023mar.onnx";
const POSE_MODEL_URL: &str = "https://github.com/opencv/opencv_zoo/raw/main/models/pose_estimation_mediapipe/pose_estimation_mediapipe_2023mar.onnx";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub fn default_pose_model_path() -> PathBuf {
    PathBuf::from("models").join(POSE_MODEL_FILENAME)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelDownloadEvent {
    AlreadyPresent,
    Started { total: Option<u64> },
    Progress { downloaded: u64, total: Option<u64> },
    Finished,
}

/// Make sure the pose landmark model exists at `model_path`, downloading it if needed.
pub fn ensure_pose_model_ready<F>(model_path: &Path, mut on_event: F) -> Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if model_path.exists() {
        on_event(ModelDownloadEvent::AlreadyPresent);
        on_event(ModelDownloadEvent::Finished);
        return Ok(());
    }

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    fetch_model(POSE_MODEL_URL, model_path, &mut |event| {
        match &event {
            ModelDownloadEvent::Started { total } => progress = Some(create_progress_bar(*total)),
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message("pose model ready");
                }
            }
            ModelDownloadEvent::AlreadyPresent => {}
        }
        on_event(event);
    })
}

/// Reports every chunk that reaches disk as a `Progress` event.
struct ProgressWriter<'a, W, F> {
    inner: W,
    written: u64,
    total: Option<u64>,
    on_event: &'a mut F,
}

impl<W: Write, F: FnMut(ModelDownloadEvent)> Write for ProgressWriter<'_, W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        (self.on_event)(ModelDownloadEvent::Progress {
            downloaded: self.written,
            total: self.total,
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn fetch_model<F>(url: &str, dest: &Path, on_event: &mut F) -> Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    log::info!("downloading pose model from {url} to {}", dest.display());

    let mut response = Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("failed to build http client")?
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelDownloadEvent::Started { total });

    let tmp_path = dest.with_extension("download");
    let result = write_checked(&mut response, &tmp_path, total, on_event).and_then(|bytes| {
        fs::rename(&tmp_path, dest).with_context(|| {
            format!("failed to move {} into place at {}", tmp_path.display(), dest.display())
        })?;
        Ok(bytes)
    });

    match result {
        Ok(bytes) => {
            log::info!("pose model saved to {} ({bytes} bytes)", dest.display());
            on_event(ModelDownloadEvent::Finished);
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(err)
        }
    }
}

/// Stream `reader` into `path`, failing if fewer bytes than `expected` arrive.
fn write_checked<R, F>(reader: &mut R, path: &Path, expected: Option<u64>, on_event: &mut F) -> Result<u64>
where
    R: Read,
    F: FnMut(ModelDownloadEvent),
{
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = ProgressWriter {
        inner: file,
        written: 0,
        total: expected,
        on_event,
    };
    let copied = io::copy(reader, &mut writer).context("failed while downloading model bytes")?;
    writer
        .inner
        .sync_all()
        .context("failed to flush downloaded model to disk")?;

    match expected {
        Some(expected) if copied != expected => Err(anyhow!(
            "model download truncated: received {copied} of {expected} bytes"
        )),
        _ => Ok(copied),
    }
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    match total_size {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )
            .unwrap()
            .progress_chars("=>-");
            pb.set_style(style);
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} downloading pose model").unwrap();
            pb.set_style(style);
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
