use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    thread,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, bounded};
use image::RgbaImage;

use crate::types::Frame;

pub const DEFAULT_FPS: f64 = 30.0;
pub const FRAME_PATTERN: &str = "frame_%06d.png";
const FRAME_CHANNEL_CAPACITY: usize = 4;
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    log::debug!("running {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {program}; is it installed?"))?;

    if !output.status.success() {
        return Err(anyhow!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

pub fn probe_fps(video: &Path) -> Result<f64> {
    let stdout = run_tool(
        "ffprobe",
        &[
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=r_frame_rate",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            path_arg(video)?,
        ],
    )?;

    Ok(stdout
        .lines()
        .find_map(parse_frame_rate)
        .unwrap_or_else(|| {
            log::warn!(
                "could not parse frame rate of {}, assuming {DEFAULT_FPS}",
                video.display()
            );
            DEFAULT_FPS
        }))
}

/// Decode every frame of `video` into numbered PNGs under `dir`. Returns the frame count.
pub fn extract_frames(video: &Path, dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create frame directory {}", dir.display()))?;
    let pattern = dir.join(FRAME_PATTERN);
    run_tool(
        "ffmpeg",
        &[
            "-y",
            "-loglevel",
            "error",
            "-i",
            path_arg(video)?,
            "-vsync",
            "0",
            path_arg(&pattern)?,
        ],
    )
    .with_context(|| format!("frame extraction failed for {}", video.display()))?;

    let count = list_frames(dir)?.len();
    if count == 0 {
        return Err(anyhow!("no frames extracted from {}", video.display()));
    }
    log::info!("extracted {count} frames from {}", video.display());
    Ok(count)
}

/// Image files in `dir`, sorted by name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read frame directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    Ok(frames)
}

pub fn load_frame(path: &Path, index: usize) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to open frame {}", path.display()))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    Ok(Frame::new(image.into_raw(), width, height, index))
}

pub fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    let image = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone())
        .ok_or_else(|| anyhow!("frame {} has a malformed buffer", frame.index))?;
    image
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

/// Decode frames on a background thread and hand them over a bounded channel in order.
pub fn spawn_frame_reader(paths: Vec<PathBuf>) -> (Receiver<Result<Frame>>, thread::JoinHandle<()>) {
    let (tx, rx) = bounded(FRAME_CHANNEL_CAPACITY);
    let handle = thread::spawn(move || {
        for (index, path) in paths.iter().enumerate() {
            if tx.send(load_frame(path, index)).is_err() {
                log::debug!("frame consumer hung up after {index} frames");
                return;
            }
        }
    });
    (rx, handle)
}

/// Encode numbered PNGs in `frames_dir` into an H.264 MP4.
pub fn encode_video(frames_dir: &Path, fps: f64, output: &Path) -> Result<()> {
    let pattern = frames_dir.join(FRAME_PATTERN);
    let fps = format!("{fps:.3}");
    run_tool(
        "ffmpeg",
        &[
            "-y",
            "-loglevel",
            "error",
            "-framerate",
            &fps,
            "-i",
            path_arg(&pattern)?,
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
            path_arg(output)?,
        ],
    )
    .with_context(|| format!("failed to encode {}", output.display()))?;
    Ok(())
}
