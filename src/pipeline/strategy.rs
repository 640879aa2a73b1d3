use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow};
use image::{RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{Frame, PoseLandmarks};

const BLUR_SIGMA: f32 = 1.5;
const BRIGHTEN_AMOUNT: i32 = 40;
const CONTRAST_PERCENT: f32 = 30.0;
const STRETCH_LOW_PERCENTILE: f32 = 0.01;
const STRETCH_HIGH_PERCENTILE: f32 = 0.99;
const UNSHARP_SIGMA: f32 = 1.0;
const UNSHARP_THRESHOLD: i32 = 2;

/// Image preprocessing variant tried against the pose model.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Original,
    Blurred,
    Enhanced,
    Mirrored,
    Brightened,
    Contrast,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Original frames only, no interpolation or kinematic validation.
    Fast,
    #[default]
    Full,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::Original,
        Strategy::Blurred,
        Strategy::Enhanced,
        Strategy::Mirrored,
        Strategy::Brightened,
        Strategy::Contrast,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Original => "original",
            Strategy::Blurred => "blurred",
            Strategy::Enhanced => "enhanced",
            Strategy::Mirrored => "mirrored",
            Strategy::Brightened => "brightened",
            Strategy::Contrast => "contrast",
        }
    }

    pub fn apply(&self, frame: &Frame) -> Result<Frame> {
        if *self == Strategy::Original {
            return Ok(frame.clone());
        }

        let Some(img) = RgbaImage::from_raw(frame.width, frame.height, frame.rgba.clone()) else {
            return Err(anyhow!(
                "frame buffer size mismatch: got {}, expected {}",
                frame.rgba.len(),
                frame.expected_len()
            ));
        };

        let out = match self {
            Strategy::Original => img,
            Strategy::Blurred => imageops::blur(&img, BLUR_SIGMA),
            Strategy::Enhanced => {
                let stretched = stretch_histogram(img);
                imageops::unsharpen(&stretched, UNSHARP_SIGMA, UNSHARP_THRESHOLD)
            }
            Strategy::Mirrored => imageops::flip_horizontal(&img),
            Strategy::Brightened => imageops::brighten(&img, BRIGHTEN_AMOUNT),
            Strategy::Contrast => imageops::contrast(&img, CONTRAST_PERCENT),
        };

        Ok(Frame::new(out.into_raw(), frame.width, frame.height, frame.index))
    }

    /// Map a pose detected on the transformed image back into original-frame coordinates.
    pub fn restore(&self, pose: PoseLandmarks) -> PoseLandmarks {
        match self {
            Strategy::Mirrored => pose.mirrored(),
            _ => pose,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown strategy '{s}'"))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fast => f.write_str("fast"),
            Mode::Full => f.write_str("full"),
        }
    }
}

/// Per-channel linear stretch between the 1st and 99th percentile.
fn stretch_histogram(mut img: RgbaImage) -> RgbaImage {
    let pixel_count = (img.width() as usize * img.height() as usize).max(1);
    let mut histograms = [[0usize; 256]; 3];
    for px in img.pixels() {
        for c in 0..3 {
            histograms[c][px.0[c] as usize] += 1;
        }
    }

    let mut lut = [[0u8; 256]; 3];
    for c in 0..3 {
        let low = percentile(&histograms[c], pixel_count, STRETCH_LOW_PERCENTILE);
        let high = percentile(&histograms[c], pixel_count, STRETCH_HIGH_PERCENTILE);
        for v in 0..256usize {
            lut[c][v] = if high <= low {
                v as u8
            } else {
                let scaled = (v as f32 - low as f32) * 255.0 / (high - low) as f32;
                scaled.round().clamp(0.0, 255.0) as u8
            };
        }
    }

    let buffer: &mut [u8] = &mut img;
    buffer.par_chunks_exact_mut(4).for_each(|px| {
        px[0] = lut[0][px[0] as usize];
        px[1] = lut[1][px[1] as usize];
        px[2] = lut[2][px[2] as usize];
    });
    img
}

fn percentile(histogram: &[usize; 256], total: usize, fraction: f32) -> usize {
    let target = (total as f32 * fraction).ceil() as usize;
    let mut seen = 0usize;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= target.max(1) {
            return value;
        }
    }
    255
}
