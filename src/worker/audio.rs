//! Writing raw waveforms returned by a backend to disk.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use audiosr_types::Waveform;

/// Samples in (time, channel) order, interleaved frame by frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Interleaved {
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl Interleaved {
    #[cfg(test)]
    fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }
}

/// Normalize a waveform to (time, channel).
///
/// A nested waveform whose first axis is shorter than its second is taken
/// as (channel, time) and transposed; otherwise rows are already frames.
pub fn interleave(waveform: &Waveform) -> Result<Interleaved> {
    match waveform {
        Waveform::Mono(samples) => {
            if samples.is_empty() {
                bail!("waveform is empty");
            }
            Ok(Interleaved {
                channels: 1,
                samples: samples.clone(),
            })
        }
        Waveform::Multi(rows) => {
            let width = rows.first().map(Vec::len).unwrap_or(0);
            if width == 0 {
                bail!("waveform is empty");
            }
            if let Some(bad) = rows.iter().position(|row| row.len() != width) {
                bail!(
                    "waveform rows differ in length: row {bad} has {} samples, expected {width}",
                    rows[bad].len()
                );
            }

            if rows.len() < width {
                // (channel, time)
                let channels = channel_count(rows.len())?;
                let mut samples = Vec::with_capacity(rows.len() * width);
                for t in 0..width {
                    samples.extend(rows.iter().map(|channel| channel[t]));
                }
                Ok(Interleaved { channels, samples })
            } else {
                Ok(Interleaved {
                    channels: channel_count(width)?,
                    samples: rows.iter().flatten().copied().collect(),
                })
            }
        }
    }
}

fn channel_count(n: usize) -> Result<u16> {
    u16::try_from(n).map_err(|_| anyhow!("too many channels: {n}"))
}

/// Write `waveform` as 16-bit PCM WAV at `sample_rate`.
pub fn write_wav(path: &Path, sample_rate: u32, waveform: &Waveform) -> Result<()> {
    if sample_rate == 0 {
        bail!("invalid sample rate 0");
    }
    let audio = interleave(waveform)?;
    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("create wav {}", path.display()))?;
    for s in &audio.samples {
        let clamped = s.clamp(-1.0, 1.0);
        let v = (clamped * i16::MAX as f32) as i16;
        writer.write_sample(v).context("write sample")?;
    }
    writer.finalize().context("finalize wav")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_major_is_transposed() {
        let waveform = Waveform::Multi(vec![vec![0.1, 0.2, 0.3], vec![-0.1, -0.2, -0.3]]);
        let audio = interleave(&waveform).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
        assert_eq!(audio.frames(), 3);
    }

    #[test]
    fn time_major_is_kept() {
        let waveform = Waveform::Multi(vec![vec![0.1, -0.1], vec![0.2, -0.2], vec![0.3, -0.3]]);
        let audio = interleave(&waveform).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]);
    }

    #[test]
    fn single_row_is_mono() {
        let audio = interleave(&Waveform::Multi(vec![vec![0.0, 0.5, 1.0]])).unwrap();
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frames(), 3);
    }

    #[test]
    fn rejects_empty_and_ragged() {
        assert!(interleave(&Waveform::Mono(vec![])).is_err());
        assert!(interleave(&Waveform::Multi(vec![])).is_err());
        assert!(interleave(&Waveform::Multi(vec![vec![0.0, 0.1, 0.2], vec![0.0]])).is_err());
    }

    #[test]
    fn writes_pcm16_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let waveform = Waveform::Multi(vec![vec![0.0, 1.0, -1.0, 2.0], vec![0.0; 4]]);
        write_wav(&path, 48_000, &waveform).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(
            samples,
            vec![0, 0, i16::MAX, 0, -i16::MAX, 0, i16::MAX, 0]
        );
    }

    #[test]
    fn write_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.wav");
        assert!(write_wav(&path, 16_000, &Waveform::Mono(vec![0.0])).is_err());
    }
}
