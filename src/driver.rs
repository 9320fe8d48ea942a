//! Output Drivers
//!
//! An [`AudioStrategy`] is told when the environment starts and stops
//! generating; it decides where blocks go. [`OfflineStrategy`] goes nowhere:
//! blocks are pulled with [`Environment::render`] and handed back as
//! interleaved samples, which is also how tests listen to an environment.

use crate::environment::Environment;
use tracing::debug;

/// Lifecycle hooks of an output back-end
pub trait AudioStrategy: Send {
    fn start_generating_samples(&mut self);

    fn stop_generating_samples(&mut self);

    fn is_generating(&self) -> bool;
}

/// A back-end for pull-based, faster than real time rendering
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineStrategy {
    generating: bool,
}

impl AudioStrategy for OfflineStrategy {
    fn start_generating_samples(&mut self) {
        self.generating = true;
    }

    fn stop_generating_samples(&mut self) {
        self.generating = false;
    }

    fn is_generating(&self) -> bool {
        self.generating
    }
}

impl Environment {
    /// Render up to `frames` frames of interleaved output.
    ///
    /// Output channel `c` is bus `c`. Blocks are generated while the environment
    /// is playing. Frames of a block that a call did not consume are served
    /// first by the next call, so consecutive calls yield one continuous
    /// stream. Rendering ends early when playback reaches its duration.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let channels = self.settings().channels;
        let block_size = self.settings().block_size.max(1);
        let mut out = Vec::with_capacity(frames * channels);
        let mut rendered = 0;

        while rendered < frames && self.is_playing() && channels > 0 {
            let mut take = frames - rendered;
            let state = self.play_state();
            if let Some(total) = state.total {
                let remaining = (total.saturating_sub(state.written) / channels as u64) as usize;
                take = take.min(remaining);
            }
            if take == 0 {
                self.stop();
                break;
            }

            if self.read_cursor >= block_size {
                self.gen();
            }
            let start = self.read_cursor;
            take = take.min(block_size - start);

            let buses = self.buses();
            for frame in start..start + take {
                for channel in 0..channels {
                    let sample = buses
                        .get(channel)
                        .and_then(|bus| bus.get(frame))
                        .copied()
                        .unwrap_or(0.0);
                    out.push(sample);
                }
            }
            self.read_cursor += take;
            rendered += take;
            self.advance((take * channels) as u64);

            let state = self.play_state();
            if state.total.is_some_and(|total| state.written >= total) {
                debug!(written = state.written, "reached end of playback");
                self.stop();
            }
        }
        out
    }
}

/// Write interleaved float samples to a WAV file
#[cfg(feature = "wav")]
pub fn write_wav(
    path: impl AsRef<std::path::Path>,
    samples: &[f32],
    channels: usize,
    sample_rate: f64,
) -> crate::error::Result<()> {
    use crate::error::Error;

    let path = path.as_ref();
    let encode_err = |e: hound::Error| Error::Encode(format!("{}: {}", path.display(), e));
    let spec = hound::WavSpec {
        channels: channels as u16,
        sample_rate: sample_rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(encode_err)?;
    for sample in samples {
        writer.write_sample(*sample).map_err(encode_err)?;
    }
    writer.finalize().map_err(encode_err)
}
