//! Buffer Loading
//!
//! Sample buffers are decoded off the control timeline. Completed decodes are
//! queued on a channel and applied by the environment at the next block boundary,
//! so decoding never blocks a tick.

use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;

/// Decoded per-channel sample data, shared with the nodes that read it
pub type BufferData = Arc<Vec<Vec<f32>>>;

/// Called once a buffer is available, with its data and name
pub type OnLoad = Box<dyn FnOnce(&BufferData, &str) + Send>;

/// Called by a decoder when it finishes
pub type DecodeCallback = Box<dyn FnOnce(Result<DecodedBuffer>) + Send>;

/// Where a buffer comes from
#[derive(Debug, Clone)]
pub enum BufferSource {
    /// An audio file on disk
    File(PathBuf),
    /// Samples already in memory, one vector per channel
    Samples {
        channels: Vec<Vec<f32>>,
        sample_rate: f64,
    },
}

/// Decoder output
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: f64,
}

/// Asynchronous buffer decoding
pub trait BufferDecoder: Send {
    /// Decode `source` and call `done` exactly once, from any thread
    fn decode(&self, source: BufferSource, done: DecodeCallback);
}

/// Decodes in-memory sources immediately and WAV files on a worker thread
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl BufferDecoder for DefaultDecoder {
    fn decode(&self, source: BufferSource, done: DecodeCallback) {
        match source {
            BufferSource::Samples {
                channels,
                sample_rate,
            } => done(Ok(DecodedBuffer {
                channels,
                sample_rate,
            })),
            BufferSource::File(path) => {
                #[cfg(feature = "wav")]
                std::thread::spawn(move || done(read_wav(&path)));

                #[cfg(not(feature = "wav"))]
                done(Err(Error::Decode(format!(
                    "cannot decode {}: built without the `wav` feature",
                    path.display()
                ))));
            }
        }
    }
}

/// Read a WAV file into per-channel float samples
#[cfg(feature = "wav")]
pub fn read_wav(path: &std::path::Path) -> Result<DecodedBuffer> {
    let decode_err = |e: hound::Error| Error::Decode(format!("{}: {}", path.display(), e));

    let mut reader = hound::WavReader::open(path).map_err(decode_err)?;
    let spec = reader.spec();
    let num_channels = (spec.channels as usize).max(1);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(decode_err)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(decode_err)?
        }
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / num_channels); num_channels];
    for frame in interleaved.chunks(num_channels) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }

    Ok(DecodedBuffer {
        channels,
        sample_rate: spec.sample_rate as f64,
    })
}

pub(crate) struct Completion {
    pub name: String,
    pub result: Result<DecodedBuffer>,
    pub on_load: Option<OnLoad>,
    generation: u64,
}

/// Decodes in flight, and their results waiting for the next block boundary
pub(crate) struct PendingLoads {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    generation: u64,
}

impl PendingLoads {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx, generation: 0 }
    }

    /// A decoder callback that queues its result under `name`
    pub fn completer(&self, name: String, on_load: Option<OnLoad>) -> DecodeCallback {
        let tx = self.tx.clone();
        let generation = self.generation;
        Box::new(move |result| {
            // The environment may already be gone
            let _ = tx.send(Completion {
                name,
                result,
                on_load,
                generation,
            });
        })
    }

    /// Completed loads issued since the last `clear`
    pub fn drain(&mut self) -> Vec<Completion> {
        let current = self.generation;
        self.rx
            .try_iter()
            .filter(|c| c.generation == current)
            .collect()
    }

    /// Forget every load in flight
    pub fn clear(&mut self) {
        self.generation += 1;
        while self.rx.try_recv().is_ok() {}
    }
}
