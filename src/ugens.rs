//! Stock Unit Generators
//!
//! The building blocks registered under the `ugen` namespace: a sine oscillator,
//! an attack/sustain/release envelope, a summing mixer, bus input and output,
//! and a buffer player.

use crate::compiler::{Rate, UgenRegistry, UnitSpec, OUT_UGEN};
use crate::unit::{sample_at, BlockContext, InputSignals, UnitGenerator};
use std::f64::consts::TAU;
use tracing::warn;

/// Box a unit generator for a factory
pub fn boxed<U: UnitGenerator + 'static>(unit: U) -> Box<dyn UnitGenerator> {
    Box::new(unit)
}

/// Register the stock unit generators
pub fn register_stock(registry: &mut UgenRegistry) {
    let stock: [(&str, fn(&UnitSpec) -> Box<dyn UnitGenerator>); 6] = [
        ("ugen.sin_osc", |spec| boxed(SinOsc::new(spec))),
        ("ugen.asr", |spec| boxed(Asr::new(spec))),
        ("ugen.sum", |_| boxed(Sum)),
        (OUT_UGEN, |spec| boxed(Out::new(spec))),
        ("ugen.in", |_| boxed(In)),
        ("ugen.play_buffer", |spec| boxed(PlayBuffer::new(spec))),
    ];
    for (name, factory) in stock {
        if let Err(e) = registry.register(name, factory) {
            warn!(ugen = name, error = %e, "stock unit generator not registered");
        }
    }
}

/// Samples per second at which a node of `rate` runs
fn node_rate(spec: &UnitSpec) -> f64 {
    match spec.rate {
        Rate::Audio => spec.settings.sample_rate,
        Rate::Control | Rate::Constant => {
            spec.settings.sample_rate / spec.settings.block_size.max(1) as f64
        }
    }
}

/// Sine oscillator
///
/// Inputs: `freq` (Hz, default 440), `phase` (radians added to the running
/// phase), `mul` (default 1) and `add` (default 0).
pub struct SinOsc {
    phase: f64,
    sample_rate: f64,
}

impl SinOsc {
    pub fn new(spec: &UnitSpec) -> Self {
        Self {
            phase: 0.0,
            sample_rate: node_rate(spec),
        }
    }
}

impl UnitGenerator for SinOsc {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        _ctx: &mut BlockContext<'_>,
    ) {
        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            let freq = inputs.sample("freq", i, 440.0) as f64;
            let offset = inputs.sample("phase", i, 0.0) as f64;
            let mul = inputs.sample("mul", i, 1.0);
            let add = inputs.sample("add", i, 0.0);

            *out = libm::sin(self.phase + offset) as f32 * mul + add;

            self.phase = libm::fmod(self.phase + TAU * freq / self.sample_rate, TAU);
        }
    }

    fn type_name(&self) -> &'static str {
        "sin_osc"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsrStage {
    Idle,
    Attack,
    Sustain,
    Release,
}

/// Attack/sustain/release envelope
///
/// A positive `gate` ramps linearly up to `sustain` (default 1) over `attack`
/// seconds (default 0.01) and holds it; closing the gate ramps down to zero over
/// `release` seconds (default 1).
pub struct Asr {
    stage: AsrStage,
    level: f32,
    release_step: f32,
    last_gate: f32,
    sample_rate: f64,
}

impl Asr {
    pub fn new(spec: &UnitSpec) -> Self {
        Self {
            stage: AsrStage::Idle,
            level: 0.0,
            release_step: 0.0,
            last_gate: 0.0,
            sample_rate: node_rate(spec),
        }
    }

    fn samples(&self, seconds: f32) -> f32 {
        (seconds as f64 * self.sample_rate).max(1.0) as f32
    }
}

impl UnitGenerator for Asr {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        _ctx: &mut BlockContext<'_>,
    ) {
        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            let gate = inputs.sample("gate", i, 0.0);
            let sustain = inputs.sample("sustain", i, 1.0);
            let attack = inputs.sample("attack", i, 0.01);
            let release = inputs.sample("release", i, 1.0);

            if gate > 0.0 && self.last_gate <= 0.0 {
                self.stage = AsrStage::Attack;
            } else if gate <= 0.0 && self.last_gate > 0.0 && self.stage != AsrStage::Idle {
                self.stage = AsrStage::Release;
                self.release_step = self.level / self.samples(release);
            }
            self.last_gate = gate;

            match self.stage {
                AsrStage::Idle => self.level = 0.0,
                AsrStage::Attack => {
                    let step = sustain.abs().max(f32::EPSILON) / self.samples(attack);
                    if self.level < sustain {
                        self.level = (self.level + step).min(sustain);
                    } else {
                        self.level = (self.level - step).max(sustain);
                    }
                    if self.level == sustain {
                        self.stage = AsrStage::Sustain;
                    }
                }
                AsrStage::Sustain => self.level = sustain,
                AsrStage::Release => {
                    self.level -= self.release_step;
                    if self.level <= 0.0 {
                        self.level = 0.0;
                        self.stage = AsrStage::Idle;
                    }
                }
            }

            *out = self.level;
        }
    }

    fn type_name(&self) -> &'static str {
        "asr"
    }
}

/// Sums every signal connected to `sources`
pub struct Sum;

impl UnitGenerator for Sum {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        _ctx: &mut BlockContext<'_>,
    ) {
        let sources = inputs.signals("sources");
        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            *out = sources.iter().map(|s| sample_at(s, i)).sum();
        }
    }

    fn type_name(&self) -> &'static str {
        "sum"
    }
}

/// Writes its sources to the shared buses
///
/// Source `k` is mixed into bus `bus + k`. With the `expand` option set to more
/// channels than there are sources, sources repeat across the extra channels, so
/// a mono source fills every output channel. Writes add into the buses; the
/// environment clears them before each block. The node's own output is the
/// first source.
pub struct Out {
    expand: usize,
}

impl Out {
    pub fn new(spec: &UnitSpec) -> Self {
        Self {
            expand: spec.option_f64("expand").map(|e| e.max(1.0) as usize).unwrap_or(1),
        }
    }
}

impl UnitGenerator for Out {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        ctx: &mut BlockContext<'_>,
    ) {
        let sources = inputs.signals("sources");
        let bus = inputs.sample("bus", 0, 0.0).max(0.0) as usize;

        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            *out = sources.first().map(|s| sample_at(s, i)).unwrap_or(0.0);
        }
        if sources.is_empty() {
            return;
        }

        let channels = self.expand.max(sources.len());
        for channel in 0..channels {
            let source = sources[channel % sources.len()];
            let Some(target) = ctx.bus_mut(bus + channel) else {
                break;
            };
            for (i, sample) in target.iter_mut().enumerate().take(block_size) {
                *sample += sample_at(source, i);
            }
        }
    }

    fn type_name(&self) -> &'static str {
        "out"
    }
}

/// Reads the bus selected by `bus` (default 0)
pub struct In;

impl UnitGenerator for In {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        ctx: &mut BlockContext<'_>,
    ) {
        let bus = inputs.sample("bus", 0, 0.0).max(0.0) as usize;
        let source = ctx.bus(bus).unwrap_or(&[]);
        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            *out = source.get(i).copied().unwrap_or(0.0);
        }
    }

    fn type_name(&self) -> &'static str {
        "in"
    }
}

/// Plays a loaded buffer
///
/// The buffer is named by the `buffer` option and the channel by `channel`
/// (default 0). Inputs: `speed` (default 1) and `loop` (positive to wrap at the
/// end). Until the buffer is loaded the output is silent.
pub struct PlayBuffer {
    buffer: String,
    channel: usize,
    position: f64,
}

impl PlayBuffer {
    pub fn new(spec: &UnitSpec) -> Self {
        Self {
            buffer: spec.option_str("buffer").unwrap_or_default().to_string(),
            channel: spec.option_f64("channel").map(|c| c.max(0.0) as usize).unwrap_or(0),
            position: 0.0,
        }
    }
}

impl UnitGenerator for PlayBuffer {
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        ctx: &mut BlockContext<'_>,
    ) {
        let samples = ctx
            .buffer(&self.buffer)
            .and_then(|data| data.get(self.channel))
            .map(|channel| channel.as_slice())
            .unwrap_or(&[]);

        for (i, out) in output.iter_mut().enumerate().take(block_size) {
            let speed = inputs.sample("speed", i, 1.0) as f64;
            let looping = inputs.sample("loop", i, 0.0) > 0.0;
            let len = samples.len() as f64;

            if looping && len > 0.0 {
                self.position = self.position.rem_euclid(len);
            }
            *out = if self.position >= 0.0 && self.position < len {
                samples[self.position as usize]
            } else {
                0.0
            };
            self.position += speed;
        }
    }

    fn on_input_changed(&mut self, input: &str) {
        // A new speed restarts playback from the top
        if input == "speed" {
            self.position = 0.0;
        }
    }

    fn type_name(&self) -> &'static str {
        "play_buffer"
    }
}
