//! Polyphony Support
//!
//! A [`PolySynth`] plays one synth definition per held note. Voices are
//! ordinary [`Synth`]s kept in a [`Group`]; a note turns a voice on by applying
//! the "on" note spec (by default `env.gate = 1`) and off by applying the "off"
//! spec, after which the voice returns to the free pool. Released voices keep
//! generating so their envelopes can ring out.
//!
//! # Allocation
//!
//! - Pooled (`init_voices_lazily = false`): every voice is created up front and
//!   notes take them from the free pool.
//! - Lazy: a free voice is reused if there is one, otherwise a new voice is
//!   created until `max_voices` exist.
//!
//! When no voice can be had, [`OnExhausted`] decides between stealing the
//! longest-held note and rejecting the new one.

use crate::compiler::NodeDef;
use crate::error::{Error, Result};
use crate::synth::{ChangeSpec, Group, MemberId, Synth, SynthContext};
use crate::unit::BlockContext;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Custom amplitude normalization, given a fresh voice and the amplitude key.
/// An error aborts creation of the voice.
pub type NormalizerFn = Arc<dyn Fn(&mut Synth, &str) -> Result<()> + Send + Sync>;

/// How a new voice's amplitude is scaled
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmplitudeNormalizer {
    /// Leave voices untouched
    None,
    /// Set the amplitude key to `1 / max_voices`
    #[default]
    Static,
    /// Reserved for level-dependent scaling; currently does nothing
    Dynamic,
    #[serde(skip)]
    Custom(NormalizerFn),
}

impl fmt::Debug for AmplitudeNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmplitudeNormalizer::None => f.write_str("None"),
            AmplitudeNormalizer::Static => f.write_str("Static"),
            AmplitudeNormalizer::Dynamic => f.write_str("Dynamic"),
            AmplitudeNormalizer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// What happens to a note-on when every voice is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExhausted {
    /// Release the longest-held note and reuse its voice
    #[default]
    StealOldest,
    /// Fail with [`Error::VoicesExhausted`]
    Reject,
}

/// Input changes applied on note events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSpecs {
    pub on: ChangeSpec,
    pub off: ChangeSpec,
}

impl Default for NoteSpecs {
    fn default() -> Self {
        Self {
            on: ChangeSpec::from([("env.gate".to_string(), NodeDef::Scalar(1.0))]),
            off: ChangeSpec::from([("env.gate".to_string(), NodeDef::Scalar(0.0))]),
        }
    }
}

/// Polyphonic synth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolyOptions {
    pub max_voices: usize,
    pub init_voices_lazily: bool,
    /// Input path set by the amplitude normalizer
    pub amplitude_key: String,
    pub amplitude_normalizer: AmplitudeNormalizer,
    pub note_specs: NoteSpecs,
    pub on_exhausted: OnExhausted,
}

impl Default for PolyOptions {
    fn default() -> Self {
        Self {
            max_voices: 16,
            init_voices_lazily: true,
            amplitude_key: "env.sustain".to_string(),
            amplitude_normalizer: AmplitudeNormalizer::Static,
            note_specs: NoteSpecs::default(),
            on_exhausted: OnExhausted::StealOldest,
        }
    }
}

impl PolyOptions {
    pub fn with_max_voices(mut self, max_voices: usize) -> Self {
        self.max_voices = max_voices;
        self
    }

    /// Create every voice up front instead of on demand
    pub fn pooled(mut self) -> Self {
        self.init_voices_lazily = false;
        self
    }

    pub fn with_amplitude_key(mut self, key: impl Into<String>) -> Self {
        self.amplitude_key = key.into();
        self
    }

    pub fn with_amplitude_normalizer(mut self, normalizer: AmplitudeNormalizer) -> Self {
        self.amplitude_normalizer = normalizer;
        self
    }

    pub fn with_note_specs(mut self, note_specs: NoteSpecs) -> Self {
        self.note_specs = note_specs;
        self
    }

    pub fn with_on_exhausted(mut self, on_exhausted: OnExhausted) -> Self {
        self.on_exhausted = on_exhausted;
        self
    }
}

/// State of a single voice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// In the free pool, possibly still releasing
    Free,
    /// Playing a held note
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteEvent {
    On,
    Off,
}

/// A synth that plays one voice per held note
#[derive(Debug)]
pub struct PolySynth {
    def: Option<NodeDef>,
    options: PolyOptions,
    cx: SynthContext,
    voices: Group,
    active: HashMap<String, MemberId>,
    // Held notes, oldest first
    held: VecDeque<String>,
    free: Vec<MemberId>,
    nickname: Option<String>,
}

impl PolySynth {
    pub fn new(def: Option<NodeDef>, options: PolyOptions, cx: SynthContext) -> Result<Self> {
        let mut poly = Self {
            def,
            options,
            cx,
            voices: Group::new(),
            active: HashMap::new(),
            held: VecDeque::new(),
            free: Vec::new(),
            nickname: None,
        };
        if !poly.options.init_voices_lazily {
            for _ in 0..poly.options.max_voices {
                let voice = poly.create_voice()?;
                poly.free.push(voice);
            }
        }
        Ok(poly)
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn options(&self) -> &PolyOptions {
        &self.options
    }

    /// Start `note` on a voice, applying `change` on top of the "on" note spec.
    ///
    /// A note that is already held is released first, so the latest note-on wins.
    pub fn note_on(&mut self, note: &str, change: Option<&ChangeSpec>) -> Result<MemberId> {
        if self.active.contains_key(note) {
            self.note_off(note, None)?;
        }
        let voice = self.next_free_voice()?;

        if let Err(e) = self.note_change(voice, NoteEvent::On, change) {
            // Part of the change may have landed; silence the voice before pooling it
            if let Err(off) = self.note_change(voice, NoteEvent::Off, None) {
                warn!(note, error = %off, "could not release voice after a failed note on");
            }
            self.free.push(voice);
            return Err(e);
        }
        self.active.insert(note.to_string(), voice);
        self.held.push_back(note.to_string());

        debug!(note, active = self.active.len(), "note on");
        Ok(voice)
    }

    /// Release `note`, applying `change` on top of the "off" note spec.
    /// Returns the released voice, or `None` if the note was not held.
    pub fn note_off(&mut self, note: &str, change: Option<&ChangeSpec>) -> Result<Option<MemberId>> {
        let Some(&voice) = self.active.get(note) else {
            return Ok(None);
        };
        self.note_change(voice, NoteEvent::Off, change)?;

        self.active.remove(note);
        self.held.retain(|held| held != note);
        self.free.push(voice);

        debug!(note, free = self.free.len(), "note off");
        Ok(Some(voice))
    }

    /// Release every held note
    pub fn all_notes_off(&mut self) -> Result<()> {
        let held: Vec<String> = self.held.iter().cloned().collect();
        for note in held {
            self.note_off(&note, None)?;
        }
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Voices created so far
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// The voice playing `note`
    pub fn active_voice(&self, note: &str) -> Option<MemberId> {
        self.active.get(note).copied()
    }

    pub fn voice(&self, id: MemberId) -> Option<&Synth> {
        self.voices.member(id)
    }

    pub fn voice_mut(&mut self, id: MemberId) -> Option<&mut Synth> {
        self.voices.member_mut(id)
    }

    pub fn voice_state(&self, id: MemberId) -> Option<VoiceState> {
        self.voices.member(id)?;
        if self.active.values().any(|v| *v == id) {
            Some(VoiceState::Active)
        } else {
            Some(VoiceState::Free)
        }
    }

    /// Every voice, active or free, in creation order
    pub fn voices(&self) -> &Group {
        &self.voices
    }

    /// Evaluate every voice
    pub fn gen(&mut self, ctx: &mut BlockContext<'_>) {
        self.voices.gen(ctx);
    }

    fn next_free_voice(&mut self) -> Result<MemberId> {
        if let Some(voice) = self.free.pop() {
            return Ok(voice);
        }
        if self.options.init_voices_lazily && self.voices.len() < self.options.max_voices {
            return self.create_voice();
        }

        let max = self.options.max_voices;
        match self.options.on_exhausted {
            OnExhausted::Reject => {
                warn!(max, "all voices in use; note rejected");
                Err(Error::VoicesExhausted { max })
            }
            OnExhausted::StealOldest => {
                let oldest = self
                    .held
                    .front()
                    .cloned()
                    .ok_or(Error::VoicesExhausted { max })?;
                warn!(max, stolen = %oldest, "all voices in use; stealing the oldest note");
                self.note_off(&oldest, None)?;
                self.free.pop().ok_or(Error::VoicesExhausted { max })
            }
        }
    }

    fn create_voice(&mut self) -> Result<MemberId> {
        let mut voice = Synth::new(self.def.clone(), self.cx.clone())?;
        let key = self.options.amplitude_key.as_str();
        match &self.options.amplitude_normalizer {
            AmplitudeNormalizer::None => {}
            AmplitudeNormalizer::Static => {
                let level = 1.0 / self.options.max_voices.max(1) as f64;
                voice.set(key, level, false)?;
            }
            AmplitudeNormalizer::Dynamic => {
                warn!("dynamic amplitude normalization is not available; voice left unscaled");
            }
            AmplitudeNormalizer::Custom(normalize) => normalize(&mut voice, key)?,
        }

        let id = self.voices.tail(voice);
        debug!(voices = self.voices.len(), "created voice");
        Ok(id)
    }

    fn note_change(
        &mut self,
        voice: MemberId,
        event: NoteEvent,
        change: Option<&ChangeSpec>,
    ) -> Result<()> {
        let mut merged = match event {
            NoteEvent::On => self.options.note_specs.on.clone(),
            NoteEvent::Off => self.options.note_specs.off.clone(),
        };
        if let Some(change) = change {
            merged.extend(change.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.voices
            .member_mut(voice)
            .ok_or(Error::UnknownNode)?
            .set_many(&merged)
    }
}
