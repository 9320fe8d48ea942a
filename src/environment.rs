//! Environment
//!
//! The top-level scheduler. An [`Environment`] owns the shared output buses, the
//! buffer cache and an ordered list of playables (synths, groups and polyphonic
//! synths). Each call to [`Environment::gen`] produces one block:
//!
//! 1. buffer loads that completed since the last block are applied and due
//!    scheduled tasks run,
//! 2. every bus is cleared,
//! 3. every listed playable is evaluated in list order.
//!
//! Earlier playables write the buses before later ones read them, so list order
//! is signal-flow order.

use crate::buffers::{BufferData, BufferDecoder, BufferSource, DefaultDecoder, OnLoad, PendingLoads};
use crate::compiler::{DefinitionCompiler, GraphCompiler};
use crate::driver::{AudioStrategy, OfflineStrategy};
use crate::error::{Error, Result};
use crate::node_list::NodeList;
use crate::polyphony::PolySynth;
use crate::scheduler::{Scheduler, TaskId};
use crate::synth::{Group, Synth, SynthContext};
use crate::unit::BlockContext;
use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Audio configuration shared by an environment and everything it plays
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Audio-rate samples per second
    pub sample_rate: f64,
    /// Frames per block; bus buffers and audio-rate nodes have this length
    pub block_size: usize,
    /// Output channels, read from the first buses
    pub channels: usize,
    pub num_buses: usize,
    /// Hint for output back-ends
    pub buffer_size: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 44100.0,
            block_size: 64,
            channels: 2,
            num_buses: 2,
            buffer_size: 2048,
        }
    }
}

impl AudioSettings {
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_num_buses(mut self, num_buses: usize) -> Self {
        self.num_buses = num_buses;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// Playback progress, counted in interleaved samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayState {
    pub written: u64,
    /// Where playback stops; `None` plays forever
    pub total: Option<u64>,
    pub is_playing: bool,
}

/// Anything the environment can evaluate
#[derive(Debug)]
pub enum Playable {
    Synth(Synth),
    Group(Group),
    Poly(PolySynth),
}

impl Playable {
    pub fn nickname(&self) -> Option<&str> {
        match self {
            Playable::Synth(synth) => synth.nickname(),
            Playable::Group(group) => group.nickname(),
            Playable::Poly(poly) => poly.nickname(),
        }
    }

    pub fn gen(&mut self, ctx: &mut BlockContext<'_>) {
        match self {
            Playable::Synth(synth) => synth.gen(ctx),
            Playable::Group(group) => group.gen(ctx),
            Playable::Poly(poly) => poly.gen(ctx),
        }
    }
}

impl From<Synth> for Playable {
    fn from(synth: Synth) -> Self {
        Playable::Synth(synth)
    }
}

impl From<Group> for Playable {
    fn from(group: Group) -> Self {
        Playable::Group(group)
    }
}

impl From<PolySynth> for Playable {
    fn from(poly: PolySynth) -> Self {
        Playable::Poly(poly)
    }
}

new_key_type! {
    /// Identifies a playable owned by an environment
    pub struct PlayableId;
}

/// A one-shot task run on the control timeline
pub type Task = Box<dyn FnOnce(&mut Environment) + Send>;

/// Owns the buses, buffers and evaluation order of everything playing
pub struct Environment {
    settings: AudioSettings,
    buses: Vec<Vec<f32>>,
    buffers: HashMap<String, BufferData>,
    playables: SlotMap<PlayableId, Playable>,
    nodes: NodeList<PlayableId>,
    play_state: PlayState,
    strategy: Box<dyn AudioStrategy>,
    decoder: Box<dyn BufferDecoder>,
    loads: PendingLoads,
    scheduler: Scheduler<Task>,
    frame: u64,
    // Frames of the current block already handed out by `render`
    pub(crate) read_cursor: usize,
    compiler: Arc<dyn GraphCompiler>,
}

impl Environment {
    pub fn new() -> Self {
        Self::with_settings(AudioSettings::default())
    }

    pub fn with_settings(settings: AudioSettings) -> Self {
        let num_buses = settings.num_buses.max(settings.channels);
        Self {
            settings,
            buses: vec![vec![0.0; settings.block_size.max(1)]; num_buses],
            buffers: HashMap::new(),
            playables: SlotMap::with_key(),
            nodes: NodeList::new(),
            play_state: PlayState::default(),
            strategy: Box::new(OfflineStrategy::default()),
            decoder: Box::new(DefaultDecoder),
            loads: PendingLoads::new(),
            scheduler: Scheduler::new(),
            frame: 0,
            read_cursor: settings.block_size.max(1),
            compiler: Arc::new(DefinitionCompiler::default()),
        }
    }

    /// Use another compiler for synths built from this environment's context
    pub fn with_compiler(mut self, compiler: Arc<dyn GraphCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn AudioStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn BufferDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    /// Context for building synths that play here
    pub fn synth_context(&self) -> SynthContext {
        SynthContext::new(self.settings, self.compiler.clone())
    }

    pub fn play_state(&self) -> PlayState {
        self.play_state
    }

    pub fn is_playing(&self) -> bool {
        self.play_state.is_playing
    }

    pub fn strategy(&self) -> &dyn AudioStrategy {
        self.strategy.as_ref()
    }

    pub fn buses(&self) -> &[Vec<f32>] {
        &self.buses
    }

    /// Frames generated so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Start generating, for `duration` seconds or until stopped
    pub fn play(&mut self, duration: Option<f64>) {
        let total = duration.map(|seconds| {
            let samples = seconds.max(0.0) * self.settings.sample_rate * self.settings.channels as f64;
            self.play_state.written + samples.round() as u64
        });
        self.play_state.total = total;
        self.strategy.start_generating_samples();
        self.play_state.is_playing = true;
        debug!(?total, written = self.play_state.written, "playing");
    }

    /// Stop generating. Progress counters are kept.
    pub fn stop(&mut self) {
        self.strategy.stop_generating_samples();
        self.play_state.is_playing = false;
        debug!(written = self.play_state.written, "stopped");
    }

    /// Stop, drop pending tasks and buffer loads, and empty the node list.
    /// Playables stay owned by the environment. Frames of the last block that
    /// were not rendered yet are dropped.
    pub fn reset(&mut self) {
        self.stop();
        self.scheduler.clear_all();
        self.loads.clear();
        self.nodes.clear();
        self.read_cursor = self.settings.block_size.max(1);
    }

    /// Generate one block into the buses
    pub fn gen(&mut self) {
        self.apply_loaded_buffers();
        for task in self.scheduler.take_due(self.frame) {
            task(self);
        }

        for bus in &mut self.buses {
            bus.fill(0.0);
        }

        let mut ctx = BlockContext::new(&mut self.buses, &self.buffers, &self.settings);
        for id in self.nodes.iter() {
            if let Some(playable) = self.playables.get_mut(id) {
                playable.gen(&mut ctx);
            }
        }

        self.frame += self.settings.block_size as u64;
        self.read_cursor = 0;
    }

    pub(crate) fn advance(&mut self, samples: u64) {
        let written = self.play_state.written + samples;
        self.play_state.written = match self.play_state.total {
            Some(total) => written.min(total),
            None => written,
        };
    }

    // Structure

    /// Take ownership of a playable without scheduling it
    pub fn add(&mut self, playable: impl Into<Playable>) -> PlayableId {
        self.playables.insert(playable.into())
    }

    /// Add a playable at the end of the node list
    pub fn spawn(&mut self, playable: impl Into<Playable>) -> PlayableId {
        let id = self.add(playable);
        let nickname = self.nickname_of(id);
        self.nodes.tail(id, nickname.as_deref());
        id
    }

    pub fn head(&mut self, id: PlayableId) -> Result<()> {
        let nickname = self.owned_nickname(id)?;
        self.nodes.head(id, nickname.as_deref());
        Ok(())
    }

    pub fn tail(&mut self, id: PlayableId) -> Result<()> {
        let nickname = self.owned_nickname(id)?;
        self.nodes.tail(id, nickname.as_deref());
        Ok(())
    }

    /// Insert at `index`, clamped to the list length
    pub fn at(&mut self, index: usize, id: PlayableId) -> Result<()> {
        let nickname = self.owned_nickname(id)?;
        self.nodes.at(index, id, nickname.as_deref());
        Ok(())
    }

    pub fn before(&mut self, reference: PlayableId, id: PlayableId) -> Result<()> {
        let nickname = self.owned_nickname(id)?;
        self.nodes.before(reference, id, nickname.as_deref())?;
        Ok(())
    }

    pub fn after(&mut self, reference: PlayableId, id: PlayableId) -> Result<()> {
        let nickname = self.owned_nickname(id)?;
        self.nodes.after(reference, id, nickname.as_deref())?;
        Ok(())
    }

    /// Take a playable out of the node list; it stays owned
    pub fn remove(&mut self, id: PlayableId) -> Result<()> {
        self.nodes.remove(id)?;
        Ok(())
    }

    /// Take a playable out of the list and hand it back
    pub fn destroy(&mut self, id: PlayableId) -> Result<Playable> {
        while self.nodes.remove(id).is_ok() {}
        self.playables.remove(id).ok_or(Error::UnknownNode)
    }

    pub fn get(&self, id: PlayableId) -> Option<&Playable> {
        self.playables.get(id)
    }

    pub fn get_mut(&mut self, id: PlayableId) -> Option<&mut Playable> {
        self.playables.get_mut(id)
    }

    pub fn synth(&self, id: PlayableId) -> Option<&Synth> {
        match self.playables.get(id)? {
            Playable::Synth(synth) => Some(synth),
            _ => None,
        }
    }

    pub fn synth_mut(&mut self, id: PlayableId) -> Option<&mut Synth> {
        match self.playables.get_mut(id)? {
            Playable::Synth(synth) => Some(synth),
            _ => None,
        }
    }

    pub fn group_mut(&mut self, id: PlayableId) -> Option<&mut Group> {
        match self.playables.get_mut(id)? {
            Playable::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn poly_mut(&mut self, id: PlayableId) -> Option<&mut PolySynth> {
        match self.playables.get_mut(id)? {
            Playable::Poly(poly) => Some(poly),
            _ => None,
        }
    }

    /// The listed playable most recently inserted under `nickname`
    pub fn named(&self, nickname: &str) -> Option<PlayableId> {
        self.nodes.named(nickname)
    }

    /// Listed playables in evaluation order
    pub fn nodes(&self) -> Vec<PlayableId> {
        self.nodes.to_vec()
    }

    /// Put a playable at the head of the list if it is not listed, and start
    /// the environment if it is stopped
    pub fn play_node(&mut self, id: PlayableId) -> Result<()> {
        if !self.nodes.contains(id) {
            self.head(id)?;
        }
        if !self.is_playing() {
            self.play(None);
        }
        Ok(())
    }

    /// Take a playable out of the list. Pausing an unlisted playable does nothing.
    pub fn pause_node(&mut self, id: PlayableId) -> Result<()> {
        if !self.playables.contains_key(id) {
            return Err(Error::UnknownNode);
        }
        if self.nodes.contains(id) {
            self.nodes.remove(id)?;
        }
        Ok(())
    }

    fn nickname_of(&self, id: PlayableId) -> Option<String> {
        self.playables
            .get(id)
            .and_then(Playable::nickname)
            .map(str::to_string)
    }

    fn owned_nickname(&self, id: PlayableId) -> Result<Option<String>> {
        if !self.playables.contains_key(id) {
            return Err(Error::UnknownNode);
        }
        Ok(self.nickname_of(id))
    }

    // Buffers

    /// Make the buffer `name` available.
    ///
    /// Without a source, `on_load` is called right away with the cached buffer.
    /// With one, the decoder runs and the result is cached, and `on_load`
    /// called, at the start of the next block after decoding completes.
    pub fn load_buffer(
        &mut self,
        name: &str,
        source: Option<BufferSource>,
        on_load: Option<OnLoad>,
    ) -> Result<()> {
        match source {
            None => {
                let data = self
                    .buffers
                    .get(name)
                    .ok_or_else(|| Error::UnknownBuffer(name.to_string()))?;
                if let Some(on_load) = on_load {
                    on_load(data, name);
                }
                Ok(())
            }
            Some(source) => {
                let done = self.loads.completer(name.to_string(), on_load);
                self.decoder.decode(source, done);
                Ok(())
            }
        }
    }

    pub fn buffer(&self, name: &str) -> Option<&BufferData> {
        self.buffers.get(name)
    }

    fn apply_loaded_buffers(&mut self) {
        for completion in self.loads.drain() {
            match completion.result {
                Ok(decoded) => {
                    let data: BufferData = Arc::new(decoded.channels);
                    self.buffers.insert(completion.name.clone(), data.clone());
                    debug!(
                        buffer = %completion.name,
                        channels = data.len(),
                        "buffer loaded"
                    );
                    if let Some(on_load) = completion.on_load {
                        on_load(&data, &completion.name);
                    }
                }
                Err(e) => warn!(buffer = %completion.name, error = %e, "failed to load buffer"),
            }
        }
    }

    // Scheduling

    /// Run `task` once, `delay` seconds from now, at a block boundary
    pub fn schedule_once<F>(&mut self, delay: f64, task: F) -> TaskId
    where
        F: FnOnce(&mut Environment) + Send + 'static,
    {
        let frames = (delay.max(0.0) * self.settings.sample_rate).round() as u64;
        self.scheduler.schedule_at(self.frame + frames, Box::new(task))
    }

    /// Cancel a scheduled task. Returns whether it was still pending.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.scheduler.cancel(id).is_some()
    }

    pub fn pending_tasks(&self) -> usize {
        self.scheduler.len()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .field("play_state", &self.play_state)
            .field("nodes", &self.nodes.len())
            .field("buffers", &self.buffers.keys().collect::<Vec<_>>())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

static SHARED: Mutex<Option<Environment>> = const_mutex(None);

/// Create the shared environment if there is none. Returns whether it was created.
pub fn init_shared(settings: AudioSettings) -> bool {
    let mut shared = SHARED.lock();
    if shared.is_some() {
        return false;
    }
    *shared = Some(Environment::with_settings(settings));
    true
}

/// Run `f` against the shared environment, creating a default one on first use
pub fn with_shared<R>(f: impl FnOnce(&mut Environment) -> R) -> R {
    let mut shared = SHARED.lock();
    f(shared.get_or_insert_with(Environment::new))
}

/// Reset and hand back the shared environment, if one exists
pub fn teardown_shared() -> Option<Environment> {
    let mut env = SHARED.lock().take()?;
    env.reset();
    Some(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{DecodeCallback, DecodedBuffer};
    use crate::compiler::{NodeDef, UgenRegistry, UnitDef};
    use crate::unit::{InputSignals, UnitGenerator};
    use approx::assert_relative_eq;

    fn settings() -> AudioSettings {
        AudioSettings::default().with_block_size(8)
    }

    fn constant(level: f64) -> NodeDef {
        UnitDef::new("ugen.sin_osc")
            .with_input("freq", 0.0)
            .with_input("add", level)
            .into()
    }

    fn synth(env: &Environment, def: NodeDef) -> Synth {
        Synth::new(Some(def), env.synth_context()).unwrap()
    }

    // Records the first sample of bus 0 as it was when the tap ran
    struct BusTap {
        seen: Arc<Mutex<Vec<f32>>>,
    }

    impl UnitGenerator for BusTap {
        fn gen(
            &mut self,
            _block_size: usize,
            _inputs: &InputSignals<'_>,
            _output: &mut [f32],
            ctx: &mut BlockContext<'_>,
        ) {
            let first = ctx.bus(0).and_then(|b| b.first().copied()).unwrap_or(f32::NAN);
            self.seen.lock().push(first);
        }
    }

    fn tap_env(seen: Arc<Mutex<Vec<f32>>>) -> Environment {
        let mut registry = UgenRegistry::stock();
        registry
            .register("test.bus_tap", move |_| {
                Box::new(BusTap { seen: seen.clone() })
            })
            .unwrap();
        Environment::with_settings(settings())
            .with_compiler(Arc::new(DefinitionCompiler::new(registry)))
    }

    fn tap_def() -> NodeDef {
        UnitDef::new("ugen.out")
            .with_input("sources", UnitDef::new("test.bus_tap"))
            .with_input("bus", 7.0)
            .into()
    }

    #[test]
    fn test_default_settings() {
        let settings = AudioSettings::default();
        assert_eq!(settings.sample_rate, 44100.0);
        assert_eq!(settings.block_size, 64);
        assert_eq!(settings.channels, 2);
        assert_eq!(settings.num_buses, 2);
        assert_eq!(settings.buffer_size, 2048);
    }

    #[test]
    fn test_settings_from_json() {
        let settings: AudioSettings =
            serde_json::from_str(r#"{"sample_rate": 48000, "num_buses": 8}"#).unwrap();
        assert_eq!(settings.sample_rate, 48000.0);
        assert_eq!(settings.num_buses, 8);
        assert_eq!(settings.block_size, 64);
    }

    #[test]
    fn test_play_and_stop() {
        let mut env = Environment::with_settings(settings());
        env.play(Some(1.0));
        let state = env.play_state();
        assert!(state.is_playing);
        assert!(env.strategy().is_generating());
        assert_eq!(state.total, Some(88200));

        env.advance(100);
        env.stop();
        let state = env.play_state();
        assert!(!state.is_playing);
        assert!(!env.strategy().is_generating());
        assert_eq!(state.written, 100);

        env.play(None);
        assert_eq!(env.play_state().total, None);
    }

    #[test]
    fn test_buses_cleared_before_evaluation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut env = tap_env(seen.clone());
        env.spawn(synth(&env, constant(0.5)));
        let tap = env.add(synth(&env, tap_def()));
        env.head(tap).unwrap();

        env.gen();
        env.gen();

        // The tap runs first and sees cleared buses although the writer left 0.5
        assert_eq!(*seen.lock(), vec![0.0, 0.0]);
        assert!(env.buses()[0].iter().all(|s| *s == 0.5));
    }

    #[test]
    fn test_list_order_is_signal_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut env = tap_env(seen.clone());
        let writer = env.spawn(synth(&env, constant(0.25)));
        let tap = env.add(synth(&env, tap_def()));
        env.after(writer, tap).unwrap();

        env.gen();
        assert_eq!(*seen.lock(), vec![0.25]);
        assert_eq!(env.nodes(), vec![writer, tap]);
    }

    #[test]
    fn test_mixing_on_buses() {
        let mut env = Environment::with_settings(settings());
        env.spawn(synth(&env, constant(0.25)));
        env.spawn(synth(&env, constant(0.5)));
        env.gen();
        for bus in env.buses() {
            for sample in bus {
                assert_relative_eq!(*sample, 0.75);
            }
        }
    }

    #[test]
    fn test_structure_operations() {
        let mut env = Environment::with_settings(settings());
        let a = env.add(synth(&env, constant(0.1)).with_nickname("a"));
        let b = env.add(synth(&env, constant(0.2)));
        let c = env.add(synth(&env, constant(0.3)));

        env.tail(a).unwrap();
        env.head(b).unwrap();
        env.at(99, c).unwrap();
        assert_eq!(env.nodes(), vec![b, a, c]);
        assert_eq!(env.named("a"), Some(a));

        env.remove(a).unwrap();
        assert_eq!(env.remove(a), Err(Error::NotInList));
        assert_eq!(env.before(a, b), Err(Error::NotInList));
        assert_eq!(env.named("a"), None);

        let destroyed = env.destroy(c).unwrap();
        assert!(matches!(destroyed, Playable::Synth(_)));
        assert_eq!(env.nodes(), vec![b]);
        assert!(env.get(c).is_none());
        assert!(matches!(env.destroy(c), Err(Error::UnknownNode)));
        assert_eq!(env.head(c), Err(Error::UnknownNode));

        assert!(env.synth(b).is_some());
        assert!(env.group_mut(b).is_none());
        assert!(env.poly_mut(b).is_none());
    }

    #[test]
    fn test_play_and_pause_node() {
        let mut env = Environment::with_settings(settings());
        let first = env.spawn(synth(&env, constant(0.1)));
        let id = env.add(synth(&env, constant(0.2)));

        env.play_node(id).unwrap();
        assert!(env.is_playing());
        assert_eq!(env.nodes(), vec![id, first]);

        // Already listed: stays where it is
        env.play_node(id).unwrap();
        assert_eq!(env.nodes().len(), 2);

        env.pause_node(id).unwrap();
        env.pause_node(id).unwrap();
        assert_eq!(env.nodes(), vec![first]);
        assert!(env.synth(id).is_some());
    }

    #[test]
    fn test_reset() {
        let mut env = Environment::with_settings(settings());
        let id = env.spawn(synth(&env, constant(0.1)));
        env.schedule_once(10.0, |_| {});
        env.play(None);

        env.reset();
        assert!(!env.is_playing());
        assert!(env.nodes().is_empty());
        assert_eq!(env.pending_tasks(), 0);
        assert!(env.get(id).is_some());
    }

    #[test]
    fn test_schedule_once_runs_at_block_boundary() {
        let mut env = Environment::with_settings(settings());
        let id = env.add(synth(&env, constant(0.5)));
        // Two blocks of 8 frames
        let delay = 16.0 / env.settings().sample_rate;
        env.schedule_once(delay, move |env| {
            env.tail(id).unwrap();
        });
        let cancelled = env.schedule_once(delay, |env| env.reset());
        assert!(env.cancel(cancelled));

        env.gen();
        env.gen();
        assert!(env.nodes().is_empty());
        assert!(env.buses()[0].iter().all(|s| *s == 0.0));

        env.gen();
        assert_eq!(env.nodes(), vec![id]);
        assert!(env.buses()[0].iter().all(|s| *s == 0.5));
        assert_eq!(env.pending_tasks(), 0);
    }

    #[test]
    fn test_load_buffer_from_samples() {
        let mut env = Environment::with_settings(settings());
        let loaded = Arc::new(Mutex::new(Vec::new()));
        let record = loaded.clone();
        env.load_buffer(
            "clip",
            Some(BufferSource::Samples {
                channels: vec![vec![0.5; 4]],
                sample_rate: 44100.0,
            }),
            Some(Box::new(move |data, name| {
                record.lock().push((name.to_string(), data.len()));
            })),
        )
        .unwrap();

        // Applied at the next block boundary
        assert!(env.buffer("clip").is_none());
        env.gen();
        assert_eq!(env.buffer("clip").unwrap()[0], vec![0.5; 4]);
        assert_eq!(*loaded.lock(), vec![("clip".to_string(), 1)]);

        // Cached: the callback runs immediately
        let again = Arc::new(Mutex::new(false));
        let flag = again.clone();
        env.load_buffer("clip", None, Some(Box::new(move |_, _| *flag.lock() = true)))
            .unwrap();
        assert!(*again.lock());

        assert_eq!(
            env.load_buffer("missing", None, None),
            Err(Error::UnknownBuffer("missing".into()))
        );
    }

    #[test]
    fn test_played_buffer_reaches_bus() {
        let mut env = Environment::with_settings(settings());
        env.load_buffer(
            "clip",
            Some(BufferSource::Samples {
                channels: vec![vec![0.25; 64]],
                sample_rate: 44100.0,
            }),
            None,
        )
        .unwrap();
        let def: NodeDef = UnitDef::new("ugen.play_buffer")
            .with_option("buffer", "clip")
            .into();
        env.spawn(synth(&env, def));

        env.gen();
        assert!(env.buses()[1].iter().all(|s| *s == 0.25));
    }

    // Holds decodes until the test releases them
    #[derive(Default, Clone)]
    struct DeferredDecoder {
        queued: Arc<Mutex<Vec<DecodeCallback>>>,
    }

    impl BufferDecoder for DeferredDecoder {
        fn decode(&self, _source: BufferSource, done: DecodeCallback) {
            self.queued.lock().push(done);
        }
    }

    impl DeferredDecoder {
        fn finish(&self, result: Result<DecodedBuffer>) {
            for done in self.queued.lock().drain(..) {
                done(result.clone());
            }
        }
    }

    #[test]
    fn test_reset_drops_loads_in_flight() {
        let decoder = DeferredDecoder::default();
        let mut env =
            Environment::with_settings(settings()).with_decoder(Box::new(decoder.clone()));
        env.load_buffer("late", Some(BufferSource::File("late.wav".into())), None)
            .unwrap();
        env.reset();

        decoder.finish(Ok(DecodedBuffer {
            channels: vec![vec![1.0]],
            sample_rate: 44100.0,
        }));
        env.gen();
        assert!(env.buffer("late").is_none());
    }

    #[test]
    fn test_failed_decode_leaves_cache_untouched() {
        let decoder = DeferredDecoder::default();
        let mut env =
            Environment::with_settings(settings()).with_decoder(Box::new(decoder.clone()));
        env.load_buffer("bad", Some(BufferSource::File("bad.wav".into())), None)
            .unwrap();
        decoder.finish(Err(Error::Decode("corrupt".into())));
        env.gen();
        assert!(env.buffer("bad").is_none());
    }

    #[test]
    fn test_shared_environment() {
        teardown_shared();
        assert!(init_shared(settings()));
        assert!(!init_shared(AudioSettings::default()));

        let block_size = with_shared(|env| env.settings().block_size);
        assert_eq!(block_size, 8);

        let listed = with_shared(|env| {
            let synth = Synth::new(Some(constant(0.5)), env.synth_context()).unwrap();
            env.spawn(synth);
            env.nodes().len()
        });
        assert_eq!(listed, 1);

        let env = teardown_shared().unwrap();
        assert!(env.nodes().is_empty());
        assert!(teardown_shared().is_none());
    }
}
