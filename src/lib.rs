//! # Murmur: Live Audio Signal Graphs
//!
//! `murmur` is a runtime for block-based audio signal graphs that can be edited
//! while they play. Synths are described declaratively, compiled into graphs of
//! unit generators, and evaluated one block at a time by an environment that
//! mixes them onto shared buses.
//!
//! ## Architecture
//!
//! - **Environment** - Owns the buses and buffers and evaluates an ordered list of
//!   playables each block; list order is signal-flow order
//! - **Synth** - One compiled graph whose inputs are addressed by dotted paths
//!   (`"carrier.freq"`) and can be replaced live, with optional reattachment of
//!   the replaced node's inputs
//! - **Node Cache** - Per-synth registry keeping the all/active/named views of the
//!   graph consistent across live edits
//! - **Polyphony** - A voice pool that maps note names onto synth voices, with
//!   pooled or lazy allocation and amplitude normalization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use murmur::prelude::*;
//!
//! let mut env = Environment::new();
//!
//! // A sine wave on both output channels
//! let def: NodeDef = UnitDef::new("ugen.sin_osc")
//!     .with_id("carrier")
//!     .with_input("freq", 440.0)
//!     .with_input("mul", 0.25)
//!     .into();
//! let synth = Synth::new(Some(def), env.synth_context()).unwrap();
//! let id = env.spawn(synth);
//!
//! // Retune it while it plays
//! env.synth_mut(id).unwrap().set("carrier.freq", 220.0, false).unwrap();
//!
//! // Render one second of interleaved stereo
//! env.play(Some(1.0));
//! let samples = env.render(44100);
//! ```

pub mod buffers;
pub mod compiler;
pub mod driver;
pub mod environment;
pub mod error;
pub mod graph;
pub mod node_list;
pub mod path;
pub mod polyphony;
pub mod scheduler;
pub mod synth;
pub mod ugens;
pub mod unit;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};

    // Paths
    pub use crate::path::{
        expand_path, expand_paths, Addressable, AddressableMut, Callable, Path, Segment,
        INPUTS_MARKER,
    };

    // Nodes and graphs
    pub use crate::graph::{Input, Inputs, Node, NodeCache, NodeId, NodeKind, Reattach, Target};
    pub use crate::unit::{sample_at, BlockContext, InputSignals, UnitGenerator};

    // Definitions and compilation
    pub use crate::compiler::{
        Compiled, DefinitionCompiler, GraphCompiler, NodeDef, Rate, UgenFactory, UgenRegistry,
        UnitDef, UnitSpec, OUTPUT_NODE_ID,
    };
    pub use crate::ugens::{Asr, In, Out, PlayBuffer, SinOsc, Sum};

    // Synths
    pub use crate::node_list::NodeList;
    pub use crate::synth::{ChangeSpec, Group, MemberId, Resolved, Synth, SynthContext};

    // Environment
    pub use crate::buffers::{BufferData, BufferDecoder, BufferSource, DecodedBuffer, DefaultDecoder};
    pub use crate::driver::{AudioStrategy, OfflineStrategy};
    pub use crate::environment::{AudioSettings, Environment, PlayState, Playable, PlayableId};
    pub use crate::scheduler::TaskId;

    // Polyphony
    pub use crate::polyphony::{
        AmplitudeNormalizer, NoteSpecs, OnExhausted, PolyOptions, PolySynth, VoiceState,
    };
}

// Re-export key types at crate root for convenience
pub use prelude::*;
