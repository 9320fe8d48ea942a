//! Synths and Groups
//!
//! A [`Synth`] owns one compiled signal graph and exposes its inputs by
//! user-facing path (`"carrier.freq"`). Changing an input compiles the new
//! definition and splices it into the live graph; evaluation order is kept by
//! the synth's [`NodeCache`].
//!
//! A [`Group`] fans the same reads and writes out to several synths.

use crate::compiler::{DefinitionCompiler, GraphCompiler, NodeDef};
use crate::environment::AudioSettings;
use crate::error::{Error, Result};
use crate::graph::{Node, NodeCache, NodeId, Reattach, Target};
use crate::node_list::NodeList;
use crate::path::{self, Path};
use crate::unit::BlockContext;
use slotmap::{new_key_type, SlotMap};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Input changes keyed by user-facing path, applied in key order
pub type ChangeSpec = BTreeMap<String, NodeDef>;

/// What a synth needs from its environment to build graphs
#[derive(Clone)]
pub struct SynthContext {
    pub settings: AudioSettings,
    pub compiler: Arc<dyn GraphCompiler>,
}

impl SynthContext {
    pub fn new(settings: AudioSettings, compiler: Arc<dyn GraphCompiler>) -> Self {
        Self { settings, compiler }
    }
}

impl Default for SynthContext {
    fn default() -> Self {
        Self::new(AudioSettings::default(), Arc::new(DefinitionCompiler::default()))
    }
}

impl fmt::Debug for SynthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthContext")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// The result of reading a synth input
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// A value node's constant
    Scalar(f64),
    /// A processing node
    Node(NodeId),
    /// The nodes of a list input
    List(Vec<NodeId>),
}

/// A playable signal graph
#[derive(Debug)]
pub struct Synth {
    cache: NodeCache,
    root: Option<NodeId>,
    nickname: Option<String>,
    cx: SynthContext,
}

impl Synth {
    /// Compile `def` into a new synth. Without a definition the synth is silent.
    pub fn new(def: Option<NodeDef>, cx: SynthContext) -> Result<Self> {
        let mut cache = NodeCache::new();
        let root = match &def {
            Some(def) => {
                let compiled = cx.compiler.compile_graph(def, &cx.settings, &mut cache)?;
                cache.add(&compiled.nodes);
                Some(compiled.root)
            }
            None => {
                warn!("synth created without a graph definition; it will produce silence");
                None
            }
        };

        debug!(
            nodes = cache.all().len(),
            active = cache.active().len(),
            "compiled synth"
        );

        Ok(Self {
            cache,
            root,
            nickname: None,
            cx,
        })
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.cx.settings
    }

    /// The node whose output is the synth's output
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// The root node's most recent block
    pub fn output(&self) -> &[f32] {
        self.root
            .and_then(|id| self.cache.node(id))
            .map(Node::output)
            .unwrap_or(&[])
    }

    /// Read the input at a user-facing path
    pub fn get(&self, path: &str) -> Result<Option<Resolved>> {
        let path = Path::expand(path);
        Ok(path::get(&self.cache, &path)?.map(|target| self.resolve(target)))
    }

    /// Read several inputs at once
    pub fn get_many<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p str>,
    ) -> Result<BTreeMap<String, Option<Resolved>>> {
        paths
            .into_iter()
            .map(|p| Ok((p.to_string(), self.get(p)?)))
            .collect()
    }

    /// Replace the input at a user-facing path with a newly compiled definition.
    ///
    /// The previous node and everything only it reached are torn down. With
    /// `reattach`, the new node inherits the previous node's inputs (all of
    /// them, or only the named ones).
    pub fn set(
        &mut self,
        path: &str,
        def: impl Into<NodeDef>,
        reattach: impl Into<Reattach>,
    ) -> Result<()> {
        let path = Path::expand(path);
        if path.is_empty() {
            return Err(Error::InvalidDefinition(
                "cannot set an empty path".to_string(),
            ));
        }
        let def = def.into();
        let reattach = reattach.into();

        let previous = match path::get(&self.cache, &path)? {
            Some(Target::Node(id)) => vec![id],
            Some(Target::List(ids)) => ids,
            None => Vec::new(),
        };

        let (roots, created, target) = self.compile(&def)?;
        if let Err(e) = path::check_set(&self.cache, &path, &target) {
            self.cache.discard(&created);
            return Err(e);
        }
        let inputs: Vec<NodeId> = created
            .into_iter()
            .filter(|id| !roots.contains(id))
            .collect();
        self.cache.add(&inputs);
        self.cache.replace(&roots, &previous, &reattach);
        path::set(&mut self.cache, &path, target)?;

        if let ([old], [new]) = (previous.as_slice(), roots.as_slice()) {
            if self.root == Some(*old) {
                self.root = Some(*new);
            }
        }

        if let Some((owner, input)) = path.owner() {
            if let Ok(Some(Target::Node(owner))) = path::get(&self.cache, &owner) {
                self.cache.notify_input_changed(owner, input);
            }
        }
        Ok(())
    }

    /// Apply several changes, in key order
    pub fn set_many(&mut self, changes: &ChangeSpec) -> Result<()> {
        for (path, def) in changes {
            self.set(path, def.clone(), Reattach::None)?;
        }
        Ok(())
    }

    /// Read the input at `path`, or replace it first when a value is given
    pub fn input(
        &mut self,
        path: &str,
        value: Option<NodeDef>,
        reattach: impl Into<Reattach>,
    ) -> Result<Option<Resolved>> {
        if let Some(def) = value {
            self.set(path, def, reattach)?;
        }
        self.get(path)
    }

    /// Evaluate one block
    pub fn gen(&mut self, ctx: &mut BlockContext<'_>) {
        self.cache.gen(ctx);
    }

    fn resolve(&self, target: Target) -> Resolved {
        match target {
            Target::Node(id) => match self.cache.node(id).and_then(Node::scalar) {
                Some(value) => Resolved::Scalar(value),
                None => Resolved::Node(id),
            },
            Target::List(ids) => Resolved::List(ids),
        }
    }

    // A list definition compiles each element on its own and targets a list input.
    fn compile(&mut self, def: &NodeDef) -> Result<(Vec<NodeId>, Vec<NodeId>, Target)> {
        let compiler = self.cx.compiler.clone();
        let settings = self.cx.settings;

        let NodeDef::List(defs) = def else {
            let compiled = compiler.compile_node(def, &settings, &mut self.cache)?;
            return Ok((
                vec![compiled.root],
                compiled.nodes,
                Target::Node(compiled.root),
            ));
        };

        let mut roots = Vec::with_capacity(defs.len());
        let mut created = Vec::new();
        for def in defs {
            match compiler.compile_node(def, &settings, &mut self.cache) {
                Ok(compiled) => {
                    roots.push(compiled.root);
                    created.extend(compiled.nodes);
                }
                Err(e) => {
                    self.cache.discard(&created);
                    return Err(e);
                }
            }
        }
        Ok((roots.clone(), created, Target::List(roots)))
    }
}

new_key_type! {
    /// Identifies a synth within a [`Group`]
    pub struct MemberId;
}

/// An ordered collection of synths addressed together
#[derive(Debug, Default)]
pub struct Group {
    synths: SlotMap<MemberId, Synth>,
    order: NodeList<MemberId>,
    nickname: Option<String>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Add a synth at the end of the group
    pub fn tail(&mut self, synth: Synth) -> MemberId {
        let nickname = synth.nickname().map(str::to_string);
        let id = self.synths.insert(synth);
        self.order.tail(id, nickname.as_deref());
        id
    }

    /// Add a synth at the front of the group
    pub fn head(&mut self, synth: Synth) -> MemberId {
        let nickname = synth.nickname().map(str::to_string);
        let id = self.synths.insert(synth);
        self.order.head(id, nickname.as_deref());
        id
    }

    pub fn remove(&mut self, id: MemberId) -> Result<Synth> {
        self.order.remove(id)?;
        self.synths.remove(id).ok_or(Error::UnknownNode)
    }

    pub fn member(&self, id: MemberId) -> Option<&Synth> {
        self.synths.get(id)
    }

    pub fn member_mut(&mut self, id: MemberId) -> Option<&mut Synth> {
        self.synths.get_mut(id)
    }

    pub fn named(&self, nickname: &str) -> Option<MemberId> {
        self.order.named(nickname)
    }

    /// Members in evaluation order
    pub fn members(&self) -> impl Iterator<Item = (MemberId, &Synth)> + '_ {
        self.order
            .iter()
            .filter_map(|id| self.synths.get(id).map(|s| (id, s)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Read `path` from every member, returning the last member's value
    pub fn get(&self, path: &str) -> Result<Option<Resolved>> {
        let mut last = None;
        for (_, synth) in self.members() {
            last = synth.get(path)?;
        }
        Ok(last)
    }

    /// Apply a change to every member
    pub fn set(
        &mut self,
        path: &str,
        def: impl Into<NodeDef>,
        reattach: impl Into<Reattach>,
    ) -> Result<()> {
        let def = def.into();
        let reattach = reattach.into();
        for id in self.order.to_vec() {
            if let Some(synth) = self.synths.get_mut(id) {
                synth.set(path, def.clone(), reattach.clone())?;
            }
        }
        Ok(())
    }

    pub fn set_many(&mut self, changes: &ChangeSpec) -> Result<()> {
        for id in self.order.to_vec() {
            if let Some(synth) = self.synths.get_mut(id) {
                synth.set_many(changes)?;
            }
        }
        Ok(())
    }

    pub fn input(
        &mut self,
        path: &str,
        value: Option<NodeDef>,
        reattach: impl Into<Reattach>,
    ) -> Result<Option<Resolved>> {
        if let Some(def) = value {
            self.set(path, def, reattach)?;
        }
        self.get(path)
    }

    /// Evaluate every member in order
    pub fn gen(&mut self, ctx: &mut BlockContext<'_>) {
        for id in self.order.to_vec() {
            if let Some(synth) = self.synths.get_mut(id) {
                synth.gen(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferData;
    use crate::compiler::{UgenRegistry, UnitDef, OUTPUT_NODE_ID};
    use crate::graph::Input;
    use crate::unit::{InputSignals, UnitGenerator};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn settings() -> AudioSettings {
        AudioSettings::default().with_block_size(8)
    }

    fn cx() -> SynthContext {
        SynthContext::new(settings(), Arc::new(DefinitionCompiler::default()))
    }

    fn sine_def() -> NodeDef {
        UnitDef::new("ugen.sin_osc")
            .with_id("carrier")
            .with_input("freq", 440.0)
            .with_input("mul", 0.25)
            .into()
    }

    fn render(synth: &mut Synth) -> Vec<Vec<f32>> {
        let settings = *synth.settings();
        let mut buses = vec![vec![0.0; settings.block_size]; settings.num_buses];
        let buffers: HashMap<String, BufferData> = HashMap::new();
        let mut ctx = BlockContext::new(&mut buses, &buffers, &settings);
        synth.gen(&mut ctx);
        buses
    }

    #[test]
    fn test_new_compiles_graph() {
        let synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let root = synth.root().unwrap();
        assert_eq!(synth.cache().named(OUTPUT_NODE_ID), Some(root));
        assert_eq!(synth.cache().active().len(), 2);
        assert_eq!(*synth.cache().active().last().unwrap(), root);
    }

    #[test]
    fn test_empty_synth_is_silent() {
        let mut synth = Synth::new(None, cx()).unwrap();
        assert!(synth.root().is_none());
        assert!(synth.output().is_empty());
        let buses = render(&mut synth);
        assert!(buses.iter().flatten().all(|s| *s == 0.0));
    }

    #[test]
    fn test_get_scalar_and_node() {
        let synth = Synth::new(Some(sine_def()), cx()).unwrap();
        assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(440.0)));
        assert!(matches!(synth.get("carrier").unwrap(), Some(Resolved::Node(_))));
        assert_eq!(synth.get("carrier.phase").unwrap(), None);
        assert!(matches!(
            synth.get("nowhere.freq"),
            Err(Error::Unresolved { .. })
        ));

        let many = synth.get_many(["carrier.freq", "carrier.mul"]).unwrap();
        assert_eq!(many["carrier.mul"], Some(Resolved::Scalar(0.25)));
    }

    #[test]
    fn test_set_scalar_replaces_value_node() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let stored = synth.cache().len();

        synth.set("carrier.freq", 220.0, false).unwrap();
        assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(220.0)));
        assert_eq!(synth.cache().len(), stored);
        assert_eq!(synth.cache().all().len(), stored);
    }

    #[test]
    fn test_set_subgraph_then_tear_down() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let stored = synth.cache().len();
        let active = synth.cache().active().len();

        let lfo = UnitDef::new("ugen.sin_osc")
            .with_id("lfo")
            .with_input("freq", 2.0)
            .with_input("mul", 10.0)
            .with_input("add", 440.0);
        synth.set("carrier.freq", lfo, false).unwrap();
        assert_eq!(synth.cache().active().len(), active + 1);
        assert_eq!(synth.get("lfo.freq").unwrap(), Some(Resolved::Scalar(2.0)));

        // The new node runs after its consumer until the graph is rebuilt
        let active_ids = synth.cache().active();
        let lfo_id = synth.cache().named("lfo").unwrap();
        assert_eq!(*active_ids.last().unwrap(), lfo_id);

        synth.set("carrier.freq", 330.0, false).unwrap();
        assert_eq!(synth.cache().len(), stored);
        assert_eq!(synth.cache().active().len(), active);
        assert_eq!(synth.cache().named("lfo"), None);
    }

    #[test]
    fn test_set_node_with_reattach() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let out = synth.root().unwrap();

        let replacement = UnitDef::new("ugen.sin_osc").with_id("carrier");
        synth.set("carrier", replacement, Reattach::All).unwrap();

        let carrier = synth.cache().named("carrier").unwrap();
        assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(440.0)));
        assert_eq!(synth.get("carrier.mul").unwrap(), Some(Resolved::Scalar(0.25)));
        assert_eq!(
            synth.cache().node(out).unwrap().inputs().get("sources"),
            Some(&Input::Node(carrier))
        );
        assert_eq!(synth.cache().active(), &[out, carrier]);
    }

    #[test]
    fn test_set_list_input() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let sources: NodeDef = vec![
            UnitDef::new("ugen.sin_osc").with_id("a").into(),
            UnitDef::new("ugen.sin_osc").with_id("b").into(),
        ]
        .into();
        synth
            .set(&format!("{}.sources", OUTPUT_NODE_ID), sources, false)
            .unwrap();

        let Some(Resolved::List(ids)) = synth.get(&format!("{}.sources", OUTPUT_NODE_ID)).unwrap()
        else {
            panic!("expected a list input");
        };
        assert_eq!(ids.len(), 2);
        assert_eq!(synth.cache().named("carrier"), None);

        // Single elements of the list are addressable by index
        let second = UnitDef::new("ugen.sin_osc").with_id("c");
        synth
            .set(&format!("{}.sources.1", OUTPUT_NODE_ID), second, false)
            .unwrap();
        assert_eq!(synth.cache().named("b"), None);
        assert!(synth.cache().named("c").is_some());
    }

    #[test]
    fn test_replacing_root_moves_output() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let out = UnitDef::new("ugen.out")
            .with_id("main")
            .with_input("sources", 0.5)
            .with_option("expand", 2);
        synth.set(OUTPUT_NODE_ID, out, false).unwrap();

        let root = synth.root().unwrap();
        assert_eq!(synth.cache().named("main"), Some(root));
        let buses = render(&mut synth);
        assert!(buses[0].iter().all(|s| *s == 0.5));
        assert_eq!(synth.output(), &[0.5; 8]);
    }

    #[test]
    fn test_unknown_ugen_leaves_graph_untouched() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let stored = synth.cache().len();
        let err = synth
            .set("carrier.freq", UnitDef::new("ugen.missing"), false)
            .unwrap_err();
        assert_eq!(err, Error::UnknownUnitGenerator("ugen.missing".into()));
        assert_eq!(synth.cache().len(), stored);
        assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(440.0)));
    }

    #[test]
    fn test_unwritable_path_leaves_graph_untouched() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let stored = synth.cache().len();
        let all = synth.cache().all().len();
        let active = synth.cache().active().len();

        let err = synth
            .set(
                "graph-out.sources.5",
                UnitDef::new("ugen.sin_osc").with_id("ghost"),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotAContainer { .. }));

        let err = synth.set("carrier.0", 1.0, false).unwrap_err();
        assert!(matches!(err, Error::NotAContainer { .. }));

        assert_eq!(synth.cache().len(), stored);
        assert_eq!(synth.cache().all().len(), all);
        assert_eq!(synth.cache().active().len(), active);
        assert!(synth.cache().named("ghost").is_none());
        assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(440.0)));
    }

    struct Recorder {
        changes: Arc<Mutex<Vec<String>>>,
    }

    impl UnitGenerator for Recorder {
        fn gen(
            &mut self,
            _block_size: usize,
            _inputs: &InputSignals<'_>,
            _output: &mut [f32],
            _ctx: &mut BlockContext<'_>,
        ) {
        }

        fn on_input_changed(&mut self, input: &str) {
            self.changes.lock().push(input.to_string());
        }
    }

    #[test]
    fn test_set_notifies_owner() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        let mut registry = UgenRegistry::stock();
        registry
            .register("test.recorder", move |_| {
                Box::new(Recorder {
                    changes: seen.clone(),
                })
            })
            .unwrap();
        let cx = SynthContext::new(settings(), Arc::new(DefinitionCompiler::new(registry)));

        let def: NodeDef = UnitDef::new("test.recorder")
            .with_id("recorder")
            .with_input("level", 1.0)
            .into();
        let mut synth = Synth::new(Some(def), cx).unwrap();
        synth.set("recorder.level", 0.5, false).unwrap();
        synth.set("recorder.shape", 2.0, false).unwrap();

        assert_eq!(*changes.lock(), vec!["level".to_string(), "shape".to_string()]);
    }

    #[test]
    fn test_set_many_and_input() {
        let mut synth = Synth::new(Some(sine_def()), cx()).unwrap();
        let mut changes = ChangeSpec::new();
        changes.insert("carrier.freq".into(), 110.0.into());
        changes.insert("carrier.mul".into(), 0.5.into());
        synth.set_many(&changes).unwrap();

        assert_eq!(
            synth.input("carrier.freq", None, false).unwrap(),
            Some(Resolved::Scalar(110.0))
        );
        assert_eq!(
            synth.input("carrier.mul", Some(0.1.into()), false).unwrap(),
            Some(Resolved::Scalar(0.1))
        );
    }

    #[test]
    fn test_group_dispatches_to_members() {
        let mut group = Group::new().with_nickname("pads");
        let first = group.tail(Synth::new(Some(sine_def()), cx()).unwrap());
        let second = group.tail(Synth::new(Some(sine_def()), cx()).unwrap().with_nickname("upper"));
        assert_eq!(group.len(), 2);
        assert_eq!(group.named("upper"), Some(second));

        group.set("carrier.freq", 660.0, false).unwrap();
        for (_, synth) in group.members() {
            assert_eq!(synth.get("carrier.freq").unwrap(), Some(Resolved::Scalar(660.0)));
        }

        group
            .member_mut(second)
            .unwrap()
            .set("carrier.freq", 880.0, false)
            .unwrap();
        // Reads report the last member
        assert_eq!(group.get("carrier.freq").unwrap(), Some(Resolved::Scalar(880.0)));

        group.remove(first).unwrap();
        assert_eq!(group.len(), 1);
        assert!(group.remove(first).is_err());
        assert_eq!(Group::new().get("carrier.freq").unwrap(), None);
    }

    #[test]
    fn test_group_gen_mixes_members() {
        let constant = |level: f64| -> NodeDef {
            UnitDef::new("ugen.sin_osc")
                .with_input("freq", 0.0)
                .with_input("add", level)
                .into()
        };
        let mut group = Group::new();
        group.tail(Synth::new(Some(constant(0.25)), cx()).unwrap());
        group.tail(Synth::new(Some(constant(0.5)), cx()).unwrap());

        let settings = settings();
        let mut buses = vec![vec![0.0; settings.block_size]; settings.num_buses];
        let buffers: HashMap<String, BufferData> = HashMap::new();
        let mut ctx = BlockContext::new(&mut buses, &buffers, &settings);
        group.gen(&mut ctx);

        assert!(buses[0].iter().all(|s| *s == 0.75));
        assert!(buses[1].iter().all(|s| *s == 0.75));
    }
}
