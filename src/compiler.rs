//! Graph Definitions and Compiler
//!
//! Synth graphs are described declaratively by [`NodeDef`] trees (deserializable
//! from JSON) and turned into concrete nodes by a [`GraphCompiler`]. The stock
//! [`DefinitionCompiler`] looks unit generator types up in a [`UgenRegistry`], a
//! dotted namespace of factories resolved through [`path::invoke`].

use crate::environment::AudioSettings;
use crate::error::{Error, Result};
use crate::graph::{Input, Inputs, Node, NodeCache, NodeId};
use crate::path::{self, Addressable, AddressableMut, Callable, Path, Segment};
use crate::unit::UnitGenerator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier given to the output node wrapped around bare graph definitions
pub const OUTPUT_NODE_ID: &str = "graph-out";

/// Type name of the bus output unit generator
pub const OUT_UGEN: &str = "ugen.out";

/// Type name of value nodes. The compiler builds these itself; no factory is registered.
pub const VALUE_UGEN: &str = "ugen.value";

/// Evaluation rate of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rate {
    /// One sample per frame of the block
    #[default]
    Audio,
    /// One sample per block
    Control,
    /// Never changes
    Constant,
}

impl Rate {
    /// Samples produced per block at this rate
    pub fn block_size(&self, settings: &AudioSettings) -> usize {
        match self {
            Rate::Audio => settings.block_size,
            Rate::Control | Rate::Constant => 1,
        }
    }
}

/// A declarative node definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeDef {
    /// A constant, compiled to a value node
    Scalar(f64),
    /// Several nodes feeding one list input
    List(Vec<NodeDef>),
    Unit(Box<UnitDef>),
}

impl NodeDef {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl From<f64> for NodeDef {
    fn from(value: f64) -> Self {
        NodeDef::Scalar(value)
    }
}

impl From<UnitDef> for NodeDef {
    fn from(unit: UnitDef) -> Self {
        NodeDef::Unit(Box::new(unit))
    }
}

impl From<Vec<NodeDef>> for NodeDef {
    fn from(defs: Vec<NodeDef>) -> Self {
        NodeDef::List(defs)
    }
}

/// Definition of a single unit generator node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDef {
    /// Dotted type name in the registry, e.g. `ugen.sin_osc`
    pub ugen: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub rate: Rate,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, NodeDef>,

    /// Construction options passed to the factory
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl UnitDef {
    pub fn new(ugen: impl Into<String>) -> Self {
        Self {
            ugen: ugen.into(),
            id: None,
            rate: Rate::Audio,
            inputs: BTreeMap::new(),
            options: Value::Null,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rate(mut self, rate: Rate) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, def: impl Into<NodeDef>) -> Self {
        self.inputs.insert(name.into(), def.into());
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.options.is_object() {
            self.options = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.options {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// What a unit generator factory is built from
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub options: Value,
    pub rate: Rate,
    pub settings: AudioSettings,
}

impl UnitSpec {
    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// Builds a unit generator
pub type UgenFactory = Arc<dyn Fn(&UnitSpec) -> Box<dyn UnitGenerator> + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Namespace(BTreeMap<String, Entry>),
    Factory(UgenFactory),
}

/// Dotted namespace of unit generator factories
#[derive(Clone)]
pub struct UgenRegistry {
    root: BTreeMap<String, Entry>,
}

impl UgenRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// A registry holding the stock unit generators
    pub fn stock() -> Self {
        let mut registry = Self::new();
        crate::ugens::register_stock(&mut registry);
        registry
    }

    /// Register a factory under a dotted type name
    pub fn register<F>(&mut self, ugen: &str, factory: F) -> Result<()>
    where
        F: Fn(&UnitSpec) -> Box<dyn UnitGenerator> + Send + Sync + 'static,
    {
        path::set(self, &Path::parse(ugen), Arc::new(factory))
    }

    pub fn contains(&self, ugen: &str) -> bool {
        matches!(path::get(self, &Path::parse(ugen)), Ok(Some(_)))
    }

    /// Instantiate the unit generator registered under `ugen`
    pub fn create(&self, ugen: &str, spec: &UnitSpec) -> Result<Box<dyn UnitGenerator>> {
        path::invoke(self, &Path::parse(ugen), spec)
            .map_err(|_| Error::UnknownUnitGenerator(ugen.to_string()))
    }

    fn entry(&self, at: &[String]) -> Option<&Entry> {
        let (first, rest) = at.split_first()?;
        let mut entry = self.root.get(first)?;
        for key in rest {
            match entry {
                Entry::Namespace(children) => entry = children.get(key)?,
                Entry::Factory(_) => return None,
            }
        }
        Some(entry)
    }

    fn namespace_mut(&mut self, at: &[String]) -> Option<&mut BTreeMap<String, Entry>> {
        let mut namespace = &mut self.root;
        for key in at {
            match namespace.get_mut(key)? {
                Entry::Namespace(children) => namespace = children,
                Entry::Factory(_) => return None,
            }
        }
        Some(namespace)
    }
}

impl Default for UgenRegistry {
    fn default() -> Self {
        Self::stock()
    }
}

impl fmt::Debug for UgenRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UgenRegistry")
            .field("namespaces", &self.root.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Addressable for UgenRegistry {
    type Cursor = Vec<String>;
    type Value = UgenFactory;

    fn root(&self) -> Vec<String> {
        Vec::new()
    }

    fn descend(&self, at: &Vec<String>, segment: &Segment) -> Option<Vec<String>> {
        let mut next = at.clone();
        next.push(segment.key());
        self.entry(&next).map(|_| next)
    }

    fn read(&self, at: &Vec<String>) -> Option<UgenFactory> {
        match self.entry(at)? {
            Entry::Factory(factory) => Some(factory.clone()),
            Entry::Namespace(_) => None,
        }
    }
}

impl AddressableMut for UgenRegistry {
    fn is_container(&self, at: &Vec<String>) -> bool {
        at.is_empty() || matches!(self.entry(at), Some(Entry::Namespace(_)))
    }

    fn create(&mut self, at: &Vec<String>, segment: &Segment) -> Option<Vec<String>> {
        let namespace = self.namespace_mut(at)?;
        namespace.insert(segment.key(), Entry::Namespace(BTreeMap::new()));
        let mut next = at.clone();
        next.push(segment.key());
        Some(next)
    }

    fn write(&mut self, at: &Vec<String>, segment: &Segment, value: UgenFactory) -> bool {
        match self.namespace_mut(at) {
            Some(namespace) => {
                namespace.insert(segment.key(), Entry::Factory(value));
                true
            }
            None => false,
        }
    }
}

impl Callable for UgenRegistry {
    type Args = UnitSpec;
    type Output = Box<dyn UnitGenerator>;

    fn call(&self, at: &Vec<String>, spec: &UnitSpec) -> Option<Box<dyn UnitGenerator>> {
        match self.entry(at)? {
            Entry::Factory(factory) => Some(factory(spec)),
            Entry::Namespace(_) => None,
        }
    }
}

/// Result of compiling a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub root: NodeId,
    /// Every node created, inputs before the nodes reading them; `root` is last
    pub nodes: Vec<NodeId>,
}

impl Compiled {
    /// The nodes created for the root's inputs
    pub fn inputs(&self) -> &[NodeId] {
        &self.nodes[..self.nodes.len().saturating_sub(1)]
    }
}

/// Turns definitions into nodes stored in a [`NodeCache`].
///
/// Compiled nodes are stored but not registered; the caller decides how they
/// join the cache's views. On failure nothing is left behind.
pub trait GraphCompiler: Send + Sync {
    /// Compile one node and its inputs
    fn compile_node(
        &self,
        def: &NodeDef,
        settings: &AudioSettings,
        cache: &mut NodeCache,
    ) -> Result<Compiled>;

    /// Compile a whole synth graph whose root writes to the output buses
    fn compile_graph(
        &self,
        def: &NodeDef,
        settings: &AudioSettings,
        cache: &mut NodeCache,
    ) -> Result<Compiled>;
}

/// The stock compiler backed by a [`UgenRegistry`]
#[derive(Debug, Clone, Default)]
pub struct DefinitionCompiler {
    registry: UgenRegistry,
}

impl DefinitionCompiler {
    pub fn new(registry: UgenRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &UgenRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut UgenRegistry {
        &mut self.registry
    }

    fn build(
        &self,
        def: &NodeDef,
        settings: &AudioSettings,
        cache: &mut NodeCache,
        created: &mut Vec<NodeId>,
    ) -> Result<Input> {
        match def {
            NodeDef::Scalar(value) => {
                let id = cache.insert(Node::value(*value));
                created.push(id);
                Ok(Input::Node(id))
            }
            NodeDef::List(defs) => {
                let mut ids = Vec::with_capacity(defs.len());
                for def in defs {
                    match self.build(def, settings, cache, created)? {
                        Input::Node(id) => ids.push(id),
                        Input::List(_) => {
                            return Err(Error::InvalidDefinition(
                                "list inputs cannot be nested".to_string(),
                            ))
                        }
                    }
                }
                Ok(Input::List(ids))
            }
            NodeDef::Unit(unit) => {
                let node = if unit.ugen == VALUE_UGEN {
                    let value = unit.options.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                    Node::value(value)
                } else {
                    let mut inputs = Inputs::new();
                    for (name, input) in &unit.inputs {
                        inputs.set(name.as_str(), self.build(input, settings, cache, created)?);
                    }
                    let spec = UnitSpec {
                        options: unit.options.clone(),
                        rate: unit.rate,
                        settings: *settings,
                    };
                    let generator = self.registry.create(&unit.ugen, &spec)?;
                    Node::processing(generator, unit.rate.block_size(settings)).with_inputs(inputs)
                };
                let node = match &unit.id {
                    Some(id) => node.with_id(id.as_str()),
                    None => node,
                };
                let id = cache.insert(node);
                created.push(id);
                Ok(Input::Node(id))
            }
        }
    }
}

fn is_output(def: &NodeDef) -> bool {
    matches!(def, NodeDef::Unit(unit) if unit.ugen == OUT_UGEN)
}

impl GraphCompiler for DefinitionCompiler {
    fn compile_node(
        &self,
        def: &NodeDef,
        settings: &AudioSettings,
        cache: &mut NodeCache,
    ) -> Result<Compiled> {
        let mut created = Vec::new();
        let result = match self.build(def, settings, cache, &mut created) {
            Ok(Input::Node(root)) => Ok(root),
            Ok(Input::List(_)) => Err(Error::InvalidDefinition(
                "a list does not compile to a single node".to_string(),
            )),
            Err(e) => Err(e),
        };
        match result {
            Ok(root) => Ok(Compiled {
                root,
                nodes: created,
            }),
            Err(e) => {
                cache.discard(&created);
                Err(e)
            }
        }
    }

    fn compile_graph(
        &self,
        def: &NodeDef,
        settings: &AudioSettings,
        cache: &mut NodeCache,
    ) -> Result<Compiled> {
        if is_output(def) {
            return self.compile_node(def, settings, cache);
        }
        let wrapped: NodeDef = UnitDef::new(OUT_UGEN)
            .with_id(OUTPUT_NODE_ID)
            .with_input("sources", def.clone())
            .with_input("bus", 0.0)
            .with_option("expand", settings.channels as u64)
            .into();
        self.compile_node(&wrapped, settings, cache)
    }
}
