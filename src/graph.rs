//! Node Graph and Node Cache
//!
//! A synth's nodes live in an arena owned by its [`NodeCache`]. Nodes refer to
//! each other through named inputs holding [`NodeId`]s, so identity is the arena
//! key. The cache keeps three coupled views over the arena:
//!
//! - `all` - every registered node
//! - `active` - the registered nodes with a generation step, in evaluation order
//! - `named` - identifier to node, last write wins
//!
//! and implements live graph editing (`add`, `remove`, `swap`, `replace`) on top
//! of them.

use crate::path::{Addressable, AddressableMut, Segment};
use crate::unit::{BlockContext, InputSignals, UnitGenerator};
use slotmap::{DefaultKey, SlotMap};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Unique identifier for a node within a synth
pub type NodeId = DefaultKey;

/// What a named input holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Node(NodeId),
    /// Ordered multi-source input, such as an output's `sources`
    List(Vec<NodeId>),
}

impl Input {
    pub fn ids(&self) -> &[NodeId] {
        match self {
            Input::Node(id) => std::slice::from_ref(id),
            Input::List(ids) => ids,
        }
    }
}

/// A node's named inputs, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inputs {
    entries: Vec<(String, Input)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Input> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, i)| i)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Input> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, i)| i)
    }

    /// Set an input, keeping its position if it already exists
    pub fn set(&mut self, name: impl Into<String>, input: Input) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(slot) => *slot = input,
            None => self.entries.push((name, input)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Input> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.entries.iter().map(|(n, i)| (n.as_str(), i))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Every node referenced by any input
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().flat_map(|(_, i)| i.ids().iter().copied())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The kind of a node. Only `Processing` nodes are evaluated.
pub enum NodeKind {
    /// A scalar tap with no generation step
    Value(f64),
    Processing(Box<dyn UnitGenerator>),
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Value(v) => f.debug_tuple("Value").field(v).finish(),
            NodeKind::Processing(unit) => f.debug_tuple("Processing").field(&unit.type_name()).finish(),
        }
    }
}

/// A node in a synth graph
#[derive(Debug)]
pub struct Node {
    id: Option<String>,
    inputs: Inputs,
    kind: NodeKind,
    output: Vec<f32>,
    block_size: usize,
}

impl Node {
    /// A constant value node
    pub fn value(value: f64) -> Self {
        Self {
            id: None,
            inputs: Inputs::new(),
            kind: NodeKind::Value(value),
            output: vec![value as f32],
            block_size: 1,
        }
    }

    /// A processing node producing `block_size` samples per block
    pub fn processing(unit: Box<dyn UnitGenerator>, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            id: None,
            inputs: Inputs::new(),
            kind: NodeKind::Processing(unit),
            output: vec![0.0; block_size],
            block_size,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Inputs) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut Inputs {
        &mut self.inputs
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn output(&self) -> &[f32] {
        &self.output
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether this node has a generation step
    pub fn is_active(&self) -> bool {
        matches!(self.kind, NodeKind::Processing(_))
    }

    /// The payload of a value node
    pub fn scalar(&self) -> Option<f64> {
        match self.kind {
            NodeKind::Value(v) => Some(v),
            NodeKind::Processing(_) => None,
        }
    }
}

/// How much of a replaced node's wiring the replacement inherits
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reattach {
    #[default]
    None,
    /// Take over every input of the previous node
    All,
    /// Take over only the named inputs
    Only(Vec<String>),
}

impl Reattach {
    pub fn only<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Reattach::Only(names.into_iter().map(Into::into).collect())
    }

    fn subset(&self) -> Option<&[String]> {
        match self {
            Reattach::Only(names) => Some(names),
            _ => None,
        }
    }
}

impl From<bool> for Reattach {
    fn from(reattach: bool) -> Self {
        if reattach {
            Reattach::All
        } else {
            Reattach::None
        }
    }
}

/// Registry of a synth's nodes
#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: SlotMap<NodeId, Node>,
    all: Vec<NodeId>,
    active: Vec<NodeId>,
    named: HashMap<String, NodeId>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a node without registering it in any view
    pub fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.insert(node)
    }

    /// Drop stored nodes that were never registered
    pub(crate) fn discard(&mut self, ids: &[NodeId]) {
        for id in ids {
            if !self.all.contains(id) {
                self.nodes.remove(*id);
            }
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn named(&self, name: &str) -> Option<NodeId> {
        self.named.get(name).copied()
    }

    pub fn named_nodes(&self) -> &HashMap<String, NodeId> {
        &self.named
    }

    pub fn all(&self) -> &[NodeId] {
        &self.all
    }

    pub fn active(&self) -> &[NodeId] {
        &self.active
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.all.contains(&id)
    }

    /// Number of stored nodes, registered or not
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Register nodes: every node joins `all`, nodes with a generation step
    /// join `active`, and identified nodes overwrite their `named` entry.
    pub fn add(&mut self, ids: &[NodeId]) {
        for &id in ids {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if self.all.contains(&id) {
                continue;
            }
            self.all.push(id);
            if node.is_active() {
                self.active.push(id);
            }
            if let Some(name) = node.id() {
                self.named.insert(name.to_string(), id);
            }
        }
    }

    /// Unregister and drop nodes. With `recursive`, everything reachable through
    /// their inputs goes too.
    pub fn remove(&mut self, ids: &[NodeId], recursive: bool) {
        self.remove_except(ids, recursive, &HashSet::new());
    }

    fn remove_except(&mut self, ids: &[NodeId], recursive: bool, keep: &HashSet<NodeId>) {
        let mut pending: Vec<NodeId> = ids.iter().rev().copied().collect();
        let mut visited = HashSet::new();

        while let Some(id) = pending.pop() {
            if keep.contains(&id) || !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.remove(id) else {
                continue;
            };
            self.active.retain(|n| *n != id);
            self.all.retain(|n| *n != id);
            if let Some(name) = node.id() {
                if self.named.get(name) == Some(&id) {
                    self.named.remove(name);
                }
            }
            if recursive {
                pending.extend(node.inputs.node_ids());
            }
        }
    }

    /// Copy inputs from `previous` onto `current`: only the listed names, or the
    /// whole mapping when `subset` is `None`
    pub fn reattach_inputs(&mut self, current: NodeId, previous: NodeId, subset: Option<&[String]>) {
        let Some(inherited) = self.nodes.get(previous).map(|n| n.inputs.clone()) else {
            return;
        };
        let Some(node) = self.nodes.get_mut(current) else {
            return;
        };
        match subset {
            Some(names) => {
                for name in names {
                    match inherited.get(name) {
                        Some(input) => node.inputs.set(name.as_str(), input.clone()),
                        None => {
                            node.inputs.remove(name);
                        }
                    }
                }
            }
            None => node.inputs = inherited,
        }
    }

    /// Point active nodes that read from `previous` at `current`.
    ///
    /// Only the first matching input of each node is rewritten, and list inputs
    /// are not searched.
    pub fn replace_active_output(&mut self, current: NodeId, previous: NodeId) {
        let target = Input::Node(previous);
        for &id in &self.active {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if let Some(slot) = node.inputs.entries.iter_mut().find(|(_, i)| *i == target) {
                slot.1 = Input::Node(current);
            }
        }
    }

    /// Pairwise reattach and rewire `new[i]` in place of `prev[i]`
    pub fn swap(&mut self, new: &[NodeId], prev: &[NodeId], subset: Option<&[String]>) {
        for (&current, &previous) in new.iter().zip(prev) {
            self.reattach_inputs(current, previous, subset);
            self.replace_active_output(current, previous);
        }
    }

    /// Substitute `new` for `prev` in the live graph.
    ///
    /// The previous subgraph is torn down, except for nodes the new one still
    /// reaches (inputs it inherited through reattachment). Inputs the new nodes
    /// lost to reattachment are torn down as well.
    pub fn replace(&mut self, new: &[NodeId], prev: &[NodeId], reattach: &Reattach) {
        let before = self.reachable(new);
        if *reattach != Reattach::None {
            self.swap(new, prev, reattach.subset());
        }
        let keep = self.reachable(new);
        let orphaned: Vec<NodeId> = before.difference(&keep).copied().collect();

        self.remove_except(prev, true, &keep);
        self.remove_except(&orphaned, true, &keep);
        self.add(new);

        debug!(
            replaced = prev.len(),
            added = new.len(),
            active = self.active.len(),
            "replaced nodes"
        );
    }

    /// Every node reachable from `roots` through inputs, roots included
    pub fn reachable(&self, roots: &[NodeId]) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if seen.insert(id) {
                stack.extend(node.inputs.node_ids());
            }
        }
        seen
    }

    /// Run a node's change hook
    pub fn notify_input_changed(&mut self, owner: NodeId, input: &str) {
        if let Some(Node {
            kind: NodeKind::Processing(unit),
            ..
        }) = self.nodes.get_mut(owner)
        {
            unit.on_input_changed(input);
        }
    }

    /// Evaluate every active node in order
    pub fn gen(&mut self, ctx: &mut BlockContext<'_>) {
        for i in 0..self.active.len() {
            let id = self.active[i];
            self.eval(id, ctx);
        }
    }

    fn eval(&mut self, id: NodeId, ctx: &mut BlockContext<'_>) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !node.is_active() {
            return;
        }

        // The unit and its output are detached while it runs so the rest of the
        // arena can be read as its inputs.
        let mut kind = std::mem::replace(&mut node.kind, NodeKind::Value(0.0));
        let mut output = std::mem::take(&mut node.output);
        let block_size = node.block_size;

        if let (NodeKind::Processing(unit), Some(node)) = (&mut kind, self.nodes.get(id)) {
            let inputs = InputSignals::new(&node.inputs, &self.nodes);
            unit.gen(block_size, &inputs, &mut output, ctx);
        }

        if let Some(node) = self.nodes.get_mut(id) {
            node.kind = kind;
            node.output = output;
        }
    }
}

/// A location in a synth graph reached by a [`Path`](crate::path::Path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// The named-node table
    Root,
    Node(NodeId),
    /// A node's input mapping
    Inputs(NodeId),
    /// A list input of a node
    List(NodeId, String),
}

/// What a graph path resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(NodeId),
    List(Vec<NodeId>),
}

impl From<Target> for Input {
    fn from(target: Target) -> Self {
        match target {
            Target::Node(id) => Input::Node(id),
            Target::List(ids) => Input::List(ids),
        }
    }
}

impl Addressable for NodeCache {
    type Cursor = Location;
    type Value = Target;

    fn root(&self) -> Location {
        Location::Root
    }

    fn descend(&self, at: &Location, segment: &Segment) -> Option<Location> {
        let live = |id: NodeId| self.nodes.contains_key(id).then_some(Location::Node(id));
        match (at, segment) {
            (Location::Root, Segment::Field(name)) => live(self.named(name)?),
            (Location::Node(id), Segment::Inputs) => {
                self.nodes.contains_key(*id).then_some(Location::Inputs(*id))
            }
            (Location::Inputs(id), Segment::Field(name)) => {
                match self.nodes.get(*id)?.inputs.get(name)? {
                    Input::Node(child) => live(*child),
                    Input::List(_) => Some(Location::List(*id, name.clone())),
                }
            }
            (Location::List(id, name), Segment::Index(i)) => {
                match self.nodes.get(*id)?.inputs.get(name)? {
                    Input::List(ids) => live(*ids.get(*i)?),
                    Input::Node(_) => None,
                }
            }
            _ => None,
        }
    }

    fn read(&self, at: &Location) -> Option<Target> {
        match at {
            Location::Node(id) => Some(Target::Node(*id)),
            Location::List(id, name) => match self.nodes.get(*id)?.inputs.get(name)? {
                Input::List(ids) => Some(Target::List(ids.clone())),
                Input::Node(child) => Some(Target::Node(*child)),
            },
            Location::Root | Location::Inputs(_) => None,
        }
    }
}

impl AddressableMut for NodeCache {
    fn is_container(&self, _at: &Location) -> bool {
        true
    }

    fn create(&mut self, _at: &Location, _segment: &Segment) -> Option<Location> {
        None
    }

    fn write(&mut self, at: &Location, segment: &Segment, value: Target) -> bool {
        match (at, segment, value) {
            (Location::Root, Segment::Field(name), Target::Node(id)) => {
                self.named.insert(name.clone(), id);
                true
            }
            (Location::Inputs(owner), Segment::Field(name), value) => match self.nodes.get_mut(*owner) {
                Some(node) => {
                    node.inputs.set(name.as_str(), value.into());
                    true
                }
                None => false,
            },
            (Location::List(owner, name), Segment::Index(i), Target::Node(id)) => {
                let Some(Input::List(ids)) = self
                    .nodes
                    .get_mut(*owner)
                    .and_then(|node| node.inputs.get_mut(name))
                else {
                    return false;
                };
                if *i < ids.len() {
                    ids[*i] = id;
                } else if *i == ids.len() {
                    ids.push(id);
                } else {
                    return false;
                }
                true
            }
            _ => false,
        }
    }

    fn can_write(&self, at: &Location, segment: &Segment, value: &Target) -> bool {
        match (at, segment, value) {
            (Location::Root, Segment::Field(_), Target::Node(_)) => true,
            (Location::Inputs(owner), Segment::Field(_), _) => self.nodes.contains_key(*owner),
            (Location::List(owner, name), Segment::Index(i), Target::Node(_)) => matches!(
                self.nodes.get(*owner).and_then(|node| node.inputs.get(name)),
                Some(Input::List(ids)) if *i <= ids.len()
            ),
            _ => false,
        }
    }
}
