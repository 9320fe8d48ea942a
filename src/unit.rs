//! Node Capability Contract
//!
//! This module defines the interface every signal-processing node implements,
//! the read-only view of a node's inputs it sees while generating, and the
//! per-block context carrying the shared buses and loaded buffers.

use crate::buffers::BufferData;
use crate::environment::AudioSettings;
use crate::graph::{Input, Inputs, Node, NodeId};
use slotmap::SlotMap;
use std::collections::HashMap;

/// A signal-processing algorithm that runs once per block
pub trait UnitGenerator: Send {
    /// Generate `block_size` samples into `output`
    fn gen(
        &mut self,
        block_size: usize,
        inputs: &InputSignals<'_>,
        output: &mut [f32],
        ctx: &mut BlockContext<'_>,
    );

    /// Called after the named input has been replaced
    fn on_input_changed(&mut self, _input: &str) {}

    /// Unit generator type identifier, for debugging
    fn type_name(&self) -> &'static str {
        "unknown"
    }
}

/// Read a sample from a buffer; length-1 buffers hold constants
#[inline]
pub fn sample_at(buffer: &[f32], index: usize) -> f32 {
    match buffer.len() {
        0 => 0.0,
        1 => buffer[0],
        _ => buffer.get(index).copied().unwrap_or(0.0),
    }
}

/// The current output buffers of a node's inputs
pub struct InputSignals<'a> {
    inputs: &'a Inputs,
    nodes: &'a SlotMap<NodeId, Node>,
}

impl<'a> InputSignals<'a> {
    pub(crate) fn new(inputs: &'a Inputs, nodes: &'a SlotMap<NodeId, Node>) -> Self {
        Self { inputs, nodes }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inputs.get(name).is_some()
    }

    /// The output of the input node `name`, or of the first node of a list input
    pub fn signal(&self, name: &str) -> Option<&'a [f32]> {
        let id = match self.inputs.get(name)? {
            Input::Node(id) => *id,
            Input::List(ids) => *ids.first()?,
        };
        self.nodes.get(id).map(|node| node.output())
    }

    /// Every output connected to `name`, in list order
    pub fn signals(&self, name: &str) -> Vec<&'a [f32]> {
        let nodes = self.nodes;
        match self.inputs.get(name) {
            Some(Input::Node(id)) => nodes.get(*id).map(|n| n.output()).into_iter().collect(),
            Some(Input::List(ids)) => ids
                .iter()
                .filter_map(|id| nodes.get(*id).map(|n| n.output()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Sample `index` of input `name`, or `default` if it is not connected
    pub fn sample(&self, name: &str, index: usize, default: f32) -> f32 {
        self.signal(name)
            .map(|buffer| sample_at(buffer, index))
            .unwrap_or(default)
    }
}

/// Shared state visible to every node during one block
pub struct BlockContext<'a> {
    pub buses: &'a mut [Vec<f32>],
    pub buffers: &'a HashMap<String, BufferData>,
    pub settings: &'a AudioSettings,
}

impl<'a> BlockContext<'a> {
    pub fn new(
        buses: &'a mut [Vec<f32>],
        buffers: &'a HashMap<String, BufferData>,
        settings: &'a AudioSettings,
    ) -> Self {
        Self {
            buses,
            buffers,
            settings,
        }
    }

    pub fn bus(&self, index: usize) -> Option<&[f32]> {
        self.buses.get(index).map(|b| b.as_slice())
    }

    pub fn bus_mut(&mut self, index: usize) -> Option<&mut [f32]> {
        self.buses.get_mut(index).map(|b| b.as_mut_slice())
    }

    pub fn buffer(&self, name: &str) -> Option<&BufferData> {
        self.buffers.get(name)
    }
}
