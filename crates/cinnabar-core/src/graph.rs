//! Precompiled operator-graph representation.
//!
//! The graph loader and optimizer are external collaborators; this module
//! defines the structured form they hand to the session: nodes with
//! attributes, a tensor table keyed by name, and per-domain opset versions.
//! Graphs are acyclic by construction (enforced by the loader, not here).

use crate::types::{DataType, TensorShape};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a node in the graph.
pub type NodeId = usize;

/// Unique identifier for a tensor in the graph.
pub type TensorId = usize;

/// A precompiled operator graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// All nodes (operations) in the graph.
    pub nodes: Vec<Node>,

    /// All tensors in the graph, indexed by name.
    pub tensors: HashMap<String, TensorId>,

    /// Tensor metadata.
    pub tensor_info: Vec<TensorInfo>,

    /// Names of graph input tensors.
    pub inputs: Vec<String>,

    /// Names of graph output tensors.
    pub outputs: Vec<String>,

    /// Opset version per operator domain ("" is the default domain).
    pub opset_imports: HashMap<String, i64>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            tensors: HashMap::new(),
            tensor_info: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            opset_imports: HashMap::new(),
        }
    }

    /// Get tensor ID by name.
    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.tensors
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown tensor '{}'", name)))
    }

    /// Get tensor info by ID.
    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo> {
        self.tensor_info
            .get(id)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid tensor ID {}", id)))
    }

    /// Get tensor info by name.
    pub fn tensor_by_name(&self, name: &str) -> Result<&TensorInfo> {
        let id = self.tensor_id(name)?;
        self.tensor(id)
    }

    /// Add a tensor to the graph.
    pub fn add_tensor(&mut self, info: TensorInfo) -> TensorId {
        let id = self.tensor_info.len();
        let name = info.name.clone();
        self.tensor_info.push(info);
        self.tensors.insert(name, id);
        id
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        id
    }

    /// Opset version for an operator domain, defaulting to the default
    /// domain's version for unknown domains.
    pub fn opset_for(&self, domain: &str) -> i64 {
        self.opset_imports
            .get(domain)
            .or_else(|| self.opset_imports.get(""))
            .copied()
            .unwrap_or(1)
    }

    /// Validate graph structure: all named inputs, outputs, and node edges
    /// must reference tensors in the table. Empty names mark absent optional
    /// slots and are skipped.
    pub fn validate(&self) -> Result<()> {
        for input in &self.inputs {
            self.tensor_id(input)?;
        }
        for output in &self.outputs {
            self.tensor_id(output)?;
        }
        for node in &self.nodes {
            for input in &node.inputs {
                if !input.is_empty() {
                    self.tensor_id(input)?;
                }
            }
            for output in &node.outputs {
                if !output.is_empty() {
                    self.tensor_id(output)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// What role a tensor plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorKind {
    Input,
    Output,
    Intermediate,
    Initializer,
}

/// Metadata for one tensor in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor name.
    pub name: String,

    /// Element type.
    pub dtype: DataType,

    /// Shape, possibly with symbolic dimensions.
    pub shape: TensorShape,

    /// Role in the graph.
    pub kind: TensorKind,

    /// Constant data for initializer tensors (little-endian element bytes).
    pub initializer: Option<Vec<u8>>,
}

/// A node (operation) in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node name (may be empty).
    pub name: String,

    /// Operation type (e.g., "MaxPool", "LayerNormalization").
    pub op_type: String,

    /// Operator domain ("" is the default domain).
    pub domain: String,

    /// Input tensor names; "" marks an absent optional input.
    pub inputs: Vec<String>,

    /// Output tensor names; "" marks an unrequested optional output.
    pub outputs: Vec<String>,

    /// Configuration values fixed at kernel-construction time.
    pub attributes: HashMap<String, AttributeValue>,
}

impl Node {
    /// Create a new node.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            domain: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    /// Get a typed attribute value.
    pub fn attr<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<AttributeValue, Error = String>,
    {
        let value = self.attributes.get(name).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "node '{}' is missing attribute '{}'",
                self.op_type, name
            ))
        })?;
        T::try_from(value.clone()).map_err(|e| {
            Error::InvalidArgument(format!(
                "attribute '{}' on '{}': {}",
                name, self.op_type, e
            ))
        })
    }

    /// Get a typed attribute value, falling back to a default when absent.
    pub fn attr_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: TryFrom<AttributeValue, Error = String>,
    {
        if self.attributes.contains_key(name) {
            self.attr(name)
        } else {
            Ok(default)
        }
    }

    /// Check if an attribute exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Whether the node declares (and a consumer requested) output slot `i`.
    pub fn has_output(&self, i: usize) -> bool {
        self.outputs.get(i).is_some_and(|name| !name.is_empty())
    }

    /// Builder-style attribute insertion, mostly for tests and loaders.
    pub fn with_attr(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// Attribute value types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl TryFrom<AttributeValue> for f32 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Float(v) => Ok(v),
            other => Err(format!("expected float, got {:?}", other)),
        }
    }
}

impl TryFrom<AttributeValue> for i64 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Int(v) => Ok(v),
            other => Err(format!("expected int, got {:?}", other)),
        }
    }
}

impl TryFrom<AttributeValue> for String {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::String(v) => Ok(v),
            other => Err(format!("expected string, got {:?}", other)),
        }
    }
}

impl TryFrom<AttributeValue> for Vec<i64> {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Ints(v) => Ok(v),
            other => Err(format!("expected ints, got {:?}", other)),
        }
    }
}

impl TryFrom<AttributeValue> for Vec<f32> {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Floats(v) => Ok(v),
            other => Err(format!("expected floats, got {:?}", other)),
        }
    }
}
