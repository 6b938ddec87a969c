//! Profile trees: the unit of data appended to and read back from a series
//!
//! A profile is a call tree whose nodes carry flat (self) and cumulative
//! (self + descendants) values, optionally split by sample labels. The tree is
//! stored as an arena in breadth-first order: every node addresses its
//! children as a contiguous index range, so there is no per-node allocation
//! and no pointer chasing.
//!
//! ```text
//! index: 0      1      2      3
//!        root   main   gc     work
//!        [1..3) [3..4) [4..4) [4..4)
//! ```
//!
//! Series do not store trees. They store one value column per [`NodeKey`]
//! (root-first location path plus sample labels) and rebuild the tree from
//! those columns when queried.
//!
//! # Example
//!
//! ```rust
//! use kuba_profstore::profile::{ProfileTreeBuilder, SampleLabels};
//!
//! let mut builder = ProfileTreeBuilder::new();
//! // stacks are leaf first: work <- main
//! builder.add_sample(&[3, 1], 10, SampleLabels::default());
//! builder.add_sample(&[2, 1], 5, SampleLabels::default());
//! let tree = builder.build();
//!
//! assert_eq!(tree.total(), 15);
//! let main = &tree.children(tree.root())[0];
//! assert_eq!(main.location_id, 1);
//! assert_eq!(tree.children(main).len(), 2);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::ProfileMeta;

/// Location id of the synthetic root node
pub const ROOT_LOCATION_ID: u64 = 0;

/// String and numeric labels attached to a sample, sorted by key
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SampleLabels {
    /// String labels
    pub labels: BTreeMap<String, Vec<String>>,
    /// Numeric labels
    pub num_labels: BTreeMap<String, Vec<i64>>,
}

impl SampleLabels {
    /// Build from string labels only
    pub fn from_labels(pairs: &[(&str, &str)]) -> Self {
        let mut labels: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (k, v) in pairs {
            labels.entry(k.to_string()).or_default().push(v.to_string());
        }
        Self {
            labels,
            num_labels: BTreeMap::new(),
        }
    }

    /// Check if no labels are set
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.num_labels.is_empty()
    }
}

/// A value split out by its sample labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabeledValue {
    /// Labels the value is attributed to
    pub labels: SampleLabels,
    /// Sample value
    pub value: i64,
}

/// Identity of one value column within a series
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    /// Location ids from the first frame below the root down to the node
    pub location_ids: Vec<u64>,
    /// Sample labels of the values in this column
    pub labels: SampleLabels,
}

/// Flat and cumulative value of one [`NodeKey`] within a profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeValues {
    /// Self value
    pub flat: i64,
    /// Self plus descendants
    pub cumulative: i64,
}

/// One node of a [`ProfileTree`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTreeNode {
    /// Location (stack frame) id; [`ROOT_LOCATION_ID`] for the root
    pub location_id: u64,
    /// Self values, one per distinct label set
    pub flat: Vec<LabeledValue>,
    /// Cumulative values, one per distinct label set
    pub cumulative: Vec<LabeledValue>,
    /// Arena indices of this node's children
    pub children: Range<usize>,
}

impl ProfileTreeNode {
    /// Sum of flat values over all label sets
    pub fn flat_total(&self) -> i64 {
        self.flat.iter().map(|v| v.value).sum()
    }

    /// Sum of cumulative values over all label sets
    pub fn cumulative_total(&self) -> i64 {
        self.cumulative.iter().map(|v| v.value).sum()
    }
}

/// Arena-backed call tree in breadth-first order, root at index 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTree {
    nodes: Vec<ProfileTreeNode>,
}

impl ProfileTree {
    /// The root node
    pub fn root(&self) -> &ProfileTreeNode {
        &self.nodes[0]
    }

    /// All nodes in breadth-first order
    pub fn nodes(&self) -> &[ProfileTreeNode] {
        &self.nodes
    }

    /// Children of `node`
    pub fn children(&self, node: &ProfileTreeNode) -> &[ProfileTreeNode] {
        &self.nodes[node.children.clone()]
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree holds nothing but the root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Total value of the profile (root cumulative)
    pub fn total(&self) -> i64 {
        self.root().cumulative_total()
    }

    /// Flat and cumulative value of every column in the tree
    pub fn node_values(&self) -> BTreeMap<NodeKey, NodeValues> {
        let mut out: BTreeMap<NodeKey, NodeValues> = BTreeMap::new();
        let mut stack: Vec<(usize, Vec<u64>)> = vec![(0, Vec::new())];

        while let Some((index, path)) = stack.pop() {
            let node = &self.nodes[index];
            for v in &node.flat {
                out.entry(NodeKey {
                    location_ids: path.clone(),
                    labels: v.labels.clone(),
                })
                .or_default()
                .flat += v.value;
            }
            for v in &node.cumulative {
                out.entry(NodeKey {
                    location_ids: path.clone(),
                    labels: v.labels.clone(),
                })
                .or_default()
                .cumulative += v.value;
            }
            for child in node.children.clone() {
                let mut child_path = path.clone();
                child_path.push(self.nodes[child].location_id);
                stack.push((child, child_path));
            }
        }

        out
    }
}

impl Default for ProfileTree {
    fn default() -> Self {
        ProfileTreeBuilder::new().build()
    }
}

#[derive(Debug)]
struct BuilderNode {
    location_id: u64,
    children: BTreeMap<u64, usize>,
    flat: BTreeMap<SampleLabels, i64>,
    cumulative: BTreeMap<SampleLabels, i64>,
}

impl BuilderNode {
    fn new(location_id: u64) -> Self {
        Self {
            location_id,
            children: BTreeMap::new(),
            flat: BTreeMap::new(),
            cumulative: BTreeMap::new(),
        }
    }
}

/// Incrementally builds a [`ProfileTree`]
///
/// Children end up ordered by location id.
#[derive(Debug)]
pub struct ProfileTreeBuilder {
    nodes: Vec<BuilderNode>,
}

impl ProfileTreeBuilder {
    /// Create a builder holding only the root
    pub fn new() -> Self {
        Self {
            nodes: vec![BuilderNode::new(ROOT_LOCATION_ID)],
        }
    }

    fn child(&mut self, parent: usize, location_id: u64) -> usize {
        if let Some(&index) = self.nodes[parent].children.get(&location_id) {
            return index;
        }
        let index = self.nodes.len();
        self.nodes.push(BuilderNode::new(location_id));
        self.nodes[parent].children.insert(location_id, index);
        index
    }

    /// Add one sample whose stack is given leaf first
    ///
    /// The value counts as flat at the leaf and as cumulative on every node
    /// from the root down to the leaf.
    pub fn add_sample(&mut self, stack: &[u64], value: i64, labels: SampleLabels) {
        let mut node = 0;
        *self.nodes[node].cumulative.entry(labels.clone()).or_default() += value;
        for &location_id in stack.iter().rev() {
            node = self.child(node, location_id);
            *self.nodes[node].cumulative.entry(labels.clone()).or_default() += value;
        }
        *self.nodes[node].flat.entry(labels).or_default() += value;
    }

    /// Add explicit values to the node at `key`'s root-first path
    pub fn insert(&mut self, key: &NodeKey, values: NodeValues) {
        let mut node = 0;
        for &location_id in &key.location_ids {
            node = self.child(node, location_id);
        }
        let node = &mut self.nodes[node];
        if values.flat != 0 {
            *node.flat.entry(key.labels.clone()).or_default() += values.flat;
        }
        if values.cumulative != 0 {
            *node.cumulative.entry(key.labels.clone()).or_default() += values.cumulative;
        }
    }

    /// Flatten into a breadth-first arena
    pub fn build(self) -> ProfileTree {
        let mut order: Vec<usize> = Vec::with_capacity(self.nodes.len());
        let mut ranges: Vec<Range<usize>> = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([0usize]);
        let mut next = 1;

        while let Some(index) = queue.pop_front() {
            let children = &self.nodes[index].children;
            ranges.push(next..next + children.len());
            next += children.len();
            order.push(index);
            queue.extend(children.values().copied());
        }

        let mut nodes = self.nodes.into_iter().map(Some).collect::<Vec<_>>();
        let arena = order
            .into_iter()
            .zip(ranges)
            .filter_map(|(index, children)| {
                let node = nodes[index].take()?;
                Some(ProfileTreeNode {
                    location_id: node.location_id,
                    flat: labeled_values(node.flat),
                    cumulative: labeled_values(node.cumulative),
                    children,
                })
            })
            .collect();

        ProfileTree { nodes: arena }
    }
}

impl Default for ProfileTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn labeled_values(values: BTreeMap<SampleLabels, i64>) -> Vec<LabeledValue> {
    values
        .into_iter()
        .filter(|(_, value)| *value != 0)
        .map(|(labels, value)| LabeledValue { labels, value })
        .collect()
}

/// A profile as appended to a series: metadata plus its call tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Schema and timing of the profile
    pub meta: ProfileMeta,
    /// Call tree
    pub tree: ProfileTree,
}

/// A profile read back from a series at a single timestamp
pub type InstantProfile = Profile;
