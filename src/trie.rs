//! Build-time sample trie.
//!
//! Samples arrive sorted in the partition's rotated order. Each trie level
//! branches on the next window of bits; a leaf holds a single sample and is
//! split when a second sample reaches it.

use std::collections::VecDeque;

use crate::index::{Index, TrieNode};
use crate::plan::Range;
use crate::record::Code;
use crate::window::{is_valid_size, Window};
use crate::{FbiError, DATA_BIT};

#[derive(Debug, Default)]
struct Node {
    range: Range,
    kind: NodeKind,
}

#[derive(Debug, Default)]
enum NodeKind {
    #[default]
    Empty,
    Leaf {
        code: Code,
        position: u32,
    },
    Internal(Vec<Node>),
}

impl Node {
    fn insert(&mut self, code: &Code, position: u32, window: Window) {
        match self.kind {
            NodeKind::Empty => {
                self.kind = NodeKind::Leaf {
                    code: *code,
                    position,
                };
                return;
            }
            NodeKind::Leaf {
                code: held,
                position: held_position,
            } => {
                // every bit consumed: the codes are identical, keep the first
                if !window.has_remaining() {
                    return;
                }
                let mut children: Vec<Node> =
                    (0..window.fanout()).map(|_| Node::default()).collect();
                children[window.peek(&held) as usize].kind = NodeKind::Leaf {
                    code: held,
                    position: held_position,
                };
                self.kind = NodeKind::Internal(children);
            }
            NodeKind::Internal(_) => {}
        }
        if let NodeKind::Internal(children) = &mut self.kind {
            children[window.peek(code) as usize].insert(code, position, window.next());
        }
    }

    /// Pre-order pass: a node starts at the last sample seen before it.
    fn assign_begin(&mut self, cursor: &mut u32) {
        self.range.offset = *cursor as usize;
        match &mut self.kind {
            NodeKind::Internal(children) => {
                for child in children.iter_mut() {
                    child.assign_begin(cursor);
                }
            }
            NodeKind::Leaf { position, .. } => {
                assert!(*position >= *cursor, "samples inserted out of order");
                *cursor = *position;
            }
            NodeKind::Empty => {}
        }
    }

    /// Reverse pass: a node ends at the first sample seen after it.
    fn assign_end(&mut self, cursor: &mut u32) {
        let end = *cursor as usize;
        assert!(end >= self.range.offset, "node ends before it starts");
        self.range.length = end - self.range.offset;
        match &mut self.kind {
            NodeKind::Internal(children) => {
                for child in children.iter_mut().rev() {
                    child.assign_end(cursor);
                }
            }
            NodeKind::Leaf { position, .. } => {
                assert!(*position < *cursor, "samples inserted out of order");
                *cursor = *position;
            }
            NodeKind::Empty => {}
        }
    }
}

/// Accumulates sorted samples of one partition and flattens them into an [`Index`].
#[derive(Debug)]
pub struct TrieBuilder {
    root: Node,
    first_offset: u32,
    sample_skip: u32,
    samples: u32,
}

impl TrieBuilder {
    /// Start a trie for the partition at bit `first_offset`, branching on
    /// `sample_skip` bits per level.
    pub fn new(first_offset: u32, sample_skip: u32) -> Result<Self, FbiError> {
        if first_offset as usize >= DATA_BIT {
            return Err(FbiError::InvalidConfig(
                "first offset must lie inside the code",
            ));
        }
        if !is_valid_size(sample_skip) {
            return Err(FbiError::InvalidConfig(
                "sample skip must be a power of two between 1 and 16",
            ));
        }
        Ok(Self {
            root: Node::default(),
            first_offset,
            sample_skip,
            samples: 0,
        })
    }

    /// Insert the next sample; its position is the number of samples seen so far.
    pub fn insert(&mut self, code: &Code) {
        let window = Window::new(self.sample_skip, self.first_offset);
        self.root.insert(code, self.samples, window);
        self.samples += 1;
    }

    /// Number of samples inserted.
    pub fn len(&self) -> usize {
        self.samples as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Assign ranges and lay the nodes out breadth first, children of a node
    /// in one contiguous block.
    pub fn finish(mut self) -> Index {
        let mut begin = 0u32;
        self.root.assign_begin(&mut begin);
        let mut end = self.samples;
        self.root.assign_end(&mut end);

        let mut nodes = vec![TrieNode {
            range: self.root.range,
            child_base: 0,
        }];
        let mut queue = VecDeque::new();
        queue.push_back((0usize, &self.root));
        while let Some((slot, node)) = queue.pop_front() {
            if let NodeKind::Internal(children) = &node.kind {
                nodes[slot].child_base = nodes.len() as u32;
                for child in children {
                    queue.push_back((nodes.len(), child));
                    nodes.push(TrieNode {
                        range: child.range,
                        child_base: 0,
                    });
                }
            }
        }

        Index::from_parts(self.first_offset, self.sample_skip, nodes)
    }
}
