use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::plan::{Range, Selection};
use crate::record::Code;
use crate::window::{is_valid_size, Window};
use crate::{FbiError, DATA_BIT};

/// Bytes of one persisted node: offset, length, child base.
const NODE_BYTES: usize = 12;

/// One flattened trie node.
///
/// `child_base == 0` marks a leaf; otherwise the children occupy
/// `[child_base, child_base + 2^sample_skip)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrieNode {
    pub range: Range,
    pub child_base: u32,
}

/// Read-only sample index of one partition.
///
/// The on-disk layout is little endian: `first_offset: u32`,
/// `sample_skip: u32`, `node_count: u32`, then `node_count` records of
/// `{range_offset: u32, range_length: u32, child_base: i32}`.
///
/// # Example
///
/// ```no_run
/// use fbi_rs::Index;
///
/// let index = Index::load_from_path("data/sample.0")?;
/// println!("{} samples, {} nodes", index.max(), index.nodes().len());
/// # Ok::<(), fbi_rs::FbiError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    first_offset: u32,
    sample_skip: u32,
    nodes: Vec<TrieNode>,
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn persist_u32(value: usize, what: &'static str) -> Result<u32, FbiError> {
    u32::try_from(value).map_err(|_| FbiError::InvalidPersistence(what))
}

impl Index {
    pub(crate) fn from_parts(first_offset: u32, sample_skip: u32, nodes: Vec<TrieNode>) -> Self {
        debug_assert!(!nodes.is_empty());
        Self {
            first_offset,
            sample_skip,
            nodes,
        }
    }

    /// Bit offset this partition starts reading codes at.
    pub fn first_offset(&self) -> u32 {
        self.first_offset
    }

    /// Bits consumed per trie level.
    pub fn sample_skip(&self) -> u32 {
        self.sample_skip
    }

    pub fn nodes(&self) -> &[TrieNode] {
        &self.nodes
    }

    /// Number of sample positions covered by the root.
    pub fn max(&self) -> usize {
        self.nodes[0].range.length
    }

    /// The whole partition.
    pub fn all(&self) -> Selection {
        Selection::single(self.nodes[0].range)
    }

    /// Narrow to the range of codes sharing the query's first `key_bits` bits
    /// (read from this partition's offset).
    ///
    /// When `key_bits` is not a multiple of `sample_skip`, the last level is
    /// resolved to the block of children whose leading bits match, spanning
    /// from the first to the last child of that block.
    pub fn lookup_one(&self, query: &Code, key_bits: u32) -> Range {
        let key_bits = key_bits.min(DATA_BIT as u32);
        let mut window = Window::new(self.sample_skip, self.first_offset);
        let mut levels = key_bits / self.sample_skip;
        let partial = key_bits % self.sample_skip;
        let mut cur = 0usize;
        while levels > 0 {
            let base = self.nodes[cur].child_base as usize;
            if base == 0 {
                break;
            }
            cur = base + window.peek(query) as usize;
            levels -= 1;
            window.advance();
        }

        let base = self.nodes[cur].child_base as usize;
        if levels > 0 || partial == 0 || base == 0 {
            return self.nodes[cur].range;
        }

        let tail = self.sample_skip - partial;
        let prefix = (window.peek(query) >> tail) as usize;
        let begin = prefix << tail;
        let end = ((prefix + 1) << tail) - 1;
        self.nodes[base + begin]
            .range
            .span_to(&self.nodes[base + end].range)
    }

    /// Ranges after every `step` bits of descent, `count` of them.
    ///
    /// Entry `i` narrows on the first `(i + 1) * step` bits. Once a leaf is
    /// reached its range repeats for the remaining entries.
    ///
    /// # Panics
    ///
    /// Panics if `step` is not a positive multiple of `sample_skip`.
    pub fn lookup_series(&self, query: &Code, step: u32, count: usize) -> Vec<Selection> {
        assert!(
            step > 0 && step % self.sample_skip == 0,
            "step {step} must be a multiple of sample skip {}",
            self.sample_skip
        );
        let mut out = Vec::with_capacity(count);
        let mut window = Window::new(self.sample_skip, self.first_offset);
        let mut cur = 0usize;
        let mut consumed = 0u32;
        while out.len() < count {
            let base = self.nodes[cur].child_base as usize;
            if base == 0 {
                break;
            }
            cur = base + window.peek(query) as usize;
            window.advance();
            consumed += self.sample_skip;
            if consumed % step == 0 {
                out.push(Selection::single(self.nodes[cur].range));
            }
        }
        while out.len() < count {
            out.push(Selection::single(self.nodes[cur].range));
        }
        out
    }

    /// Persist the index to the provided filesystem path.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), FbiError> {
        let file = File::create(path)?;
        self.save_to_writer(file)
    }

    /// Persist the index using the supplied writer.
    pub fn save_to_writer<W: Write>(&self, writer: W) -> Result<(), FbiError> {
        let mut writer = BufWriter::new(writer);
        write_u32(&mut writer, self.first_offset)?;
        write_u32(&mut writer, self.sample_skip)?;
        let count = persist_u32(self.nodes.len(), "node count exceeds persistence limits")?;
        write_u32(&mut writer, count)?;
        for node in &self.nodes {
            let offset =
                persist_u32(node.range.offset, "range offset exceeds persistence limits")?;
            let length =
                persist_u32(node.range.length, "range length exceeds persistence limits")?;
            let child_base = i32::try_from(node.child_base).map_err(|_| {
                FbiError::InvalidPersistence("child base exceeds persistence limits")
            })?;
            write_u32(&mut writer, offset)?;
            write_u32(&mut writer, length)?;
            writer.write_all(&child_base.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Load an index from the provided filesystem path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, FbiError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| FbiError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_from_reader(BufReader::new(file))
    }

    /// Load an index from a persisted byte stream, validating its structure.
    pub fn load_from_reader<R: Read>(reader: R) -> Result<Self, FbiError> {
        let mut reader = BufReader::new(reader);
        let first_offset = read_u32(&mut reader)?;
        if first_offset as usize >= DATA_BIT {
            return Err(FbiError::InvalidPersistence("first offset out of range"));
        }
        let sample_skip = read_u32(&mut reader)?;
        if !is_valid_size(sample_skip) {
            return Err(FbiError::InvalidPersistence("unsupported sample skip"));
        }
        let count = read_u32(&mut reader)? as usize;
        if count == 0 {
            return Err(FbiError::InvalidPersistence("index has no root node"));
        }

        let mut raw = vec![0u8; NODE_BYTES];
        let mut nodes = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            reader.read_exact(&mut raw).map_err(|err| {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    FbiError::InvalidPersistence("node table is truncated")
                } else {
                    FbiError::Io(err)
                }
            })?;
            let offset = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let length = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            let child_base = i32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            if child_base < 0 {
                return Err(FbiError::InvalidPersistence("negative child base"));
            }
            nodes.push(TrieNode {
                range: Range::new(offset as usize, length as usize),
                child_base: child_base as u32,
            });
        }

        let fanout = 1usize << sample_skip;
        for node in &nodes {
            let base = node.child_base as usize;
            if base != 0 && base + fanout > nodes.len() {
                return Err(FbiError::InvalidPersistence(
                    "child block lies outside the node table",
                ));
            }
        }

        Ok(Self {
            first_offset,
            sample_skip,
            nodes,
        })
    }
}
