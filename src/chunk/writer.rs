//! Chunk stream encoder.
//!
//! [`ChunkTree::dumps_iter`] turns a tree into a lazy sequence of byte
//! fragments: one per record header and one per bounded block of payload.
//! Large arrays are converted block by block as the consumer pulls them.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder};

use super::format::*;
use super::node::{ChunkTree, Group, Node, Payload};
use crate::util::{Error, Result};

impl<'a> ChunkTree<'a> {
    /// Consume the tree and return its encoded byte fragments.
    ///
    /// Sizes are validated up front so the iterator itself cannot fail.
    pub fn dumps_iter(self) -> Result<Fragments<'a>> {
        for node in self.records() {
            check_sizes(node)?;
        }
        Ok(Fragments {
            stack: vec![self.into_records().into_iter()],
            pending: None,
        })
    }

    /// Encode the tree into `writer`, returning the number of bytes written.
    pub fn write_to<W: Write>(self, writer: &mut W) -> Result<u64> {
        let mut written = 0u64;
        for fragment in self.dumps_iter()? {
            writer.write_all(&fragment)?;
            written += fragment.len() as u64;
        }
        Ok(written)
    }

    /// Encode the whole tree into memory.
    pub fn to_bytes(self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        self.write_to(&mut out)?;
        Ok(out)
    }
}

fn check_sizes(node: &Node<'_>) -> Result<()> {
    match node {
        Node::Leaf(leaf) => {
            let len = leaf.payload().byte_len();
            if len > u64::from(u32::MAX) {
                return Err(Error::NotRepresentable {
                    tag: leaf.tag(),
                    value: format!("payload of {} bytes", len),
                });
            }
        }
        Node::Group(group) => {
            let len = group.content_len();
            if len > u64::from(u32::MAX) {
                return Err(Error::NotRepresentable {
                    tag: group.tag(),
                    value: format!("group of {} bytes", len),
                });
            }
            for child in group.children() {
                check_sizes(child)?;
            }
        }
    }
    Ok(())
}

fn record_header(tag: Tag, size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE as usize + GROUP_TAG_SIZE as usize);
    out.extend_from_slice(tag.as_bytes());
    let mut size_bytes = [0u8; 4];
    // check_sizes() has already bounded every size to u32.
    BigEndian::write_u32(&mut size_bytes, size as u32);
    out.extend_from_slice(&size_bytes);
    out
}

fn group_header(group: &Group<'_>) -> Vec<u8> {
    let mut out = record_header(Tag::FOR4, group.content_len());
    out.extend_from_slice(group.tag().as_bytes());
    out
}

/// Payload being emitted block by block.
struct PendingPayload<'a> {
    payload: Payload<'a>,
    /// Next element to emit.
    offset: usize,
    done: bool,
}

impl<'a> PendingPayload<'a> {
    fn new(payload: Payload<'a>) -> Self {
        Self {
            payload,
            offset: 0,
            done: false,
        }
    }

    fn element_count(&self) -> usize {
        match &self.payload {
            Payload::Ints(v) => v.len(),
            Payload::Floats(v) | Payload::Doubles(v) => v.len(),
            Payload::String(s) => s.len() + 1,
            Payload::Raw(b) => b.len(),
        }
    }

    fn next_block(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }
        let count = self.element_count();
        let start = self.offset;
        let end = match &self.payload {
            // Strings are small and always emitted whole.
            Payload::String(_) => count,
            Payload::Raw(_) => (start + FRAGMENT_ELEMENTS * 4).min(count),
            _ => (start + FRAGMENT_ELEMENTS).min(count),
        };

        let width = self.payload.kind().element_size();
        let mut out = vec![0u8; (end - start) * width];
        match &self.payload {
            Payload::Ints(v) => BigEndian::write_i32_into(&v[start..end], &mut out),
            Payload::Floats(v) => {
                for (dst, &value) in out.chunks_exact_mut(4).zip(&v[start..end]) {
                    BigEndian::write_f32(dst, value as f32);
                }
            }
            Payload::Doubles(v) => BigEndian::write_f64_into(&v[start..end], &mut out),
            Payload::String(s) => {
                out[..s.len()].copy_from_slice(s.as_bytes());
            }
            Payload::Raw(b) => out.copy_from_slice(&b[start..end]),
        }
        self.offset = end;

        if end == count {
            self.done = true;
            let pad = padding(self.payload.byte_len()) as usize;
            out.resize(out.len() + pad, 0);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// Lazy encoder over a consumed [`ChunkTree`].
pub struct Fragments<'a> {
    stack: Vec<std::vec::IntoIter<Node<'a>>>,
    pending: Option<PendingPayload<'a>>,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(pending) = &mut self.pending {
                if let Some(block) = pending.next_block() {
                    return Some(block);
                }
                self.pending = None;
            }

            let siblings = self.stack.last_mut()?;
            match siblings.next() {
                None => {
                    self.stack.pop();
                }
                Some(Node::Group(group)) => {
                    let header = group_header(&group);
                    self.stack.push(group.into_children().into_iter());
                    return Some(header);
                }
                Some(Node::Leaf(leaf)) => {
                    let header = record_header(leaf.tag(), leaf.payload().byte_len());
                    self.pending = Some(PendingPayload::new(leaf.into_payload()));
                    return Some(header);
                }
            }
        }
    }
}
