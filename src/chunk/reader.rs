//! Streaming chunk reader.
//!
//! Records are decoded one at a time with [`ChunkReader::parse_next`], which
//! descends into groups as it meets them. Callers that only need a few
//! header tags can stop early; [`ChunkReader::parse_all`] drains the rest.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use super::format::*;
use super::node::{ChunkTree, Group, Leaf, Node, Payload};
use crate::util::{Error, Result};

/// A group whose children are still being read.
struct OpenGroup {
    node: Node<'static>,
    /// Stream position one past the group's last byte.
    end: u64,
}

/// Incremental decoder over any byte source.
pub struct ChunkReader<R> {
    reader: R,
    pos: u64,
    stack: Vec<OpenGroup>,
    records: Vec<Node<'static>>,
    finished: bool,
}

impl ChunkReader<BufReader<File>> {
    /// Open a chunk file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pos: 0,
            stack: Vec::new(),
            records: Vec::new(),
            finished: false,
        }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Whether the end of the stream has been reached.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Completed top-level records.
    #[inline]
    pub fn records(&self) -> &[Node<'static>] {
        &self.records
    }

    /// First completed top-level record with the given tag.
    pub fn find_one(&self, tag: Tag) -> Result<&Node<'static>> {
        self.records
            .iter()
            .find(|n| n.tag() == tag)
            .ok_or(Error::TagNotFound(tag))
    }

    /// Decode the next record, descending into groups.
    ///
    /// Returns the leaf just read, or the group just opened (whose children
    /// are still to come). `None` means the stream ended cleanly.
    pub fn parse_next(&mut self) -> Result<Option<&Node<'static>>> {
        if self.finished {
            return Ok(None);
        }
        self.close_finished_groups();

        let record_pos = self.pos;
        let Some(tag) = self.read_tag()? else {
            if let Some(open) = self.stack.last() {
                return Err(Error::TruncatedStream {
                    pos: self.pos,
                    missing: format!("end of group {} at byte {}", open.node.tag(), open.end),
                });
            }
            self.finished = true;
            return Ok(None);
        };
        let size = u64::from(self.read_u32("record size")?);
        let limit = self.stack.last().map(|g| g.end).unwrap_or(u64::MAX);

        if tag == Tag::FOR8 {
            return Err(Error::malformed(record_pos, "64-bit FOR8 groups are not supported"));
        }
        if self.pos + size > limit {
            return Err(Error::malformed(
                record_pos,
                format!("{} record of {} bytes overruns its group ending at {}", tag, size, limit),
            ));
        }

        if tag == Tag::FOR4 {
            if size < GROUP_TAG_SIZE {
                return Err(Error::malformed(record_pos, format!("group size {} too small", size)));
            }
            let end = self.pos + size;
            let group_tag = self
                .read_tag()?
                .ok_or_else(|| self.truncated("group tag"))?;
            tracing::trace!(pos = record_pos, tag = %group_tag, size, "open group");
            self.stack.push(OpenGroup {
                node: Node::Group(Group::new(group_tag)),
                end,
            });
            return Ok(self.stack.last().map(|g| &g.node));
        }

        let bytes = self.read_payload(size)?;
        let pad = padding(size).min(limit - self.pos);
        if pad > 0 {
            let mut skip = [0u8; ALIGNMENT as usize];
            let pad = pad as usize;
            if self.stack.is_empty() {
                // Top-level padding may be omitted on the last record.
                let read = self.read_up_to(&mut skip[..pad])?;
                self.pos += read as u64;
            } else {
                self.read_exact(&mut skip[..pad], "record padding")?;
            }
        }

        let payload = decode_payload(tag, bytes, record_pos)?;
        tracing::trace!(pos = record_pos, tag = %tag, size, "leaf");
        Ok(Some(self.attach(Node::Leaf(Leaf::with_payload(tag, payload)))))
    }

    /// Decode every remaining record.
    pub fn parse_all(&mut self) -> Result<&[Node<'static>]> {
        while self.parse_next()?.is_some() {}
        Ok(&self.records)
    }

    /// Decode the remaining records and hand over the whole tree.
    ///
    /// The underlying reader is dropped, closing the file.
    pub fn into_tree(mut self) -> Result<ChunkTree<'static>> {
        self.parse_all()?;
        Ok(ChunkTree::from_records(self.records))
    }

    fn close_finished_groups(&mut self) {
        while self.stack.last().is_some_and(|g| g.end <= self.pos) {
            if let Some(done) = self.stack.pop() {
                self.attach(done.node);
            }
        }
    }

    fn attach(&mut self, node: Node<'static>) -> &Node<'static> {
        let siblings = match self.stack.last_mut() {
            Some(OpenGroup { node: Node::Group(parent), .. }) => parent,
            _ => {
                self.records.push(node);
                return &self.records[self.records.len() - 1];
            }
        };
        siblings.push(node);
        &siblings.children()[siblings.len() - 1]
    }

    fn truncated(&self, what: &str) -> Error {
        Error::TruncatedStream {
            pos: self.pos,
            missing: what.to_string(),
        }
    }

    fn read_up_to(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Read a declared payload, growing the buffer only as bytes arrive.
    fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        let n = (&mut self.reader).take(size).read_to_end(&mut bytes)?;
        self.pos += n as u64;
        if (n as u64) < size {
            return Err(self.truncated("record payload"));
        }
        Ok(bytes)
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &str) -> Result<()> {
        let n = self.read_up_to(buf)?;
        self.pos += n as u64;
        if n < buf.len() {
            return Err(self.truncated(what));
        }
        Ok(())
    }

    /// Read a tag, or `None` on a clean end of stream.
    fn read_tag(&mut self) -> Result<Option<Tag>> {
        let mut buf = [0u8; 4];
        let n = self.read_up_to(&mut buf)?;
        self.pos += n as u64;
        match n {
            0 => Ok(None),
            4 => Ok(Some(Tag(buf))),
            _ => Err(self.truncated("record tag")),
        }
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        match self.reader.read_u32::<BigEndian>() {
            Ok(v) => {
                self.pos += 4;
                Ok(v)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(self.truncated(what)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Interpret raw payload bytes according to the tag's payload kind.
fn decode_payload(tag: Tag, bytes: Vec<u8>, pos: u64) -> Result<Payload<'static>> {
    let kind = tag.payload_kind();
    if bytes.len() % kind.element_size() != 0 {
        return Err(Error::malformed(
            pos,
            format!("{} payload of {} bytes is not a whole number of {}", tag, bytes.len(), kind.name()),
        ));
    }
    let count = bytes.len() / kind.element_size();
    Ok(match kind {
        PayloadKind::Ints => {
            let mut out = vec![0i32; count];
            BigEndian::read_i32_into(&bytes, &mut out);
            Payload::Ints(Cow::Owned(out))
        }
        PayloadKind::Floats => {
            let mut out = vec![0f32; count];
            BigEndian::read_f32_into(&bytes, &mut out);
            Payload::Floats(Cow::Owned(out.into_iter().map(f64::from).collect()))
        }
        PayloadKind::Doubles => {
            let mut out = vec![0f64; count];
            BigEndian::read_f64_into(&bytes, &mut out);
            Payload::Doubles(Cow::Owned(out))
        }
        PayloadKind::String => {
            let mut bytes = bytes;
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            bytes.truncate(len);
            Payload::String(Cow::Owned(String::from_utf8(bytes)?))
        }
        PayloadKind::Raw => Payload::Raw(Cow::Owned(bytes)),
    })
}
