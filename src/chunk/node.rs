//! Chunk tree: groups containing tagged leaves or nested groups.
//!
//! The same tree is produced by [`ChunkReader`](super::ChunkReader) and
//! consumed by the fragment writer. Payloads are `Cow` so a tree being
//! encoded can borrow large arrays from their owner instead of copying them.

use std::borrow::Cow;

use super::format::*;
use crate::util::{Error, Result};

/// Typed payload of a leaf chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload<'a> {
    /// i32 sequence.
    Ints(Cow<'a, [i32]>),
    /// Values stored as f32 on the wire (every decoded value is exact in f64).
    Floats(Cow<'a, [f64]>),
    /// Values stored as f64 on the wire.
    Doubles(Cow<'a, [f64]>),
    /// String, stored NUL-terminated.
    String(Cow<'a, str>),
    /// Unknown payload, kept verbatim.
    Raw(Cow<'a, [u8]>),
}

impl<'a> Payload<'a> {
    /// Empty payload of the given kind.
    pub fn empty(kind: PayloadKind) -> Self {
        match kind {
            PayloadKind::Ints => Self::Ints(Cow::Borrowed(&[])),
            PayloadKind::Floats => Self::Floats(Cow::Borrowed(&[])),
            PayloadKind::Doubles => Self::Doubles(Cow::Borrowed(&[])),
            PayloadKind::String => Self::String(Cow::Borrowed("")),
            PayloadKind::Raw => Self::Raw(Cow::Borrowed(&[])),
        }
    }

    /// Kind of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Ints(_) => PayloadKind::Ints,
            Self::Floats(_) => PayloadKind::Floats,
            Self::Doubles(_) => PayloadKind::Doubles,
            Self::String(_) => PayloadKind::String,
            Self::Raw(_) => PayloadKind::Raw,
        }
    }

    /// Encoded size in bytes, without padding.
    pub fn byte_len(&self) -> u64 {
        match self {
            Self::Ints(v) => v.len() as u64 * 4,
            Self::Floats(v) => v.len() as u64 * 4,
            Self::Doubles(v) => v.len() as u64 * 8,
            Self::String(s) => s.len() as u64 + 1,
            Self::Raw(b) => b.len() as u64,
        }
    }
}

/// A leaf chunk: tag plus typed payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Leaf<'a> {
    tag: Tag,
    payload: Payload<'a>,
}

impl<'a> Leaf<'a> {
    /// Empty leaf whose payload kind follows the tag.
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            payload: Payload::empty(tag.payload_kind()),
        }
    }

    /// Leaf with an explicit payload.
    pub fn with_payload(tag: Tag, payload: Payload<'a>) -> Self {
        Self { tag, payload }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn payload(&self) -> &Payload<'a> {
        &self.payload
    }

    pub fn into_payload(self) -> Payload<'a> {
        self.payload
    }

    fn wrong_kind(&self, expected: PayloadKind) -> Error {
        Error::WrongPayloadKind {
            tag: self.tag,
            expected: expected.name(),
            actual: self.payload.kind().name(),
        }
    }

    fn not_representable(&self, value: impl ToString) -> Error {
        Error::NotRepresentable {
            tag: self.tag,
            value: value.to_string(),
        }
    }

    /// Payload as integers.
    pub fn ints(&self) -> Result<&[i32]> {
        match &self.payload {
            Payload::Ints(v) => Ok(v),
            _ => Err(self.wrong_kind(PayloadKind::Ints)),
        }
    }

    /// Payload as floats (either wire width).
    pub fn floats(&self) -> Result<&[f64]> {
        match &self.payload {
            Payload::Floats(v) | Payload::Doubles(v) => Ok(v),
            _ => Err(self.wrong_kind(PayloadKind::Floats)),
        }
    }

    /// Consume the leaf and take its float payload.
    pub fn into_floats(self) -> Result<Vec<f64>> {
        match self.payload {
            Payload::Floats(v) | Payload::Doubles(v) => Ok(v.into_owned()),
            _ => Err(self.wrong_kind(PayloadKind::Floats)),
        }
    }

    /// Payload as a string.
    pub fn string(&self) -> Result<&str> {
        match &self.payload {
            Payload::String(s) => Ok(s),
            _ => Err(self.wrong_kind(PayloadKind::String)),
        }
    }

    /// Assign an integer payload. Every value must fit an i32.
    pub fn set_ints(&mut self, values: &[i64]) -> Result<()> {
        let mut out = Vec::with_capacity(values.len());
        for &v in values {
            let v = i32::try_from(v).map_err(|_| self.not_representable(v))?;
            out.push(v);
        }
        self.payload = Payload::Ints(Cow::Owned(out));
        Ok(())
    }

    /// Assign a float payload.
    ///
    /// `DBLA` leaves keep full precision; other tags are written as f32 and
    /// reject finite values outside the f32 range.
    pub fn set_floats(&mut self, values: impl Into<Cow<'a, [f64]>>) -> Result<()> {
        let values = values.into();
        if self.tag.payload_kind() == PayloadKind::Doubles {
            self.payload = Payload::Doubles(values);
            return Ok(());
        }
        // Finite values must survive the narrowing unchanged.
        if let Some(bad) = values
            .iter()
            .find(|v| v.is_finite() && f64::from(**v as f32) != **v)
        {
            return Err(self.not_representable(bad));
        }
        if values.len() as u64 * 4 > u32::MAX as u64 {
            return Err(self.not_representable(format!("{} floats", values.len())));
        }
        self.payload = Payload::Floats(values);
        Ok(())
    }

    /// Assign a string payload. Interior NUL bytes cannot be encoded.
    pub fn set_string(&mut self, value: impl Into<Cow<'a, str>>) -> Result<()> {
        let value = value.into();
        if value.contains('\0') {
            return Err(self.not_representable(value.escape_debug()));
        }
        self.payload = Payload::String(value);
        Ok(())
    }

    /// Encoded size including header and padding.
    pub fn encoded_len(&self) -> u64 {
        RECORD_HEADER_SIZE + aligned(self.payload.byte_len())
    }
}

/// A group chunk holding an ordered list of children.
#[derive(Clone, Debug, PartialEq)]
pub struct Group<'a> {
    tag: Tag,
    children: Vec<Node<'a>>,
}

impl<'a> Group<'a> {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.tag
    }

    #[inline]
    pub fn children(&self) -> &[Node<'a>] {
        &self.children
    }

    pub fn into_children(self) -> Vec<Node<'a>> {
        self.children
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Child at `index`, by position.
    pub fn child(&self, index: usize) -> Option<&Node<'a>> {
        self.children.get(index)
    }

    /// First direct child with the given tag.
    pub fn find_one(&self, tag: Tag) -> Result<&Node<'a>> {
        self.children
            .iter()
            .find(|c| c.tag() == tag)
            .ok_or(Error::TagNotFound(tag))
    }

    /// All direct children with the given tag, in order.
    pub fn find(&self, tag: Tag) -> impl Iterator<Item = &Node<'a>> + '_ {
        self.children.iter().filter(move |c| c.tag() == tag)
    }

    /// Remove and return the first direct child with the given tag.
    pub fn take_one(&mut self, tag: Tag) -> Result<Node<'a>> {
        let pos = self
            .children
            .iter()
            .position(|c| c.tag() == tag)
            .ok_or(Error::TagNotFound(tag))?;
        Ok(self.children.remove(pos))
    }

    pub fn push(&mut self, node: Node<'a>) {
        self.children.push(node);
    }

    /// Append an empty child group and return it.
    pub fn add_group(&mut self, tag: Tag) -> &mut Group<'a> {
        self.children.push(Node::Group(Group::new(tag)));
        match self.children.last_mut() {
            Some(Node::Group(g)) => g,
            _ => unreachable!("a group was just pushed"),
        }
    }

    /// Append an empty leaf and return it for payload assignment.
    pub fn add_chunk(&mut self, tag: Tag) -> &mut Leaf<'a> {
        self.children.push(Node::Leaf(Leaf::new(tag)));
        match self.children.last_mut() {
            Some(Node::Leaf(l)) => l,
            _ => unreachable!("a leaf was just pushed"),
        }
    }

    /// Value of the group header's size field: group tag plus children.
    pub fn content_len(&self) -> u64 {
        GROUP_TAG_SIZE + self.children.iter().map(Node::encoded_len).sum::<u64>()
    }

    /// Encoded size including the `FOR4` header.
    pub fn encoded_len(&self) -> u64 {
        RECORD_HEADER_SIZE + self.content_len()
    }
}

/// Either kind of chunk.
#[derive(Clone, Debug, PartialEq)]
pub enum Node<'a> {
    Group(Group<'a>),
    Leaf(Leaf<'a>),
}

impl<'a> Node<'a> {
    /// Leaf tag, or the type tag of a group.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Group(g) => g.tag(),
            Self::Leaf(l) => l.tag(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group(_))
    }

    pub fn as_group(&self) -> Result<&Group<'a>> {
        match self {
            Self::Group(g) => Ok(g),
            Self::Leaf(l) => Err(Error::WrongPayloadKind {
                tag: l.tag(),
                expected: "group",
                actual: l.payload().kind().name(),
            }),
        }
    }

    pub fn into_group(self) -> Result<Group<'a>> {
        match self {
            Self::Group(g) => Ok(g),
            Self::Leaf(l) => Err(Error::WrongPayloadKind {
                tag: l.tag(),
                expected: "group",
                actual: l.payload().kind().name(),
            }),
        }
    }

    pub fn as_leaf(&self) -> Result<&Leaf<'a>> {
        match self {
            Self::Leaf(l) => Ok(l),
            Self::Group(g) => Err(Error::WrongPayloadKind {
                tag: g.tag(),
                expected: "leaf",
                actual: "group",
            }),
        }
    }

    pub fn into_leaf(self) -> Result<Leaf<'a>> {
        match self {
            Self::Leaf(l) => Ok(l),
            Self::Group(g) => Err(Error::WrongPayloadKind {
                tag: g.tag(),
                expected: "leaf",
                actual: "group",
            }),
        }
    }

    pub fn encoded_len(&self) -> u64 {
        match self {
            Self::Group(g) => g.encoded_len(),
            Self::Leaf(l) => l.encoded_len(),
        }
    }
}

/// A whole chunk stream: the top-level records of one file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkTree<'a> {
    records: Vec<Node<'a>>,
}

impl<'a> ChunkTree<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_records(records: Vec<Node<'a>>) -> Self {
        Self { records }
    }

    #[inline]
    pub fn records(&self) -> &[Node<'a>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Node<'a>> {
        self.records
    }

    /// First top-level record with the given tag.
    pub fn find_one(&self, tag: Tag) -> Result<&Node<'a>> {
        self.records
            .iter()
            .find(|c| c.tag() == tag)
            .ok_or(Error::TagNotFound(tag))
    }

    /// All top-level records with the given tag.
    pub fn find(&self, tag: Tag) -> impl Iterator<Item = &Node<'a>> + '_ {
        self.records.iter().filter(move |c| c.tag() == tag)
    }

    /// Remove and return the first top-level record with the given tag.
    pub fn take_one(&mut self, tag: Tag) -> Result<Node<'a>> {
        let pos = self
            .records
            .iter()
            .position(|c| c.tag() == tag)
            .ok_or(Error::TagNotFound(tag))?;
        Ok(self.records.remove(pos))
    }

    /// Append a top-level group and return it.
    pub fn add_group(&mut self, tag: Tag) -> &mut Group<'a> {
        self.records.push(Node::Group(Group::new(tag)));
        match self.records.last_mut() {
            Some(Node::Group(g)) => g,
            _ => unreachable!("a group was just pushed"),
        }
    }

    /// Append a top-level leaf.
    pub fn add_chunk(&mut self, tag: Tag) -> &mut Leaf<'a> {
        self.records.push(Node::Leaf(Leaf::new(tag)));
        match self.records.last_mut() {
            Some(Node::Leaf(l)) => l,
            _ => unreachable!("a leaf was just pushed"),
        }
    }

    /// Total encoded size of the stream.
    pub fn encoded_len(&self) -> u64 {
        self.records.iter().map(Node::encoded_len).sum()
    }
}
