//! Minimal owned XML element tree for cache sidecars.
//!
//! Sidecars are small, so they are parsed fully into memory, edited in
//! place and written back out.

use std::fmt::Display;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use smallvec::SmallVec;

use crate::util::{Error, Result};

fn xml_err(e: impl Display) -> Error {
    Error::Xml(e.to_string())
}

/// A child of an element.
#[derive(Clone, Debug, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

/// An element with attributes and children, in document order.
#[derive(Clone, Debug, PartialEq)]
pub struct XmlElement {
    name: String,
    attributes: SmallVec<[(String, String); 4]>,
    children: Vec<XmlNode>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: SmallVec::new(),
            children: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute value by key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        for (k, v) in &mut self.attributes {
            if *k == key {
                *v = value;
                return;
            }
        }
        self.attributes.push((key, value));
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn children(&self) -> &[XmlNode] {
        &self.children
    }

    pub fn push(&mut self, node: XmlNode) {
        self.children.push(node);
    }

    /// Child elements, skipping text.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut XmlElement> {
        self.children.iter_mut().filter_map(|c| match c {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    /// First direct child element with the given name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.elements_mut().find(|e| e.name == name)
    }

    /// All direct child elements with the given name.
    pub fn find_all<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s XmlElement> + 's {
        self.elements().filter(move |e| e.name == name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|c| match c {
                XmlNode::Text(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let mut element = Self::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    fn write<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attributes {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start)).map_err(xml_err)?;
            return Ok(());
        }
        writer.write_event(Event::Start(start)).map_err(xml_err)?;
        for child in &self.children {
            match child {
                XmlNode::Element(e) => e.write(writer)?,
                XmlNode::Text(t) => {
                    writer
                        .write_event(Event::Text(BytesText::new(t)))
                        .map_err(xml_err)?;
                }
            }
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(xml_err)?;
        Ok(())
    }
}

/// A parsed XML document with a single root element.
#[derive(Clone, Debug, PartialEq)]
pub struct XmlDocument {
    root: XmlElement,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    /// Parse a document from text. Whitespace-only text is dropped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        let mut attach = |stack: &mut Vec<XmlElement>, element: XmlElement| -> Result<()> {
            match stack.last_mut() {
                Some(parent) => parent.children.push(XmlNode::Element(element)),
                None if root.is_none() => root = Some(element),
                None => return Err(Error::Xml("document has more than one root element".into())),
            }
            Ok(())
        };

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(XmlElement::from_start(&e)?),
                Ok(Event::Empty(e)) => attach(&mut stack, XmlElement::from_start(&e)?)?,
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::Xml("unbalanced end tag".into()))?;
                    attach(&mut stack, element)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(xml_err)?.into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(text));
                    }
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8(c.into_inner().into_owned())?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Text(text));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(Error::Xml(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                // Declarations, comments, processing instructions.
                Ok(_) => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::Xml(format!("unclosed element <{}>", open.name)));
        }
        drop(attach);
        root.map(Self::new)
            .ok_or_else(|| Error::Xml("document has no root element".into()))
    }

    /// Read and parse a file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Self::parse(&text)
    }

    #[inline]
    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    #[inline]
    pub fn root_mut(&mut self) -> &mut XmlElement {
        &mut self.root
    }

    /// Serialize with a declaration and two-space indentation.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", None, None)))
            .map_err(xml_err)?;
        self.root.write(&mut writer)?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(String::from_utf8(bytes)?)
    }

    /// Serialize to a file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_xml_string()?)?;
        Ok(())
    }
}
