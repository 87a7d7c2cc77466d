/*
 * Copyright 2020 Joyent, Inc.
 */

//! Buffered XML sections.
//!
//! Opaque XML that has to survive re-serialization (address metadata,
//! extension elements, policy blobs) is kept as serialized bytes in a single
//! arena. Each section is an offset/length pair tagged with its kind and is
//! decoded on demand. A buffer is written through [`XmlBufferBuilder`] and
//! is immutable once [`XmlBufferBuilder::close`] returns.

use std::str;

use bytes::{BufMut, Bytes, BytesMut};

use crate::xml::{self, XmlError, XmlNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Metadata,
    Extensions,
    Psp,
}

/// Parser and buffer limits, built from `RuntimeConfig::quotas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlQuotas {
    pub max_depth: usize,
    pub max_section_bytes: usize,
    /// Largest envelope the codec will buffer, complete or not.
    pub max_message_bytes: usize,
}

impl Default for XmlQuotas {
    fn default() -> Self {
        XmlQuotas {
            max_depth: xml::DEFAULT_MAX_DEPTH,
            max_section_bytes: 64 * 1024,
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Section {
    kind: SectionKind,
    offset: usize,
    len: usize,
}

#[derive(Debug)]
pub struct XmlBufferBuilder {
    arena: BytesMut,
    sections: Vec<Section>,
    quotas: XmlQuotas,
}

impl XmlBufferBuilder {
    pub fn new(quotas: XmlQuotas) -> XmlBufferBuilder {
        XmlBufferBuilder {
            arena: BytesMut::new(),
            sections: Vec::new(),
            quotas,
        }
    }

    /// Appends a section and returns its index.
    pub fn write_section(&mut self, kind: SectionKind, nodes: &[XmlNode]) -> Result<usize, XmlError> {
        let serialized = xml::write_fragment(nodes);
        self.write_raw_section(kind, serialized.as_bytes())
    }

    fn write_raw_section(&mut self, kind: SectionKind, raw: &[u8]) -> Result<usize, XmlError> {
        if raw.len() > self.quotas.max_section_bytes {
            return Err(XmlError::new(format!(
                "buffered section of {} bytes exceeds the {} byte quota",
                raw.len(),
                self.quotas.max_section_bytes
            )));
        }
        let offset = self.arena.len();
        self.arena.reserve(raw.len());
        self.arena.put_slice(raw);
        self.sections.push(Section {
            kind,
            offset,
            len: raw.len(),
        });
        Ok(self.sections.len() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn close(self) -> XmlBuffer {
        XmlBuffer {
            arena: self.arena.freeze(),
            sections: self.sections,
            quotas: self.quotas,
        }
    }
}

/// A closed, read-only set of buffered sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlBuffer {
    arena: Bytes,
    sections: Vec<Section>,
    quotas: XmlQuotas,
}

impl XmlBuffer {
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn quotas(&self) -> XmlQuotas {
        self.quotas
    }

    pub fn find(&self, kind: SectionKind) -> Option<usize> {
        self.sections.iter().position(|s| s.kind == kind)
    }

    pub fn section_kind(&self, index: usize) -> Option<SectionKind> {
        self.sections.get(index).map(|s| s.kind)
    }

    /// Raw serialized bytes of a section.
    pub fn section_bytes(&self, index: usize) -> Option<&[u8]> {
        self.sections
            .get(index)
            .map(|s| &self.arena[s.offset..s.offset + s.len])
    }

    /// Decodes a section back into the nodes it was written from.
    pub fn read_section(&self, index: usize) -> Result<Vec<XmlNode>, XmlError> {
        let raw = self
            .section_bytes(index)
            .ok_or_else(|| XmlError::new(format!("no buffered section {}", index)))?;
        let text = str::from_utf8(raw)
            .map_err(|_| XmlError::new("buffered section is not valid UTF-8"))?;
        xml::parse_fragment(text, self.quotas.max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::XmlElement;

    fn nodes() -> Vec<XmlNode> {
        vec![
            XmlNode::Element(XmlElement::new("urn:m", "Meta").with_text("one")),
            XmlNode::Element(XmlElement::new("urn:m", "Meta").with_text("two")),
        ]
    }

    #[test]
    fn sections_decode_to_written_nodes() {
        let mut builder = XmlBufferBuilder::new(XmlQuotas::default());
        let meta = builder.write_section(SectionKind::Metadata, &nodes()).unwrap();
        let ext = builder.write_section(SectionKind::Extensions, &[]).unwrap();
        let buffer = builder.close();

        assert_eq!(buffer.section_count(), 2);
        assert_eq!(buffer.find(SectionKind::Extensions), Some(ext));
        assert_eq!(buffer.find(SectionKind::Psp), None);
        assert_eq!(buffer.section_kind(meta), Some(SectionKind::Metadata));

        let decoded = buffer.read_section(meta).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(buffer.read_section(ext).unwrap().is_empty());
        assert!(buffer.read_section(7).is_err());
    }

    #[test]
    fn second_round_trip_is_byte_identical() {
        let mut builder = XmlBufferBuilder::new(XmlQuotas::default());
        let idx = builder.write_section(SectionKind::Extensions, &nodes()).unwrap();
        let first = builder.close();

        let mut builder = XmlBufferBuilder::new(XmlQuotas::default());
        let again = builder
            .write_section(SectionKind::Extensions, &first.read_section(idx).unwrap())
            .unwrap();
        let second = builder.close();

        assert_eq!(first.section_bytes(idx), second.section_bytes(again));
    }

    #[test]
    fn quotas_are_enforced() {
        let quotas = XmlQuotas {
            max_depth: 1,
            max_section_bytes: 16,
            ..XmlQuotas::default()
        };
        let mut builder = XmlBufferBuilder::new(quotas);
        assert!(builder.write_section(SectionKind::Psp, &nodes()).is_err());

        let nested = vec![XmlNode::Element(
            XmlElement::new("", "a").with_child(XmlElement::new("", "b")),
        )];
        let idx = builder.write_section(SectionKind::Psp, &nested).unwrap();
        let buffer = builder.close();
        assert!(buffer.read_section(idx).is_err());
    }
}
