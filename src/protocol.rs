/*
 * Copyright 2020 Joyent, Inc.
 */

//! SOAP envelope encoding and the stream codec.
//!
//! ```text
//! <s:Envelope xmlns:s="...">
//!   <s:Header>         optional; one child element per header
//!     ...
//!   </s:Header>
//!   <s:Body>           exactly one; empty, a payload element, or s:Fault
//!     ...
//!   </s:Body>
//! </s:Envelope>
//! ```
//!
//! Messages of the `None` envelope version have no envelope at all: the
//! document is the body element.

use std::str;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::buffer::XmlQuotas;
use crate::error::{Error, ProtocolError};
use crate::fault::MessageFault;
use crate::header::MessageHeader;
use crate::message::{Message, MessageBody};
use crate::version::{EnvelopeKind, MessageVersion};
use crate::xml::{self, NamespaceScope, QName, XmlElement, XmlError, XmlNode};

const ENV_PREFIX: &str = "s";

mod elements {
    pub const ENVELOPE: &str = "Envelope";
    pub const HEADER: &str = "Header";
    pub const BODY: &str = "Body";
    pub const FAULT: &str = "Fault";
}

impl Message {
    /// Decodes one envelope of the given version.
    pub fn parse(src: &str, version: MessageVersion, quotas: XmlQuotas) -> Result<Message, Error> {
        let root = xml::parse_document_with_depth(src, quotas.max_depth)?;
        Message::from_envelope(root, version)
    }

    /// Builds a message from an already parsed envelope element.
    pub fn from_envelope(root: XmlElement, version: MessageVersion) -> Result<Message, Error> {
        let envelope = version.envelope;
        if envelope.kind == EnvelopeKind::None {
            return Ok(Message::new(version, MessageBody::Element(root)));
        }

        let ns = envelope.namespace;
        if !root.is(ns, elements::ENVELOPE) {
            if root.name.local == elements::ENVELOPE {
                return Err(ProtocolError::protocol(format!(
                    "envelope namespace '{}' does not match the expected {}",
                    root.name.namespace, envelope
                ))
                .into());
            }
            return Err(XmlError::unexpected(&QName::new(ns, elements::ENVELOPE), &root).into());
        }

        let scope = NamespaceScope::default().enter(&root);
        let mut header = None;
        let mut body = None;
        for child in root.elements() {
            if child.is(ns, elements::HEADER) && header.is_none() && body.is_none() {
                header = Some(child);
            } else if child.is(ns, elements::BODY) && body.is_none() {
                body = Some(child);
            } else {
                return Err(XmlError::new(format!(
                    "unexpected element {} in envelope",
                    child.name
                ))
                .into());
            }
        }
        let body = body
            .ok_or_else(|| XmlError::new(format!("envelope has no {{{}}}Body", ns)))?;

        let mut message = Message::new(version, MessageBody::Empty);
        if let Some(header) = header {
            for el in header.elements() {
                message
                    .headers_mut()
                    .add(MessageHeader::from_element(el.clone(), envelope));
            }
        }

        let body_scope = scope.enter(body);
        let mut payload = body.elements();
        let content = match payload.next() {
            None => MessageBody::Empty,
            Some(el) if el.is(ns, elements::FAULT) => {
                MessageBody::Fault(MessageFault::read_from(el, envelope, &body_scope)?)
            }
            Some(el) => MessageBody::Element(el.clone()),
        };
        if payload.next().is_some() {
            return Err(XmlError::new("Body holds more than one element").into());
        }
        Ok(message.with_body(content))
    }

    fn with_body(mut self, body: MessageBody) -> Message {
        self.set_body(body);
        self
    }

    /// Builds the envelope element for this message.
    pub fn to_envelope(&self) -> Result<XmlElement, Error> {
        let envelope = self.version().envelope;
        let body_content = match self.body() {
            MessageBody::Empty => None,
            MessageBody::Element(el) => Some(el.clone()),
            MessageBody::Fault(f) => Some(f.write_to(envelope)?),
        };

        if envelope.kind == EnvelopeKind::None {
            return body_content.ok_or_else(|| {
                Error::invalid_operation("a message without an envelope needs a body element")
            });
        }

        let ns = envelope.namespace;
        let env = |local: &str| XmlElement::new(ns, local).with_prefix(ENV_PREFIX);
        let mut root = env(elements::ENVELOPE).with_namespace(Some(ENV_PREFIX), ns);
        if !self.headers().is_empty() {
            let mut header = env(elements::HEADER);
            for h in self.headers().iter() {
                header.push(h.element().clone());
            }
            root.push(header);
        }
        let mut body = env(elements::BODY);
        if let Some(content) = body_content {
            body.children.push(XmlNode::Element(content));
        }
        root.push(body);
        Ok(root)
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(self.to_envelope()?.to_xml_string())
    }
}

/// Frames SOAP envelopes on a byte stream, one message per document.
#[derive(Debug, Clone, Copy)]
pub struct SoapCodec {
    version: MessageVersion,
    quotas: XmlQuotas,
}

impl SoapCodec {
    pub fn new(version: MessageVersion, quotas: XmlQuotas) -> SoapCodec {
        SoapCodec { version, quotas }
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }
}

impl Default for SoapCodec {
    fn default() -> Self {
        SoapCodec::new(MessageVersion::default(), XmlQuotas::default())
    }
}

fn utf8_prefix(buf: &[u8]) -> Result<&str, Error> {
    match str::from_utf8(buf) {
        Ok(s) => Ok(s),
        // A multi-byte sequence split across reads; decode what is complete.
        Err(e) if e.error_len().is_none() => str::from_utf8(&buf[..e.valid_up_to()])
            .map_err(|e| XmlError::new(format!("invalid UTF-8: {}", e)).into()),
        Err(e) => Err(XmlError::new(format!("invalid UTF-8: {}", e)).into()),
    }
}

fn oversized(len: usize, limit: usize) -> Error {
    ProtocolError::protocol(format!(
        "envelope of at least {} bytes exceeds the {} byte quota",
        len, limit
    ))
    .into()
}

impl Decoder for SoapCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let limit = self.quotas.max_message_bytes;
        let text = utf8_prefix(buf)?;
        let (root, consumed) = match xml::parse_document_prefix(text, self.quotas.max_depth) {
            Ok(parsed) => parsed,
            Err(e) if e.is_eof() && buf.len() <= limit => return Ok(None),
            Err(e) if e.is_eof() => return Err(oversized(buf.len(), limit)),
            Err(e) => return Err(e.into()),
        };
        if consumed > limit {
            return Err(oversized(consumed, limit));
        }
        buf.advance(consumed);
        Message::from_envelope(root, self.version).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.iter().all(u8::is_ascii_whitespace) => {
                buf.clear();
                Ok(None)
            }
            None => Err(Error::Communication(String::from(
                "stream ended inside a SOAP envelope",
            ))),
        }
    }
}

impl Encoder<Message> for SoapCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), Error> {
        if item.version() != self.version {
            return Err(Error::argument(
                "item",
                format!(
                    "message version {} does not match codec version {}",
                    item.version(),
                    self.version
                ),
            ));
        }
        let text = item.encode()?;
        buf.reserve(text.len());
        buf.extend_from_slice(text.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MessageHeaderError;
    use crate::fault::FaultKind;
    use crate::version::EnvelopeVersion;

    const WSA10: &str = "http://www.w3.org/2005/08/addressing";

    fn request() -> Message {
        let mut message = Message::create(
            MessageVersion::SOAP12_WSA10,
            Some("urn:echo"),
            Some(XmlElement::new("urn:app", "Echo").with_text("hi")),
        );
        message.headers_mut().set_message_id(Some("urn:uuid:42"));
        message
    }

    #[test]
    fn envelope_round_trip() {
        let text = request().encode().unwrap();
        let back = Message::parse(&text, MessageVersion::SOAP12_WSA10, XmlQuotas::default()).unwrap();
        assert_eq!(back.headers().action().unwrap().as_deref(), Some("urn:echo"));
        assert_eq!(back.headers().message_id().unwrap().as_deref(), Some("urn:uuid:42"));
        assert_eq!(back.body_element().unwrap().text(), "hi");
    }

    #[test]
    fn envelope_version_mismatch_is_a_protocol_error() {
        let text = request().encode().unwrap();
        let err = Message::parse(&text, MessageVersion::SOAP11_WSA10, XmlQuotas::default()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn malformed_envelopes_fail() {
        let v = MessageVersion::SOAP12_WSA10;
        let q = XmlQuotas::default();
        let ns = EnvelopeVersion::SOAP12.namespace;
        let no_body = format!(r#"<s:Envelope xmlns:s="{}"/>"#, ns);
        assert!(matches!(Message::parse(&no_body, v, q), Err(Error::Xml(_))));
        let two = format!(
            r#"<s:Envelope xmlns:s="{}"><s:Body><a/><b/></s:Body></s:Envelope>"#,
            ns
        );
        assert!(Message::parse(&two, v, q).is_err());
        assert!(Message::parse("<Other/>", v, q).is_err());
    }

    #[test]
    fn fault_body_round_trip() {
        let err = ProtocolError::from(MessageHeaderError::missing("Action", WSA10));
        let message = err.create_fault_message(MessageVersion::SOAP12_WSA10, "en-US");
        let text = message.encode().unwrap();
        let back = Message::parse(&text, MessageVersion::SOAP12_WSA10, XmlQuotas::default()).unwrap();
        let fault = back.fault().unwrap();
        assert!(fault.code().is_sender_fault());
        assert!(matches!(fault.kind(), FaultKind::ProblemHeaderQName { .. }));
    }

    #[test]
    fn unenveloped_messages_are_bare_bodies() {
        let message = Message::create(
            MessageVersion::NONE,
            None,
            Some(XmlElement::new("urn:app", "Plain")),
        );
        let text = message.encode().unwrap();
        assert_eq!(text, r#"<Plain xmlns="urn:app"/>"#);
        let back = Message::parse(&text, MessageVersion::NONE, XmlQuotas::default()).unwrap();
        assert!(back.body_element().unwrap().is("urn:app", "Plain"));
        assert!(Message::create(MessageVersion::NONE, None, None).encode().is_err());
    }

    #[test]
    fn codec_rejects_oversized_envelopes() {
        let quotas = XmlQuotas {
            max_message_bytes: 1024,
            ..XmlQuotas::default()
        };
        let mut codec = SoapCodec::new(MessageVersion::SOAP12_WSA10, quotas);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(
            format!(r#"<s:Envelope xmlns:s="{}"><s:Body><a>"#, EnvelopeVersion::SOAP12.namespace)
                .as_bytes(),
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        while buf.len() <= 1024 {
            buf.extend_from_slice(b"padding ");
        }
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));

        let whole = request().encode().unwrap();
        let mut codec = SoapCodec::new(
            MessageVersion::SOAP12_WSA10,
            XmlQuotas {
                max_message_bytes: whole.len() - 1,
                ..XmlQuotas::default()
            },
        );
        let mut buf = BytesMut::from(whole.as_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn codec_frames_partial_and_back_to_back_envelopes() {
        let mut codec = SoapCodec::default();
        let one = request().encode().unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(one[..one.len() / 2].as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(one[one.len() / 2..].as_bytes());
        buf.extend_from_slice(b"\n");
        buf.extend_from_slice(one.as_bytes());

        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_rejects_truncated_stream() {
        let mut codec = SoapCodec::default();
        let mut buf = BytesMut::from("<s:Envelope xmlns:s=\"urn:x\">");
        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn codec_encodes_only_its_version() {
        let mut codec = SoapCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(request(), &mut buf).unwrap();
        assert!(buf.starts_with(b"<s:Envelope"));
        let other = Message::create(MessageVersion::SOAP11_WSA10, None, None);
        assert!(codec.encode(other, &mut buf).is_err());
    }
}
