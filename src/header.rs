/*
 * Copyright 2020 Joyent, Inc.
 */

//! Address headers and SOAP message headers.

use std::collections::HashSet;

use crate::address::EndpointAddress;
use crate::error::{Error, MessageHeaderError};
use crate::uri::Uri;
use crate::version::{AddressingKind, EnvelopeKind, EnvelopeVersion, MessageVersion};
use crate::xml::{QName, XmlElement};

pub const IS_REFERENCE_PARAMETER: &str = "IsReferenceParameter";

pub mod names {
    pub const TO: &str = "To";
    pub const ACTION: &str = "Action";
    pub const MESSAGE_ID: &str = "MessageID";
    pub const RELATES_TO: &str = "RelatesTo";
    pub const REPLY_TO: &str = "ReplyTo";
    pub const FAULT_TO: &str = "FaultTo";
    pub const FROM: &str = "From";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressHeaderKind {
    ReferenceParameter,
    /// Only expressible in August 2004 addressing; written as a reference
    /// parameter by WS-Addressing 1.0.
    ReferenceProperty,
}

/// A header an endpoint address carries and promotes onto every message
/// sent to it.
#[derive(Debug, Clone)]
pub struct AddressHeader {
    kind: AddressHeaderKind,
    element: XmlElement,
}

impl AddressHeader {
    pub fn parameter(element: XmlElement) -> AddressHeader {
        AddressHeader {
            kind: AddressHeaderKind::ReferenceParameter,
            element,
        }
    }

    pub fn property(element: XmlElement) -> AddressHeader {
        AddressHeader {
            kind: AddressHeaderKind::ReferenceProperty,
            element,
        }
    }

    pub fn kind(&self) -> AddressHeaderKind {
        self.kind
    }

    pub fn is_reference_property(&self) -> bool {
        self.kind == AddressHeaderKind::ReferenceProperty
    }

    pub fn name(&self) -> &str {
        &self.element.name.local
    }

    pub fn namespace(&self) -> &str {
        &self.element.name.namespace
    }

    pub fn element(&self) -> &XmlElement {
        &self.element
    }

    /// Same header demoted to a reference parameter.
    pub fn as_parameter(&self) -> AddressHeader {
        AddressHeader::parameter(self.element.clone())
    }

    /// Promotes the header onto a message of the given version.
    pub fn to_message_header(&self, version: MessageVersion) -> MessageHeader {
        let mut element = self.element.clone();
        if version.addressing.kind == AddressingKind::WsAddressing10 {
            element.set_attribute(version.addressing.namespace, IS_REFERENCE_PARAMETER, "true");
        }
        MessageHeader::from_element(element, version.envelope)
    }

    fn equivalence_key(&self) -> (QName, String) {
        (self.element.name.clone(), self.element.canonical_string())
    }
}

/// Headers compare by name and content; the parameter/property kind does
/// not participate.
impl PartialEq for AddressHeader {
    fn eq(&self, other: &AddressHeader) -> bool {
        self.equivalence_key() == other.equivalence_key()
    }
}

/// Order-independent multiset comparison of two header lists.
pub fn headers_equivalent(a: &[AddressHeader], b: &[AddressHeader]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut ka: Vec<_> = a.iter().map(AddressHeader::equivalence_key).collect();
    let mut kb: Vec<_> = b.iter().map(AddressHeader::equivalence_key).collect();
    ka.sort();
    kb.sort();
    ka == kb
}

/// Processing attributes of a header as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaderInfo {
    pub name: String,
    pub namespace: String,
    pub actor: String,
    pub must_understand: bool,
    pub relay: bool,
    pub is_reference_parameter: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    info: MessageHeaderInfo,
    element: XmlElement,
}

fn is_true(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), Some("1") | Some("true"))
}

impl MessageHeader {
    /// Wraps a header element, reading its processing attributes for the
    /// given envelope.
    pub fn from_element(element: XmlElement, envelope: &EnvelopeVersion) -> MessageHeader {
        let env_ns = envelope.namespace;
        let actor = if envelope.actor_attribute.is_empty() {
            String::new()
        } else {
            element
                .attribute(env_ns, envelope.actor_attribute)
                .unwrap_or("")
                .to_string()
        };
        let is_reference_parameter = element.attributes.iter().any(|a| {
            a.name.local == IS_REFERENCE_PARAMETER && is_true(Some(a.value.as_str()))
        });
        let info = MessageHeaderInfo {
            name: element.name.local.clone(),
            namespace: element.name.namespace.clone(),
            actor,
            must_understand: is_true(element.attribute(env_ns, "mustUnderstand")),
            relay: envelope.kind == EnvelopeKind::Soap12 && is_true(element.attribute(env_ns, "relay")),
            is_reference_parameter,
        };
        MessageHeader { info, element }
    }

    pub fn new(namespace: &str, name: &str, content: &str, envelope: &EnvelopeVersion) -> MessageHeader {
        MessageHeader::from_element(XmlElement::new(namespace, name).with_text(content), envelope)
    }

    /// Marks the header as mandatory for the receiver.
    pub fn with_must_understand(mut self, envelope: &EnvelopeVersion) -> MessageHeader {
        if envelope.kind != EnvelopeKind::None {
            self.element
                .set_attribute(envelope.namespace, "mustUnderstand", envelope.must_understand_value);
            self.info.must_understand = true;
        }
        self
    }

    pub fn info(&self) -> &MessageHeaderInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn namespace(&self) -> &str {
        &self.info.namespace
    }

    pub fn element(&self) -> &XmlElement {
        &self.element
    }

    pub fn text(&self) -> String {
        self.element.trimmed_text()
    }
}

#[derive(Debug, Clone)]
pub struct MessageHeaders {
    version: MessageVersion,
    headers: Vec<MessageHeader>,
    understood: HashSet<QName>,
}

impl MessageHeaders {
    pub fn new(version: MessageVersion) -> MessageHeaders {
        MessageHeaders {
            version,
            headers: Vec::new(),
            understood: HashSet::new(),
        }
    }

    pub fn version(&self) -> MessageVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageHeader> {
        self.headers.iter()
    }

    pub fn add(&mut self, header: MessageHeader) {
        self.headers.push(header);
    }

    pub fn remove_all(&mut self, name: &str, namespace: &str) {
        self.headers
            .retain(|h| !(h.name() == name && h.namespace() == namespace));
    }

    pub fn find_all(&self, name: &str, namespace: &str) -> Vec<&MessageHeader> {
        self.headers
            .iter()
            .filter(|h| h.name() == name && h.namespace() == namespace)
            .collect()
    }

    /// Finds the single header with this name. More than one is a
    /// cardinality violation.
    pub fn find_header(&self, name: &str, namespace: &str) -> Result<Option<&MessageHeader>, Error> {
        let mut found = self.headers.iter().filter(|h| {
            h.name() == name
                && h.namespace() == namespace
                && self
                    .version
                    .envelope
                    .recognized_roles()
                    .contains(&h.info().actor.as_str())
        });
        let first = found.next();
        if first.is_some() && found.next().is_some() {
            return Err(MessageHeaderError::duplicate(name, namespace).into());
        }
        Ok(first)
    }

    pub fn mark_understood(&mut self, name: &str, namespace: &str) {
        self.understood.insert(QName::new(namespace, name));
    }

    pub fn is_understood(&self, name: &str, namespace: &str) -> bool {
        self.understood.contains(&QName::new(namespace, name))
    }

    /// Mandatory headers targeted at this node that nobody claimed.
    pub fn not_understood(&self) -> Vec<MessageHeaderInfo> {
        let roles = self.version.envelope.recognized_roles();
        self.headers
            .iter()
            .filter(|h| h.info().must_understand)
            .filter(|h| roles.contains(&h.info().actor.as_str()))
            .filter(|h| !self.is_understood(h.name(), h.namespace()))
            .map(|h| h.info().clone())
            .collect()
    }

    fn addressing_text(&self, name: &str) -> Result<Option<String>, Error> {
        if self.version.addressing.is_none() {
            return Ok(None);
        }
        Ok(self
            .find_header(name, self.version.addressing.namespace)?
            .map(MessageHeader::text))
    }

    fn set_addressing_element(&mut self, name: &str, element: Option<XmlElement>) {
        if self.version.addressing.is_none() {
            return;
        }
        let ns = self.version.addressing.namespace;
        self.remove_all(name, ns);
        if let Some(el) = element {
            let header = MessageHeader::from_element(el, self.version.envelope);
            self.headers.push(header);
        }
        self.mark_understood(name, ns);
    }

    fn set_addressing_text(&mut self, name: &str, value: Option<&str>) {
        let ns = self.version.addressing.namespace;
        let element = value.map(|v| XmlElement::new(ns, name).with_prefix("a").with_text(v));
        self.set_addressing_element(name, element);
    }

    pub fn action(&self) -> Result<Option<String>, Error> {
        self.addressing_text(names::ACTION)
    }

    pub fn set_action(&mut self, action: Option<&str>) {
        self.set_addressing_text(names::ACTION, action)
    }

    pub fn to(&self) -> Result<Option<Uri>, Error> {
        match self.addressing_text(names::TO)? {
            Some(s) => Ok(Some(Uri::parse(&s)?)),
            None => Ok(None),
        }
    }

    pub fn set_to(&mut self, to: Option<&Uri>) {
        self.set_addressing_text(names::TO, to.map(Uri::as_str))
    }

    pub fn message_id(&self) -> Result<Option<String>, Error> {
        self.addressing_text(names::MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, id: Option<&str>) {
        self.set_addressing_text(names::MESSAGE_ID, id)
    }

    pub fn relates_to(&self) -> Result<Option<String>, Error> {
        self.addressing_text(names::RELATES_TO)
    }

    pub fn set_relates_to(&mut self, id: Option<&str>) {
        self.set_addressing_text(names::RELATES_TO, id)
    }

    fn addressing_endpoint(&self, name: &str) -> Result<Option<EndpointAddress>, Error> {
        if self.version.addressing.is_none() {
            return Ok(None);
        }
        match self.find_header(name, self.version.addressing.namespace)? {
            Some(h) => Ok(Some(EndpointAddress::read_from_version(
                self.version.addressing,
                h.element(),
            )?)),
            None => Ok(None),
        }
    }

    fn set_addressing_endpoint(&mut self, name: &str, address: Option<&EndpointAddress>) -> Result<(), Error> {
        let element = match address {
            Some(a) => Some(a.write_to(self.version.addressing, self.version.addressing.namespace, name)?),
            None => None,
        };
        self.set_addressing_element(name, element);
        Ok(())
    }

    pub fn reply_to(&self) -> Result<Option<EndpointAddress>, Error> {
        self.addressing_endpoint(names::REPLY_TO)
    }

    pub fn set_reply_to(&mut self, address: Option<&EndpointAddress>) -> Result<(), Error> {
        self.set_addressing_endpoint(names::REPLY_TO, address)
    }

    pub fn fault_to(&self) -> Result<Option<EndpointAddress>, Error> {
        self.addressing_endpoint(names::FAULT_TO)
    }

    pub fn set_fault_to(&mut self, address: Option<&EndpointAddress>) -> Result<(), Error> {
        self.set_addressing_endpoint(names::FAULT_TO, address)
    }

    pub fn from(&self) -> Result<Option<EndpointAddress>, Error> {
        self.addressing_endpoint(names::FROM)
    }

    pub fn set_from(&mut self, address: Option<&EndpointAddress>) -> Result<(), Error> {
        self.set_addressing_endpoint(names::FROM, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::EnvelopeVersion;

    fn wsa() -> &'static str {
        MessageVersion::SOAP12_WSA10.addressing.namespace
    }

    #[test]
    fn header_sets_compare_unordered() {
        let a = AddressHeader::parameter(XmlElement::new("urn:h", "A").with_text("1"));
        let b = AddressHeader::property(XmlElement::new("urn:h", "B").with_text("2"));
        let b_param = b.as_parameter();
        assert!(headers_equivalent(&[a.clone(), b.clone()], &[b_param, a.clone()]));
        assert!(!headers_equivalent(&[a.clone(), a.clone()], &[a.clone(), b.clone()]));
        assert!(!headers_equivalent(&[a.clone()], &[]));
    }

    #[test]
    fn promoted_reference_parameters_are_marked() {
        let h = AddressHeader::parameter(XmlElement::new("urn:h", "Key").with_text("42"));
        let promoted = h.to_message_header(MessageVersion::SOAP12_WSA10);
        assert!(promoted.info().is_reference_parameter);
        let promoted = h.to_message_header(MessageVersion::SOAP12_WSA_AUGUST_2004);
        assert!(!promoted.info().is_reference_parameter);
    }

    #[test]
    fn duplicate_headers_are_reported() {
        let mut headers = MessageHeaders::new(MessageVersion::SOAP12_WSA10);
        headers.set_action(Some("urn:a"));
        assert_eq!(headers.action().unwrap(), Some(String::from("urn:a")));
        headers.add(MessageHeader::new(wsa(), "Action", "urn:b", EnvelopeVersion::SOAP12));
        match headers.action() {
            Err(Error::Protocol(p)) => assert!(p.to_string().contains("Action")),
            other => panic!("expected duplicate error, got {:?}", other),
        }
    }

    #[test]
    fn headers_for_other_roles_are_ignored() {
        let mut headers = MessageHeaders::new(MessageVersion::SOAP12_WSA10);
        let mut el = XmlElement::new(wsa(), "Action").with_text("urn:other");
        el.set_attribute(EnvelopeVersion::SOAP12.namespace, "role", "urn:some-intermediary");
        headers.add(MessageHeader::from_element(el, EnvelopeVersion::SOAP12));
        assert_eq!(headers.action().unwrap(), None);
    }

    #[test]
    fn not_understood_lists_unclaimed_mandatory_headers() {
        let env = EnvelopeVersion::SOAP11;
        let mut headers = MessageHeaders::new(MessageVersion::SOAP11_WSA10);
        headers.add(MessageHeader::new("urn:x", "Secret", "s", env).with_must_understand(env));
        headers.add(MessageHeader::new("urn:x", "Optional", "o", env));
        headers.set_action(Some("urn:act"));

        let missing = headers.not_understood();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name, "Secret");

        headers.mark_understood("Secret", "urn:x");
        assert!(headers.not_understood().is_empty());
    }

    #[test]
    fn unaddressed_versions_drop_addressing_headers() {
        let mut headers = MessageHeaders::new(MessageVersion::SOAP11);
        headers.set_action(Some("urn:a"));
        assert!(headers.is_empty());
        assert_eq!(headers.action().unwrap(), None);
    }
}
