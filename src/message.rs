/*
 * Copyright 2020 Joyent, Inc.
 */

//! The message abstraction shared by the codec, the dispatcher and
//! application handlers.

use serde_json::{Map, Value};

use crate::fault::MessageFault;
use crate::header::MessageHeaders;
use crate::version::MessageVersion;
use crate::xml::XmlElement;

/// Property holding the action supplied by the transport (for example the
/// HTTP `SOAPAction` header), when there is one.
pub const TRANSPORT_ACTION_PROPERTY: &str = "transport.action";

/// Property holding the address the transport received the message on.
pub const VIA_PROPERTY: &str = "transport.via";

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Empty,
    Element(XmlElement),
    Fault(MessageFault),
}

#[derive(Debug, Clone)]
pub struct Message {
    headers: MessageHeaders,
    properties: Map<String, Value>,
    body: MessageBody,
}

impl Message {
    pub fn new(version: MessageVersion, body: MessageBody) -> Message {
        Message {
            headers: MessageHeaders::new(version),
            properties: Map::new(),
            body,
        }
    }

    pub fn create(version: MessageVersion, action: Option<&str>, body: Option<XmlElement>) -> Message {
        let body = match body {
            Some(el) => MessageBody::Element(el),
            None => MessageBody::Empty,
        };
        let mut message = Message::new(version, body);
        message.headers.set_action(action);
        message
    }

    /// A fault message carrying any headers the fault requires.
    pub fn create_fault(version: MessageVersion, fault: MessageFault, action: Option<&str>) -> Message {
        let mut message = Message::new(version, MessageBody::Empty);
        message.headers.set_action(action);
        fault.add_headers(&mut message.headers);
        message.body = MessageBody::Fault(fault);
        message
    }

    pub fn version(&self) -> MessageVersion {
        self.headers.version()
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.properties
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    pub fn set_property(&mut self, name: &str, value: Value) {
        self.properties.insert(String::from(name), value);
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn set_body(&mut self, body: MessageBody) {
        self.body = body;
    }

    pub fn body_element(&self) -> Option<&XmlElement> {
        match &self.body {
            MessageBody::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.body, MessageBody::Fault(_))
    }

    pub fn fault(&self) -> Option<&MessageFault> {
        match &self.body {
            MessageBody::Fault(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body == MessageBody::Empty
    }

    /// Short description naming the message's action and id, used as
    /// error context. Header lookup failures are rendered as absent.
    pub fn describe(&self) -> String {
        let action = self.headers.action().ok().flatten();
        let id = self.headers.message_id().ok().flatten();
        format!(
            "action '{}', message id '{}'",
            action.as_deref().unwrap_or("<none>"),
            id.as_deref().unwrap_or("<none>")
        )
    }
}
