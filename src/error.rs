/*
 * Copyright 2020 Joyent, Inc.
 */

//! Error types.
//!
//! [`Error`] is returned by every fallible operation in the crate.
//! [`ProtocolError`] covers conditions that are answered on the wire: each
//! variant can render itself as a [`MessageFault`] for the message version
//! in use, add any version-specific response headers, and build the fault
//! [`Message`] sent back to the caller.

use std::io;

use thiserror::Error;

use crate::fault::{FaultCode, FaultReason, MessageFault};
use crate::header::{names, MessageHeader, MessageHeaderInfo, MessageHeaders};
use crate::message::Message;
use crate::version::{AddressingKind, EnvelopeKind, EnvelopeVersion, MessageVersion};
use crate::xml::{XmlElement, XmlError};

pub mod codes {
    pub const INVALID_ADDRESSING_HEADER: &str = "InvalidAddressingHeader";
    pub const INVALID_CARDINALITY: &str = "InvalidCardinality";
    pub const HEADER_REQUIRED: &str = "MessageAddressingHeaderRequired";
    pub const ACTION_MISMATCH: &str = "ActionMismatch";
    pub const DESTINATION_UNREACHABLE: &str = "DestinationUnreachable";
    pub const MUST_UNDERSTAND: &str = "MustUnderstand";
    pub const NOT_UNDERSTOOD: &str = "NotUnderstood";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument '{name}': {reason}")]
    Argument { name: &'static str, reason: String },

    #[error("object disposed: {0}")]
    ObjectDisposed(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid operation: {message}{}", .context.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    InvalidOperation {
        message: String,
        context: Option<String>,
    },

    #[error("communication failure: {0}")]
    Communication(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("malformed XML: {0}")]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    pub fn argument(name: &'static str, reason: impl Into<String>) -> Error {
        Error::Argument {
            name,
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Error {
        Error::InvalidOperation {
            message: message.into(),
            context: None,
        }
    }

    /// Attaches the identity of the message being processed to an
    /// `InvalidOperation`. Other kinds are returned unchanged.
    pub fn with_message_context(self, message: &Message) -> Error {
        match self {
            Error::InvalidOperation { message: m, .. } => Error::InvalidOperation {
                message: m,
                context: Some(message.describe()),
            },
            other => other,
        }
    }

    /// Failures an idle close may hit while racing other closes and
    /// aborts. These are logged and dropped.
    pub fn is_expected_close_failure(&self) -> bool {
        matches!(
            self,
            Error::ObjectDisposed(_)
                | Error::InvalidOperation { .. }
                | Error::Communication(_)
                | Error::Timeout(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Communication(e.to_string())
    }
}

/// An addressing header is missing or appears more than once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MessageHeaderError {
    pub name: String,
    pub namespace: String,
    pub is_duplicate: bool,
    pub message: String,
}

impl MessageHeaderError {
    pub fn duplicate(name: &str, namespace: &str) -> MessageHeaderError {
        MessageHeaderError {
            name: String::from(name),
            namespace: String::from(namespace),
            is_duplicate: true,
            message: format!(
                "Multiple headers with name '{}' and namespace '{}' found.",
                name, namespace
            ),
        }
    }

    pub fn missing(name: &str, namespace: &str) -> MessageHeaderError {
        MessageHeaderError {
            name: String::from(name),
            namespace: String::from(namespace),
            is_duplicate: false,
            message: format!(
                "Message is missing the required header '{}' from namespace '{}'.",
                name, namespace
            ),
        }
    }
}

/// The `Action` header disagrees with the transport-level action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionMismatchError {
    pub message: String,
    pub soap_action: String,
    pub header_action: String,
}

impl ActionMismatchError {
    pub fn new(soap_action: &str, header_action: &str) -> ActionMismatchError {
        ActionMismatchError {
            message: format!(
                "The SOAP action specified on the message, '{}', does not match the action '{}' in the addressing header.",
                soap_action, header_action
            ),
            soap_action: String::from(soap_action),
            header_action: String::from(header_action),
        }
    }
}

/// Mandatory headers nobody claimed. Only the first one is named in the
/// message; every one gets a `NotUnderstood` header on SOAP 1.2.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MustUnderstandError {
    pub message: String,
    pub not_understood: Vec<MessageHeaderInfo>,
    pub envelope: &'static EnvelopeVersion,
}

impl MustUnderstandError {
    pub fn new(
        not_understood: Vec<MessageHeaderInfo>,
        envelope: &'static EnvelopeVersion,
    ) -> MustUnderstandError {
        let message = match not_understood.first() {
            Some(h) => format!(
                "The header '{}' from the namespace '{}' was not understood by the recipient of this message, causing the message to not be processed.",
                h.name, h.namespace
            ),
            None => String::from("A mandatory header was not understood."),
        };
        MustUnderstandError {
            message,
            not_understood,
            envelope,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{reason}")]
    Protocol {
        reason: String,
        fault: Option<MessageFault>,
    },

    #[error(transparent)]
    MessageHeader(#[from] MessageHeaderError),

    #[error(transparent)]
    ActionMismatch(#[from] ActionMismatchError),

    #[error(transparent)]
    MustUnderstand(#[from] MustUnderstandError),

    #[error("The message with To '{to}' cannot be processed at the receiver: no endpoint accepts that address.")]
    DestinationUnreachable { to: String },
}

impl From<MessageHeaderError> for Error {
    fn from(e: MessageHeaderError) -> Error {
        Error::Protocol(ProtocolError::MessageHeader(e))
    }
}

impl From<ActionMismatchError> for Error {
    fn from(e: ActionMismatchError) -> Error {
        Error::Protocol(ProtocolError::ActionMismatch(e))
    }
}

impl From<MustUnderstandError> for Error {
    fn from(e: MustUnderstandError) -> Error {
        Error::Protocol(ProtocolError::MustUnderstand(e))
    }
}

impl ProtocolError {
    pub fn protocol(reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Protocol {
            reason: reason.into(),
            fault: None,
        }
    }

    /// Renders the error as a fault for `version`, with reasons tagged
    /// `lang`.
    pub fn to_message_fault(&self, version: MessageVersion, lang: &str) -> MessageFault {
        let addressing = version.addressing;
        let reason = FaultReason::new(&self.to_string(), lang);
        let problem = |code: FaultCode, header: &str| {
            if addressing.kind == AddressingKind::WsAddressing10 {
                MessageFault::problem_header(code, reason.clone(), header, addressing)
            } else {
                MessageFault::new(code, reason.clone())
            }
        };

        match self {
            ProtocolError::Protocol { fault: Some(f), .. } => f.clone(),
            ProtocolError::Protocol { fault: None, .. } => {
                MessageFault::new(FaultCode::receiver(None), reason.clone())
            }
            ProtocolError::MessageHeader(e) => {
                let sub = if e.is_duplicate {
                    FaultCode::known(codes::INVALID_ADDRESSING_HEADER, addressing.namespace)
                        .with_subcode(FaultCode::known(
                            codes::INVALID_CARDINALITY,
                            addressing.namespace,
                        ))
                } else {
                    FaultCode::known(codes::HEADER_REQUIRED, addressing.namespace)
                };
                problem(FaultCode::sender(Some(sub)), &e.name)
            }
            ProtocolError::ActionMismatch(_) => {
                let sub = FaultCode::known(codes::ACTION_MISMATCH, addressing.namespace);
                problem(FaultCode::sender(Some(sub)), names::ACTION)
            }
            ProtocolError::MustUnderstand(_) => MessageFault::new(
                FaultCode::known(codes::MUST_UNDERSTAND, version.envelope.namespace),
                reason.clone(),
            ),
            ProtocolError::DestinationUnreachable { .. } => {
                let sub = FaultCode::known(codes::DESTINATION_UNREACHABLE, addressing.namespace);
                MessageFault::new(FaultCode::sender(Some(sub)), reason.clone())
            }
        }
    }

    /// Adds the response headers that accompany this error's fault.
    pub fn add_headers(&self, headers: &mut MessageHeaders, lang: &str) {
        let version = headers.version();
        match self {
            ProtocolError::MustUnderstand(e) => {
                let envelope = version.envelope;
                if envelope.kind != EnvelopeKind::Soap12 {
                    return;
                }
                for info in &e.not_understood {
                    let header = XmlElement::new(envelope.namespace, codes::NOT_UNDERSTOOD)
                        .with_prefix("s")
                        .with_namespace(Some("h"), &info.namespace)
                        .with_attribute("", "qname", &format!("h:{}", info.name));
                    headers.add(MessageHeader::from_element(header, envelope));
                }
            }
            _ => self.to_message_fault(version, lang).add_headers(headers),
        }
    }

    fn fault_action(&self, version: MessageVersion) -> Option<&'static str> {
        let addressing = version.addressing;
        match self {
            ProtocolError::MessageHeader(_)
            | ProtocolError::ActionMismatch(_)
            | ProtocolError::DestinationUnreachable { .. } => addressing.fault_action,
            _ => addressing.default_fault_action,
        }
    }

    /// Builds the complete fault message for `version`.
    pub fn create_fault_message(&self, version: MessageVersion, lang: &str) -> Message {
        let fault = self.to_message_fault(version, lang);
        let mut message = Message::create_fault(version, fault, self.fault_action(version));
        if let ProtocolError::MustUnderstand(_) = self {
            self.add_headers(message.headers_mut(), lang);
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultKind, FAULT_DETAIL};
    use crate::version::AddressingVersion;

    const WSA10: &str = "http://www.w3.org/2005/08/addressing";

    fn info(name: &str) -> MessageHeaderInfo {
        MessageHeaderInfo {
            name: String::from(name),
            namespace: String::from("urn:app"),
            actor: String::new(),
            must_understand: true,
            relay: false,
            is_reference_parameter: false,
        }
    }

    #[test]
    fn duplicate_header_fault_codes() {
        let err = ProtocolError::from(MessageHeaderError::duplicate("To", WSA10));
        let fault = err.to_message_fault(MessageVersion::SOAP12_WSA10, "en-US");
        assert!(fault.code().is_sender_fault());
        let sub = fault.code().subcode().unwrap();
        assert_eq!(sub.name(), "InvalidAddressingHeader");
        assert_eq!(sub.subcode().unwrap().name(), "InvalidCardinality");
        assert_eq!(fault.reason().translations()[0].lang(), "en-US");
        match fault.kind() {
            FaultKind::ProblemHeaderQName { header, .. } => assert_eq!(header, "To"),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn missing_header_placement_follows_envelope() {
        let err = ProtocolError::from(MessageHeaderError::missing("Action", WSA10));

        let m11 = err.create_fault_message(MessageVersion::SOAP11_WSA10, "en-US");
        assert_eq!(m11.headers().find_all(FAULT_DETAIL, WSA10).len(), 1);
        let fault = m11.fault().unwrap();
        assert_eq!(fault.code().subcode().unwrap().name(), "MessageAddressingHeaderRequired");
        assert!(fault.detail(EnvelopeVersion::SOAP11).is_none());

        let m12 = err.create_fault_message(MessageVersion::SOAP12_WSA10, "en-US");
        assert!(m12.headers().find_all(FAULT_DETAIL, WSA10).is_empty());
        let detail = m12.fault().unwrap().detail(EnvelopeVersion::SOAP12).unwrap();
        assert!(detail.is(WSA10, "ProblemHeaderQName"));
        assert_eq!(
            m12.headers().action().unwrap().as_deref(),
            AddressingVersion::WS_ADDRESSING_10.fault_action
        );
    }

    #[test]
    fn action_mismatch_names_action() {
        let err = ProtocolError::from(ActionMismatchError::new("urn:a", "urn:b"));
        assert!(err.to_string().contains("urn:a"));
        let fault = err.to_message_fault(MessageVersion::SOAP12_WSA10, "en");
        assert_eq!(fault.code().subcode().unwrap().name(), "ActionMismatch");
        match fault.kind() {
            FaultKind::ProblemHeaderQName { header, .. } => assert_eq!(header, "Action"),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn must_understand_reason_is_first_header_only() {
        let err = ProtocolError::from(MustUnderstandError::new(
            vec![info("First"), info("Second")],
            EnvelopeVersion::SOAP12,
        ));
        let text = err.to_string();
        assert!(text.contains("First"));
        assert!(!text.contains("Second"));

        let m12 = err.create_fault_message(MessageVersion::SOAP12_WSA10, "en-US");
        let not_understood = m12
            .headers()
            .find_all("NotUnderstood", EnvelopeVersion::SOAP12.namespace);
        assert_eq!(not_understood.len(), 2);
        let q = not_understood[1]
            .element()
            .resolve_qname_value(not_understood[1].element().attribute("", "qname").unwrap())
            .unwrap();
        assert_eq!(q.local, "Second");
        assert_eq!(q.namespace, "urn:app");
        assert_eq!(m12.fault().unwrap().code().name(), "MustUnderstand");

        let m11 = err.create_fault_message(MessageVersion::SOAP11_WSA10, "en-US");
        assert!(m11
            .headers()
            .find_all("NotUnderstood", EnvelopeVersion::SOAP11.namespace)
            .is_empty());
    }

    #[test]
    fn close_failures_are_classified() {
        assert!(Error::Timeout(String::from("t")).is_expected_close_failure());
        assert!(Error::ObjectDisposed(String::from("d")).is_expected_close_failure());
        assert!(Error::invalid_operation("x").is_expected_close_failure());
        assert!(!Error::argument("a", "b").is_expected_close_failure());
        assert!(!Error::NotSupported(String::from("n")).is_expected_close_failure());
    }

    #[test]
    fn invalid_operation_carries_context() {
        let mut message = Message::create(MessageVersion::SOAP12_WSA10, Some("urn:op"), None);
        message.headers_mut().set_message_id(Some("urn:uuid:1"));
        let err = Error::invalid_operation("no behavior").with_message_context(&message);
        let text = err.to_string();
        assert!(text.contains("no behavior"));
        assert!(text.contains("urn:op"));
        assert!(text.contains("urn:uuid:1"));
    }
}
