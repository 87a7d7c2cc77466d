/*
 * Copyright 2020 Joyent, Inc.
 */

//! Protocol version tables.
//!
//! Each envelope and addressing generation is a `'static` constant; the
//! tables are plain data and are compared by value.

use std::fmt;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";
pub const IDENTITY_NAMESPACE: &str =
    "http://schemas.xmlsoap.org/ws/2006/02/addressingidentity";
pub const XMLDSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const POLICY_NAMESPACE: &str = "http://schemas.xmlsoap.org/ws/2004/09/policy";

/// Version-agnostic sentinel for "reply on the back channel".
pub const ANONYMOUS_URI: &str =
    "http://schemas.microsoft.com/2005/12/ServiceModel/Addressing/Anonymous";
/// Version-agnostic sentinel for "do not reply".
pub const NONE_URI: &str =
    "http://schemas.microsoft.com/2005/12/ServiceModel/Addressing/None";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Soap11,
    Soap12,
    None,
}

/// SOAP envelope generation.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EnvelopeVersion {
    pub kind: EnvelopeKind,
    pub name: &'static str,
    pub namespace: &'static str,
    pub sender_fault_name: &'static str,
    pub receiver_fault_name: &'static str,
    pub next_destination_role: &'static str,
    pub ultimate_destination_role: &'static str,
    /// Value written for `mustUnderstand`.
    pub must_understand_value: &'static str,
    /// Attribute naming the header target (`actor` or `role`).
    pub actor_attribute: &'static str,
}

impl EnvelopeVersion {
    pub const SOAP11: &'static EnvelopeVersion = &EnvelopeVersion {
        kind: EnvelopeKind::Soap11,
        name: "Soap11",
        namespace: "http://schemas.xmlsoap.org/soap/envelope/",
        sender_fault_name: "Client",
        receiver_fault_name: "Server",
        next_destination_role: "http://schemas.xmlsoap.org/soap/actor/next",
        ultimate_destination_role: "",
        must_understand_value: "1",
        actor_attribute: "actor",
    };

    pub const SOAP12: &'static EnvelopeVersion = &EnvelopeVersion {
        kind: EnvelopeKind::Soap12,
        name: "Soap12",
        namespace: "http://www.w3.org/2003/05/soap-envelope",
        sender_fault_name: "Sender",
        receiver_fault_name: "Receiver",
        next_destination_role: "http://www.w3.org/2003/05/soap-envelope/role/next",
        ultimate_destination_role:
            "http://www.w3.org/2003/05/soap-envelope/role/ultimateReceiver",
        must_understand_value: "true",
        actor_attribute: "role",
    };

    pub const NONE: &'static EnvelopeVersion = &EnvelopeVersion {
        kind: EnvelopeKind::None,
        name: "EnvelopeNone",
        namespace: "http://schemas.microsoft.com/ws/2005/05/envelope/none",
        sender_fault_name: "Sender",
        receiver_fault_name: "Receiver",
        next_destination_role: "",
        ultimate_destination_role: "",
        must_understand_value: "",
        actor_attribute: "",
    };

    pub fn all() -> [&'static EnvelopeVersion; 3] {
        [Self::SOAP11, Self::SOAP12, Self::NONE]
    }

    /// Maps an envelope namespace back to its version.
    pub fn from_namespace(ns: &str) -> Option<&'static EnvelopeVersion> {
        Self::all().into_iter().find(|v| v.namespace == ns)
    }

    /// Roles a header may target and still be processed here.
    pub fn recognized_roles(&self) -> Vec<&'static str> {
        match self.kind {
            EnvelopeKind::Soap11 => vec!["", self.next_destination_role],
            EnvelopeKind::Soap12 => vec![
                "",
                self.next_destination_role,
                self.ultimate_destination_role,
            ],
            EnvelopeKind::None => vec![],
        }
    }
}

impl fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingKind {
    WsAddressing10,
    WsAddressingAugust2004,
    None,
}

/// WS-Addressing generation.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AddressingVersion {
    pub kind: AddressingKind,
    pub name: &'static str,
    pub namespace: &'static str,
    pub anonymous: &'static str,
    pub none: Option<&'static str>,
    pub default_fault_action: Option<&'static str>,
    /// Action used for addressing faults (problem header, action mismatch).
    pub fault_action: Option<&'static str>,
}

impl AddressingVersion {
    pub const WS_ADDRESSING_10: &'static AddressingVersion = &AddressingVersion {
        kind: AddressingKind::WsAddressing10,
        name: "Addressing10",
        namespace: "http://www.w3.org/2005/08/addressing",
        anonymous: "http://www.w3.org/2005/08/addressing/anonymous",
        none: Some("http://www.w3.org/2005/08/addressing/none"),
        default_fault_action: Some("http://www.w3.org/2005/08/addressing/soap/fault"),
        fault_action: Some("http://www.w3.org/2005/08/addressing/fault"),
    };

    pub const WS_ADDRESSING_AUGUST_2004: &'static AddressingVersion =
        &AddressingVersion {
            kind: AddressingKind::WsAddressingAugust2004,
            name: "Addressing200408",
            namespace: "http://schemas.xmlsoap.org/ws/2004/08/addressing",
            anonymous:
                "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            none: None,
            default_fault_action:
                Some("http://schemas.xmlsoap.org/ws/2004/08/addressing/fault"),
            fault_action:
                Some("http://schemas.xmlsoap.org/ws/2004/08/addressing/fault"),
        };

    pub const NONE: &'static AddressingVersion = &AddressingVersion {
        kind: AddressingKind::None,
        name: "AddressingNone",
        namespace: "http://schemas.microsoft.com/ws/2005/05/addressing/none",
        anonymous: ANONYMOUS_URI,
        none: None,
        default_fault_action: None,
        fault_action: None,
    };

    pub fn all() -> [&'static AddressingVersion; 3] {
        [Self::WS_ADDRESSING_10, Self::WS_ADDRESSING_AUGUST_2004, Self::NONE]
    }

    pub fn from_namespace(ns: &str) -> Option<&'static AddressingVersion> {
        Self::all().into_iter().find(|v| v.namespace == ns)
    }

    pub fn is_none(&self) -> bool {
        self.kind == AddressingKind::None
    }
}

impl fmt::Display for AddressingVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.namespace)
    }
}

/// Envelope and addressing generation pair carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageVersion {
    pub envelope: &'static EnvelopeVersion,
    pub addressing: &'static AddressingVersion,
}

impl MessageVersion {
    pub const SOAP12_WSA10: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP12,
        addressing: AddressingVersion::WS_ADDRESSING_10,
    };
    pub const SOAP11_WSA10: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP11,
        addressing: AddressingVersion::WS_ADDRESSING_10,
    };
    pub const SOAP12_WSA_AUGUST_2004: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP12,
        addressing: AddressingVersion::WS_ADDRESSING_AUGUST_2004,
    };
    pub const SOAP11_WSA_AUGUST_2004: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP11,
        addressing: AddressingVersion::WS_ADDRESSING_AUGUST_2004,
    };
    pub const SOAP11: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP11,
        addressing: AddressingVersion::NONE,
    };
    pub const SOAP12: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::SOAP12,
        addressing: AddressingVersion::NONE,
    };
    pub const NONE: MessageVersion = MessageVersion {
        envelope: EnvelopeVersion::NONE,
        addressing: AddressingVersion::NONE,
    };

    pub fn new(
        envelope: &'static EnvelopeVersion,
        addressing: &'static AddressingVersion,
    ) -> MessageVersion {
        MessageVersion { envelope, addressing }
    }
}

impl Default for MessageVersion {
    fn default() -> Self {
        MessageVersion::SOAP12_WSA10
    }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.envelope.name, self.addressing.name)
    }
}
