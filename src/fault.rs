/*
 * Copyright 2020 Joyent, Inc.
 */

//! SOAP fault model.
//!
//! A [`MessageFault`] is written differently per envelope generation:
//!
//! ```text
//! SOAP 1.2                                SOAP 1.1
//! <s:Fault>                               <s:Fault>
//!   <s:Code>                                <faultcode>s:Client</faultcode>
//!     <s:Value>s:Sender</s:Value>           <faultstring xml:lang="..">..</faultstring>
//!     <s:Subcode>..</s:Subcode>?            <faultactor>..</faultactor>?
//!   </s:Code>                               <detail>..</detail>?
//!   <s:Reason>                            </s:Fault>
//!     <s:Text xml:lang="..">..</s:Text>+
//!   </s:Reason>
//!   <s:Node>..</s:Node>?
//!   <s:Role>..</s:Role>?
//!   <s:Detail>..</s:Detail>?
//! </s:Fault>
//! ```
//!
//! SOAP 1.1 has no subcodes; when a predefined code carries one, the
//! subcode is written as the `faultcode` instead.

use std::fmt;

use crate::error::Error;
use crate::header::{MessageHeader, MessageHeaders};
use crate::uri::Uri;
use crate::version::{AddressingVersion, EnvelopeKind, EnvelopeVersion, XML_NAMESPACE};
use crate::xml::{NamespaceScope, QName, XmlElement, XmlError};

const ENV_PREFIX: &str = "s";
const CODE_PREFIX: &str = "c";
const WSA_PREFIX: &str = "a";

pub const PROBLEM_HEADER_QNAME: &str = "ProblemHeaderQName";
pub const FAULT_DETAIL: &str = "FaultDetail";

/*
 * Fault codes
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultCode {
    name: String,
    namespace: String,
    subcode: Option<Box<FaultCode>>,
    envelope: Option<&'static EnvelopeVersion>,
}

impl FaultCode {
    /// Creates a code. The name must be non-empty and the namespace either
    /// empty or an absolute URI.
    pub fn new(name: &str, namespace: &str) -> Result<FaultCode, Error> {
        if name.is_empty() {
            return Err(Error::argument("name", "fault code name must not be empty"));
        }
        if !namespace.is_empty() {
            Uri::parse_absolute(namespace)?;
        }
        Ok(FaultCode {
            name: String::from(name),
            namespace: String::from(namespace),
            subcode: None,
            envelope: EnvelopeVersion::from_namespace(namespace),
        })
    }

    /// Code in a namespace known to be valid, such as an addressing or
    /// envelope namespace constant.
    pub(crate) fn known(name: &str, namespace: &str) -> FaultCode {
        FaultCode {
            name: String::from(name),
            namespace: String::from(namespace),
            subcode: None,
            envelope: EnvelopeVersion::from_namespace(namespace),
        }
    }

    pub fn with_subcode(mut self, subcode: FaultCode) -> FaultCode {
        self.subcode = Some(Box::new(subcode));
        self
    }

    fn predefined(name: &'static str, subcode: Option<FaultCode>) -> FaultCode {
        FaultCode {
            name: String::from(name),
            namespace: String::new(),
            subcode: subcode.map(Box::new),
            envelope: None,
        }
    }

    /// Version-neutral sender code; written as `Client` or `Sender`.
    pub fn sender(subcode: Option<FaultCode>) -> FaultCode {
        FaultCode::predefined(EnvelopeVersion::SOAP12.sender_fault_name, subcode)
    }

    /// Version-neutral receiver code; written as `Server` or `Receiver`.
    pub fn receiver(subcode: Option<FaultCode>) -> FaultCode {
        FaultCode::predefined(EnvelopeVersion::SOAP12.receiver_fault_name, subcode)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn subcode(&self) -> Option<&FaultCode> {
        self.subcode.as_deref()
    }

    /// The envelope whose namespace this code lives in, if any.
    pub fn envelope_version(&self) -> Option<&'static EnvelopeVersion> {
        self.envelope
    }

    pub fn is_predefined_fault(&self) -> bool {
        self.namespace.is_empty() || self.envelope.is_some()
    }

    fn names(&self) -> &'static EnvelopeVersion {
        self.envelope.unwrap_or(EnvelopeVersion::SOAP12)
    }

    pub fn is_sender_fault(&self) -> bool {
        self.is_predefined_fault() && self.name == self.names().sender_fault_name
    }

    pub fn is_receiver_fault(&self) -> bool {
        self.is_predefined_fault() && self.name == self.names().receiver_fault_name
    }

    /// Name to use when writing for `envelope`, translating the predefined
    /// sender and receiver names.
    fn wire_name(&self, envelope: &EnvelopeVersion) -> &str {
        if self.is_sender_fault() {
            envelope.sender_fault_name
        } else if self.is_receiver_fault() {
            envelope.receiver_fault_name
        } else {
            &self.name
        }
    }

    fn value_element(&self, envelope: &EnvelopeVersion, namespace: &str, local: &str) -> XmlElement {
        let mut el = XmlElement::new(namespace, local);
        if !namespace.is_empty() {
            el = el.with_prefix(ENV_PREFIX);
        }
        if self.is_predefined_fault() {
            let value = format!("{}:{}", ENV_PREFIX, self.wire_name(envelope));
            el.with_namespace(Some(ENV_PREFIX), envelope.namespace).with_text(&value)
        } else if self.namespace.is_empty() {
            el.with_text(&self.name)
        } else {
            let value = format!("{}:{}", CODE_PREFIX, self.name);
            el.with_namespace(Some(CODE_PREFIX), &self.namespace).with_text(&value)
        }
    }

    fn from_qname(qname: QName) -> Result<FaultCode, Error> {
        FaultCode::new(&qname.local, &qname.namespace)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", QName::new(&self.namespace, &self.name))?;
        if let Some(sub) = &self.subcode {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

/*
 * Fault reasons
 */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReasonText {
    text: String,
    lang: String,
}

impl FaultReasonText {
    pub fn new(text: &str, lang: &str) -> FaultReasonText {
        FaultReasonText {
            text: String::from(text),
            lang: String::from(lang),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn lang(&self) -> &str {
        &self.lang
    }

    pub fn matches(&self, lang: &str) -> bool {
        self.lang.eq_ignore_ascii_case(lang)
    }
}

/// One or more translations of a fault's human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultReason {
    translations: Vec<FaultReasonText>,
}

impl FaultReason {
    pub fn new(text: &str, lang: &str) -> FaultReason {
        FaultReason {
            translations: vec![FaultReasonText::new(text, lang)],
        }
    }

    pub fn from_translations(translations: Vec<FaultReasonText>) -> Result<FaultReason, Error> {
        if translations.is_empty() {
            return Err(Error::argument(
                "translations",
                "a fault reason needs at least one translation",
            ));
        }
        Ok(FaultReason { translations })
    }

    pub fn translations(&self) -> &[FaultReasonText] {
        &self.translations
    }

    /// Picks the translation for `lang`: an exact match, then each shorter
    /// prefix of the tag (`en-GB` then `en`), then the first translation.
    pub fn get_matching_translation(&self, lang: &str) -> &FaultReasonText {
        let mut candidate = lang;
        loop {
            if let Some(t) = self.translations.iter().find(|t| t.matches(candidate)) {
                return t;
            }
            match candidate.rfind('-') {
                Some(idx) => candidate = &candidate[..idx],
                None => break,
            }
        }
        &self.translations[0]
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.translations[0].text())
    }
}

/*
 * Faults
 */

#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    Plain { detail: Option<XmlElement> },
    /// Names the offending addressing header. SOAP 1.2 carries it as body
    /// detail, SOAP 1.1 as a `FaultDetail` response header.
    ProblemHeaderQName {
        header: String,
        addressing: &'static AddressingVersion,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageFault {
    code: FaultCode,
    reason: FaultReason,
    actor: String,
    node: String,
    kind: FaultKind,
}

impl MessageFault {
    pub fn new(code: FaultCode, reason: FaultReason) -> MessageFault {
        MessageFault {
            code,
            reason,
            actor: String::new(),
            node: String::new(),
            kind: FaultKind::Plain { detail: None },
        }
    }

    pub fn with_detail(mut self, detail: XmlElement) -> MessageFault {
        self.kind = FaultKind::Plain {
            detail: Some(detail),
        };
        self
    }

    pub fn with_actor(mut self, actor: &str) -> MessageFault {
        self.actor = String::from(actor);
        self
    }

    pub fn with_node(mut self, node: &str) -> MessageFault {
        self.node = String::from(node);
        self
    }

    pub fn problem_header(
        code: FaultCode,
        reason: FaultReason,
        header: &str,
        addressing: &'static AddressingVersion,
    ) -> MessageFault {
        MessageFault {
            kind: FaultKind::ProblemHeaderQName {
                header: String::from(header),
                addressing,
            },
            ..MessageFault::new(code, reason)
        }
    }

    pub fn code(&self) -> &FaultCode {
        &self.code
    }

    pub fn reason(&self) -> &FaultReason {
        &self.reason
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    pub fn has_detail(&self) -> bool {
        match &self.kind {
            FaultKind::Plain { detail } => detail.is_some(),
            FaultKind::ProblemHeaderQName { .. } => true,
        }
    }

    /// The detail element as written for `envelope`, if any.
    pub fn detail(&self, envelope: &EnvelopeVersion) -> Option<XmlElement> {
        match &self.kind {
            FaultKind::Plain { detail } => detail.clone(),
            FaultKind::ProblemHeaderQName { header, addressing } => {
                if envelope.kind == EnvelopeKind::Soap12 {
                    Some(problem_header_qname(header, addressing))
                } else {
                    None
                }
            }
        }
    }

    /// Adds the response headers this fault needs for the message's
    /// envelope: a `FaultDetail` header for problem-header faults on
    /// SOAP 1.1.
    pub fn add_headers(&self, headers: &mut MessageHeaders) {
        let envelope = headers.version().envelope;
        if let FaultKind::ProblemHeaderQName { header, addressing } = &self.kind {
            if envelope.kind == EnvelopeKind::Soap11 {
                let detail = XmlElement::new(addressing.namespace, FAULT_DETAIL)
                    .with_prefix(WSA_PREFIX)
                    .with_child(problem_header_qname(header, addressing));
                headers.add(MessageHeader::from_element(detail, envelope));
            }
        }
    }

    /// Writes the `Fault` element for the envelope generation.
    pub fn write_to(&self, envelope: &EnvelopeVersion) -> Result<XmlElement, Error> {
        match envelope.kind {
            EnvelopeKind::Soap12 => Ok(self.write_12(envelope)),
            EnvelopeKind::Soap11 => Ok(self.write_11(envelope)),
            EnvelopeKind::None => Err(Error::NotSupported(String::from(
                "faults cannot be written without a SOAP envelope",
            ))),
        }
    }

    fn write_12(&self, envelope: &EnvelopeVersion) -> XmlElement {
        let ns = envelope.namespace;
        let env = |local: &str| XmlElement::new(ns, local).with_prefix(ENV_PREFIX);

        let mut code = env("Code");
        write_code_12(&self.code, envelope, &mut code);

        let mut reason = env("Reason");
        for t in self.reason.translations() {
            reason.push(
                env("Text")
                    .with_attribute(XML_NAMESPACE, "lang", t.lang())
                    .with_text(t.text()),
            );
        }

        let mut fault = env("Fault").with_child(code).with_child(reason);
        if !self.node.is_empty() {
            fault.push(env("Node").with_text(&self.node));
        }
        if !self.actor.is_empty() {
            fault.push(env("Role").with_text(&self.actor));
        }
        if let Some(detail) = self.detail(envelope) {
            fault.push(env("Detail").with_child(detail));
        }
        fault
    }

    fn write_11(&self, envelope: &EnvelopeVersion) -> XmlElement {
        let code = match self.code.subcode() {
            Some(sub) if self.code.is_predefined_fault() => sub,
            _ => &self.code,
        };
        let reason = self.reason.translations()[0].clone();

        let mut fault = XmlElement::new(envelope.namespace, "Fault")
            .with_prefix(ENV_PREFIX)
            .with_child(code.value_element(envelope, "", "faultcode"))
            .with_child(
                XmlElement::new("", "faultstring")
                    .with_attribute(XML_NAMESPACE, "lang", reason.lang())
                    .with_text(reason.text()),
            );
        if !self.actor.is_empty() {
            fault.push(XmlElement::new("", "faultactor").with_text(&self.actor));
        }
        if let Some(detail) = self.detail(envelope) {
            fault.push(XmlElement::new("", "detail").with_child(detail));
        }
        fault
    }

    /// Decodes a received `Fault` element. `scope` holds the namespace
    /// bindings in effect at the element (typically entered from the
    /// envelope and body).
    pub fn read_from(
        element: &XmlElement,
        envelope: &'static EnvelopeVersion,
        scope: &NamespaceScope,
    ) -> Result<MessageFault, Error> {
        if !element.is(envelope.namespace, "Fault") {
            return Err(XmlError::unexpected(&QName::new(envelope.namespace, "Fault"), element).into());
        }
        let scope = scope.enter(element);
        match envelope.kind {
            EnvelopeKind::Soap12 => read_12(element, envelope, &scope),
            EnvelopeKind::Soap11 => read_11(element, &scope),
            EnvelopeKind::None => Err(Error::NotSupported(String::from(
                "faults cannot be read without a SOAP envelope",
            ))),
        }
    }
}

fn problem_header_qname(header: &str, addressing: &AddressingVersion) -> XmlElement {
    XmlElement::new(addressing.namespace, PROBLEM_HEADER_QNAME)
        .with_prefix(WSA_PREFIX)
        .with_namespace(Some(WSA_PREFIX), addressing.namespace)
        .with_text(&format!("{}:{}", WSA_PREFIX, header))
}

fn write_code_12(code: &FaultCode, envelope: &EnvelopeVersion, parent: &mut XmlElement) {
    parent.push(code.value_element(envelope, envelope.namespace, "Value"));
    if let Some(sub) = code.subcode() {
        let mut subcode = XmlElement::new(envelope.namespace, "Subcode").with_prefix(ENV_PREFIX);
        write_code_12(sub, envelope, &mut subcode);
        parent.push(subcode);
    }
}

fn required<'a>(parent: &'a XmlElement, namespace: &str, local: &str) -> Result<&'a XmlElement, Error> {
    parent.child(namespace, local).ok_or_else(|| {
        XmlError::new(format!(
            "{} is missing required element {}",
            parent.name,
            QName::new(namespace, local)
        ))
        .into()
    })
}

fn resolve_code(value: &XmlElement, scope: &NamespaceScope) -> Result<FaultCode, Error> {
    let text = value.trimmed_text();
    let qname = scope
        .enter(value)
        .resolve(&text)
        .ok_or_else(|| XmlError::new(format!("fault code '{}' uses an undeclared prefix", text)))?;
    FaultCode::from_qname(qname)
}

fn read_code_12(code: &XmlElement, envelope: &EnvelopeVersion, scope: &NamespaceScope) -> Result<FaultCode, Error> {
    let scope = scope.enter(code);
    let value = required(code, envelope.namespace, "Value")?;
    let mut result = resolve_code(value, &scope)?;
    if let Some(sub) = code.child(envelope.namespace, "Subcode") {
        result = result.with_subcode(read_code_12(sub, envelope, &scope)?);
    }
    Ok(result)
}

fn read_detail(detail: Option<&XmlElement>, scope: &NamespaceScope) -> FaultKind {
    let (detail, first) = match detail.and_then(|d| d.elements().next().map(|e| (d, e))) {
        Some(pair) => pair,
        None => return FaultKind::Plain { detail: None },
    };
    if first.name.local == PROBLEM_HEADER_QNAME {
        if let Some(addressing) = AddressingVersion::from_namespace(&first.name.namespace) {
            let scope = scope.enter(detail).enter(first);
            if let Some(q) = scope.resolve(&first.text()) {
                return FaultKind::ProblemHeaderQName {
                    header: q.local,
                    addressing,
                };
            }
        }
    }
    FaultKind::Plain {
        detail: Some(first.clone()),
    }
}

fn read_12(element: &XmlElement, envelope: &'static EnvelopeVersion, scope: &NamespaceScope) -> Result<MessageFault, Error> {
    let ns = envelope.namespace;
    let code = read_code_12(required(element, ns, "Code")?, envelope, scope)?;

    let translations = required(element, ns, "Reason")?
        .elements()
        .filter(|e| e.is(ns, "Text"))
        .map(|e| FaultReasonText::new(&e.text(), e.attribute(XML_NAMESPACE, "lang").unwrap_or("")))
        .collect();
    let reason = FaultReason::from_translations(translations)
        .map_err(|_| XmlError::new("fault Reason has no Text"))?;

    Ok(MessageFault {
        code,
        reason,
        actor: element.child(ns, "Role").map(XmlElement::trimmed_text).unwrap_or_default(),
        node: element.child(ns, "Node").map(XmlElement::trimmed_text).unwrap_or_default(),
        kind: read_detail(element.child(ns, "Detail"), scope),
    })
}

fn read_11(element: &XmlElement, scope: &NamespaceScope) -> Result<MessageFault, Error> {
    let code = resolve_code(required(element, "", "faultcode")?, scope)?;
    let text = required(element, "", "faultstring")?;
    let reason = FaultReason::new(
        &text.text(),
        text.attribute(XML_NAMESPACE, "lang").unwrap_or(""),
    );

    Ok(MessageFault {
        code,
        reason,
        actor: element
            .child("", "faultactor")
            .map(XmlElement::trimmed_text)
            .unwrap_or_default(),
        node: String::new(),
        kind: read_detail(element.child("", "detail"), scope),
    })
}
