/*
 * Copyright 2020 Joyent, Inc.
 */

//! Endpoint addresses.
//!
//! An [`EndpointAddress`] is an absolute URI plus the reference headers,
//! identity and opaque XML (metadata, extensions, policy blobs) that travel
//! with it. Addresses are immutable and cheap to clone; use
//! [`EndpointAddressBuilder`] to derive a modified copy.
//!
//! Wire shape for WS-Addressing 1.0:
//!
//! ```text
//! <wsa:EndpointReference>
//!   <wsa:Address>xs:anyURI</wsa:Address>
//!   <wsa:ReferenceParameters>xs:any*</wsa:ReferenceParameters>?
//!   <wsa:Metadata>xs:any*</wsa:Metadata>?
//!   <id:Identity>...</id:Identity>?
//!   xs:any*
//! </wsa:EndpointReference>
//! ```
//!
//! August 2004 adds `ReferenceProperties` before `ReferenceParameters` and
//! the `PortType`/`ServiceName`/`wsp:Policy` group after them, and has no
//! `Metadata`. With no addressing the element content is the URI text.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock};

use crate::buffer::{SectionKind, XmlBuffer, XmlBufferBuilder, XmlQuotas};
use crate::error::Error;
use crate::header::{headers_equivalent, AddressHeader, AddressHeaderKind, MessageHeaders};
use crate::identity::EndpointIdentity;
use crate::uri::{uri_equals, Uri};
use crate::version::{
    AddressingKind, AddressingVersion, ANONYMOUS_URI, IDENTITY_NAMESPACE, NONE_URI,
    POLICY_NAMESPACE,
};
use crate::xml::{QName, XmlElement, XmlError, XmlNode};

static ANONYMOUS: LazyLock<Uri> =
    LazyLock::new(|| Uri::parse(ANONYMOUS_URI).expect("anonymous sentinel URI is valid"));
static NONE: LazyLock<Uri> =
    LazyLock::new(|| Uri::parse(NONE_URI).expect("none sentinel URI is valid"));
static ANONYMOUS_ADDRESS: LazyLock<EndpointAddress> = LazyLock::new(|| {
    EndpointAddress(Arc::new(AddressInner {
        uri: anonymous_uri(),
        headers: Vec::new(),
        identity: None,
        buffer: None,
        is_anonymous: true,
        is_none: false,
    }))
});

/// The shared anonymous sentinel URI.
pub fn anonymous_uri() -> Uri {
    ANONYMOUS.clone()
}

/// The shared "do not reply" sentinel URI.
pub fn none_uri() -> Uri {
    NONE.clone()
}

const EPR_PREFIX: &str = "a";

mod elements {
    pub const ENDPOINT_REFERENCE: &str = "EndpointReference";
    pub const ADDRESS: &str = "Address";
    pub const REFERENCE_PARAMETERS: &str = "ReferenceParameters";
    pub const REFERENCE_PROPERTIES: &str = "ReferenceProperties";
    pub const METADATA: &str = "Metadata";
    pub const IDENTITY: &str = "Identity";
    pub const PORT_TYPE: &str = "PortType";
    pub const SERVICE_NAME: &str = "ServiceName";
    pub const POLICY: &str = "Policy";
}

#[derive(Debug)]
struct AddressInner {
    uri: Uri,
    headers: Vec<AddressHeader>,
    identity: Option<EndpointIdentity>,
    buffer: Option<XmlBuffer>,
    is_anonymous: bool,
    is_none: bool,
}

#[derive(Debug, Clone)]
pub struct EndpointAddress(Arc<AddressInner>);

/// Opaque XML collected while reading an address.
#[derive(Default)]
struct Sections {
    metadata: Option<XmlElement>,
    psp: Vec<XmlElement>,
    extensions: Vec<XmlElement>,
}

impl Sections {
    fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.psp.is_empty() && self.extensions.is_empty()
    }

    fn into_buffer(self, quotas: XmlQuotas) -> Result<Option<XmlBuffer>, Error> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut builder = XmlBufferBuilder::new(quotas);
        if let Some(metadata) = self.metadata {
            builder.write_section(SectionKind::Metadata, &[XmlNode::Element(metadata)])?;
        }
        if !self.psp.is_empty() {
            builder.write_section(SectionKind::Psp, &to_nodes(self.psp))?;
        }
        if !self.extensions.is_empty() {
            builder.write_section(SectionKind::Extensions, &to_nodes(self.extensions))?;
        }
        Ok(Some(builder.close()))
    }
}

fn to_nodes(elements: Vec<XmlElement>) -> Vec<XmlNode> {
    elements.into_iter().map(XmlNode::Element).collect()
}

fn only_elements(nodes: Vec<XmlNode>) -> Vec<XmlElement> {
    nodes
        .into_iter()
        .filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
        .collect()
}

impl EndpointAddress {
    /// Address for an absolute URI string with no headers or identity.
    pub fn new(uri: &str) -> Result<EndpointAddress, Error> {
        EndpointAddress::with_uri(Uri::parse(uri)?, None, Vec::new())
    }

    pub fn with_uri(
        uri: Uri,
        identity: Option<EndpointIdentity>,
        headers: Vec<AddressHeader>,
    ) -> Result<EndpointAddress, Error> {
        EndpointAddress::from_parts(None, uri, identity, headers, None)
    }

    fn from_parts(
        version: Option<&AddressingVersion>,
        uri: Uri,
        identity: Option<EndpointIdentity>,
        headers: Vec<AddressHeader>,
        buffer: Option<XmlBuffer>,
    ) -> Result<EndpointAddress, Error> {
        if !uri.is_absolute() {
            return Err(Error::argument(
                "uri",
                format!("'{}' is not an absolute URI", uri),
            ));
        }

        let is_anonymous = Uri::ptr_eq(&uri, &ANONYMOUS)
            || uri == *ANONYMOUS
            || version.map_or(false, |v| uri.as_str() == v.anonymous);
        let is_none = !is_anonymous
            && (Uri::ptr_eq(&uri, &NONE)
                || uri == *NONE
                || version.and_then(|v| v.none).map_or(false, |n| uri.as_str() == n));
        let uri = if is_anonymous {
            anonymous_uri()
        } else if is_none {
            none_uri()
        } else {
            uri
        };

        Ok(EndpointAddress(Arc::new(AddressInner {
            uri,
            headers,
            identity,
            buffer,
            is_anonymous,
            is_none,
        })))
    }

    /// The shared anonymous address.
    pub fn anonymous() -> EndpointAddress {
        ANONYMOUS_ADDRESS.clone()
    }

    /// A fresh address for the "none" sentinel. Never shared.
    pub fn none() -> EndpointAddress {
        EndpointAddress(Arc::new(AddressInner {
            uri: none_uri(),
            headers: Vec::new(),
            identity: None,
            buffer: None,
            is_anonymous: false,
            is_none: true,
        }))
    }

    pub fn uri(&self) -> &Uri {
        &self.0.uri
    }

    pub fn headers(&self) -> &[AddressHeader] {
        &self.0.headers
    }

    pub fn identity(&self) -> Option<&EndpointIdentity> {
        self.0.identity.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_anonymous
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none
    }

    pub fn ptr_eq(a: &EndpointAddress, b: &EndpointAddress) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn section(&self, kind: SectionKind) -> Result<Option<Vec<XmlNode>>, Error> {
        match &self.0.buffer {
            Some(buffer) => match buffer.find(kind) {
                Some(idx) => Ok(Some(buffer.read_section(idx)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Raw bytes of a buffered section, as stored.
    pub fn section_bytes(&self, kind: SectionKind) -> Option<&[u8]> {
        let buffer = self.0.buffer.as_ref()?;
        buffer.section_bytes(buffer.find(kind)?)
    }

    /// Children of the `Metadata` element, if one was present.
    pub fn metadata(&self) -> Result<Option<Vec<XmlElement>>, Error> {
        Ok(self
            .section(SectionKind::Metadata)?
            .and_then(|nodes| only_elements(nodes).into_iter().next())
            .map(|metadata| metadata.elements().cloned().collect()))
    }

    pub fn extensions(&self) -> Result<Vec<XmlElement>, Error> {
        Ok(self
            .section(SectionKind::Extensions)?
            .map(only_elements)
            .unwrap_or_default())
    }

    /// August 2004 `PortType`/`ServiceName`/`Policy` elements.
    pub fn psp(&self) -> Result<Vec<XmlElement>, Error> {
        Ok(self
            .section(SectionKind::Psp)?
            .map(only_elements)
            .unwrap_or_default())
    }

    fn metadata_element(&self) -> Result<Option<XmlElement>, Error> {
        Ok(self
            .section(SectionKind::Metadata)?
            .and_then(|nodes| only_elements(nodes).into_iter().next()))
    }

    pub fn to_builder(&self) -> Result<EndpointAddressBuilder, Error> {
        let mut builder = EndpointAddressBuilder::new(self.0.uri.clone());
        builder.headers = self.0.headers.clone();
        builder.identity = self.0.identity.clone();
        builder.metadata = self.metadata_element()?;
        builder.psp = self.psp()?;
        builder.extensions = self.extensions()?;
        if let Some(buffer) = &self.0.buffer {
            builder.quotas = buffer.quotas();
        }
        Ok(builder)
    }

    /// Version-insensitive comparison: URIs via [`uri_equals`] (host and
    /// port included, case-sensitive path), identities, and header sets
    /// regardless of order.
    pub fn endpoint_equals(&self, other: &EndpointAddress) -> bool {
        if EndpointAddress::ptr_eq(self, other) {
            return true;
        }
        if !uri_equals(self.uri(), other.uri(), false, true) {
            return false;
        }
        if self.identity() != other.identity() {
            return false;
        }
        headers_equivalent(self.headers(), other.headers())
    }

    /*
     * Reading
     */

    /// Reads an endpoint reference, detecting the addressing version from
    /// the element's namespace.
    pub fn read_from(element: &XmlElement) -> Result<EndpointAddress, Error> {
        let version = AddressingVersion::from_namespace(&element.name.namespace)
            .filter(|v| !v.is_none())
            .ok_or_else(|| {
                XmlError::new(format!(
                    "{} is not in a known addressing namespace",
                    element.name
                ))
            })?;
        EndpointAddress::read_from_version(version, element)
    }

    /// Reads the contents of `element` as an address of `version`.
    pub fn read_from_version(
        version: &'static AddressingVersion,
        element: &XmlElement,
    ) -> Result<EndpointAddress, Error> {
        EndpointAddress::read_with_quotas(version, element, XmlQuotas::default())
    }

    pub fn read_with_quotas(
        version: &'static AddressingVersion,
        element: &XmlElement,
        quotas: XmlQuotas,
    ) -> Result<EndpointAddress, Error> {
        match version.kind {
            AddressingKind::None => {
                let text = element.trimmed_text();
                EndpointAddress::from_parts(
                    Some(version),
                    Uri::parse(&text)?,
                    None,
                    Vec::new(),
                    None,
                )
            }
            AddressingKind::WsAddressing10 | AddressingKind::WsAddressingAugust2004 => {
                read_addressed(version, element, quotas)
            }
        }
    }

    /*
     * Writing
     */

    fn wire_uri(&self, version: &AddressingVersion) -> String {
        if self.is_anonymous() {
            String::from(version.anonymous)
        } else if self.is_none() {
            String::from(version.none.unwrap_or(NONE_URI))
        } else {
            String::from(self.uri().as_str())
        }
    }

    /// Writes the address as an element named `{namespace}local`.
    pub fn write_to(
        &self,
        version: &AddressingVersion,
        namespace: &str,
        local: &str,
    ) -> Result<XmlElement, Error> {
        let mut element = XmlElement::new(namespace, local);
        if namespace == version.namespace && !version.is_none() {
            element = element.with_prefix(EPR_PREFIX);
        }
        self.write_contents_to(version, &mut element)?;
        Ok(element)
    }

    /// Writes an `EndpointReference` element for the version.
    pub fn write_endpoint_reference(&self, version: &AddressingVersion) -> Result<XmlElement, Error> {
        self.write_to(version, version.namespace, elements::ENDPOINT_REFERENCE)
    }

    /// Appends the address content to `parent`. Without addressing only
    /// the URI text is written; headers, identity and buffered XML are
    /// dropped.
    pub fn write_contents_to(
        &self,
        version: &AddressingVersion,
        parent: &mut XmlElement,
    ) -> Result<(), Error> {
        let ns = version.namespace;
        let wsa = |local: &str| XmlElement::new(ns, local).with_prefix(EPR_PREFIX);

        match version.kind {
            AddressingKind::None => {
                parent
                    .children
                    .push(XmlNode::Text(self.wire_uri(version)));
                return Ok(());
            }
            AddressingKind::WsAddressing10 => {
                parent.push(wsa(elements::ADDRESS).with_text(&self.wire_uri(version)));
                if !self.headers().is_empty() {
                    let mut params = wsa(elements::REFERENCE_PARAMETERS);
                    for header in self.headers() {
                        params.push(header.element().clone());
                    }
                    parent.push(params);
                }
                if let Some(nodes) = self.section(SectionKind::Metadata)? {
                    parent.children.extend(nodes);
                }
            }
            AddressingKind::WsAddressingAugust2004 => {
                parent.push(wsa(elements::ADDRESS).with_text(&self.wire_uri(version)));
                let (props, params): (Vec<&AddressHeader>, Vec<&AddressHeader>) = self
                    .headers()
                    .iter()
                    .partition(|h| h.kind() == AddressHeaderKind::ReferenceProperty);
                for (name, list) in [
                    (elements::REFERENCE_PROPERTIES, props),
                    (elements::REFERENCE_PARAMETERS, params),
                ] {
                    if !list.is_empty() {
                        let mut el = wsa(name);
                        for header in list {
                            el.push(header.element().clone());
                        }
                        parent.push(el);
                    }
                }
                if let Some(nodes) = self.section(SectionKind::Psp)? {
                    parent.children.extend(nodes);
                }
            }
        }

        if let Some(identity) = self.identity() {
            parent.push(identity.write_to()?);
        }
        for extension in self.extensions()? {
            if extension.name.namespace == ns {
                return Err(XmlError::new(format!(
                    "extension element {} collides with the addressing namespace",
                    extension.name
                ))
                .into());
            }
            parent.push(extension);
        }
        Ok(())
    }

    /// Promotes the address onto outgoing message headers: `To` plus
    /// every reference header.
    pub fn apply_to(&self, headers: &mut MessageHeaders) -> Result<(), Error> {
        let version = headers.version();
        if version.addressing.is_none() {
            return Ok(());
        }
        let to = Uri::parse(&self.wire_uri(version.addressing))?;
        headers.set_to(Some(&to));
        for header in self.headers() {
            headers.add(header.to_message_header(version));
        }
        Ok(())
    }
}

fn read_addressed(
    version: &'static AddressingVersion,
    element: &XmlElement,
    quotas: XmlQuotas,
) -> Result<EndpointAddress, Error> {
    let ns = version.namespace;
    if element.children.iter().any(|n| match n {
        XmlNode::Text(t) => !t.trim().is_empty(),
        XmlNode::Element(_) => false,
    }) {
        return Err(XmlError::new(format!("{} has unexpected text content", element.name)).into());
    }

    let mut children = element.elements().peekable();
    let address = match children.next() {
        Some(a) if a.is(ns, elements::ADDRESS) => a.trimmed_text(),
        Some(other) => {
            return Err(XmlError::unexpected(&QName::new(ns, elements::ADDRESS), other).into())
        }
        None => {
            return Err(XmlError::new(format!("{} is missing its Address", element.name)).into())
        }
    };

    let mut headers = Vec::new();
    let mut sections = Sections::default();

    if version.kind == AddressingKind::WsAddressingAugust2004 {
        if let Some(props) = children.next_if(|e| e.is(ns, elements::REFERENCE_PROPERTIES)) {
            headers.extend(props.elements().cloned().map(AddressHeader::property));
        }
    }
    if let Some(params) = children.next_if(|e| e.is(ns, elements::REFERENCE_PARAMETERS)) {
        headers.extend(params.elements().cloned().map(AddressHeader::parameter));
    }
    match version.kind {
        AddressingKind::WsAddressing10 => {
            if let Some(metadata) = children.next_if(|e| e.is(ns, elements::METADATA)) {
                sections.metadata = Some(metadata.clone());
            }
        }
        _ => {
            while let Some(psp) = children.next_if(|e| {
                e.is(ns, elements::PORT_TYPE)
                    || e.is(ns, elements::SERVICE_NAME)
                    || e.is(POLICY_NAMESPACE, elements::POLICY)
            }) {
                sections.psp.push(psp.clone());
            }
        }
    }

    let mut identity = None;
    for child in children {
        if child.is(IDENTITY_NAMESPACE, elements::IDENTITY) {
            if identity.is_some() {
                return Err(XmlError::new("endpoint reference has more than one Identity").into());
            }
            identity = Some(EndpointIdentity::read_from(child)?);
        } else if child.name.namespace == ns {
            return Err(XmlError::new(format!(
                "unexpected element {} in endpoint reference",
                child.name
            ))
            .into());
        } else {
            sections.extensions.push(child.clone());
        }
    }

    if address == version.anonymous
        && headers.is_empty()
        && identity.is_none()
        && sections.is_empty()
    {
        return Ok(EndpointAddress::anonymous());
    }

    let uri = if address == version.anonymous {
        anonymous_uri()
    } else if version.none.map_or(false, |n| address == n) {
        none_uri()
    } else {
        Uri::parse(&address)?
    };
    let buffer = sections.into_buffer(quotas)?;
    EndpointAddress::from_parts(Some(version), uri, identity, headers, buffer)
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &EndpointAddress) -> bool {
        self.endpoint_equals(other)
    }
}

impl Eq for EndpointAddress {}

impl Hash for EndpointAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri().hash_normalized(state);
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Mutable companion used to derive new addresses.
#[derive(Debug, Clone)]
pub struct EndpointAddressBuilder {
    pub uri: Uri,
    pub headers: Vec<AddressHeader>,
    pub identity: Option<EndpointIdentity>,
    metadata: Option<XmlElement>,
    pub psp: Vec<XmlElement>,
    pub extensions: Vec<XmlElement>,
    pub quotas: XmlQuotas,
}

impl EndpointAddressBuilder {
    pub fn new(uri: Uri) -> EndpointAddressBuilder {
        EndpointAddressBuilder {
            uri,
            headers: Vec::new(),
            identity: None,
            metadata: None,
            psp: Vec::new(),
            extensions: Vec::new(),
            quotas: XmlQuotas::default(),
        }
    }

    /// Sets the children of the WS-Addressing 1.0 `Metadata` element.
    pub fn set_metadata(&mut self, children: Vec<XmlElement>) {
        let mut metadata =
            XmlElement::new(AddressingVersion::WS_ADDRESSING_10.namespace, elements::METADATA)
                .with_prefix(EPR_PREFIX);
        for child in children {
            metadata.push(child);
        }
        self.metadata = Some(metadata);
    }

    pub fn clear_metadata(&mut self) {
        self.metadata = None;
    }

    pub fn build(self) -> Result<EndpointAddress, Error> {
        let sections = Sections {
            metadata: self.metadata,
            psp: self.psp,
            extensions: self.extensions,
        };
        let buffer = sections.into_buffer(self.quotas)?;
        EndpointAddress::from_parts(None, self.uri, self.identity, self.headers, buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::MessageVersion;
    use crate::xml::parse_document;
    use std::collections::hash_map::DefaultHasher;

    const WSA10: &str = "http://www.w3.org/2005/08/addressing";
    const WSA04: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";

    fn hash_of(a: &EndpointAddress) -> u64 {
        let mut h = DefaultHasher::new();
        a.hash(&mut h);
        h.finish()
    }

    fn round_trip(address: &EndpointAddress, version: &'static AddressingVersion) -> EndpointAddress {
        let written = address
            .write_endpoint_reference(version)
            .unwrap()
            .to_xml_string();
        let parsed = parse_document(&written).unwrap();
        EndpointAddress::read_from_version(version, &parsed).unwrap()
    }

    fn rich_address() -> EndpointAddress {
        let mut builder = EndpointAddressBuilder::new(Uri::parse("http://svc.example/orders").unwrap());
        builder
            .headers
            .push(AddressHeader::parameter(XmlElement::new("urn:h", "Session").with_text("7")));
        builder.identity = Some(EndpointIdentity::dns("svc.example"));
        builder.set_metadata(vec![XmlElement::new("urn:meta", "Wsdl").with_text("x")]);
        builder
            .extensions
            .push(XmlElement::new("urn:ext", "Hint").with_attribute("", "k", "v"));
        builder.build().unwrap()
    }

    #[test]
    fn relative_uris_are_rejected() {
        assert!(matches!(
            EndpointAddress::new("/just/a/path"),
            Err(Error::Argument { .. })
        ));
    }

    #[test]
    fn sentinels_are_canonicalized() {
        let anon = EndpointAddress::new(ANONYMOUS_URI).unwrap();
        assert!(anon.is_anonymous());
        assert!(Uri::ptr_eq(anon.uri(), &anonymous_uri()));

        let none = EndpointAddress::new(NONE_URI).unwrap();
        assert!(none.is_none());
        assert!(Uri::ptr_eq(none.uri(), &none_uri()));

        let plain = EndpointAddress::new(AddressingVersion::WS_ADDRESSING_10.anonymous).unwrap();
        assert!(!plain.is_anonymous());
    }

    #[test]
    fn round_trips_for_every_version() {
        let rich = rich_address();
        for version in [
            AddressingVersion::WS_ADDRESSING_10,
            AddressingVersion::WS_ADDRESSING_AUGUST_2004,
        ] {
            let back = round_trip(&rich, version);
            assert!(back.endpoint_equals(&rich), "version {}", version);
            let ext: Vec<String> = back.extensions().unwrap().iter().map(XmlElement::canonical_string).collect();
            let orig: Vec<String> = rich.extensions().unwrap().iter().map(XmlElement::canonical_string).collect();
            assert_eq!(ext, orig);
        }

        let plain = EndpointAddress::new("net.tcp://host:9000/svc").unwrap();
        let back = round_trip(&plain, AddressingVersion::NONE);
        assert!(back.endpoint_equals(&plain));
    }

    #[test]
    fn buffered_sections_are_byte_stable() {
        let rich = rich_address();
        let once = round_trip(&rich, AddressingVersion::WS_ADDRESSING_10);
        let twice = round_trip(&once, AddressingVersion::WS_ADDRESSING_10);
        for kind in [SectionKind::Metadata, SectionKind::Extensions] {
            assert!(once.section_bytes(kind).is_some());
            assert_eq!(once.section_bytes(kind), twice.section_bytes(kind));
        }
        let meta = twice.metadata().unwrap().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(meta[0].is("urn:meta", "Wsdl"));
    }

    #[test]
    fn anonymous_reads_share_one_instance() {
        for version in [
            AddressingVersion::WS_ADDRESSING_10,
            AddressingVersion::WS_ADDRESSING_AUGUST_2004,
        ] {
            let doc = format!(
                r#"<a:EndpointReference xmlns:a="{0}"><a:Address>{1}</a:Address></a:EndpointReference>"#,
                version.namespace, version.anonymous
            );
            let first = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
            let second = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
            assert!(EndpointAddress::ptr_eq(&first, &second));
            assert!(EndpointAddress::ptr_eq(&first, &EndpointAddress::anonymous()));
        }
    }

    #[test]
    fn none_reads_are_never_shared() {
        let doc = format!(
            r#"<a:EndpointReference xmlns:a="{0}"><a:Address>{0}/none</a:Address></a:EndpointReference>"#,
            WSA10
        );
        let first = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
        let second = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
        assert!(first.is_none());
        assert!(!EndpointAddress::ptr_eq(&first, &second));
        assert!(first.endpoint_equals(&second));
    }

    #[test]
    fn anonymous_with_headers_is_not_collapsed() {
        let doc = format!(
            r#"<a:EndpointReference xmlns:a="{0}"><a:Address>{0}/anonymous</a:Address><a:ReferenceParameters><k xmlns="urn:k">1</k></a:ReferenceParameters></a:EndpointReference>"#,
            WSA10
        );
        let address = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
        assert!(address.is_anonymous());
        assert!(!EndpointAddress::ptr_eq(&address, &EndpointAddress::anonymous()));
        assert_eq!(address.headers().len(), 1);
    }

    #[test]
    fn sentinels_written_per_version() {
        let anon = EndpointAddress::anonymous();
        let el = anon.write_endpoint_reference(AddressingVersion::WS_ADDRESSING_10).unwrap();
        assert_eq!(
            el.child(WSA10, "Address").unwrap().text(),
            AddressingVersion::WS_ADDRESSING_10.anonymous
        );
        let el = anon
            .write_endpoint_reference(AddressingVersion::WS_ADDRESSING_AUGUST_2004)
            .unwrap();
        assert_eq!(
            el.child(WSA04, "Address").unwrap().text(),
            AddressingVersion::WS_ADDRESSING_AUGUST_2004.anonymous
        );
        let el = EndpointAddress::none()
            .write_endpoint_reference(AddressingVersion::WS_ADDRESSING_10)
            .unwrap();
        assert_eq!(el.child(WSA10, "Address").unwrap().text(), format!("{}/none", WSA10));
    }

    #[test]
    fn duplicate_identity_fails() {
        let doc = format!(
            r#"<a:EndpointReference xmlns:a="{0}"><a:Address>http://h/</a:Address><Identity xmlns="{1}"><Dns>h</Dns></Identity><Identity xmlns="{1}"><Dns>h</Dns></Identity></a:EndpointReference>"#,
            WSA10, IDENTITY_NAMESPACE
        );
        let err = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Xml(_)));
    }

    #[test]
    fn missing_address_fails() {
        let doc = format!(r#"<a:EndpointReference xmlns:a="{0}"/>"#, WSA10);
        assert!(EndpointAddress::read_from(&parse_document(&doc).unwrap()).is_err());
        let doc = r#"<EndpointReference xmlns="urn:unknown"><Address>http://h/</Address></EndpointReference>"#;
        assert!(EndpointAddress::read_from(&parse_document(doc).unwrap()).is_err());
    }

    #[test]
    fn colliding_extension_fails_on_write() {
        let mut builder = EndpointAddressBuilder::new(Uri::parse("http://h/").unwrap());
        builder.extensions.push(XmlElement::new(WSA10, "Bogus"));
        let address = builder.build().unwrap();
        assert!(address
            .write_endpoint_reference(AddressingVersion::WS_ADDRESSING_10)
            .is_err());
        assert!(address
            .write_endpoint_reference(AddressingVersion::WS_ADDRESSING_AUGUST_2004)
            .is_ok());
    }

    #[test]
    fn august_2004_keeps_properties_and_psp() {
        let doc = format!(
            r#"<b:EndpointReference xmlns:b="{0}"><b:Address>http://h/svc</b:Address><b:ReferenceProperties><p xmlns="urn:p">1</p></b:ReferenceProperties><b:ReferenceParameters><q xmlns="urn:q">2</q></b:ReferenceParameters><b:PortType>x:Port</b:PortType><b:ServiceName>x:Svc</b:ServiceName></b:EndpointReference>"#,
            WSA04
        );
        let address = EndpointAddress::read_from(&parse_document(&doc).unwrap()).unwrap();
        assert_eq!(address.psp().unwrap().len(), 2);
        assert!(address.headers()[0].is_reference_property());

        let same = round_trip(&address, AddressingVersion::WS_ADDRESSING_AUGUST_2004);
        assert_eq!(same.psp().unwrap().len(), 2);
        assert!(same.headers().iter().any(AddressHeader::is_reference_property));

        // 1.0 has no wire form for either: properties demote, psp is lost.
        let converted = round_trip(&address, AddressingVersion::WS_ADDRESSING_10);
        assert!(converted.psp().unwrap().is_empty());
        assert!(!converted.headers().iter().any(AddressHeader::is_reference_property));
        assert!(converted.endpoint_equals(&address));
    }

    #[test]
    fn none_version_drops_everything_but_the_uri() {
        let rich = rich_address();
        let el = rich.write_to(AddressingVersion::NONE, "urn:x", "To").unwrap();
        assert_eq!(el.text(), "http://svc.example/orders");
        assert!(el.elements().next().is_none());
    }

    #[test]
    fn equality_and_hash_agree() {
        let a = EndpointAddress::new("http://Host/svc").unwrap();
        let b = EndpointAddress::new("http://host/svc/?query#frag").unwrap();
        let c = EndpointAddress::new("http://host/SVC").unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(b, c);

        let with_identity = EndpointAddress::with_uri(
            Uri::parse("http://host/svc").unwrap(),
            Some(EndpointIdentity::dns("host")),
            Vec::new(),
        )
        .unwrap();
        assert_ne!(a, with_identity);
    }

    #[test]
    fn apply_to_promotes_headers() {
        let rich = rich_address();
        let mut headers = MessageHeaders::new(MessageVersion::SOAP12_WSA10);
        rich.apply_to(&mut headers).unwrap();
        assert_eq!(headers.to().unwrap().unwrap().as_str(), "http://svc.example/orders");
        let session = headers.find_header("Session", "urn:h").unwrap().unwrap();
        assert!(session.info().is_reference_parameter);
    }

    #[test]
    fn builder_round_trip_preserves_sections() {
        let rich = rich_address();
        let copy = rich.to_builder().unwrap().build().unwrap();
        assert!(copy.endpoint_equals(&rich));
        assert_eq!(
            copy.section_bytes(SectionKind::Metadata),
            rich.section_bytes(SectionKind::Metadata)
        );
    }
}
