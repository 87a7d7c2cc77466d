/*
 * Copyright 2020 Joyent, Inc.
 */

//! Endpoint identities.
//!
//! An identity wraps a single claim naming who the endpoint is expected to
//! be. The claim type decides the variant; see [`create_identity`].

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::Error;
use crate::version::{IDENTITY_NAMESPACE, XMLDSIG_NAMESPACE};
use crate::xml::{XmlElement, XmlError};

pub mod claim_types {
    pub const DNS: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/dns";
    pub const SPN: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/spn";
    pub const UPN: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/upn";
    pub const RSA: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/rsa";
    pub const THUMBPRINT: &str =
        "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/thumbprint";
}

pub const RIGHT_POSSESS_PROPERTY: &str =
    "http://schemas.xmlsoap.org/ws/2005/05/identity/right/possessproperty";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClaimResource {
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Claim {
    pub claim_type: String,
    pub resource: ClaimResource,
    pub right: String,
}

impl Claim {
    pub fn new(claim_type: &str, resource: ClaimResource) -> Claim {
        Claim {
            claim_type: String::from(claim_type),
            resource,
            right: String::from(RIGHT_POSSESS_PROPERTY),
        }
    }

    pub fn text(claim_type: &str, value: &str) -> Claim {
        Claim::new(claim_type, ClaimResource::Text(String::from(value)))
    }
}

/// Decides whether two claims name the same principal.
pub trait ClaimComparer: Send + Sync + fmt::Debug {
    fn equals(&self, a: &Claim, b: &Claim) -> bool;
}

/// Host-like claims (DNS, SPN, UPN) compare case-insensitively, everything
/// else byte for byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClaimComparer;

impl ClaimComparer for DefaultClaimComparer {
    fn equals(&self, a: &Claim, b: &Claim) -> bool {
        if a.claim_type != b.claim_type || a.right != b.right {
            return false;
        }
        let case_insensitive = matches!(
            a.claim_type.as_str(),
            claim_types::DNS | claim_types::SPN | claim_types::UPN
        );
        match (&a.resource, &b.resource) {
            (ClaimResource::Text(x), ClaimResource::Text(y)) if case_insensitive => {
                x.eq_ignore_ascii_case(y)
            }
            (x, y) => x == y,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityClaim {
    claim: Claim,
    comparer: Arc<dyn ClaimComparer>,
}

impl IdentityClaim {
    pub fn new(claim: Claim) -> IdentityClaim {
        IdentityClaim::with_comparer(claim, Arc::new(DefaultClaimComparer))
    }

    pub fn with_comparer(claim: Claim, comparer: Arc<dyn ClaimComparer>) -> IdentityClaim {
        IdentityClaim { claim, comparer }
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }
}

#[derive(Debug, Clone)]
pub enum EndpointIdentity {
    Dns(IdentityClaim),
    Spn(IdentityClaim),
    Upn(IdentityClaim),
    Rsa(IdentityClaim),
    X509Certificate(IdentityClaim),
    General(IdentityClaim),
}

/// Builds the identity variant matching the claim type. RSA identities are
/// not implemented.
pub fn create_identity(claim: Claim) -> Result<EndpointIdentity, Error> {
    let needs_text = |claim: &Claim| match claim.resource {
        ClaimResource::Text(_) => Ok(()),
        ClaimResource::Bytes(_) => Err(Error::argument(
            "claim",
            format!("claim of type {} must carry a string resource", claim.claim_type),
        )),
    };

    match claim.claim_type.as_str() {
        claim_types::DNS => {
            needs_text(&claim)?;
            Ok(EndpointIdentity::Dns(IdentityClaim::new(claim)))
        }
        claim_types::SPN => {
            needs_text(&claim)?;
            Ok(EndpointIdentity::Spn(IdentityClaim::new(claim)))
        }
        claim_types::UPN => {
            needs_text(&claim)?;
            Ok(EndpointIdentity::Upn(IdentityClaim::new(claim)))
        }
        claim_types::RSA => Err(Error::NotSupported(String::from(
            "RSA endpoint identities",
        ))),
        claim_types::THUMBPRINT => {
            if matches!(claim.resource, ClaimResource::Bytes(_)) {
                Ok(EndpointIdentity::X509Certificate(IdentityClaim::new(claim)))
            } else {
                Err(Error::argument(
                    "claim",
                    "certificate claims must carry the encoded certificate",
                ))
            }
        }
        _ => Ok(EndpointIdentity::General(IdentityClaim::new(claim))),
    }
}

impl EndpointIdentity {
    pub fn dns(name: &str) -> EndpointIdentity {
        EndpointIdentity::Dns(IdentityClaim::new(Claim::text(claim_types::DNS, name)))
    }

    pub fn spn(name: &str) -> EndpointIdentity {
        EndpointIdentity::Spn(IdentityClaim::new(Claim::text(claim_types::SPN, name)))
    }

    pub fn upn(name: &str) -> EndpointIdentity {
        EndpointIdentity::Upn(IdentityClaim::new(Claim::text(claim_types::UPN, name)))
    }

    /// Identity pinned to a DER-encoded certificate.
    pub fn x509(certificate: Vec<u8>) -> EndpointIdentity {
        EndpointIdentity::X509Certificate(IdentityClaim::new(Claim::new(
            claim_types::THUMBPRINT,
            ClaimResource::Bytes(certificate),
        )))
    }

    fn inner(&self) -> &IdentityClaim {
        match self {
            EndpointIdentity::Dns(c)
            | EndpointIdentity::Spn(c)
            | EndpointIdentity::Upn(c)
            | EndpointIdentity::Rsa(c)
            | EndpointIdentity::X509Certificate(c)
            | EndpointIdentity::General(c) => c,
        }
    }

    pub fn claim(&self) -> &Claim {
        &self.inner().claim
    }

    fn text_value(&self) -> &str {
        match &self.claim().resource {
            ClaimResource::Text(t) => t,
            ClaimResource::Bytes(_) => "",
        }
    }

    /// Serializes as an `addressingidentity` `Identity` element.
    pub fn write_to(&self) -> Result<XmlElement, Error> {
        let simple = |local: &str, value: &str| {
            XmlElement::new(IDENTITY_NAMESPACE, "Identity")
                .with_child(XmlElement::new(IDENTITY_NAMESPACE, local).with_text(value))
        };
        match self {
            EndpointIdentity::Dns(_) => Ok(simple("Dns", self.text_value())),
            EndpointIdentity::Spn(_) => Ok(simple("Spn", self.text_value())),
            EndpointIdentity::Upn(_) => Ok(simple("Upn", self.text_value())),
            EndpointIdentity::X509Certificate(c) => {
                let der: &[u8] = match &c.claim.resource {
                    ClaimResource::Bytes(b) => b.as_slice(),
                    ClaimResource::Text(_) => &[],
                };
                let key_info = XmlElement::new(XMLDSIG_NAMESPACE, "KeyInfo").with_child(
                    XmlElement::new(XMLDSIG_NAMESPACE, "X509Data").with_child(
                        XmlElement::new(XMLDSIG_NAMESPACE, "X509Certificate")
                            .with_text(&STANDARD.encode(der)),
                    ),
                );
                Ok(XmlElement::new(IDENTITY_NAMESPACE, "Identity").with_child(key_info))
            }
            EndpointIdentity::Rsa(_) => Err(Error::NotSupported(String::from(
                "writing RSA endpoint identities",
            ))),
            EndpointIdentity::General(c) => Err(Error::NotSupported(format!(
                "writing endpoint identities with claim type {}",
                c.claim.claim_type
            ))),
        }
    }

    /// Reads an `Identity` element.
    pub fn read_from(element: &XmlElement) -> Result<EndpointIdentity, Error> {
        if !element.is(IDENTITY_NAMESPACE, "Identity") {
            return Err(XmlError::new(format!(
                "expected an Identity element, found {}",
                element.name
            ))
            .into());
        }
        let inner = element
            .elements()
            .next()
            .ok_or_else(|| XmlError::new("Identity element is empty"))?;

        let ns = inner.name.namespace.as_str();
        match (ns, inner.name.local.as_str()) {
            (IDENTITY_NAMESPACE, "Dns") => Ok(EndpointIdentity::dns(&inner.trimmed_text())),
            (IDENTITY_NAMESPACE, "Spn") => Ok(EndpointIdentity::spn(&inner.trimmed_text())),
            (IDENTITY_NAMESPACE, "Upn") => Ok(EndpointIdentity::upn(&inner.trimmed_text())),
            (XMLDSIG_NAMESPACE, "KeyInfo") => {
                if inner.child(XMLDSIG_NAMESPACE, "KeyValue").is_some()
                    || inner.child(XMLDSIG_NAMESPACE, "RSAKeyValue").is_some()
                {
                    return Err(Error::NotSupported(String::from(
                        "RSA endpoint identities",
                    )));
                }
                let cert = inner
                    .child(XMLDSIG_NAMESPACE, "X509Data")
                    .and_then(|d| d.child(XMLDSIG_NAMESPACE, "X509Certificate"))
                    .ok_or_else(|| XmlError::new("KeyInfo carries no X509Certificate"))?;
                let der = STANDARD
                    .decode(cert.trimmed_text().as_bytes())
                    .map_err(|e| XmlError::new(format!("invalid certificate encoding: {}", e)))?;
                Ok(EndpointIdentity::x509(der))
            }
            _ => Err(XmlError::new(format!("unrecognized identity {}", inner.name)).into()),
        }
    }
}

impl PartialEq for EndpointIdentity {
    fn eq(&self, other: &EndpointIdentity) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.inner().comparer.equals(self.claim(), other.claim())
    }
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.claim().resource {
            ClaimResource::Text(t) => write!(f, "identity({})", t),
            ClaimResource::Bytes(b) => write!(f, "identity({} bytes)", b.len()),
        }
    }
}
