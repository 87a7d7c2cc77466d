/*
 * Copyright 2020 Joyent, Inc.
 */

//! soap-rpc: SOAP addressing, fault translation and service instance
//! lifecycle.
//!
//! The crate covers the layer between a byte transport and application
//! handlers in a SOAP service:
//!
//! * `EndpointAddress` reads and writes endpoint references for
//!   WS-Addressing 1.0, WS-Addressing August 2004 and unaddressed messages;
//! * protocol errors (missing or duplicate addressing headers, action
//!   mismatches, headers that must be understood) become SOAP 1.1 or SOAP
//!   1.2 faults, with version-specific header and detail placement;
//! * `InstanceContext` ties a service object to the calls and channels
//!   using it, draining in-flight calls on close;
//! * `Dispatcher` and `SoapCodec` put these together over any stream.
//!
//! Envelope structure
//!
//! ```text
//! <s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
//!             xmlns:a="http://www.w3.org/2005/08/addressing">
//!   <s:Header>
//!     <a:Action>urn:example:echo</a:Action>
//!     <a:MessageID>urn:uuid:...</a:MessageID>
//!     <a:ReplyTo><a:Address>...</a:Address></a:ReplyTo>
//!     <a:To>http://host/service</a:To>
//!   </s:Header>
//!   <s:Body>
//!     ...
//!   </s:Body>
//! </s:Envelope>
//! ```
//!
//! SOAP 1.1 uses the `http://schemas.xmlsoap.org/soap/envelope/` namespace
//! and a flat fault shape (`faultcode`, `faultstring`, `faultactor`,
//! `detail`); SOAP 1.2 nests `Code/Subcode` and language-tagged `Reason`
//! texts.
//!
//! Addressing faults carry the name of the offending header. On SOAP 1.2
//! it is written in the fault detail; on SOAP 1.1 it travels in a
//! `wsa:FaultDetail` response header instead.

#![allow(missing_docs)]

pub mod address;
pub mod buffer;
pub mod channel;
pub mod channel_manager;
pub mod config;
pub mod error;
pub mod fault;
pub mod header;
pub mod identity;
pub mod instance;
pub mod message;
pub mod protocol;
pub mod server;
pub mod state;
pub mod uri;
pub mod version;
pub mod xml;

pub use crate::address::EndpointAddress;
pub use crate::config::RuntimeConfig;
pub use crate::error::{Error, ProtocolError};
pub use crate::message::Message;
pub use crate::version::MessageVersion;
