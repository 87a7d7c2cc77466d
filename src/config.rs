/*
 * Copyright 2020 Joyent, Inc.
 */

//! Runtime settings for instance contexts and the dispatcher.
//!
//! ```json
//! {
//!     "close_timeout_ms": 5000,
//!     "fault_locale": "en-GB",
//!     "understood_headers": [
//!         { "name": "Session", "namespace": "urn:example:session" }
//!     ]
//! }
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::buffer::XmlQuotas;
use crate::error::Error;

/// A header the dispatcher treats as understood when checking
/// `mustUnderstand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderName {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub close_timeout_ms: u64,
    /// Close instance contexts once they go idle. Ignored for singletons
    /// and for the dispatcher's per-call contexts, which always close.
    pub auto_close: bool,
    /// `xml:lang` of locally generated fault reasons.
    pub fault_locale: String,
    pub max_xml_depth: usize,
    pub max_section_bytes: usize,
    /// Envelopes larger than this are rejected before they finish arriving.
    pub max_message_bytes: usize,
    pub understood_headers: Vec<HeaderName>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            close_timeout_ms: 60_000,
            auto_close: true,
            fault_locale: String::from("en-US"),
            max_xml_depth: XmlQuotas::default().max_depth,
            max_section_bytes: XmlQuotas::default().max_section_bytes,
            max_message_bytes: XmlQuotas::default().max_message_bytes,
            understood_headers: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<RuntimeConfig, Error> {
        let config: RuntimeConfig = serde_json::from_str(text)
            .map_err(|e| Error::argument("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.close_timeout_ms == 0 {
            return Err(Error::argument("close_timeout_ms", "must be greater than zero"));
        }
        if self.max_xml_depth == 0 {
            return Err(Error::argument("max_xml_depth", "must be greater than zero"));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::argument("max_message_bytes", "must be greater than zero"));
        }
        if self.fault_locale.trim().is_empty() {
            return Err(Error::argument("fault_locale", "must not be empty"));
        }
        if let Some(h) = self.understood_headers.iter().find(|h| h.name.is_empty()) {
            return Err(Error::argument(
                "understood_headers",
                format!("header in namespace '{}' has no name", h.namespace),
            ));
        }
        Ok(())
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn quotas(&self) -> XmlQuotas {
        XmlQuotas {
            max_depth: self.max_xml_depth,
            max_section_bytes: self.max_section_bytes,
            max_message_bytes: self.max_message_bytes,
        }
    }
}
