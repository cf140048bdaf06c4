//! CapData: a structured value plus the ordered list of refs occurring
//! within it. This is the wire/storage shape; `marshal` is the only module
//! that turns the `slots` into live standins.

use serde::{Deserialize, Serialize};

use crate::refs::KRef;

/// A capability-bearing value: an opaque structured body (serialized JSON
/// text, matching the upstream system's convention of treating the body as
/// already-serialized text rather than a live tree) plus the ordered refs
/// it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<String>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<String>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    pub fn empty() -> Self {
        Self {
            body: "null".to_string(),
            slots: Vec::new(),
        }
    }
}

/// An opaque in-memory handle carrying a single tagged kernel ref. Object
/// identity is preserved across repeated translations by interning: the
/// same kref always produces the same `Standin` within one marshal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Standin {
    pub kref: KRef,
}

impl Standin {
    pub fn new(kref: KRef) -> Self {
        Self { kref }
    }
}
