use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A strict-monotonically increasing correlation tag for bus operations.
///
/// Tags are only ever resolved on the node that allocated them, so they may
/// safely travel inside remote-action payloads and come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CbtTag(pub(crate) u64);

impl fmt::Display for CbtTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cbt-{}", self.0)
    }
}

impl CbtTag {
    // Should only be used for unit-testing.
    pub fn for_test(tag: u64) -> Self {
        Self(tag)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub initiator: String,
    pub recipient: String,
    pub action: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub data: serde_json::Value,
    pub ok: bool,
}

/// The envelope of one bus operation.
///
/// A handler either completes a `Cbt` directly or parks it as the parent of
/// child operations and completes it once those resolve.
#[derive(Debug, Clone)]
pub struct Cbt {
    pub tag: CbtTag,
    pub parent: Option<CbtTag>,
    pub request: Request,
    pub response: Option<Response>,
    pub submitted_at: Instant,
}

impl Cbt {
    pub fn set_response(&mut self, data: impl Serialize, ok: bool) {
        let data = serde_json::to_value(data)
            .unwrap_or_else(|e| serde_json::Value::String(format!("unserializable response: {e}")));

        self.response = Some(Response { data, ok });
    }

    pub fn ok(&self) -> bool {
        self.response.as_ref().is_some_and(|r| r.ok)
    }

    pub fn response_data(&self) -> &serde_json::Value {
        static NULL: serde_json::Value = serde_json::Value::Null;

        self.response.as_ref().map(|r| &r.data).unwrap_or(&NULL)
    }

    /// Deserializes the request parameters into a typed view.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.request.params.clone())
    }
}
