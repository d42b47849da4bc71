//! The wire protocol (spec §6.1): client requests deserialize into
//! [`ClientRequest`] via `serde`'s own typed deserialization, which doubles
//! as the validation pass from spec §4.3 — a `c`/`d` field typed as `String`
//! simply fails to parse if the client sent a number, an `id` typed as `u64`
//! fails if the client sent a string, and so on. An unknown `a` fails to
//! match any enum variant. All such failures are reported as a single
//! [`crate::error::ValidationError`], never by inspecting fields by hand.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BackendError;

/// The `a`, `c`, `d`, `id` fields of an incoming request, recovered even when
/// the request fails to parse as a known [`ClientRequest`], so that an error
/// reply can still echo them back per spec §4.4.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RequestEnvelope {
    pub a: Option<String>,
    pub c: Option<String>,
    pub d: Option<String>,
    pub id: Option<Value>,
}

/// A fully validated client request (spec §4.3's table, spec §6.1's field
/// reference).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "a")]
pub enum ClientRequest {
    #[serde(rename = "sub")]
    Sub {
        c: String,
        d: String,
        #[serde(default)]
        v: Option<u64>,
    },
    #[serde(rename = "unsub")]
    Unsub { c: String, d: String },
    #[serde(rename = "fetch")]
    Fetch {
        c: String,
        d: String,
        #[serde(default)]
        v: Option<u64>,
    },
    #[serde(rename = "bs")]
    BulkSub {
        s: HashMap<String, HashMap<String, Option<u64>>>,
    },
    #[serde(rename = "op")]
    Submit {
        c: String,
        d: String,
        #[serde(default)]
        v: Option<u64>,
        #[serde(default)]
        src: Option<String>,
        #[serde(default)]
        seq: Option<u64>,
        #[serde(default)]
        op: Option<Value>,
        #[serde(default)]
        create: Option<Value>,
        #[serde(default)]
        del: Option<bool>,
    },
    #[serde(rename = "qsub")]
    QSub {
        id: u64,
        c: String,
        q: Value,
        #[serde(default)]
        vs: Option<HashMap<String, u64>>,
        #[serde(default)]
        db: Option<String>,
    },
    #[serde(rename = "qresub")]
    QResub { id: u64, q: Value },
    #[serde(rename = "qfetch")]
    QFetch {
        id: u64,
        c: String,
        q: Value,
        #[serde(default)]
        vs: Option<HashMap<String, u64>>,
        #[serde(default)]
        db: Option<String>,
    },
    #[serde(rename = "qunsub")]
    QUnsub { id: u64 },
}

impl ClientRequest {
    /// Builds the error reply for this request (spec §4.4): the action tag
    /// and `c`/`d`/`id` are always echoed from the request that triggered it,
    /// whatever the failure — a validation error, a Backend error, or an
    /// agent-side rejection like the in-flight-request cap.
    pub fn error_reply(&self, error: WireError) -> Reply {
        let reply = match self {
            ClientRequest::Sub { c, d, .. } => Reply::new("sub").c(c.clone()).d(d.clone()),
            ClientRequest::Unsub { c, d, .. } => Reply::new("unsub").c(c.clone()).d(d.clone()),
            ClientRequest::Fetch { c, d, .. } => Reply::new("fetch").c(c.clone()).d(d.clone()),
            ClientRequest::BulkSub { .. } => Reply::new("bs"),
            ClientRequest::Submit { c, d, .. } => Reply::new("op").c(c.clone()).d(d.clone()),
            ClientRequest::QSub { id, .. } => Reply::new("q").id(Value::from(*id)),
            ClientRequest::QResub { id, .. } => Reply::new("qresub").id(Value::from(*id)),
            ClientRequest::QFetch { id, .. } => Reply::new("q").id(Value::from(*id)),
            ClientRequest::QUnsub { id, .. } => Reply::new("qunsub").id(Value::from(*id)),
        };
        reply.error(error)
    }
}

/// The server's one-time init message (spec §4.1).
#[derive(Debug, Clone, Serialize)]
pub struct InitMessage {
    pub a: &'static str,
    pub protocol: u32,
    pub id: String,
}

impl InitMessage {
    pub fn new(client_id: String) -> Self {
        Self {
            a: "init",
            protocol: 0,
            id: client_id,
        }
    }
}

/// `{code, message}`, per spec §6.1.
#[derive(Debug, Clone, Serialize)]
pub struct WireError {
    pub code: u32,
    pub message: String,
}

impl From<&BackendError> for WireError {
    fn from(e: &BackendError) -> Self {
        Self {
            code: e.code,
            message: e.message.clone(),
        }
    }
}

/// A reply or server-initiated push, assembled exactly as spec §4.4
/// describes: start from `{error}` or the body map, overlay `a`, and copy
/// `c`/`d`/`id` from the originating request when present.
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    pub a: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Reply {
    pub fn new(a: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            c: None,
            d: None,
            id: None,
            error: None,
            body: Map::new(),
        }
    }

    #[must_use]
    pub fn c(mut self, c: impl Into<String>) -> Self {
        self.c = Some(c.into());
        self
    }

    #[must_use]
    pub fn d(mut self, d: impl Into<String>) -> Self {
        self.d = Some(d.into());
        self
    }

    #[must_use]
    pub fn id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn error(mut self, error: WireError) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// Like [`Reply::set`], but omits the key entirely when `value` is
    /// `None` instead of writing an explicit `null` (spec §3: `v` is
    /// "non-negative integer or absent", not "or null").
    #[must_use]
    pub fn set_opt(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(value) = value {
            self.body.insert(key.to_string(), value.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_request_parses() {
        let v: ClientRequest =
            serde_json::from_str(r#"{"a":"sub","c":"users","d":"fred","v":5}"#).unwrap();
        match v {
            ClientRequest::Sub { c, d, v } => {
                assert_eq!(c, "users");
                assert_eq!(d, "fred");
                assert_eq!(v, Some(5));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn non_string_c_is_rejected() {
        let err = serde_json::from_str::<ClientRequest>(r#"{"a":"sub","c":5,"d":"fred"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<ClientRequest>(r#"{"a":"frobnicate"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn reply_framing_merges_body_and_overlays_tag() {
        let reply = Reply::new("sub").c("users").d("fred").set("data", "hi");
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v["a"], "sub");
        assert_eq!(v["c"], "users");
        assert_eq!(v["data"], "hi");
        assert!(v.get("error").is_none());
    }
}
