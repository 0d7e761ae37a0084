//! RPC request/response envelope and the stream control record (§6).
//!
//! `opts` is double-encoded: it is itself a packed [`Value`] message, so the
//! envelope parses — and a protocol-error response can still be produced —
//! even when the payload inside `opts` is malformed.

use crate::message_capnp::{request as request_capnp, response as response_capnp, stream_control as stream_control_capnp};
use crate::value::Value;
use anyhow::Result;
use capnp::message::{Builder, ReaderOptions};
use capnp::serialize_packed;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ping,
    GetItem,
    GetObjAttr,
    CallObj,
    Transfer,
    Import,
    Delete,
    GetProxy,
    Release,
    ReleaseAll,
    CloseServer,
    Return,
}

impl Action {
    fn to_capnp(self) -> crate::message_capnp::Action {
        use crate::message_capnp::Action as A;
        match self {
            Action::Ping => A::Ping,
            Action::GetItem => A::Getitem,
            Action::GetObjAttr => A::GetObjAttr,
            Action::CallObj => A::CallObj,
            Action::Transfer => A::Transfer,
            Action::Import => A::Import,
            Action::Delete => A::Delete,
            Action::GetProxy => A::GetProxy,
            Action::Release => A::Release,
            Action::ReleaseAll => A::ReleaseAll,
            Action::CloseServer => A::CloseServer,
            Action::Return => A::Return_,
        }
    }

    fn from_capnp(a: crate::message_capnp::Action) -> Action {
        use crate::message_capnp::Action as A;
        match a {
            A::Ping => Action::Ping,
            A::Getitem => Action::GetItem,
            A::GetObjAttr => Action::GetObjAttr,
            A::CallObj => Action::CallObj,
            A::Transfer => Action::Transfer,
            A::Import => Action::Import,
            A::Delete => Action::Delete,
            A::GetProxy => Action::GetProxy,
            A::Release => Action::Release,
            A::ReleaseAll => Action::ReleaseAll,
            A::CloseServer => Action::CloseServer,
            A::Return_ => Action::Return,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    Auto,
    Proxy,
    Value,
    None,
}

impl ReturnType {
    fn to_capnp(self) -> crate::message_capnp::ReturnType {
        use crate::message_capnp::ReturnType as R;
        match self {
            ReturnType::Auto => R::Auto,
            ReturnType::Proxy => R::Proxy,
            ReturnType::Value => R::Value,
            ReturnType::None => R::None,
        }
    }

    fn from_capnp(r: crate::message_capnp::ReturnType) -> ReturnType {
        use crate::message_capnp::ReturnType as R;
        match r {
            R::Auto => ReturnType::Auto,
            R::Proxy => ReturnType::Proxy,
            R::Value => ReturnType::Value,
            R::None => ReturnType::None,
        }
    }
}

/// A request envelope. `req_id` is `None` when no response is wanted
/// (`return_type == ReturnType::None`).
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub req_id: Option<u64>,
    pub action: Action,
    pub return_type: ReturnType,
    pub opts: Value,
}

impl Request {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let opts_bytes = self.opts.encode()?;
        let mut message = Builder::new_default();
        {
            let mut root = message.init_root::<request_capnp::Builder>();
            root.set_has_req_id(self.req_id.is_some());
            root.set_req_id(self.req_id.unwrap_or(0));
            root.set_action(self.action.to_capnp());
            root.set_return_type(self.return_type.to_capnp());
            root.set_opts(opts_bytes.as_slice());
        }
        let mut buf = Vec::new();
        serialize_packed::write_message(&mut buf, &message)?;
        Ok(buf)
    }

    /// Parses the envelope and its `opts` payload in one step. Fails if
    /// either the envelope or the `opts` payload inside it is malformed —
    /// use [`RawRequest::decode`] when the two need to fail independently
    /// (e.g. to still answer a known `req_id` with a protocol error when
    /// only `opts` is garbage).
    pub fn decode(bytes: &[u8]) -> Result<Request> {
        RawRequest::decode(bytes)?.into_request()
    }
}

/// An envelope whose `req_id`/`action`/`return_type` have been parsed but
/// whose `opts` payload has not yet been decoded. `opts` is double-encoded
/// as its own packed [`Value`] message specifically so this split is
/// possible: a corrupt `opts` payload doesn't prevent the server from
/// learning `req_id` and answering with a `ProtocolError` response instead
/// of dropping the frame (the caller would otherwise hang to its timeout).
pub struct RawRequest {
    pub req_id: Option<u64>,
    pub action: Action,
    pub return_type: ReturnType,
    opts_bytes: Vec<u8>,
}

impl RawRequest {
    pub fn decode(bytes: &[u8]) -> Result<RawRequest> {
        let mut cursor = Cursor::new(bytes);
        let reader = serialize_packed::read_message(&mut cursor, ReaderOptions::new())?;
        let root = reader.get_root::<request_capnp::Reader>()?;
        Ok(RawRequest {
            req_id: if root.get_has_req_id() { Some(root.get_req_id()) } else { None },
            action: Action::from_capnp(root.get_action()?),
            return_type: ReturnType::from_capnp(root.get_return_type()?),
            opts_bytes: root.get_opts()?.to_vec(),
        })
    }

    /// Decodes the `opts` payload now that the envelope is known good.
    pub fn opts(&self) -> Result<Value> {
        Value::decode(&self.opts_bytes)
    }

    pub fn into_request(self) -> Result<Request> {
        let opts = self.opts()?;
        Ok(Request { req_id: self.req_id, action: self.action, return_type: self.return_type, opts })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub req_id: u64,
    pub rval: Option<Value>,
    pub error: Option<(String, String)>,
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let rval_bytes = match &self.rval {
            Some(v) => Some(v.encode()?),
            None => None,
        };
        let mut message = Builder::new_default();
        {
            let mut root = message.init_root::<response_capnp::Builder>();
            root.set_req_id(self.req_id);
            if let Some(bytes) = &rval_bytes {
                root.set_has_rval(true);
                root.set_rval(bytes.as_slice());
            } else {
                root.set_has_rval(false);
            }
            if let Some((type_name, traceback)) = &self.error {
                root.set_has_error(true);
                root.set_error_type_name(type_name.as_str().into());
                root.set_error_traceback(traceback.as_str().into());
            } else {
                root.set_has_error(false);
            }
        }
        let mut buf = Vec::new();
        serialize_packed::write_message(&mut buf, &message)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Response> {
        let mut cursor = Cursor::new(bytes);
        let reader = serialize_packed::read_message(&mut cursor, ReaderOptions::new())?;
        let root = reader.get_root::<response_capnp::Reader>()?;
        let rval = if root.get_has_rval() {
            Some(Value::decode(root.get_rval()?)?)
        } else {
            None
        };
        let error = if root.get_has_error() {
            Some((
                root.get_error_type_name()?.to_string()?,
                root.get_error_traceback()?.to_string()?,
            ))
        } else {
            None
        };
        Ok(Response { req_id: root.get_req_id(), rval, error })
    }
}

/// Stream control packet: `head` on every transfer mode, `payload` only in
/// `plaindata` mode, `meta` carrying transfer-mode-specific extras.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamControl {
    pub head: u64,
    pub length: u32,
    pub meta: Vec<u8>,
    pub payload: Option<Vec<u8>>,
}

impl StreamControl {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut message = Builder::new_default();
        {
            let mut root = message.init_root::<stream_control_capnp::Builder>();
            root.set_head(self.head);
            root.set_length(self.length);
            root.set_meta(self.meta.as_slice());
            if let Some(payload) = &self.payload {
                root.set_has_payload(true);
                root.set_payload(payload.as_slice());
            } else {
                root.set_has_payload(false);
            }
        }
        let mut buf = Vec::new();
        serialize_packed::write_message(&mut buf, &message)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<StreamControl> {
        let mut cursor = Cursor::new(bytes);
        let reader = serialize_packed::read_message(&mut cursor, ReaderOptions::new())?;
        let root = reader.get_root::<stream_control_capnp::Reader>()?;
        let payload = if root.get_has_payload() {
            Some(root.get_payload()?.to_vec())
        } else {
            None
        };
        Ok(StreamControl {
            head: root.get_head(),
            length: root.get_length(),
            meta: root.get_meta()?.to_vec(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_with_req_id() {
        let req = Request {
            req_id: Some(7),
            action: Action::CallObj,
            return_type: ReturnType::Auto,
            opts: Value::Map(vec![("obj".into(), Value::Int(1))]),
        };
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn request_round_trips_without_req_id() {
        let req = Request {
            req_id: None,
            action: Action::Ping,
            return_type: ReturnType::None,
            opts: Value::Null,
        };
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.req_id, None);
    }

    /// A well-formed envelope with a corrupt `opts` payload still parses
    /// its `req_id`/`action`/`return_type` via `RawRequest`; only calling
    /// `opts()` fails. `Request::decode` (which decodes both in one step)
    /// fails on the same bytes, since it needs a valid `opts` too.
    #[test]
    fn raw_request_decodes_envelope_even_with_malformed_opts() {
        let mut message = Builder::new_default();
        {
            let mut root = message.init_root::<request_capnp::Builder>();
            root.set_has_req_id(true);
            root.set_req_id(9);
            root.set_action(Action::Ping.to_capnp());
            root.set_return_type(ReturnType::Value.to_capnp());
            root.set_opts(&[0xff, 0xff, 0xff, 0xff]);
        }
        let mut buf = Vec::new();
        serialize_packed::write_message(&mut buf, &message).unwrap();

        let raw = RawRequest::decode(&buf).unwrap();
        assert_eq!(raw.req_id, Some(9));
        assert_eq!(raw.action, Action::Ping);
        assert!(raw.opts().is_err());
        assert!(Request::decode(&buf).is_err());
    }

    #[test]
    fn response_round_trips_error() {
        let resp = Response {
            req_id: 3,
            rval: None,
            error: Some(("ValueError".into(), "traceback...".into())),
        };
        let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(resp, decoded);
    }

    #[test]
    fn stream_control_round_trips_sharedmem_variant() {
        let ctl = StreamControl { head: 1000, length: 64, meta: vec![1, 2, 3], payload: None };
        let decoded = StreamControl::decode(&ctl.encode().unwrap()).unwrap();
        assert_eq!(ctl, decoded);
    }
}
