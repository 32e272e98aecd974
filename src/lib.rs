//! Asynchronous [varlink](https://varlink.org) support with file descriptor
//! passing.
//!
//! Varlink is a line-delimited JSON request/response protocol over byte
//! streams, usually unix domain sockets. This crate implements the protocol
//! on top of tokio with the ancillary feature that file descriptors may
//! travel alongside messages on socket endpoints:
//!
//! - [`transport`] moves whole messages plus descriptor arrays over a pair
//!   of file descriptors (sockets, pipes or stdio),
//! - [`client`] and [`service`] implement the two protocol roles, including
//!   streamed (`more`), `oneway` and `upgrade` calls,
//! - [`idl`] and [`convert`] describe interfaces as data, render the
//!   canonical interface description text and derive the wire conversions,
//!   with descriptor-typed fields represented as indices into the message's
//!   descriptor array.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use varlink_aio::client::VarlinkClient;
//! use varlink_aio::idl::{Interface, Method, VType, VTypeExt};
//! use varlink_aio::service::{serve_connection, VarlinkInterface, VarlinkService};
//! use varlink_aio::transport::VarlinkTransport;
//! use varlink_aio::Request;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> varlink_aio::Result<()> {
//!     let decl = Interface::builder("org.example.ping")
//!         .method(
//!             Method::new("Ping")
//!                 .input("ping", VTypeExt::Plain(VType::String))
//!                 .output("pong", VTypeExt::Plain(VType::String)),
//!         )
//!         .build()?;
//!     let mut ping = VarlinkInterface::new(decl);
//!     ping.on_call("Ping", |mut call| async move {
//!         let pong = call.raw_parameters()["ping"].clone();
//!         call.reply(json!({ "pong": pong }))
//!     })?;
//!
//!     let service = Arc::new(VarlinkService::new(
//!         "org.example",
//!         "ping service",
//!         "0.1",
//!         "http://example.org",
//!         vec![ping],
//!     )?);
//!     let (server, client) = VarlinkTransport::pair()?;
//!     tokio::spawn(serve_connection(service, server));
//!
//!     let client = VarlinkClient::new(client);
//!     let (reply, _fds) = client
//!         .call(
//!             Request::create("org.example.ping.Ping", Some(json!({"ping": "hello"}))),
//!             &[],
//!         )
//!         .await?;
//!     assert_eq!(reply.parameters.unwrap()["pong"], "hello");
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![cfg(unix)]

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};

use serde::de;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub mod error;
pub use error::{Error, ErrorKind, Result};

pub mod client;
pub mod convert;
pub mod fdarray;
pub mod idl;
pub mod service;
pub mod transport;
pub mod util;

pub use crate::client::{VarlinkClient, VarlinkInterfaceProxy};
pub use crate::fdarray::{Fd, FileDescriptorArray};
pub use crate::service::{serve_connection, ErrorReply, VarlinkInterface, VarlinkService};
pub use crate::transport::{UpgradedConnection, VarlinkTransport};

/// The structure of a varlink call. Used to serialize json into it.
///
/// Unknown top level fields are a protocol violation, enforced during
/// deserialization.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Request<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oneway: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<bool>,
    pub method: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn create<S: Into<Cow<'a, str>>>(method: S, parameters: Option<Value>) -> Self {
        Request {
            more: None,
            oneway: None,
            upgrade: None,
            method: method.into(),
            parameters,
        }
    }

    /// At most one of `more`, `oneway` and `upgrade` may be set on a call.
    pub fn flags_valid(&self) -> bool {
        [self.more, self.oneway, self.upgrade]
            .iter()
            .filter(|f| **f == Some(true))
            .count()
            <= 1
    }
}

/// The structure of a varlink reply. Used to deserialize it into json.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continues: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Cow<'static, str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl Reply {
    pub fn parameters(parameters: Option<Value>) -> Self {
        Reply {
            continues: None,
            error: None,
            parameters,
        }
    }

    pub fn error<S: Into<Cow<'static, str>>>(name: S, parameters: Option<Value>) -> Self {
        Reply {
            continues: None,
            error: Some(name.into()),
            parameters,
        }
    }
}

pub type StringHashMap<T> = HashMap<String, T>;

/// A set of strings with the varlink wire form of a map with empty-object
/// values.
#[derive(Debug, PartialEq, Default, Clone)]
pub struct StringHashSet {
    inner: HashSet<String>,
}

impl StringHashSet {
    pub fn new() -> StringHashSet {
        StringHashSet {
            inner: HashSet::new(),
        }
    }
}

impl Deref for StringHashSet {
    type Target = HashSet<String>;

    fn deref(&self) -> &HashSet<String> {
        &self.inner
    }
}

impl DerefMut for StringHashSet {
    fn deref_mut(&mut self) -> &mut HashSet<String> {
        &mut self.inner
    }
}

impl Serialize for StringHashSet {
    fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let null_obj: Value = Value::Object(serde_json::Map::new());

        let mut map = serializer.serialize_map(Some(self.inner.len()))?;
        for k in &self.inner {
            map.serialize_entry(k, &null_obj)?;
        }
        map.end()
    }
}

impl<'de> de::Deserialize<'de> for StringHashSet {
    #[inline]
    fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = StringHashSet;

            fn expecting(&self, formatter: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                formatter.write_str("a map")
            }

            #[inline]
            fn visit_unit<E>(self) -> ::std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(StringHashSet::new())
            }

            #[inline]
            fn visit_map<V>(self, mut visitor: V) -> ::std::result::Result<Self::Value, V::Error>
            where
                V: de::MapAccess<'de>,
            {
                let mut values = StringHashSet::new();

                while let Some((key, _value)) = visitor.next_entry::<String, Value>()? {
                    values.insert(key);
                }

                Ok(values)
            }
        }

        deserializer.deserialize_map(Visitor)
    }
}

/// Metadata returned by `org.varlink.service.GetInfo`.
#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct ServiceInfo {
    pub vendor: Cow<'static, str>,
    pub product: Cow<'static, str>,
    pub version: Cow<'static, str>,
    pub url: Cow<'static, str>,
    pub interfaces: Vec<Cow<'static, str>>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct GetInterfaceDescriptionArgs<'a> {
    pub interface: Cow<'a, str>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default, Clone)]
pub struct GetInterfaceDescriptionReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInterfaceNotFound {
    pub interface: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorInvalidParameter {
    pub parameter: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotImplemented {
    pub method: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ErrorMethodNotFound {
    pub method: Option<String>,
}

impl From<Reply> for ErrorKind {
    fn from(e: Reply) -> Self {
        match e {
            Reply {
                error: Some(ref t), ..
            } if t == "org.varlink.service.InterfaceNotFound" => match e {
                Reply {
                    parameters: Some(p),
                    ..
                } => match serde_json::from_value::<ErrorInterfaceNotFound>(p) {
                    Ok(v) => ErrorKind::InterfaceNotFound(v.interface.unwrap_or_default()),
                    Err(_) => ErrorKind::InterfaceNotFound(String::new()),
                },
                _ => ErrorKind::InterfaceNotFound(String::new()),
            },
            Reply {
                error: Some(ref t), ..
            } if t == "org.varlink.service.InvalidParameter" => match e {
                Reply {
                    parameters: Some(p),
                    ..
                } => match serde_json::from_value::<ErrorInvalidParameter>(p) {
                    Ok(v) => ErrorKind::InvalidParameter(v.parameter.unwrap_or_default()),
                    Err(_) => ErrorKind::InvalidParameter(String::new()),
                },
                _ => ErrorKind::InvalidParameter(String::new()),
            },
            Reply {
                error: Some(ref t), ..
            } if t == "org.varlink.service.MethodNotFound" => match e {
                Reply {
                    parameters: Some(p),
                    ..
                } => match serde_json::from_value::<ErrorMethodNotFound>(p) {
                    Ok(v) => ErrorKind::MethodNotFound(v.method.unwrap_or_default()),
                    Err(_) => ErrorKind::MethodNotFound(String::new()),
                },
                _ => ErrorKind::MethodNotFound(String::new()),
            },
            Reply {
                error: Some(ref t), ..
            } if t == "org.varlink.service.MethodNotImplemented" => match e {
                Reply {
                    parameters: Some(p),
                    ..
                } => match serde_json::from_value::<ErrorMethodNotImplemented>(p) {
                    Ok(v) => ErrorKind::MethodNotImplemented(v.method.unwrap_or_default()),
                    Err(_) => ErrorKind::MethodNotImplemented(String::new()),
                },
                _ => ErrorKind::MethodNotImplemented(String::new()),
            },
            Reply {
                error: Some(ref t), ..
            } if t == "org.varlink.service.ExpectedMore" => ErrorKind::ExpectedMore,
            _ => ErrorKind::VarlinkErrorReply(e),
        }
    }
}

impl ErrorKind {
    pub fn is_error(r: &Reply) -> bool {
        match r.error {
            Some(ref t) => matches!(
                t.as_ref(),
                "org.varlink.service.InvalidParameter"
                    | "org.varlink.service.InterfaceNotFound"
                    | "org.varlink.service.MethodNotFound"
                    | "org.varlink.service.MethodNotImplemented"
                    | "org.varlink.service.ExpectedMore"
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_minimally() {
        let req = Request::create("org.example.Ping", None);
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"method":"org.example.Ping"}"#
        );
        let mut req = Request::create("org.example.Range", Some(json!({"count": 3})));
        req.more = Some(true);
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"more":true,"method":"org.example.Range","parameters":{"count":3}}"#
        );
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let err = serde_json::from_str::<Request>(r#"{"method":"a.b.C","id":7}"#);
        assert!(err.is_err());
        assert!(serde_json::from_str::<Request>(r#"{"method":"a.b.C"}"#).is_ok());
    }

    #[test]
    fn request_flag_combinations() {
        let mut req = Request::create("a.b.C", None);
        assert!(req.flags_valid());
        req.more = Some(true);
        assert!(req.flags_valid());
        req.oneway = Some(true);
        assert!(!req.flags_valid());
    }

    #[test]
    fn reply_tolerates_extensions() {
        let reply: Reply =
            serde_json::from_str(r#"{"parameters":{"x":1},"vendor_extension":true}"#).unwrap();
        assert_eq!(reply.parameters, Some(json!({"x": 1})));
        assert_eq!(reply.continues, None);
    }

    #[test]
    fn service_error_replies_map_to_kinds() {
        let reply = Reply::error(
            "org.varlink.service.MethodNotFound",
            Some(json!({"method": "a.b.C"})),
        );
        assert!(ErrorKind::is_error(&reply));
        match ErrorKind::from(reply) {
            ErrorKind::MethodNotFound(m) => assert_eq!(m, "a.b.C"),
            kind => panic!("unexpected kind {:?}", kind),
        }
        let reply = Reply::error("com.example.demo.Custom", None);
        assert!(!ErrorKind::is_error(&reply));
        assert!(matches!(
            ErrorKind::from(reply),
            ErrorKind::VarlinkErrorReply(_)
        ));
    }
}
