//! Typed method registration and dispatch.
//!
//! The server never inspects receiver types at runtime; instead each
//! method is registered as a [`MethodHandler`], a capability that decodes
//! its argument with the connection's codec, invokes the user's async
//! function, and encodes the reply. Handlers hang off a named [`Service`],
//! and a request's `Service.Method` string selects one.
//!
//! # Examples
//!
//! ```rust
//! use ika::rpc::Service;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args { a: i64, b: i64 }
//!
//! let arith = Service::new("Arith")
//!     .method("Sum", |args: Args| async move { Ok(args.a + args.b) });
//! assert!(arith.handler("Sum").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::rpc::codec::CodecKind;
use crate::rpc::RpcError;

type RawHandler = Box<dyn Fn(CodecKind, Bytes) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

/// One callable method: argument decode, invocation, reply encode, and a
/// call counter.
pub struct MethodHandler {
    invoke: RawHandler,
    calls: AtomicU64,
    arg_type: &'static str,
    reply_type: &'static str,
}

impl MethodHandler {
    /// Wraps a typed async function.
    ///
    /// The argument type is decoded from the request body; the returned
    /// reply is encoded with the same codec. Both travel by value, so the
    /// function is free to move its argument.
    pub fn new<Req, Resp, F, Fut>(f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let invoke: RawHandler = Box::new(move |kind, body| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let args: Req = kind.decode(&body)?;
                let reply = f(args).await?;
                kind.encode(&reply)
            })
        });

        Self {
            invoke,
            calls: AtomicU64::new(0),
            arg_type: std::any::type_name::<Req>(),
            reply_type: std::any::type_name::<Resp>(),
        }
    }

    /// Invokes the method, counting the call.
    pub async fn call(&self, kind: CodecKind, body: Bytes) -> Result<Bytes, RpcError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke)(kind, body).await
    }

    /// Completed plus in-flight invocations so far.
    pub fn num_calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }
}

/// A named bundle of methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodHandler>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: HashMap::new() }
    }

    /// Registers a method under this service, replacing any previous
    /// registration of the same name.
    pub fn method<Req, Resp, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        self.methods.insert(name.into(), Arc::new(MethodHandler::new(f)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self, method: &str) -> Option<Arc<MethodHandler>> {
        self.methods.get(method).cloned()
    }

    /// Methods in registration-independent order, for the debug page.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &Arc<MethodHandler>)> {
        self.methods.iter().map(|(name, handler)| (name.as_str(), handler))
    }
}

/// Splits `Service.Method` at the last dot.
pub(crate) fn split_service_method(service_method: &str) -> Result<(&str, &str), RpcError> {
    match service_method.rsplit_once('.') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(RpcError::InvalidServiceMethod(service_method.to_string())),
    }
}
