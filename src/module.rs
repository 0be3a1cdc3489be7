//! Callable modules: a static table from method name to typed handler.
//!
//! ```no_run
//! use gopi_rpc::Module;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize)]
//! struct HelloRequest { name: String }
//!
//! #[derive(Serialize)]
//! struct HelloReply { message: String }
//!
//! # fn main() -> gopi_rpc::Result<()> {
//! let module = Module::new("helloworld")?.method("say_hello", |req: HelloRequest| async move {
//!     Ok(HelloReply { message: format!("Hello, {}", req.name) })
//! })?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RpcError};
use crate::models::validate_service_name;
use crate::protocol::{Failure, FailureKind};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

pub struct Module {
    name: String,
    methods: BTreeMap<String, Handler>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Module {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_service_name(&name)?;
        Ok(Self {
            name,
            methods: BTreeMap::new(),
        })
    }

    /// Adds a handler. Parameters are decoded from, and the reply encoded
    /// to, JSON; a handler error is reported to the caller for that call only.
    pub fn method<Req, Resp, F, Fut>(mut self, name: &str, handler: F) -> Result<Self>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(RpcError::BadParameter(format!(
                "module {:?}: empty method name",
                self.name
            )));
        }
        if self.methods.contains_key(name) {
            return Err(RpcError::BadParameter(format!(
                "module {:?}: method {name:?} registered twice",
                self.name
            )));
        }

        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |params: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let req: Req = serde_json::from_value(params)
                    .map_err(|e| Failure::new(FailureKind::BadParams, e))?;
                let resp = handler(req)
                    .await
                    .map_err(|e| Failure::new(FailureKind::Handler, format!("{e:#}")))?;
                serde_json::to_value(resp).map_err(|e| Failure::new(FailureKind::Handler, e))
            }
            .boxed()
        });
        self.methods.insert(name.to_string(), erased);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn dispatch(&self, method: &str, params: Value) -> BoxFuture<'static, Result<Value, Failure>> {
        match self.methods.get(method) {
            Some(handler) => handler(params),
            None => {
                let failure = Failure::new(
                    FailureKind::UnknownMethod,
                    format!("{}.{method}", self.name),
                );
                futures::future::ready(Err(failure)).boxed()
            }
        }
    }
}
