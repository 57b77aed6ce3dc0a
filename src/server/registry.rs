//! Service registry.
//!
//! Rust has no runtime method introspection, so services are described
//! explicitly: a [`ServiceBuilder`] binds method names to handler closures,
//! and each handler is erased into an invoker that decodes the argument,
//! calls the handler and boxes the reply for encoding.
//!
//! ```text
//! "Arith.Add" ──split──▶ Registry["Arith"] ──▶ Service.methods["Add"]
//!                                                  │
//!                                   invoker(reader): decode Args
//!                                                  │ handler(receiver, args)
//!                                                  ▼
//!                                   Outcome::Reply(Box<dyn Encode>) | Outcome::Failed(text)
//! ```

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::codec::{self, Decode, Encode};
use crate::transport::BufferReader;
use crate::types::{Error, Result};

/// Result of running a handler.
pub(crate) enum Outcome {
    Reply(Box<dyn Encode + Send + Sync>),
    Failed(String),
}

type Invoker =
    Box<dyn for<'a> Fn(&'a mut dyn BufferReader) -> BoxFuture<'a, Result<Outcome>> + Send + Sync>;

/// Pins the higher-ranked signature on the invoker closure.
fn invoker<F>(f: F) -> Invoker
where
    F: for<'a> Fn(&'a mut dyn BufferReader) -> BoxFuture<'a, Result<Outcome>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// A callable method of a registered service.
pub struct Method {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    invoke: Invoker,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Decode the argument from `reader` and run the handler. Decode failures
    /// are protocol errors; handler failures become `Outcome::Failed`.
    pub(crate) async fn invoke(&self, reader: &mut dyn BufferReader) -> Result<Outcome> {
        (self.invoke)(reader).await
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .finish_non_exhaustive()
    }
}

/// A registered service: a name, the receiver's type and its method table.
/// Immutable once registered.
#[derive(Debug)]
pub struct Service {
    name: String,
    receiver_type: &'static str,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_type(&self) -> &'static str {
        self.receiver_type
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Builder binding handler closures to a receiver.
///
/// ```rust,ignore
/// let echo = ServiceBuilder::new(Echo::default())
///     .method("Ping", |svc: Arc<Echo>, req: Bytes| async move { svc.ping(req).await });
/// registry.register(echo).await?;
/// ```
pub struct ServiceBuilder<S> {
    name: Option<String>,
    receiver: Arc<S>,
    methods: HashMap<String, Method>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Service named after the receiver's type (last path segment).
    pub fn new(receiver: S) -> Self {
        Self::from_arc(None, Arc::new(receiver))
    }

    /// Service registered under an explicit name.
    pub fn named(name: impl Into<String>, receiver: S) -> Self {
        Self::from_arc(Some(name.into()), Arc::new(receiver))
    }

    /// Like [`ServiceBuilder::new`] for a receiver that is already shared.
    pub fn from_arc(name: Option<String>, receiver: Arc<S>) -> Self {
        Self {
            name,
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Bind `name` to `handler`.
    ///
    /// Ill-formed names (empty, or containing `.`) and repeated names are
    /// skipped with a warning; they do not fail the registration.
    pub fn method<A, R, E, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: Decode + 'static,
        R: Encode + Decode + Send + Sync + 'static,
        E: fmt::Display,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        if name.is_empty() || name.contains('.') {
            tracing::warn!(
                receiver = std::any::type_name::<S>(),
                method = name,
                "rpc.Register: method has an ill-formed name; skipping"
            );
            return self;
        }
        if self.methods.contains_key(name) {
            tracing::warn!(
                receiver = std::any::type_name::<S>(),
                method = name,
                "rpc.Register: method registered twice; keeping the first"
            );
            return self;
        }

        let receiver = Arc::clone(&self.receiver);
        let handler = Arc::new(handler);
        let invoke = invoker(move |reader| {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let arg = A::decode_from(reader).await.map_err(|e| {
                    Error::protocol(format!("rpc: can't read from shared memory: {}", e))
                })?;
                Ok(match handler(receiver, arg).await {
                    Ok(reply) => Outcome::Reply(Box::new(reply)),
                    Err(e) => Outcome::Failed(e.to_string()),
                })
            })
        });

        self.methods.insert(
            name.to_string(),
            Method {
                name: name.to_string(),
                arg_type: std::any::type_name::<A>(),
                reply_type: std::any::type_name::<R>(),
                invoke,
            },
        );
        self
    }

    /// Resolve the service name and check the builder is registrable.
    pub fn build(self) -> Result<Service> {
        let receiver_type = std::any::type_name::<S>();
        let name = match self.name {
            Some(name) => name,
            None => {
                let derived = short_type_name(receiver_type).to_string();
                if !derived.is_empty() && !is_exported(&derived) {
                    return Err(Error::registration(format!(
                        "rpc.Register: type {} is not exported",
                        derived
                    )));
                }
                derived
            }
        };
        if name.is_empty() {
            return Err(Error::registration(format!(
                "rpc.Register: no service name for type {}",
                receiver_type
            )));
        }
        if self.methods.is_empty() {
            return Err(Error::registration(format!(
                "rpc.Register: type {} has no exported methods of suitable type",
                name
            )));
        }

        Ok(Service {
            name,
            receiver_type,
            methods: self.methods,
        })
    }
}

impl<S> fmt::Debug for ServiceBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("name", &self.name)
            .field("receiver", &std::any::type_name::<S>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// `a::b::Echo<T>` → `Echo`
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Externally visible service names start with an upper-case letter.
fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Named services reachable by remote callers. First registration of a name
/// wins; services are never removed.
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Failures are logged and returned.
    pub async fn register<S: Send + Sync + 'static>(&self, builder: ServiceBuilder<S>) -> Result<()> {
        let service = match builder.build() {
            Ok(service) => service,
            Err(e) => {
                tracing::error!(error = %e, "service registration rejected");
                return Err(e);
            }
        };

        let mut services = self.services.write().await;
        if services.contains_key(&service.name) {
            let e = Error::registration(format!(
                "rpc: service already defined: {}",
                service.name
            ));
            tracing::error!(error = %e, "service registration rejected");
            return Err(e);
        }

        tracing::info!(
            service = %service.name,
            receiver = service.receiver_type,
            methods = ?service.method_names(),
            "registered service"
        );
        services.insert(service.name.clone(), Arc::new(service));
        Ok(())
    }

    pub async fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().await.get(name).cloned()
    }

    /// Resolve `Service.Method` to the service holding the method, and the
    /// method name.
    pub async fn resolve<'a>(&self, identifier: &'a str) -> Result<(Arc<Service>, &'a str)> {
        let (service_name, method_name) = codec::split_method(identifier)?;
        let service = self.service(service_name).await.ok_or_else(|| {
            Error::protocol(format!("rpc: can't find service {}", identifier))
        })?;
        if service.method(method_name).is_none() {
            return Err(Error::protocol(format!(
                "rpc: can't find method {}",
                identifier
            )));
        }
        Ok((service, method_name))
    }

    /// Registered service names, sorted.
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
