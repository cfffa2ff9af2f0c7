//! Handler contracts for servers and consumers.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::Delivery;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{CodecError, Envelope};
use crate::error::Result;

/// Errors raised by application handlers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The request payload did not have the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler task panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// A failure described by `reason`.
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// A decoded request handed to a handler.
#[derive(Clone, Debug)]
pub struct Request {
    envelope: Envelope,
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
}

impl Request {
    pub(crate) fn new(envelope: Envelope, delivery: &Delivery) -> Self {
        Self {
            envelope,
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            redelivered: delivery.redelivered,
        }
    }

    /// The raw request payload.
    #[must_use]
    pub const fn data(&self) -> &Value {
        &self.envelope.data
    }

    /// The request payload deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::InvalidPayload`] if the payload does not match.
    pub fn payload<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        self.envelope
            .payload()
            .map_err(|e: CodecError| HandlerError::InvalidPayload(e.to_string()))
    }

    /// An attachment sent with the request.
    #[must_use]
    pub fn attachment(&self, name: &str) -> Option<&Bytes> {
        self.envelope.attachments.get(name)
    }

    /// The action the request was addressed to.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.envelope.action.as_deref()
    }

    /// The deadline the sender asked for.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.envelope.timeout()
    }

    /// The whole request envelope.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Correlation id of the request, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Queue the reply goes to, if any.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// The broker delivered this request before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }
}

/// The result of a handler, with any attachments for the reply.
///
/// Serialization failures are kept until the reply is built, so a handler
/// can succeed while its reply cannot be encoded.
#[derive(Clone, Debug)]
pub struct Response {
    data: std::result::Result<Value, String>,
    attachments: BTreeMap<String, Bytes>,
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

impl Response {
    /// A response carrying `data` serialized to JSON.
    pub fn new<T: Serialize + ?Sized>(data: &T) -> Self {
        Self {
            data: serde_json::to_value(data).map_err(|e| e.to_string()),
            attachments: BTreeMap::new(),
        }
    }

    /// A response carrying `data` as is.
    #[must_use]
    pub const fn from_value(data: Value) -> Self {
        Self {
            data: Ok(data),
            attachments: BTreeMap::new(),
        }
    }

    /// A response with no data.
    #[must_use]
    pub const fn empty() -> Self {
        Self::from_value(Value::Null)
    }

    /// Attaches a binary to the reply.
    pub fn add_attachment(&mut self, name: impl Into<String>, content: impl Into<Bytes>) {
        self.attachments.insert(name.into(), content.into());
    }

    /// Attaches a binary to the reply.
    #[must_use]
    pub fn with_attachment(mut self, name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.add_attachment(name, content);
        self
    }

    /// Builds the `ok` reply envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the data could not be serialized.
    pub fn into_envelope(self) -> std::result::Result<Envelope, CodecError> {
        let data = self.data.map_err(CodecError::Encode)?;
        Ok(Envelope::ok(data).with_attachments(self.attachments))
    }
}

/// Outcome of a gathering handler.
#[derive(Clone, Debug)]
pub enum GatherOutcome {
    /// This responder has the answer.
    Found(Response),
    /// This responder has nothing.
    NotFound,
    /// This responder failed; the reason is sent to the requester.
    Error(String),
}

/// Handles RPC requests.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Produces the reply to `request`.
    async fn handle(&self, request: Request) -> std::result::Result<Response, HandlerError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> std::result::Result<Response, HandlerError> {
        self(request).await
    }
}

/// Handles gathering announcements.
#[async_trait]
pub trait GatheringHandler: Send + Sync + 'static {
    /// Decides whether this responder can answer `request`.
    async fn handle(&self, request: Request) -> std::result::Result<GatherOutcome, HandlerError>;
}

#[async_trait]
impl<F, Fut> GatheringHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<GatherOutcome, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> std::result::Result<GatherOutcome, HandlerError> {
        self(request).await
    }
}

/// Handles queue and subscription messages.
#[async_trait]
pub trait ConsumerHandler: Send + Sync + 'static {
    /// Processes `request`. An error requeues the message.
    async fn handle(&self, request: Request) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> std::result::Result<(), HandlerError> {
        self(request).await
    }
}

/// Maps action names to handlers, with an optional catch-all.
pub struct ActionTable<H: ?Sized> {
    name: String,
    actions: RwLock<HashMap<String, Arc<H>>>,
    fallback: RwLock<Option<Arc<H>>>,
}

impl<H: ?Sized> Debug for ActionTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut actions: Vec<String> = self.actions.read().keys().cloned().collect();
        actions.sort();
        f.debug_struct("ActionTable")
            .field("name", &self.name)
            .field("actions", &actions)
            .field("fallback", &self.fallback.read().is_some())
            .finish()
    }
}

impl<H: ?Sized> ActionTable<H> {
    /// Creates an empty table for the component `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Registers `handler` for `action`. The first registration wins; later
    /// ones are logged and ignored.
    pub fn register(&self, action: &str, handler: Arc<H>) -> bool {
        let mut actions = self.actions.write();
        if actions.contains_key(action) {
            warn!(name = %self.name, action, "action already registered; keeping the first handler");
            return false;
        }
        actions.insert(action.to_string(), handler);
        debug!(name = %self.name, action, "action registered");
        true
    }

    /// Sets the handler for requests without a registered action.
    pub fn set_fallback(&self, handler: Arc<H>) {
        if self.fallback.write().replace(handler).is_some() {
            debug!(name = %self.name, "catch-all handler replaced");
        }
    }

    /// The handler for `action`, else the catch-all.
    pub fn resolve(&self, action: Option<&str>) -> Option<Arc<H>> {
        action
            .and_then(|action| self.actions.read().get(action).cloned())
            .or_else(|| self.fallback.read().clone())
    }
}

/// Components that set up topology before use.
#[async_trait]
pub trait Initializable {
    /// Declares topology and starts consuming. Idempotent; concurrent calls
    /// share one setup.
    async fn initialize(&self) -> Result<()>;
}

/// Components that dispatch requests to registered handlers.
pub trait ActionRegistrar {
    /// The handler type accepted.
    type Handler: ?Sized;

    /// Registers `handler` for requests whose action is `name`.
    fn register_action(&self, name: &str, handler: Arc<Self::Handler>) -> bool;

    /// Registers the catch-all handler.
    fn consume(&self, handler: Arc<Self::Handler>);
}

/// Options for one outgoing call.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Deadline; the client default when unset.
    pub timeout: Option<Duration>,
    /// Action the receiver should dispatch to.
    pub action: Option<String>,
    /// Binaries sent with the request.
    pub attachments: BTreeMap<String, Bytes>,
    /// Resolve with the whole reply envelope instead of just its data.
    pub full_response: bool,
}

/// A settled call's result.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// The reply data.
    Payload(Value),
    /// The whole reply envelope.
    Full(Envelope),
}

impl Reply {
    pub(crate) fn new(envelope: Envelope, full_response: bool) -> Self {
        if full_response {
            Self::Full(envelope)
        } else {
            Self::Payload(envelope.data)
        }
    }

    /// The reply data.
    #[must_use]
    pub fn data(&self) -> &Value {
        match self {
            Self::Payload(data) => data,
            Self::Full(envelope) => &envelope.data,
        }
    }

    /// The reply data deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the data does not match `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> std::result::Result<T, CodecError> {
        T::deserialize(self.data()).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// The reply envelope, when the full response was requested.
    #[must_use]
    pub const fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Payload(_) => None,
            Self::Full(envelope) => Some(envelope),
        }
    }
}

/// Components that issue calls.
#[async_trait]
pub trait Callable {
    /// What a settled call resolves to.
    type Output;

    /// Sends `data` and waits for the outcome.
    async fn call_with(&self, data: Value, options: CallOptions) -> Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use courier_transport::{MessageProperties, NoopAcker};
    use serde_json::json;

    use super::*;

    fn delivery() -> Delivery {
        Delivery::new(
            Bytes::new(),
            MessageProperties::request("id-1", "replies"),
            true,
            "tag",
            "queue",
            Arc::new(NoopAcker),
        )
    }

    #[test]
    fn request_exposes_delivery_context() {
        let envelope = Envelope::ok(json!({"n": 2}))
            .with_action("double")
            .with_attachments(BTreeMap::from([(
                "raw".to_string(),
                Bytes::from_static(b"x"),
            )]));
        let request = Request::new(envelope, &delivery());

        assert_eq!(request.correlation_id(), Some("id-1"));
        assert_eq!(request.reply_to(), Some("replies"));
        assert!(request.redelivered());
        assert_eq!(request.action(), Some("double"));
        assert_eq!(request.attachment("raw"), Some(&Bytes::from_static(b"x")));
        assert_eq!(request.data()["n"], 2);
        assert!(matches!(
            request.payload::<String>(),
            Err(HandlerError::InvalidPayload(_))
        ));
    }

    #[test]
    fn response_defers_serialization_failures() {
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((0, 0), 0)]);
        let response = Response::new(&bad).with_attachment("a", Bytes::from_static(b"1"));
        assert!(matches!(
            response.into_envelope(),
            Err(CodecError::Encode(_))
        ));

        let envelope = Response::new("fine")
            .with_attachment("a", Bytes::from_static(b"1"))
            .into_envelope()
            .unwrap();
        assert!(envelope.is_ok());
        assert_eq!(envelope.data, json!("fine"));
        assert_eq!(envelope.attachments.len(), 1);
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler: Arc<dyn RpcHandler> = Arc::new(|request: Request| async move {
            Ok::<_, HandlerError>(Response::from_value(request.data().clone()))
        });

        let request = Request::new(Envelope::ok(json!("echo")), &delivery());
        let response = handler.handle(request).await.unwrap();
        assert_eq!(response.into_envelope().unwrap().data, json!("echo"));
    }

    #[test]
    fn first_registration_wins_and_fallback_catches_the_rest() {
        let table: ActionTable<str> = ActionTable::new("svc");
        assert!(table.register("a", Arc::from("first")));
        assert!(!table.register("a", Arc::from("second")));

        assert_eq!(table.resolve(Some("a")).as_deref(), Some("first"));
        assert!(table.resolve(Some("b")).is_none());
        assert!(table.resolve(None).is_none());

        table.set_fallback(Arc::from("catch-all"));
        assert_eq!(table.resolve(Some("b")).as_deref(), Some("catch-all"));
        assert_eq!(table.resolve(None).as_deref(), Some("catch-all"));
    }

    #[test]
    fn reply_shapes() {
        let envelope = Envelope::ok(json!(5));
        assert_eq!(Reply::new(envelope.clone(), false), Reply::Payload(json!(5)));

        let full = Reply::new(envelope.clone(), true);
        assert_eq!(full.envelope(), Some(&envelope));
        assert_eq!(full.payload::<u8>().unwrap(), 5);
    }
}
