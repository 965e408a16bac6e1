//! Handler registration and resolution by payload type.
//!
//! Handlers are registered once on a [`HandlerRegistry`] before the container is
//! built. Building the registry validates it (ambiguous registrations are rejected
//! there) and produces the [`HandlerResolver`] used by every dispatcher.
//!
//! The runtime payload type of a message is named by a message attribute
//! (`PayloadType` by default). Each registered payload type is known under its
//! short Rust type name, e.g. a handler for `crate::orders::OrderCreated` accepts
//! messages tagged `OrderCreated`, and under its full type path. A short name
//! shared by several registered types is not used; such messages must carry the
//! full path or a name mapped with [`HandlerRegistry::map_type_name`]. Untagged
//! messages carry the raw body and have payload type `String`.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::errors::SqsListenerError;
use crate::message::Message;

mod functions;
mod resolver;

pub use functions::{BatchMessageHandlerFnImpl, MessageHandlerFnImpl};
pub use resolver::HandlerResolver;

/// Runtime descriptor of a payload type.
///
/// Equality and hashing only consider the [`TypeId`].
#[derive(Clone, Copy)]
pub struct PayloadType {
    id: TypeId,
    name: &'static str,
}

impl PayloadType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        PayloadType {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name, e.g. `my_app::orders::OrderCreated`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Last path segment of the type name without generic arguments.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }
}

impl PartialEq for PayloadType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PayloadType {}

impl Hash for PayloadType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Trait for handling single messages whose payload converts to `T`.
///
/// Returning an error marks the message as failed; what happens to it then is
/// decided by the endpoint's deletion policy.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), SqsListenerError>;
}

/// Trait for handling a received batch as one unit.
///
/// The messages arrive in receive order and share one outcome.
#[async_trait]
pub trait BatchMessageHandler<T>: Send + Sync + 'static
where
    T: Send + 'static,
{
    async fn handle_batch(&self, messages: Vec<Message<T>>) -> Result<(), SqsListenerError>;
}

/// One registered handler and the payload type it declares.
pub struct HandlerRegistration<H: ?Sized> {
    payload_type: PayloadType,
    default: bool,
    handler: Arc<H>,
}

impl<H: ?Sized> HandlerRegistration<H> {
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    /// Whether this is a default handler, accepting any payload type.
    pub fn is_default(&self) -> bool {
        self.default
    }

    pub(crate) fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub(crate) fn accepts(&self, payload_type: PayloadType) -> bool {
        self.default || self.payload_type == payload_type
    }
}

pub(crate) type DynMessageHandler = dyn MessageHandler<String>;
pub(crate) type DynBatchMessageHandler = dyn BatchMessageHandler<String>;

/// Collects handler registrations before the container starts.
///
/// # Example
///
/// ```rust
/// use rs_sqs_listener::handler::HandlerRegistry;
/// use rs_sqs_listener::message::Message;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct OrderCreated {
///     id: u64,
/// }
///
/// let mut registry = HandlerRegistry::new();
/// registry
///     .add_handler_fn(
///         |message: Message<OrderCreated>, prefix: String| async move {
///             println!("{prefix}: order {}", message.payload().id);
///             Ok(())
///         },
///         "orders".to_string(),
///     )
///     .add_default_handler_fn(
///         |message: Message<String>, _: ()| async move {
///             println!("unrouted message: {}", message.payload());
///             Ok(())
///         },
///         (),
///     );
///
/// let resolver = registry.build().unwrap();
/// assert!(resolver.has_handlers());
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<HandlerRegistration<DynMessageHandler>>,
    batch_handlers: Vec<HandlerRegistration<DynBatchMessageHandler>>,
    type_names: Vec<(String, PayloadType)>,
    short_names: Vec<(String, PayloadType)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for payloads of type `T`.
    pub fn add_handler<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.register_type_name::<T>();
        self.handlers.push(HandlerRegistration {
            payload_type: PayloadType::of::<T>(),
            default: false,
            handler: Arc::new(TypedHandler::<T, H>::new(handler)),
        });
        self
    }

    /// Registers an async function for payloads of type `T`.
    ///
    /// `shared_resources` is cloned for every invocation.
    pub fn add_handler_fn<T, F, Fut, TShared>(
        &mut self,
        handler_fn: F,
        shared_resources: TShared,
    ) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Message<T>, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        self.add_handler::<T, _>(MessageHandlerFnImpl::new(handler_fn, shared_resources))
    }

    /// Registers a batch handler for payloads of type `T`.
    pub fn add_batch_handler<T, H>(&mut self, handler: H) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        H: BatchMessageHandler<T>,
    {
        self.register_type_name::<T>();
        self.batch_handlers.push(HandlerRegistration {
            payload_type: PayloadType::of::<T>(),
            default: false,
            handler: Arc::new(TypedBatchHandler::<T, H>::new(handler)),
        });
        self
    }

    pub fn add_batch_handler_fn<T, F, Fut, TShared>(
        &mut self,
        handler_fn: F,
        shared_resources: TShared,
    ) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Vec<Message<T>>, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        self.add_batch_handler::<T, _>(BatchMessageHandlerFnImpl::new(
            handler_fn,
            shared_resources,
        ))
    }

    /// Registers a handler used when no payload-specific handler matches.
    ///
    /// It receives the raw message body.
    pub fn add_default_handler<H>(&mut self, handler: H) -> &mut Self
    where
        H: MessageHandler<String>,
    {
        self.handlers.push(HandlerRegistration {
            payload_type: PayloadType::of::<String>(),
            default: true,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn add_default_handler_fn<F, Fut, TShared>(
        &mut self,
        handler_fn: F,
        shared_resources: TShared,
    ) -> &mut Self
    where
        F: Fn(Message<String>, TShared) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
        TShared: Clone + Send + Sync + 'static,
    {
        self.add_default_handler(MessageHandlerFnImpl::new(handler_fn, shared_resources))
    }

    pub fn add_default_batch_handler<H>(&mut self, handler: H) -> &mut Self
    where
        H: BatchMessageHandler<String>,
    {
        self.batch_handlers.push(HandlerRegistration {
            payload_type: PayloadType::of::<String>(),
            default: true,
            handler: Arc::new(handler),
        });
        self
    }

    /// Makes messages tagged with `name` resolve to payload type `T`.
    pub fn map_type_name<T: 'static>(&mut self, name: impl Into<String>) -> &mut Self {
        self.type_names.push((name.into(), PayloadType::of::<T>()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.batch_handlers.is_empty()
    }

    /// Validates the registrations and produces the resolver.
    ///
    /// Fails with [`SqsListenerError::AmbiguousHandler`] when two non-default
    /// handlers declare the same payload type or two default handlers exist, and
    /// with [`SqsListenerError::InvalidConfiguration`] when a mapped type name
    /// points at two different payload types.
    pub fn build(self) -> Result<HandlerResolver, SqsListenerError> {
        HandlerResolver::new(
            self.handlers,
            self.batch_handlers,
            self.type_names,
            self.short_names,
        )
    }

    fn register_type_name<T: 'static>(&mut self) {
        let payload_type = PayloadType::of::<T>();
        self.short_names
            .push((payload_type.short_name().to_string(), payload_type));
        self.type_names
            .push((payload_type.name().to_string(), payload_type));
    }
}

/// Converts a message body into `T`: JSON for every type except `String`, which
/// receives the body unchanged.
pub(crate) fn convert_payload<T>(body: &str) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + 'static,
{
    if TypeId::of::<T>() == TypeId::of::<String>() {
        let raw: Box<dyn Any> = Box::new(body.to_string());
        if let Ok(payload) = raw.downcast::<T>() {
            return Ok(*payload);
        }
    }
    serde_json::from_str(body)
}

fn convert_message<T>(message: Message<String>) -> Result<Message<T>, SqsListenerError>
where
    T: DeserializeOwned + 'static,
{
    let message_id = message.message_id().to_string();
    message
        .try_map(|body| convert_payload::<T>(&body))
        .map_err(|source| SqsListenerError::MessageConversion {
            message_id,
            payload_type: PayloadType::of::<T>().short_name().to_string(),
            source,
        })
}

/// Adapts a `MessageHandler<T>` to the body-level handler stored in the resolver.
struct TypedHandler<T, H> {
    handler: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> TypedHandler<T, H> {
    fn new(handler: H) -> Self {
        TypedHandler {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> MessageHandler<String> for TypedHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn handle(&self, message: Message<String>) -> Result<(), SqsListenerError> {
        let message = convert_message::<T>(message)?;
        self.handler.handle(message).await
    }
}

struct TypedBatchHandler<T, H> {
    handler: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> TypedBatchHandler<T, H> {
    fn new(handler: H) -> Self {
        TypedBatchHandler {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> BatchMessageHandler<String> for TypedBatchHandler<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: BatchMessageHandler<T>,
{
    async fn handle_batch(&self, messages: Vec<Message<String>>) -> Result<(), SqsListenerError> {
        let messages = messages
            .into_iter()
            .map(convert_message::<T>)
            .collect::<Result<Vec<_>, _>>()?;
        self.handler.handle_batch(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct OrderCreated {
        id: u64,
    }

    #[test]
    fn short_name_strips_path_and_generics() {
        assert_eq!(PayloadType::of::<OrderCreated>().short_name(), "OrderCreated");
        assert_eq!(PayloadType::of::<Vec<OrderCreated>>().short_name(), "Vec");
        assert_eq!(PayloadType::of::<String>().short_name(), "String");
    }

    #[test]
    fn payload_types_compare_by_type_id() {
        assert_eq!(PayloadType::of::<OrderCreated>(), PayloadType::of::<OrderCreated>());
        assert_ne!(PayloadType::of::<OrderCreated>(), PayloadType::of::<String>());
    }

    #[test]
    fn string_payload_receives_raw_body() {
        let body = r#"{"id":7}"#;
        let payload: String = convert_payload(body).unwrap();
        assert_eq!(payload, body);
    }

    #[test]
    fn typed_payload_is_json_decoded() {
        let payload: OrderCreated = convert_payload(r#"{"id":7}"#).unwrap();
        assert_eq!(payload, OrderCreated { id: 7 });
        assert!(convert_payload::<OrderCreated>("not json").is_err());
    }
}
