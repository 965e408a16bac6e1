use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::{BatchMessageHandler, MessageHandler};
use crate::errors::SqsListenerError;
use crate::message::Message;

/// Implementation of [`MessageHandler`] that wraps an async function.
///
/// The wrapped function receives the converted message and a clone of the shared
/// resources on every invocation.
///
/// # Type Parameters
///
/// * `F` - The message handler function type
/// * `Fut` - The future returned by the handler function
/// * `T` - The payload type the handler accepts
/// * `TShared` - The type of shared resources passed to the handler
pub struct MessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Message<T>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    handler_fn: F,
    shared_resources: TShared,
    _marker: PhantomData<fn(T) -> Fut>,
}

impl<F, Fut, T, TShared> MessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Message<T>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    pub fn new(handler_fn: F, shared_resources: TShared) -> Self {
        MessageHandlerFnImpl {
            handler_fn,
            shared_resources,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T, TShared> MessageHandler<T> for MessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Message<T>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    async fn handle(&self, message: Message<T>) -> Result<(), SqsListenerError> {
        (self.handler_fn)(message, self.shared_resources.clone()).await
    }
}

/// Implementation of [`BatchMessageHandler`] that wraps an async function.
pub struct BatchMessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Vec<Message<T>>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    handler_fn: F,
    shared_resources: TShared,
    _marker: PhantomData<fn(T) -> Fut>,
}

impl<F, Fut, T, TShared> BatchMessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Vec<Message<T>>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    pub fn new(handler_fn: F, shared_resources: TShared) -> Self {
        BatchMessageHandlerFnImpl {
            handler_fn,
            shared_resources,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, T, TShared> BatchMessageHandler<T> for BatchMessageHandlerFnImpl<F, Fut, T, TShared>
where
    F: Fn(Vec<Message<T>>, TShared) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SqsListenerError>> + Send + 'static,
    T: Send + 'static,
    TShared: Clone + Send + Sync + 'static,
{
    async fn handle_batch(&self, messages: Vec<Message<T>>) -> Result<(), SqsListenerError> {
        (self.handler_fn)(messages, self.shared_resources.clone()).await
    }
}
