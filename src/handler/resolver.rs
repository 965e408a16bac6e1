use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::debug;

use super::{DynBatchMessageHandler, DynMessageHandler, HandlerRegistration, PayloadType};
use crate::errors::SqsListenerError;
use crate::message::RawMessage;

/// Resolves the handler for a payload type and memoizes the decision.
///
/// The matching loop over the registrations runs at most once per distinct
/// payload type; later lookups are served from a concurrent cache.
pub struct HandlerResolver {
    handlers: Registrations<DynMessageHandler>,
    batch_handlers: Registrations<DynBatchMessageHandler>,
    type_names: HashMap<String, PayloadType>,
}

impl HandlerResolver {
    pub(crate) fn new(
        handlers: Vec<HandlerRegistration<DynMessageHandler>>,
        batch_handlers: Vec<HandlerRegistration<DynBatchMessageHandler>>,
        type_names: Vec<(String, PayloadType)>,
        short_names: Vec<(String, PayloadType)>,
    ) -> Result<Self, SqsListenerError> {
        let handlers = Registrations::new(handlers);
        let batch_handlers = Registrations::new(batch_handlers);
        handlers.validate()?;
        batch_handlers.validate()?;

        let mut names: HashMap<String, PayloadType> = HashMap::with_capacity(type_names.len());
        for (name, payload_type) in type_names {
            insert_type_name(&mut names, name, payload_type)?;
        }

        let mut candidates: HashMap<String, Vec<PayloadType>> = HashMap::new();
        for (name, payload_type) in short_names {
            let types = candidates.entry(name).or_default();
            if !types.contains(&payload_type) {
                types.push(payload_type);
            }
        }
        for (name, types) in candidates {
            match types.as_slice() {
                [payload_type] => insert_type_name(&mut names, name, *payload_type)?,
                _ if names.contains_key(&name) => {}
                _ => debug!(
                    payload_type = %name,
                    candidates = types.len(),
                    "Short type name is shared by several payload types, not using it"
                ),
            }
        }

        Ok(HandlerResolver {
            handlers,
            batch_handlers,
            type_names: names,
        })
    }

    /// Determines the runtime payload type of a message from its type attribute.
    ///
    /// Untagged messages and unknown type names resolve to `String`.
    pub fn payload_type_of(&self, message: &RawMessage, type_attribute: &str) -> PayloadType {
        match message.message_attribute(type_attribute) {
            Some(name) => self.type_names.get(name).copied().unwrap_or_else(|| {
                debug!(
                    message_id = %message.message_id,
                    payload_type = name,
                    "Unknown payload type name, treating payload as raw body"
                );
                PayloadType::of::<String>()
            }),
            None => PayloadType::of::<String>(),
        }
    }

    pub fn resolve(
        &self,
        payload_type: PayloadType,
    ) -> Result<Arc<DynMessageHandler>, SqsListenerError> {
        self.handlers.resolve(payload_type)
    }

    pub fn resolve_batch(
        &self,
        payload_type: PayloadType,
    ) -> Result<Arc<DynBatchMessageHandler>, SqsListenerError> {
        self.batch_handlers.resolve(payload_type)
    }

    pub fn has_handlers(&self) -> bool {
        !self.handlers.entries.is_empty()
    }

    pub fn has_batch_handlers(&self) -> bool {
        !self.batch_handlers.entries.is_empty()
    }

    /// Number of times the matching loop ran, across single and batch handlers.
    pub fn resolution_count(&self) -> usize {
        self.handlers.resolutions.load(Ordering::Relaxed)
            + self.batch_handlers.resolutions.load(Ordering::Relaxed)
    }
}

fn insert_type_name(
    names: &mut HashMap<String, PayloadType>,
    name: String,
    payload_type: PayloadType,
) -> Result<(), SqsListenerError> {
    match names.get(&name) {
        Some(existing) if *existing != payload_type => {
            Err(SqsListenerError::InvalidConfiguration(format!(
                "payload type name '{name}' maps to both {} and {}",
                existing.name(),
                payload_type.name()
            )))
        }
        Some(_) => Ok(()),
        None => {
            names.insert(name, payload_type);
            Ok(())
        }
    }
}

struct Registrations<H: ?Sized> {
    entries: Vec<HandlerRegistration<H>>,
    cache: DashMap<TypeId, Resolution<H>>,
    resolutions: AtomicUsize,
}

/// Memoized outcome of the matching loop. Registrations never change after
/// build, so misses are cached as well.
enum Resolution<H: ?Sized> {
    Handler(Arc<H>),
    NoMatch,
    Ambiguous(usize),
}

impl<H: ?Sized> Resolution<H> {
    fn to_result(&self, payload_type: PayloadType) -> Result<Arc<H>, SqsListenerError> {
        match self {
            Resolution::Handler(handler) => Ok(Arc::clone(handler)),
            Resolution::NoMatch => Err(SqsListenerError::NoMatchingHandler(
                payload_type.short_name().to_string(),
            )),
            Resolution::Ambiguous(candidates) => Err(SqsListenerError::AmbiguousHandler {
                payload_type: payload_type.short_name().to_string(),
                candidates: *candidates,
            }),
        }
    }
}

impl<H: ?Sized> Registrations<H> {
    fn new(entries: Vec<HandlerRegistration<H>>) -> Self {
        Registrations {
            entries,
            cache: DashMap::new(),
            resolutions: AtomicUsize::new(0),
        }
    }

    fn validate(&self) -> Result<(), SqsListenerError> {
        let defaults = self.entries.iter().filter(|entry| entry.is_default()).count();
        if defaults > 1 {
            return Err(SqsListenerError::AmbiguousHandler {
                payload_type: "<default>".to_string(),
                candidates: defaults,
            });
        }

        let mut per_type: HashMap<PayloadType, usize> = HashMap::new();
        for entry in self.entries.iter().filter(|entry| !entry.is_default()) {
            *per_type.entry(entry.payload_type()).or_default() += 1;
        }
        match per_type.into_iter().find(|(_, count)| *count > 1) {
            Some((payload_type, candidates)) => Err(SqsListenerError::AmbiguousHandler {
                payload_type: payload_type.short_name().to_string(),
                candidates,
            }),
            None => Ok(()),
        }
    }

    fn resolve(&self, payload_type: PayloadType) -> Result<Arc<H>, SqsListenerError> {
        if let Some(cached) = self.cache.get(&payload_type.id()) {
            return cached.value().to_result(payload_type);
        }

        let resolution = self.find_match(payload_type);
        let cached = self.cache.entry(payload_type.id()).or_insert(resolution);
        cached.value().to_result(payload_type)
    }

    fn find_match(&self, payload_type: PayloadType) -> Resolution<H> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let (defaults, specific): (Vec<_>, Vec<_>) = self
            .entries
            .iter()
            .filter(|entry| entry.accepts(payload_type))
            .partition(|entry| entry.is_default());

        match (specific.as_slice(), defaults.as_slice()) {
            ([single], _) => Resolution::Handler(Arc::clone(single.handler())),
            ([], [default]) => Resolution::Handler(Arc::clone(default.handler())),
            ([], []) => Resolution::NoMatch,
            ([], defaults) => Resolution::Ambiguous(defaults.len()),
            (specific, _) => Resolution::Ambiguous(specific.len()),
        }
    }
}
