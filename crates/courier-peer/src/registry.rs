//! Daemon-side routing from operation id to handler.
//!
//! The registry is filled before the daemon starts serving and is read-only
//! afterwards, so dispatch needs no locking.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use courier_frame::operation::builtin_name;
use courier_frame::{is_reserved, LIST_OPERATIONS};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DuplicatePolicy;
use crate::error::{CourierError, ErrorCode, HandlerError, RemoteError, Result};
use crate::typed::{encode_body, Operation};

/// Per-call information handed to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub connection_id: u64,
    pub call_id: u64,
    pub operation_id: u32,
}

/// Result type for handlers.
pub type HandlerResult = std::result::Result<Bytes, HandlerError>;

/// User-supplied logic behind one operation id.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: &CallContext, body: Bytes) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&CallContext, Bytes) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, ctx: &CallContext, body: Bytes) -> HandlerResult {
        self(ctx, body)
    }
}

/// One entry of the reflection listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub id: u32,
    pub name: String,
}

struct Entry {
    name: String,
    handler: Arc<dyn Handler>,
}

/// Maps operation ids to handlers.
pub struct DispatchRegistry {
    entries: HashMap<u32, Entry>,
    policy: DuplicatePolicy,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    /// Register `handler` under `operation_id` with a generated name.
    pub fn register<H: Handler>(&mut self, operation_id: u32, handler: H) -> Result<()> {
        self.register_named(operation_id, format!("op-{operation_id}"), handler)
    }

    /// Register `handler` under `operation_id` with a human-readable name.
    pub fn register_named<H: Handler>(
        &mut self,
        operation_id: u32,
        name: impl Into<String>,
        handler: H,
    ) -> Result<()> {
        if is_reserved(operation_id) {
            return Err(CourierError::ReservedOperation(operation_id));
        }

        let name = name.into();
        if let Some(existing) = self.entries.get(&operation_id) {
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(CourierError::DuplicateOperation(operation_id));
                }
                DuplicatePolicy::Ignore => {
                    debug!(operation_id, kept = %existing.name, ignored = %name, "duplicate registration ignored");
                    return Ok(());
                }
                DuplicatePolicy::Replace => {
                    debug!(operation_id, replaced = %existing.name, with = %name, "handler replaced");
                }
            }
        }

        self.entries.insert(
            operation_id,
            Entry {
                name,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    /// Register a typed operation; bodies are JSON-encoded `O::Request`/`O::Response`.
    pub fn register_operation<O, F>(&mut self, handler: F) -> Result<()>
    where
        O: Operation,
        F: Fn(&CallContext, O::Request) -> std::result::Result<O::Response, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register_named(
            O::ID,
            O::NAME,
            move |ctx: &CallContext, body: Bytes| -> HandlerResult {
                let request: O::Request = serde_json::from_slice(&body)?;
                let response = handler(ctx, request)?;
                encode_body(&response).map_err(|err| HandlerError::new(err.to_string()))
            },
        )
    }

    /// Route one request. Never panics: unknown ids, handler errors, and
    /// handler panics all come back as a [`RemoteError`].
    pub fn dispatch(&self, ctx: &CallContext, body: Bytes) -> std::result::Result<Bytes, RemoteError> {
        if ctx.operation_id == LIST_OPERATIONS {
            return serde_json::to_vec(&self.operations())
                .map(Bytes::from)
                .map_err(|err| RemoteError::new(ErrorCode::Application, err.to_string()));
        }

        let entry = self
            .entries
            .get(&ctx.operation_id)
            .ok_or_else(|| RemoteError::unknown_operation(ctx.operation_id))?;

        match catch_unwind(AssertUnwindSafe(|| entry.handler.call(ctx, body))) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                debug!(
                    connection_id = ctx.connection_id,
                    call_id = ctx.call_id,
                    operation = %entry.name,
                    error = %err,
                    "handler returned error"
                );
                Err(err.into())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    connection_id = ctx.connection_id,
                    call_id = ctx.call_id,
                    operation = %entry.name,
                    panic = %message,
                    "handler panicked"
                );
                Err(RemoteError::new(ErrorCode::HandlerPanicked, message))
            }
        }
    }

    /// Registered operations plus the built-in listing, ordered by id.
    pub fn operations(&self) -> Vec<OperationInfo> {
        let mut ops: Vec<OperationInfo> = self
            .entries
            .iter()
            .map(|(id, entry)| OperationInfo {
                id: *id,
                name: entry.name.clone(),
            })
            .collect();
        if let Some(name) = builtin_name(LIST_OPERATIONS) {
            ops.push(OperationInfo {
                id: LIST_OPERATIONS,
                name: name.to_string(),
            });
        }
        ops.sort_by_key(|op| op.id);
        ops
    }

    pub fn name(&self, operation_id: u32) -> Option<&str> {
        self.entries.get(&operation_id).map(|e| e.name.as_str())
    }

    pub fn contains(&self, operation_id: u32) -> bool {
        self.entries.contains_key(&operation_id)
    }

    /// Number of user-registered operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::typed::decode_body;

    fn ctx(operation_id: u32) -> CallContext {
        CallContext {
            connection_id: 1,
            call_id: 1,
            operation_id,
        }
    }

    fn echo(_: &CallContext, body: Bytes) -> HandlerResult {
        Ok(body)
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let mut registry = DispatchRegistry::new();
        registry.register(1, echo).unwrap();
        registry
            .register(2, |_: &CallContext, body: Bytes| -> HandlerResult {
                let mut reversed = body.to_vec();
                reversed.reverse();
                Ok(Bytes::from(reversed))
            })
            .unwrap();

        assert_eq!(
            registry.dispatch(&ctx(1), Bytes::from_static(b"abc")).unwrap(),
            Bytes::from_static(b"abc")
        );
        assert_eq!(
            registry.dispatch(&ctx(2), Bytes::from_static(b"abc")).unwrap(),
            Bytes::from_static(b"cba")
        );
    }

    #[test]
    fn unknown_operation_is_an_error_not_a_panic() {
        let registry = DispatchRegistry::new();
        let err = registry.dispatch(&ctx(77), Bytes::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownOperation);
    }

    #[test]
    fn duplicate_policies() {
        let mut reject = DispatchRegistry::new();
        reject.register(1, echo).unwrap();
        assert!(matches!(
            reject.register(1, echo),
            Err(CourierError::DuplicateOperation(1))
        ));

        let mut replace = DispatchRegistry::with_policy(DuplicatePolicy::Replace);
        replace.register_named(1, "first", echo).unwrap();
        replace.register_named(1, "second", echo).unwrap();
        assert_eq!(replace.name(1), Some("second"));

        let mut ignore = DispatchRegistry::with_policy(DuplicatePolicy::Ignore);
        ignore.register_named(1, "first", echo).unwrap();
        ignore.register_named(1, "second", echo).unwrap();
        assert_eq!(ignore.name(1), Some("first"));
        assert_eq!(ignore.len(), 1);
    }

    #[test]
    fn reserved_ids_cannot_be_registered() {
        let mut registry = DispatchRegistry::new();
        assert!(matches!(
            registry.register(LIST_OPERATIONS, echo),
            Err(CourierError::ReservedOperation(_))
        ));
        assert!(matches!(
            registry.register(u32::MAX, echo),
            Err(CourierError::ReservedOperation(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn handler_error_becomes_remote_error() {
        let mut registry = DispatchRegistry::new();
        registry
            .register(9, |_: &CallContext, _: Bytes| -> HandlerResult {
                Err(HandlerError::new("no space left"))
            })
            .unwrap();

        let err = registry.dispatch(&ctx(9), Bytes::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::Application);
        assert_eq!(err.message, "no space left");
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut registry = DispatchRegistry::new();
        registry
            .register(4, |_: &CallContext, _: Bytes| -> HandlerResult { panic!("boom") })
            .unwrap();

        let err = registry.dispatch(&ctx(4), Bytes::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerPanicked);
        assert_eq!(err.message, "boom");

        // The registry is still usable afterwards.
        assert!(registry.contains(4));
    }

    #[test]
    fn list_operations_reflects_registrations() {
        let mut registry = DispatchRegistry::new();
        registry.register_named(2, "reverse", echo).unwrap();
        registry.register_named(1, "echo", echo).unwrap();

        let body = registry.dispatch(&ctx(LIST_OPERATIONS), Bytes::new()).unwrap();
        let ops: Vec<OperationInfo> = serde_json::from_slice(&body).unwrap();
        let names: Vec<&str> = ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "reverse", "list_operations"]);
        assert_eq!(ops[2].id, LIST_OPERATIONS);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AddRequest {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AddResponse {
        sum: i64,
    }

    struct Add;

    impl Operation for Add {
        const ID: u32 = 10;
        const NAME: &'static str = "add";
        type Request = AddRequest;
        type Response = AddResponse;
    }

    #[test]
    fn typed_operation_decodes_and_encodes_json() {
        let mut registry = DispatchRegistry::new();
        registry
            .register_operation::<Add, _>(|_, req| Ok(AddResponse { sum: req.a + req.b }))
            .unwrap();
        assert_eq!(registry.name(Add::ID), Some("add"));

        let body = encode_body(&AddRequest { a: 2, b: 40 }).unwrap();
        let reply = registry.dispatch(&ctx(Add::ID), body).unwrap();
        let decoded: AddResponse = decode_body(&reply).unwrap();
        assert_eq!(decoded, AddResponse { sum: 42 });

        let err = registry
            .dispatch(&ctx(Add::ID), Bytes::from_static(b"not json"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedRequest);
    }
}
