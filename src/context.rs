//! Per-connection protocol context.
//!
//! The context survives between invocations as a flattened, type-tagged hash
//! (see [`crate::codec`]). Within an invocation it is a typed value wrapped
//! in [`TrackedContext`], whose explicit mutator API records every effective
//! write or delete; [`ContextStore::flush`] drains the recorded changes into
//! the store, grouping contiguous same-op runs into one hash write or delete
//! each.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    codec::{self, Scalar},
    keys::KeySpace,
    store::{Store, StoreError},
};

const INIT_FIELD: &str = "connectionInitReceived";
const ACK_FIELD: &str = "acknowledged";
const PARAMS_FIELD: &str = "connectionParams";
const EXTRA_FIELD: &str = "extra";
const SUBSCRIPTIONS_FIELD: &str = "subscriptions";

/// The protocol state of one connection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionContext {
    /// Whether a ConnectionInit message has been received.
    pub connection_init_received: bool,

    /// Whether the connection has been acknowledged.
    pub acknowledged: bool,

    /// The parameters the client passed with its ConnectionInit message.
    pub connection_params: Option<Value>,

    /// Application data attached to the connection.
    pub extra: Map<String, Value>,

    /// Live operation bookkeeping. Never persisted; a stateless invocation
    /// starts every message with this empty.
    pub subscriptions: Map<String, Value>,
}

impl ConnectionContext {
    /// The context created on CONNECT, with `extra` snapshotting the
    /// gateway's request metadata.
    pub fn with_extra(extra: Map<String, Value>) -> Self {
        Self {
            extra,
            ..Self::default()
        }
    }
}

/// Flattens a context into encoded hash fields. `subscriptions` is not
/// persisted.
pub fn compress(ctx: &ConnectionContext) -> Vec<(String, String)> {
    let mut leaves = vec![
        (INIT_FIELD.into(), Scalar::Bool(ctx.connection_init_received)),
        (ACK_FIELD.into(), Scalar::Bool(ctx.acknowledged)),
    ];
    match &ctx.connection_params {
        Some(params) => codec::flatten(PARAMS_FIELD, params, &mut leaves),
        None => leaves.push((PARAMS_FIELD.into(), Scalar::Undefined)),
    }
    for (field, value) in &ctx.extra {
        codec::flatten(&format!("{EXTRA_FIELD}.{field}"), value, &mut leaves);
    }
    leaves
        .into_iter()
        .map(|(path, scalar)| (path, codec::encode(&scalar)))
        .collect()
}

/// Rebuilds a context from its stored hash fields. Unrecognized top-level
/// fields are dropped.
pub fn decompress(fields: &HashMap<String, String>) -> ConnectionContext {
    let mut ctx = ConnectionContext::default();
    let mut params = Value::Null;
    let mut params_present = false;
    let mut extra = Value::Object(Map::new());
    let mut subscriptions = Value::Object(Map::new());

    for (path, raw) in fields {
        let segments = codec::segments(path);
        let Some((&root, rest)) = segments.split_first() else {
            continue;
        };
        let scalar = codec::decode(raw);
        match root {
            INIT_FIELD => {
                if let Scalar::Bool(b) = scalar {
                    ctx.connection_init_received = b;
                }
            }
            ACK_FIELD => {
                if let Scalar::Bool(b) = scalar {
                    ctx.acknowledged = b;
                }
            }
            PARAMS_FIELD if rest.is_empty() => {
                if !matches!(scalar, Scalar::Undefined) {
                    params = scalar.into_value();
                    params_present = true;
                }
            }
            PARAMS_FIELD => {
                codec::insert(&mut params, rest, scalar);
                params_present = true;
            }
            EXTRA_FIELD if !rest.is_empty() => codec::insert(&mut extra, rest, scalar),
            SUBSCRIPTIONS_FIELD if !rest.is_empty() => {
                codec::insert(&mut subscriptions, rest, scalar)
            }
            _ => {}
        }
    }

    ctx.connection_params = params_present.then_some(params);
    if let Value::Object(fields) = extra {
        ctx.extra = fields;
    }
    if let Value::Object(fields) = subscriptions {
        ctx.subscriptions = fields;
    }
    ctx
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ChangeOp {
    Set,
    Del,
}

/// One recorded mutation: `(op, dotted-path, value)`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Change {
    pub(crate) op: ChangeOp,
    pub(crate) path: String,
    pub(crate) value: Option<Scalar>,
}

/// A context plus the queue of changes made to it this invocation.
///
/// Writes go through [`set`](Self::set) and [`delete`](Self::delete) so they
/// can be tracked: writing a value equal to the current one records nothing,
/// assigning a tree records one change per leaf, and deleting an existing
/// path records exactly one delete.
#[derive(Debug)]
pub struct TrackedContext {
    ctx: ConnectionContext,
    pending: Vec<Change>,
}

impl std::ops::Deref for TrackedContext {
    type Target = ConnectionContext;

    fn deref(&self) -> &ConnectionContext {
        &self.ctx
    }
}

impl TrackedContext {
    pub(crate) fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            pending: Vec::new(),
        }
    }

    /// Writes `value` at the dotted `path`, recording the change unless the
    /// current value is already equal. Paths are rooted at the recognized
    /// top-level fields; anything else is ignored.
    pub fn set(&mut self, path: &str, value: Value) {
        let segments = codec::segments(path);
        let Some((&root, rest)) = segments.split_first() else {
            return;
        };
        match root {
            INIT_FIELD if rest.is_empty() => {
                if let Value::Bool(b) = value {
                    self.set_connection_init_received(b);
                }
            }
            ACK_FIELD if rest.is_empty() => {
                if let Value::Bool(b) = value {
                    self.set_acknowledged(b);
                }
            }
            PARAMS_FIELD if rest.is_empty() => self.set_connection_params(Some(value)),
            PARAMS_FIELD => {
                let mut tree = self.ctx.connection_params.take().unwrap_or(Value::Null);
                Self::set_in_tree(&mut self.pending, &mut tree, &segments, rest, value);
                self.ctx.connection_params = Some(tree);
            }
            EXTRA_FIELD | SUBSCRIPTIONS_FIELD => {
                let fields = if root == EXTRA_FIELD {
                    std::mem::take(&mut self.ctx.extra)
                } else {
                    std::mem::take(&mut self.ctx.subscriptions)
                };
                let mut tree = Value::Object(fields);
                if rest.is_empty() {
                    // Whole-tree assignment; only an object makes sense here.
                    if let Value::Object(_) = value {
                        Self::set_in_tree(&mut self.pending, &mut tree, &segments, rest, value);
                    }
                } else {
                    Self::set_in_tree(&mut self.pending, &mut tree, &segments, rest, value);
                }
                let fields = match tree {
                    Value::Object(fields) => fields,
                    _ => Map::new(),
                };
                if root == EXTRA_FIELD {
                    self.ctx.extra = fields;
                } else {
                    self.ctx.subscriptions = fields;
                }
            }
            _ => {}
        }
    }

    /// Deletes the value at the dotted `path`, recording one delete if it
    /// existed. Array elements are replaced by a hole rather than shifted.
    pub fn delete(&mut self, path: &str) {
        let segments = codec::segments(path);
        let Some((&root, rest)) = segments.split_first() else {
            return;
        };
        let removed = match root {
            PARAMS_FIELD if !rest.is_empty() => match self.ctx.connection_params.as_mut() {
                Some(tree) => remove_path(tree, rest),
                None => false,
            },
            PARAMS_FIELD => self.ctx.connection_params.take().is_some(),
            EXTRA_FIELD if !rest.is_empty() => {
                let mut tree = Value::Object(std::mem::take(&mut self.ctx.extra));
                let removed = remove_path(&mut tree, rest);
                if let Value::Object(fields) = tree {
                    self.ctx.extra = fields;
                }
                removed
            }
            SUBSCRIPTIONS_FIELD if !rest.is_empty() => {
                let mut tree = Value::Object(std::mem::take(&mut self.ctx.subscriptions));
                let removed = remove_path(&mut tree, rest);
                if let Value::Object(fields) = tree {
                    self.ctx.subscriptions = fields;
                }
                removed
            }
            _ => false,
        };
        if removed {
            self.pending.push(Change {
                op: ChangeOp::Del,
                path: segments.join("."),
                value: None,
            });
        }
    }

    /// Marks the ConnectionInit message as received.
    pub fn set_connection_init_received(&mut self, value: bool) {
        if self.ctx.connection_init_received != value {
            self.ctx.connection_init_received = value;
            self.record_set(INIT_FIELD.into(), Scalar::Bool(value));
        }
    }

    /// Marks the connection as acknowledged.
    pub fn set_acknowledged(&mut self, value: bool) {
        if self.ctx.acknowledged != value {
            self.ctx.acknowledged = value;
            self.record_set(ACK_FIELD.into(), Scalar::Bool(value));
        }
    }

    /// Replaces the connection parameters; [`None`] records an undefined
    /// marker so the absence survives persistence.
    pub fn set_connection_params(&mut self, value: Option<Value>) {
        if self.ctx.connection_params == value {
            return;
        }
        match &value {
            Some(tree) => {
                let mut leaves = Vec::new();
                codec::flatten(PARAMS_FIELD, tree, &mut leaves);
                for (path, scalar) in leaves {
                    self.record_set(path, scalar);
                }
            }
            None => self.record_set(PARAMS_FIELD.into(), Scalar::Undefined),
        }
        self.ctx.connection_params = value;
    }

    fn set_in_tree(
        pending: &mut Vec<Change>,
        tree: &mut Value,
        segments: &[&str],
        rest: &[&str],
        value: Value,
    ) {
        if lookup(tree, rest) == Some(&value) {
            return;
        }
        let path = segments.join(".");
        let mut leaves = Vec::new();
        codec::flatten(&path, &value, &mut leaves);
        for (leaf_path, scalar) in leaves {
            pending.push(Change {
                op: ChangeOp::Set,
                path: leaf_path,
                value: Some(scalar),
            });
        }
        codec::replace(tree, rest, value);
    }

    fn record_set(&mut self, path: String, scalar: Scalar) {
        self.pending.push(Change {
            op: ChangeOp::Set,
            path,
            value: Some(scalar),
        });
    }

    /// Whether any changes await a flush.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn restore_pending(&mut self, mut changes: Vec<Change>) {
        changes.append(&mut self.pending);
        self.pending = changes;
    }
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(fields) => fields.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn remove_path(root: &mut Value, segments: &[&str]) -> bool {
    let Some((&last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = root;
    for segment in parents {
        current = match current {
            Value::Object(fields) => match fields.get_mut(*segment) {
                Some(v) => v,
                None => return false,
            },
            Value::Array(items) => {
                let Some(index) = segment.parse::<usize>().ok() else {
                    return false;
                };
                match items.get_mut(index) {
                    Some(v) => v,
                    None => return false,
                }
            }
            _ => return false,
        };
    }
    match current {
        Value::Object(fields) => fields.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>().ok() {
            Some(index) if index < items.len() && items[index] != Value::Null => {
                items[index] = Value::Null;
                true
            }
            _ => false,
        },
        _ => false,
    }
}

/// Loads, creates, and flushes connection contexts against the store.
#[derive(Clone)]
pub struct ContextStore {
    store: Arc<dyn Store>,
    keys: KeySpace,
}

impl ContextStore {
    /// Creates a context store over the shared store.
    pub fn new(store: Arc<dyn Store>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Reads a connection's context; an absent record reads as the default
    /// context.
    pub async fn load(&self, connection_id: &str) -> Result<ConnectionContext, StoreError> {
        let fields = self.store.read_fields(&self.keys.context(connection_id)).await?;
        Ok(decompress(&fields))
    }

    /// Writes the flattened context in one round-trip, replacing any prior
    /// record.
    pub async fn create(
        &self,
        connection_id: &str,
        ctx: &ConnectionContext,
    ) -> Result<(), StoreError> {
        self.store
            .replace_fields(&self.keys.context(connection_id), &compress(ctx))
            .await
    }

    /// Persists all pending changes in observation order, grouping
    /// contiguous same-op runs into one hash write or delete each.
    ///
    /// On failure the undelivered changes are retained for a later retry and
    /// the error is returned; the terminal flush of an invocation must
    /// propagate it so the host does not acknowledge a partially-persisted
    /// context.
    pub async fn flush(
        &self,
        connection_id: &str,
        tracked: &mut TrackedContext,
    ) -> Result<(), StoreError> {
        if !tracked.has_pending() {
            return Ok(());
        }
        let key = self.keys.context(connection_id);
        let mut changes = tracked.take_pending();

        let mut cursor = 0;
        while cursor < changes.len() {
            let op = changes[cursor].op;
            let run_end = changes[cursor..]
                .iter()
                .position(|c| c.op != op)
                .map(|offset| cursor + offset)
                .unwrap_or(changes.len());
            let run = &changes[cursor..run_end];

            let written = match op {
                ChangeOp::Set => {
                    let fields: Vec<(String, String)> = run
                        .iter()
                        .map(|c| {
                            let scalar = c.value.as_ref().unwrap_or(&Scalar::Undefined);
                            (c.path.clone(), codec::encode(scalar))
                        })
                        .collect();
                    self.store.write_fields(&key, &fields).await
                }
                ChangeOp::Del => {
                    let fields: Vec<String> = run.iter().map(|c| c.path.clone()).collect();
                    self.store.clear_fields(&key, &fields).await
                }
            };

            if let Err(err) = written {
                tracing::warn!(
                    connection_id,
                    pending = changes.len() - cursor,
                    error = %err,
                    "context flush failed; retaining changes for retry",
                );
                changes.drain(..cursor);
                tracked.restore_pending(changes);
                return Err(err);
            }
            cursor = run_end;
        }
        Ok(())
    }
}
