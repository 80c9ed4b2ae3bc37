//! Scoped evaluation context.
//!
//! A context is a stack of binding frames. Lookups search innermost first.
//! [`Context::checkpoint`] pushes a frame and returns a guard; dropping the
//! guard pops the frame and everything bound in it, on every exit path.
//!
//! [`Context::fork`] freezes the visible frames into a shared, immutable
//! parent chain and returns an independent context on top of it. Forks are
//! how concurrent rule and image evaluations get isolated scopes without
//! copying the resource.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use imprimatur_policy::expression;
use serde_json::{Map, Value};

use crate::error::VerificationError;

/// A frozen frame, shared between forks.
#[derive(Debug)]
struct Frozen {
    bindings: Map<String, Value>,
    parent: Option<Arc<Frozen>>,
}

/// A stack of variable scopes over an immutable shared base.
#[derive(Debug)]
pub struct Context {
    frozen: Option<Arc<Frozen>>,
    frames: Vec<Map<String, Value>>,
    snapshot: OnceLock<Value>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An empty context with one writable frame.
    pub fn new() -> Self {
        Self {
            frozen: None,
            frames: vec![Map::new()],
            snapshot: OnceLock::new(),
        }
    }

    /// A context whose base frame holds `resource`.
    pub fn with_resource(resource: Value) -> Self {
        let mut bindings = Map::new();
        bindings.insert("resource".to_owned(), resource);
        Self {
            frozen: Some(Arc::new(Frozen {
                bindings,
                parent: None,
            })),
            frames: vec![Map::new()],
            snapshot: OnceLock::new(),
        }
    }

    /// Bind `name` in the innermost frame.
    ///
    /// A dotted name such as `a.b` binds a nested object, merged over any
    /// visible value of `a`.
    pub fn add_variable(&mut self, name: &str, value: Value) {
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name, None),
        };
        let value = match rest {
            Some(rest) => {
                let mut outer = match self.get(head) {
                    Some(Value::Object(existing)) => Value::Object(existing.clone()),
                    _ => Value::Object(Map::new()),
                };
                set_path(&mut outer, rest, value);
                outer
            }
            None => value,
        };
        self.bind(head.to_owned(), value);
    }

    /// Bind every top-level field of `object` in the innermost frame.
    pub fn add_json_object(&mut self, object: Map<String, Value>) {
        for (name, value) in object {
            self.bind(name, value);
        }
    }

    /// The innermost visible binding of a top-level name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| {
                let mut frozen = self.frozen.as_deref();
                while let Some(frame) = frozen {
                    if let Some(value) = frame.bindings.get(name) {
                        return Some(value);
                    }
                    frozen = frame.parent.as_deref();
                }
                None
            })
    }

    /// Evaluate a JMESPath expression against the visible bindings.
    pub fn query(&self, expression: &str) -> Result<Value, VerificationError> {
        Ok(expression::search(expression, self.snapshot())?)
    }

    /// All visible bindings, inner frames shadowing outer ones.
    pub fn snapshot(&self) -> &Value {
        self.snapshot.get_or_init(|| {
            let mut chain = Vec::new();
            let mut frozen = self.frozen.as_deref();
            while let Some(frame) = frozen {
                chain.push(&frame.bindings);
                frozen = frame.parent.as_deref();
            }

            let mut merged = Map::new();
            for frame in chain.into_iter().rev().chain(self.frames.iter()) {
                for (name, value) in frame {
                    merged.insert(name.clone(), value.clone());
                }
            }
            Value::Object(merged)
        })
    }

    /// Push a frame. Bindings made through the guard disappear when it drops.
    pub fn checkpoint(&mut self) -> Checkpoint<'_> {
        self.frames.push(Map::new());
        self.snapshot = OnceLock::new();
        let depth = self.frames.len();
        Checkpoint {
            context: self,
            depth,
        }
    }

    /// Number of frames, frozen ones included.
    pub fn depth(&self) -> usize {
        let mut depth = self.frames.len();
        let mut frozen = self.frozen.as_deref();
        while let Some(frame) = frozen {
            depth += 1;
            frozen = frame.parent.as_deref();
        }
        depth
    }

    /// An isolated context seeing everything this one sees.
    ///
    /// Later bindings in either context are invisible to the other.
    pub fn fork(&self) -> Self {
        let mut frozen = self.frozen.clone();
        for frame in &self.frames {
            if !frame.is_empty() {
                frozen = Some(Arc::new(Frozen {
                    bindings: frame.clone(),
                    parent: frozen,
                }));
            }
        }
        Self {
            frozen,
            frames: vec![Map::new()],
            snapshot: OnceLock::new(),
        }
    }

    fn bind(&mut self, name: String, value: Value) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name, value);
        }
        self.snapshot = OnceLock::new();
    }

    fn restore(&mut self, depth: usize) {
        self.frames.truncate(depth - 1);
        self.snapshot = OnceLock::new();
    }
}

/// Guard for a checkpointed frame; restores on drop.
#[derive(Debug)]
pub struct Checkpoint<'a> {
    context: &'a mut Context,
    depth: usize,
}

impl Deref for Checkpoint<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.context
    }
}

impl DerefMut for Checkpoint<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.context
    }
}

impl Drop for Checkpoint<'_> {
    fn drop(&mut self) {
        self.context.restore(self.depth);
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };
    match rest {
        Some(rest) => {
            let child = map.entry(head.to_owned()).or_insert(Value::Null);
            set_path(child, rest, value);
        }
        None => {
            map.insert(head.to_owned(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_is_visible() {
        let ctx = Context::with_resource(json!({ "kind": "Pod" }));
        assert_eq!(ctx.query("resource.kind").unwrap(), json!("Pod"));
    }

    #[test]
    fn checkpoint_bindings_vanish_on_drop() {
        let mut ctx = Context::new();
        ctx.add_variable("outer", json!(1));
        {
            let mut scope = ctx.checkpoint();
            scope.add_variable("inner", json!(2));
            scope.add_variable("outer", json!(3));
            assert_eq!(scope.query("inner").unwrap(), json!(2));
            assert_eq!(scope.query("outer").unwrap(), json!(3));
        }
        assert_eq!(ctx.query("inner").unwrap(), Value::Null);
        assert_eq!(ctx.query("outer").unwrap(), json!(1));
    }

    #[test]
    fn checkpoint_restores_on_early_return() {
        fn fails(ctx: &mut Context) -> Result<(), VerificationError> {
            let mut scope = ctx.checkpoint();
            scope.add_variable("leak", json!(true));
            Err(VerificationError::Operational("boom".to_owned()))
        }

        let mut ctx = Context::new();
        assert!(fails(&mut ctx).is_err());
        assert!(ctx.get("leak").is_none());
        assert_eq!(ctx.depth(), 1);
    }

    #[test]
    fn nested_checkpoints() {
        let mut ctx = Context::new();
        let mut a = ctx.checkpoint();
        a.add_variable("a", json!(1));
        {
            let mut b = a.checkpoint();
            b.add_variable("b", json!(2));
            assert_eq!(b.query("[a, b]").unwrap(), json!([1, 2]));
        }
        assert!(a.get("b").is_none());
        assert_eq!(a.get("a"), Some(&json!(1)));
    }

    #[test]
    fn dotted_names_merge_over_outer_object() {
        let mut ctx = Context::new();
        ctx.add_variable("config", json!({ "registry": "ghcr.io" }));
        let mut scope = ctx.checkpoint();
        scope.add_variable("config.team.name", json!("platform"));
        assert_eq!(
            scope.query("config").unwrap(),
            json!({ "registry": "ghcr.io", "team": { "name": "platform" } })
        );
        drop(scope);
        assert_eq!(ctx.query("config").unwrap(), json!({ "registry": "ghcr.io" }));
    }

    #[test]
    fn json_object_binds_top_level_fields() {
        let mut ctx = Context::new();
        let mut scope = ctx.checkpoint();
        scope.add_json_object(json!({ "response": { "ok": true } }).as_object().cloned().unwrap());
        assert_eq!(scope.query("response.ok").unwrap(), json!(true));
    }

    #[test]
    fn forks_are_isolated() {
        let mut base = Context::with_resource(json!({ "kind": "Pod" }));
        base.add_variable("shared", json!("yes"));

        let mut left = base.fork();
        let mut right = base.fork();
        left.add_variable("side", json!("left"));
        right.add_variable("side", json!("right"));

        assert_eq!(left.query("side").unwrap(), json!("left"));
        assert_eq!(right.query("side").unwrap(), json!("right"));
        assert_eq!(left.query("shared").unwrap(), json!("yes"));
        assert_eq!(right.query("resource.kind").unwrap(), json!("Pod"));
        assert!(base.get("side").is_none());
    }

    #[test]
    fn fork_sees_checkpointed_bindings() {
        let mut ctx = Context::new();
        let mut scope = ctx.checkpoint();
        scope.add_variable("images", json!({ "containers": {} }));
        let fork = scope.fork();
        drop(scope);
        assert!(fork.get("images").is_some());
        assert!(ctx.get("images").is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Bindings made after a checkpoint are invisible after it is
            /// restored; bindings made before remain.
            #[test]
            fn checkpoint_law(
                before in prop::collection::btree_map("[a-e]", 0i64..100, 0..5),
                after in prop::collection::btree_map("[c-h]", 100i64..200, 0..5),
            ) {
                let mut ctx = Context::new();
                for (name, value) in &before {
                    ctx.add_variable(name, json!(value));
                }
                {
                    let mut scope = ctx.checkpoint();
                    for (name, value) in &after {
                        scope.add_variable(name, json!(value));
                    }
                    for (name, value) in &after {
                        prop_assert_eq!(scope.get(name), Some(&json!(value)));
                    }
                }
                for (name, value) in &before {
                    prop_assert_eq!(ctx.get(name), Some(&json!(value)));
                }
                for name in after.keys().filter(|n| !before.contains_key(*n)) {
                    prop_assert!(ctx.get(name).is_none());
                }
            }
        }
    }
}
