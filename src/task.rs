//! Tasks - the global data processing blocks
//!
//! A task is an immutable, named unit of computation with declared
//! dependencies (other tasks addressed by dotted path), an optional
//! structural [`Specification`] checked before invocation, and optional
//! settings merged under the invocation meta as defaults.
//!
//! Five kinds exist: function tasks (arbitrary closure over the dependency
//! results), data tasks (leaf producers deriving a value from meta alone),
//! and the map/filter/reduce combinators that each wrap exactly one
//! upstream task producing a finite sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::error::TaskmeshError;
use crate::meta::{Meta, Specification};
use crate::workspace::Workspace;

/// Dependency results keyed by the dependency task's name.
pub type DepValues = HashMap<String, Value>;

type TransformFn = dyn Fn(&Meta, &DepValues) -> Result<Value, TaskmeshError> + Send + Sync;
type DataFn = dyn Fn(&Meta) -> Result<Value, TaskmeshError> + Send + Sync;
type ElementFn = dyn Fn(Value) -> Value + Send + Sync;
type PredicateFn = dyn Fn(&Value) -> bool + Send + Sync;
type FoldFn = dyn Fn(Value, Value) -> Value + Send + Sync;
type CheckFn = dyn Fn(&Meta) -> Result<(), String> + Send + Sync;

/// The task's computation, one variant per kind.
#[derive(Clone)]
enum TaskKind {
    Function(Arc<TransformFn>),
    Data(Arc<DataFn>),
    Map(Arc<ElementFn>),
    Filter(Arc<PredicateFn>),
    Reduce(Arc<FoldFn>),
}

impl TaskKind {
    fn label(&self) -> &'static str {
        match self {
            TaskKind::Function(_) => "function",
            TaskKind::Data(_) => "data",
            TaskKind::Map(_) => "map",
            TaskKind::Filter(_) => "filter",
            TaskKind::Reduce(_) => "reduce",
        }
    }
}

/// A named unit of computation. Immutable after construction.
pub struct Task {
    name: String,
    dependencies: Vec<String>,
    specification: Option<Specification>,
    settings: Option<Meta>,
    check: Option<Arc<CheckFn>>,
    kind: TaskKind,
    /// Workspace this task was first registered into, set by the builder.
    home: OnceCell<Weak<Workspace>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Name of the leaf segment of a dotted dependency path.
fn leaf_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

impl Task {
    fn new(name: String, dependencies: Vec<String>, kind: TaskKind) -> Self {
        Self {
            name,
            dependencies,
            specification: None,
            settings: None,
            check: None,
            kind,
            home: OnceCell::new(),
        }
    }

    /// A task invoking an arbitrary closure with the meta and the full
    /// dependency-result mapping.
    pub fn function<F>(
        name: impl Into<String>,
        dependencies: impl Into<Vec<String>>,
        func: F,
    ) -> Self
    where
        F: Fn(&Meta, &DepValues) -> Result<Value, TaskmeshError> + Send + Sync + 'static,
    {
        Self::new(
            name.into(),
            dependencies.into(),
            TaskKind::Function(Arc::new(func)),
        )
    }

    /// A leaf producer: no dependencies, derives a value from meta alone.
    pub fn data<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Meta) -> Result<Value, TaskmeshError> + Send + Sync + 'static,
    {
        Self::new(name.into(), Vec::new(), TaskKind::Data(Arc::new(func)))
    }

    /// Transform each element of the upstream sequence. Named
    /// `map_<dependency>` by default.
    pub fn map<F>(dependency: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let dependency = dependency.into();
        let name = format!("map_{}", leaf_name(&dependency));
        Self::new(name, vec![dependency], TaskKind::Map(Arc::new(func)))
    }

    /// Keep only the upstream elements satisfying the predicate. Named
    /// `filter_<dependency>` by default.
    pub fn filter<F>(dependency: impl Into<String>, keep: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let dependency = dependency.into();
        let name = format!("filter_{}", leaf_name(&dependency));
        Self::new(name, vec![dependency], TaskKind::Filter(Arc::new(keep)))
    }

    /// Fold the upstream sequence left-to-right, seeding the accumulator
    /// with the first element. Named `reduce_<dependency>` by default.
    pub fn reduce<F>(dependency: impl Into<String>, fold: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        let dependency = dependency.into();
        let name = format!("reduce_{}", leaf_name(&dependency));
        Self::new(name, vec![dependency], TaskKind::Reduce(Arc::new(fold)))
    }

    /// Override the default name (builder style).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach the structural specification checked before invocation.
    pub fn with_specification(mut self, spec: Specification) -> Self {
        self.specification = Some(spec);
        self
    }

    /// Attach free-form settings merged under the invocation meta.
    pub fn with_settings(mut self, settings: Meta) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Attach a semantic pre-invocation check beyond structural validation.
    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Meta) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn specification(&self) -> Option<&Specification> {
        self.specification.as_ref()
    }

    pub fn settings(&self) -> Option<&Meta> {
        self.settings.as_ref()
    }

    pub fn kind_label(&self) -> &'static str {
        self.kind.label()
    }

    /// Variant-specific semantic check hook; default is a no-op.
    pub fn check_by_meta(&self, meta: &Meta) -> Result<(), String> {
        match &self.check {
            Some(check) => check(meta),
            None => Ok(()),
        }
    }

    /// Record the workspace this task was registered into. First
    /// registration wins; later calls are ignored.
    pub(crate) fn set_home(&self, workspace: &Arc<Workspace>) {
        let _ = self.home.set(Arc::downgrade(workspace));
    }

    /// The workspace a task resolves against when the caller supplies none.
    pub fn home(&self) -> Option<Arc<Workspace>> {
        self.home.get().and_then(Weak::upgrade)
    }

    /// The meta actually passed to `transform`: invocation meta overlaid on
    /// the task's settings (explicit meta wins).
    pub fn invocation_meta(&self, meta: &Meta) -> Meta {
        match &self.settings {
            Some(settings) => meta.with_defaults(settings),
            None => meta.clone(),
        }
    }

    /// The sequence produced by this task's single upstream dependency.
    /// Only meaningful for the combinator kinds.
    fn upstream_sequence(&self, deps: &DepValues) -> Result<Vec<Value>, TaskmeshError> {
        let dependency = self
            .dependencies
            .first()
            .ok_or_else(|| TaskmeshError::Invocation {
                task: self.name.clone(),
                details: "combinator task has no dependency".into(),
            })?;
        let key = leaf_name(dependency);
        match deps.get(key) {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(TaskmeshError::NotASequence {
                task: self.name.clone(),
                dependency: dependency.clone(),
            }),
        }
    }

    /// Run this task's computation over the supplied dependency results.
    pub fn transform(&self, meta: &Meta, deps: &DepValues) -> Result<Value, TaskmeshError> {
        match &self.kind {
            TaskKind::Function(func) => func(meta, deps),
            TaskKind::Data(func) => func(meta),
            TaskKind::Map(apply) => {
                let items = self.upstream_sequence(deps)?;
                Ok(Value::Array(items.into_iter().map(|v| apply(v)).collect()))
            }
            TaskKind::Filter(keep) => {
                let items = self.upstream_sequence(deps)?;
                Ok(Value::Array(items.into_iter().filter(|v| keep(v)).collect()))
            }
            TaskKind::Reduce(fold) => {
                let items = self.upstream_sequence(deps)?;
                let mut iter = items.into_iter();
                // Accumulator seeds from the first element; a one-element
                // sequence returns it without invoking the fold.
                let first = iter.next().ok_or_else(|| TaskmeshError::EmptySequence {
                    task: self.name.clone(),
                })?;
                Ok(iter.fold(first, |acc, v| fold(acc, v)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deps_with(name: &str, value: Value) -> DepValues {
        let mut deps = DepValues::new();
        deps.insert(name.to_string(), value);
        deps
    }

    #[test]
    fn data_task_ignores_dependencies() {
        let t = Task::data("answer", |_meta| Ok(json!(42)));
        assert_eq!(t.dependencies().len(), 0);
        let v = t.transform(&Meta::new(), &DepValues::new()).unwrap();
        assert_eq!(v, json!(42));
    }

    #[test]
    fn function_task_sees_dependency_results() {
        let t = Task::function("sum", vec!["a".to_string(), "b".to_string()], |_m, deps| {
            let a = deps["a"].as_i64().unwrap();
            let b = deps["b"].as_i64().unwrap();
            Ok(json!(a + b))
        });
        let mut deps = deps_with("a", json!(2));
        deps.insert("b".into(), json!(3));
        assert_eq!(t.transform(&Meta::new(), &deps).unwrap(), json!(5));
    }

    #[test]
    fn map_task_applies_per_element() {
        let t = Task::map("numbers", |v| json!(v.as_i64().unwrap() * v.as_i64().unwrap()));
        assert_eq!(t.name(), "map_numbers");
        let deps = deps_with("numbers", json!([1, 2, 3]));
        assert_eq!(t.transform(&Meta::new(), &deps).unwrap(), json!([1, 4, 9]));
    }

    #[test]
    fn map_task_dependency_by_path_uses_leaf_name() {
        let t = Task::map("sub.numbers", |v| v);
        assert_eq!(t.name(), "map_numbers");
        let deps = deps_with("numbers", json!([1]));
        assert!(t.transform(&Meta::new(), &deps).is_ok());
    }

    #[test]
    fn named_overrides_the_default_combinator_name() {
        let t = Task::map("numbers", |v| v).named("squares");
        assert_eq!(t.name(), "squares");
        // The dependency is untouched by renaming.
        assert_eq!(t.dependencies(), &["numbers".to_string()]);
    }

    #[test]
    fn filter_task_keeps_matching_elements() {
        let t = Task::filter("numbers", |v| v.as_i64().unwrap() % 2 == 0);
        let deps = deps_with("numbers", json!([1, 2, 3, 4]));
        assert_eq!(t.transform(&Meta::new(), &deps).unwrap(), json!([2, 4]));
    }

    #[test]
    fn reduce_task_folds_left_to_right() {
        let t = Task::reduce("numbers", |acc, v| {
            json!(acc.as_i64().unwrap() - v.as_i64().unwrap())
        });
        let deps = deps_with("numbers", json!([10, 3, 2]));
        assert_eq!(t.transform(&Meta::new(), &deps).unwrap(), json!(5));
    }

    #[test]
    fn reduce_empty_sequence_fails() {
        let t = Task::reduce("numbers", |acc, _| acc);
        let deps = deps_with("numbers", json!([]));
        let err = t.transform(&Meta::new(), &deps).unwrap_err();
        assert!(matches!(err, TaskmeshError::EmptySequence { .. }));
    }

    #[test]
    fn reduce_single_element_skips_fold() {
        let t = Task::reduce("numbers", |_, _| panic!("fold must not run"));
        let deps = deps_with("numbers", json!([7]));
        assert_eq!(t.transform(&Meta::new(), &deps).unwrap(), json!(7));
    }

    #[test]
    fn combinator_rejects_non_sequence_upstream() {
        let t = Task::map("numbers", |v| v);
        let deps = deps_with("numbers", json!(1));
        let err = t.transform(&Meta::new(), &deps).unwrap_err();
        assert!(matches!(err, TaskmeshError::NotASequence { .. }));
    }

    #[test]
    fn settings_are_defaults_only() {
        let settings = Meta::from_value(json!({"base": 10, "count": 1})).unwrap();
        let t = Task::data("scaled", |meta| {
            let base = meta.get("base").and_then(|v| v.as_i64()).unwrap();
            let count = meta.get("count").and_then(|v| v.as_i64()).unwrap();
            Ok(json!(base * count))
        })
        .with_settings(settings);

        let meta = Meta::from_value(json!({"count": 5})).unwrap();
        let merged = t.invocation_meta(&meta);
        assert_eq!(t.transform(&merged, &DepValues::new()).unwrap(), json!(50));
    }

    #[test]
    fn check_hook_default_is_noop() {
        let t = Task::data("plain", |_| Ok(json!(null)));
        assert!(t.check_by_meta(&Meta::new()).is_ok());

        let checked = Task::data("checked", |_| Ok(json!(null)))
            .with_check(|meta| match meta.contains("token") {
                true => Ok(()),
                false => Err("token is required".into()),
            });
        assert!(checked.check_by_meta(&Meta::new()).is_err());
    }
}
