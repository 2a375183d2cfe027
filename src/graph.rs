//! The task graph: node arena, registration protocol and invalidation.
//!
//! Every task lives in a slot of an arena indexed by a stable [`NodeIndex`].
//! Edges point from a dependency to its consumer, so the outgoing edges of a
//! node are exactly the tasks whose caches must be dropped when it changes.
//!
//! ## Evaluation
//!
//! Nothing runs at registration time. Asking a [`TaskHandle`] for its value
//! walks *upward* through the dependencies, computing and memoizing whatever
//! is missing. Redefining a task walks *downward*, clearing the caches of
//! everything that transitively depends on it.
//!
//! ## Redefinition
//!
//! A redefined task keeps its index, and with it its downstream edges. Edges
//! from the dependencies of the *old* definition are not pruned: they can only
//! cause a consumer to be invalidated more often than strictly needed.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Serialize;

use crate::builder::{Pending, TaskBuilder};
use crate::config::Config;
use crate::error::GraphError;
use crate::handle::TaskHandle;
use crate::preset;
use crate::task::{Arg, Input, Inputs, TaskDef, TaskFn, TaskNode, TaskResult};
use crate::value::Value;

/// What currently occupies the pending-operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Register,
    Redefine(NodeIndex),
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOp::Register => write!(f, "a new task"),
            PendingOp::Redefine(index) => write!(f, "a redefinition of task #{}", index.index()),
        }
    }
}

pub(crate) struct GraphInner {
    pub(crate) graph: Graph<TaskNode, ()>,
    pub(crate) pending: Option<PendingOp>,
    pub(crate) config: Config,
}

impl GraphInner {
    pub(crate) fn lookup(&self, index: NodeIndex) -> Result<&TaskNode, GraphError> {
        self.graph
            .node_weight(index)
            .ok_or(GraphError::UnknownNodeId(index.index()))
    }

    pub(crate) fn lookup_mut(&mut self, index: NodeIndex) -> Result<&mut TaskNode, GraphError> {
        self.graph
            .node_weight_mut(index)
            .ok_or(GraphError::UnknownNodeId(index.index()))
    }

    /// Remembers that `consumer` reads from `upstream`.
    pub(crate) fn record_downstream(&mut self, upstream: NodeIndex, consumer: NodeIndex) {
        self.graph.update_edge(upstream, consumer, ());
    }

    fn downstream(&self, index: NodeIndex) -> Vec<usize> {
        let mut downstream: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .map(|index| index.index())
            .collect();
        downstream.sort_unstable();
        downstream
    }

    /// Clears the cache of `start` and of every task reachable downstream.
    /// Returns how many cached values were dropped.
    pub(crate) fn invalidate(&mut self, start: NodeIndex) -> Result<usize, GraphError> {
        self.lookup(start)?;

        let mut cleared = 0;
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(index) = dfs.next(&self.graph) {
            if self.graph[index].clear() {
                cleared += 1;
            }
        }

        Ok(cleared)
    }

    /// Fails if `target` can be reached by walking up the current arguments
    /// of any of `upstream`.
    fn check_cycle(&self, target: NodeIndex, upstream: &[NodeIndex]) -> Result<(), GraphError> {
        let mut seen = HashSet::new();

        for &via in upstream {
            let mut stack = vec![via];
            while let Some(index) = stack.pop() {
                if index == target {
                    return Err(GraphError::CyclicDependency {
                        target: target.index(),
                        via: via.index(),
                    });
                }
                if seen.insert(index) {
                    stack.extend(self.lookup(index)?.task.upstream());
                }
            }
        }

        Ok(())
    }

    fn insert(&mut self, target: Option<NodeIndex>, task: TaskDef) -> Result<NodeIndex, GraphError> {
        let mut upstream: Vec<_> = task.upstream().collect();
        upstream.sort_unstable();
        upstream.dedup();

        let index = match target {
            None => {
                let index = NodeIndex::new(self.graph.node_count());
                let added = self.graph.add_node(TaskNode::new(index, task));
                debug_assert_eq!(index, added);
                index
            }
            Some(target) => {
                if self.config.detect_cycles {
                    self.check_cycle(target, &upstream)?;
                }
                *self.lookup_mut(target)? = TaskNode::new(target, task);
                // values may have been computed since the builder was created
                self.invalidate(target)?;
                target
            }
        };

        for dependency in upstream {
            self.record_downstream(dependency, index);
        }

        Ok(index)
    }
}

/// Snapshot of a single task, as returned by [`TaskGraph::info`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub index: usize,
    pub name: String,
    /// Tasks the current definition reads from.
    pub upstream: Vec<usize>,
    /// Tasks that get invalidated when this one changes.
    pub downstream: Vec<usize>,
    /// The memoized value, if any.
    pub value: Option<Value>,
}

/// A lazy, memoized graph of tasks.
///
/// Tasks are registered with [`register`](Self::register) or
/// [`register_preset`](Self::register_preset), which hand out a
/// [`TaskBuilder`]. The handle returned by [`TaskBuilder::finish`] is used to
/// compute the value, to feed it into other tasks, or to
/// [`redefine`](Self::redefine) the task later.
///
/// `TaskGraph` is a cheap, reference counted handle to shared state; clones
/// refer to the same graph. It is single-threaded by design.
///
/// # Example
///
/// ```rust
/// use taskgraph::{Inputs, TaskGraph};
///
/// let graph = TaskGraph::new();
///
/// let base = graph
///     .register(|inputs: &Inputs| Ok(inputs.int(0)? + 1))?
///     .arg(5)
///     .finish()?;
///
/// let doubled = graph
///     .register(|inputs: &Inputs| Ok(inputs.int(0)? * 2))?
///     .arg(&base)
///     .finish()?;
///
/// assert_eq!(doubled.compute()?.as_int(), Some(12));
///
/// graph
///     .redefine(&base, |inputs: &Inputs| Ok(inputs.int(0)? + 100))?
///     .arg(5)
///     .finish()?;
///
/// assert_eq!(doubled.compute()?.as_int(), Some(210));
/// # Ok::<(), taskgraph::GraphError>(())
/// ```
#[derive(Clone)]
pub struct TaskGraph {
    pub(crate) inner: Rc<RefCell<GraphInner>>,
}

impl TaskGraph {
    /// Creates an empty graph with the default [`Config`].
    pub fn new() -> Self {
        Config::default().finish()
    }

    pub fn config() -> Config {
        Config::new()
    }

    pub(crate) fn with_config(config: Config) -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphInner {
                graph: Graph::new(),
                pending: None,
                config,
            })),
        }
    }

    /// Starts registering a new task computed by `func`.
    ///
    /// Fails with [`GraphError::ProtocolMisuse`] while another builder of this
    /// graph is alive.
    pub fn register<F, R>(&self, func: F) -> Result<TaskBuilder, GraphError>
    where
        F: Fn(&Inputs) -> TaskResult<R> + 'static,
        R: Into<Value>,
    {
        let pending = self.begin(PendingOp::Register)?;
        let name = Cow::Borrowed(short_name(std::any::type_name::<F>()));
        Ok(TaskBuilder::new(pending, None, name, erase(func)))
    }

    /// Starts registering a new task computed by one of the built-in
    /// [`PRESETS`](crate::preset::PRESETS).
    pub fn register_preset(&self, name: &str) -> Result<TaskBuilder, GraphError> {
        let func = preset::resolve(name)?;
        let pending = self.begin(PendingOp::Register)?;
        Ok(TaskBuilder::new(pending, None, name.to_string().into(), func))
    }

    /// Starts replacing the task behind `handle` with a new definition.
    ///
    /// The caches of the task and of everything downstream of it are cleared
    /// right away. The builder reuses the task's index, so existing handles and
    /// dependent tasks see the new definition once it is finished.
    pub fn redefine<F, R>(&self, handle: &TaskHandle, func: F) -> Result<TaskBuilder, GraphError>
    where
        F: Fn(&Inputs) -> TaskResult<R> + 'static,
        R: Into<Value>,
    {
        self.ensure_owned(handle)?;
        let pending = self.begin(PendingOp::Redefine(handle.index))?;
        let name = Cow::Borrowed(short_name(std::any::type_name::<F>()));
        Ok(TaskBuilder::new(pending, Some(handle.index), name, erase(func)))
    }

    /// Like [`redefine`](Self::redefine), using a built-in preset.
    pub fn redefine_preset(
        &self,
        handle: &TaskHandle,
        name: &str,
    ) -> Result<TaskBuilder, GraphError> {
        self.ensure_owned(handle)?;
        let func = preset::resolve(name)?;
        let pending = self.begin(PendingOp::Redefine(handle.index))?;
        Ok(TaskBuilder::new(
            pending,
            Some(handle.index),
            name.to_string().into(),
            func,
        ))
    }

    /// Drops the memoized value of the task and of everything downstream of
    /// it, for tasks that read state from outside the graph. Returns the
    /// number of cleared values.
    pub fn invalidate(&self, handle: &TaskHandle) -> Result<usize, GraphError> {
        self.ensure_owned(handle)?;
        let cleared = self.inner.borrow_mut().invalidate(handle.index)?;
        tracing::debug!(task = handle.index.index(), cleared, "invalidated");
        Ok(cleared)
    }

    /// Returns a snapshot of the task at `index`.
    pub fn info(&self, index: NodeIndex) -> Result<NodeInfo, GraphError> {
        let inner = self.inner.borrow();
        let node = inner.lookup(index)?;

        let mut upstream: Vec<_> = node.task.upstream().map(|index| index.index()).collect();
        upstream.sort_unstable();
        upstream.dedup();

        Ok(NodeInfo {
            index: node.index.index(),
            name: node.task.name.to_string(),
            upstream,
            downstream: inner.downstream(index),
            value: node.cache.clone(),
        })
    }

    /// Snapshots of all tasks, ordered by index.
    pub fn report(&self) -> Result<Vec<NodeInfo>, GraphError> {
        let indices: Vec<_> = self.inner.borrow().graph.node_indices().collect();
        indices.into_iter().map(|index| self.info(index)).collect()
    }

    /// Serializes [`report`](Self::report) to JSON.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(&self.report()?)?)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.inner.borrow().graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_owned(&self, handle: &TaskHandle) -> Result<(), GraphError> {
        if Rc::ptr_eq(&self.inner, &handle.graph.inner) {
            Ok(())
        } else {
            Err(GraphError::ForeignHandle(handle.index.index()))
        }
    }

    /// Claims the pending-operation slot.
    fn begin(&self, op: PendingOp) -> Result<Pending, GraphError> {
        let mut inner = self.inner.borrow_mut();

        if let Some(pending) = inner.pending {
            return Err(GraphError::ProtocolMisuse {
                pending: pending.to_string(),
            });
        }

        if let PendingOp::Redefine(target) = op {
            let cleared = inner.invalidate(target)?;
            tracing::debug!(task = target.index(), cleared, "invalidated for redefinition");
        }

        inner.pending = Some(op);
        drop(inner);

        Ok(Pending::new(self.clone()))
    }

    fn bind(&self, arg: Arg) -> Result<Input, GraphError> {
        match arg {
            Arg::Value(value) => Ok(Input::Value(value)),
            Arg::Task(handle) => {
                self.ensure_owned(&handle)?;
                self.inner.borrow().lookup(handle.index)?;
                Ok(Input::Node(handle.index))
            }
        }
    }

    /// Binds the arguments and stores the definition, in a new slot or in
    /// place of `target`.
    pub(crate) fn attach(
        &self,
        target: Option<NodeIndex>,
        name: Cow<'static, str>,
        func: TaskFn,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> Result<NodeIndex, GraphError> {
        let args = args
            .into_iter()
            .map(|arg| self.bind(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bound = BTreeMap::new();
        for (key, arg) in kwargs {
            bound.insert(key, self.bind(arg)?);
        }

        let task = TaskDef::new(name, func, args, bound);
        let index = self.inner.borrow_mut().insert(target, task)?;

        tracing::debug!(
            task = index.index(),
            redefined = target.is_some(),
            "task registered"
        );

        Ok(index)
    }
}

/// Last path segment of a function's type name. Closures are named after the
/// function they are defined in.
fn short_name(full: &'static str) -> &'static str {
    let mut path = full;
    while let Some(rest) = path.strip_suffix("::{{closure}}") {
        path = rest;
    }

    let head = path.split('<').next().unwrap_or(path);
    match head.rfind("::") {
        Some(at) => &path[at + 2..],
        None => path,
    }
}

fn erase<F, R>(func: F) -> TaskFn
where
    F: Fn(&Inputs) -> TaskResult<R> + 'static,
    R: Into<Value>,
{
    Rc::new(move |inputs: &Inputs| -> TaskResult<Value> { func(inputs).map(Into::into) })
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("TaskGraph")
                .field("tasks", &inner.graph.node_count())
                .field("pending", &inner.pending)
                .finish(),
            Err(_) => f.write_str("TaskGraph(<borrowed>)"),
        }
    }
}

/// Renders the graph as a Mermaid flowchart.
impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        writeln!(f, "graph LR")?;

        for index in inner.graph.node_indices() {
            let node = &inner.graph[index];
            let name = node.task.name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in inner.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use anyhow::bail;

    use super::*;

    /// Wraps `func` so that every call bumps `counter`.
    fn counted(
        counter: &Rc<Cell<usize>>,
        func: impl Fn(&Inputs) -> TaskResult<Value> + 'static,
    ) -> impl Fn(&Inputs) -> TaskResult<Value> + 'static {
        let counter = counter.clone();
        move |inputs: &Inputs| {
            counter.set(counter.get() + 1);
            func(inputs)
        }
    }

    fn add(n: i64) -> impl Fn(&Inputs) -> TaskResult<Value> + 'static {
        move |inputs: &Inputs| Ok(Value::from(inputs.int(0)? + n))
    }

    fn mul(n: i64) -> impl Fn(&Inputs) -> TaskResult<Value> + 'static {
        move |inputs: &Inputs| Ok(Value::from(inputs.int(0)? * n))
    }

    #[test]
    fn test_chain_with_redefinition() {
        let graph = TaskGraph::new();
        let adds = Rc::new(Cell::new(0));
        let doubles = Rc::new(Cell::new(0));
        let hundreds = Rc::new(Cell::new(0));

        let h1 = graph.register(counted(&adds, add(1))).unwrap().arg(5).finish().unwrap();
        assert_eq!(h1.compute().unwrap(), Value::Int(6));

        let h2 = graph.register(counted(&doubles, mul(2))).unwrap().arg(&h1).finish().unwrap();
        assert_eq!(h2.compute().unwrap(), Value::Int(12));
        assert_eq!(adds.get(), 1);
        assert_eq!(doubles.get(), 1);

        let redefined = graph
            .redefine(&h1, counted(&hundreds, add(100)))
            .unwrap()
            .arg(5)
            .finish()
            .unwrap();

        assert_eq!(redefined, h1);
        assert_eq!(h2.compute().unwrap(), Value::Int(210));
        assert_eq!(hundreds.get(), 1);
        assert_eq!(doubles.get(), 2);
        assert_eq!(adds.get(), 1);
    }

    #[test]
    fn test_memoization() {
        let graph = TaskGraph::new();
        let calls = Rc::new(Cell::new(0));
        let handle = graph.register(counted(&calls, add(1))).unwrap().arg(1).finish().unwrap();

        let first = handle.compute().unwrap();
        let second = handle.compute().unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_null_result_is_cached() {
        let graph = TaskGraph::new();
        let calls = Rc::new(Cell::new(0));
        let handle = graph
            .register(counted(&calls, |_| Ok(Value::Null)))
            .unwrap()
            .finish()
            .unwrap();

        assert!(handle.compute().unwrap().is_null());
        assert!(handle.compute().unwrap().is_null());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_downward_invalidation() {
        let graph = TaskGraph::new();
        let (a_calls, b_calls, c_calls) =
            (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));

        let a = graph.register(counted(&a_calls, add(0))).unwrap().arg(1).finish().unwrap();
        let b = graph.register(counted(&b_calls, add(10))).unwrap().arg(&a).finish().unwrap();
        let c = graph.register(counted(&c_calls, add(100))).unwrap().arg(&b).finish().unwrap();

        assert_eq!(c.compute().unwrap(), Value::Int(111));

        graph.redefine(&a, add(1)).unwrap().arg(1).finish().unwrap();

        assert!(!a.is_cached());
        assert!(!b.is_cached());
        assert!(!c.is_cached());

        assert_eq!(c.compute().unwrap(), Value::Int(112));
        assert_eq!(b_calls.get(), 2);
        assert_eq!(c_calls.get(), 2);
        // a was redefined, the counted function is gone
        assert_eq!(a_calls.get(), 1);
    }

    #[test]
    fn test_repeated_redefinition_keeps_downstream() {
        let graph = TaskGraph::new();
        let a = graph.register(add(0)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(mul(3)).unwrap().arg(&a).finish().unwrap();

        assert_eq!(b.compute().unwrap(), Value::Int(3));

        graph.redefine(&a, add(1)).unwrap().arg(1).finish().unwrap();
        assert_eq!(b.compute().unwrap(), Value::Int(6));

        graph.redefine(&a, add(2)).unwrap().arg(1).finish().unwrap();
        assert_eq!(b.compute().unwrap(), Value::Int(9));
    }

    #[test]
    fn test_upstream_failure_skips_consumer() {
        let graph = TaskGraph::new();
        let consumer_calls = Rc::new(Cell::new(0));

        let x = graph
            .register(|_: &Inputs| -> TaskResult<Value> { bail!("sensor offline") })
            .unwrap()
            .name("read_sensor")
            .arg("north")
            .finish()
            .unwrap();
        let y = graph.register(add(0)).unwrap().arg(2).finish().unwrap();

        let d = graph
            .register(counted(&consumer_calls, |inputs| {
                Ok(Value::from(inputs.int(0)? + inputs.int(1)?))
            }))
            .unwrap()
            .arg(&x)
            .arg(&y)
            .finish()
            .unwrap();

        let err = d.compute().unwrap_err();
        let GraphError::Task(failure) = err else {
            panic!("expected a task failure");
        };

        assert_eq!(failure.method_name, "read_sensor");
        assert_eq!(failure.parameters, vec![r#""north""#]);
        assert!(failure.trace.contains("sensor offline"));
        assert_eq!(consumer_calls.get(), 0);
        assert!(!d.is_cached());
    }

    #[test]
    fn test_failure_is_not_cached() {
        let graph = TaskGraph::new();
        let attempts = Rc::new(Cell::new(0));
        let seen = attempts.clone();

        let flaky = graph
            .register(counted(&attempts, move |_| {
                if seen.get() < 2 {
                    bail!("transient failure");
                }
                Ok(Value::from("ok"))
            }))
            .unwrap()
            .name("flaky")
            .finish()
            .unwrap();

        assert!(matches!(flaky.compute(), Err(GraphError::Task(_))));
        assert!(!flaky.is_cached());

        assert_eq!(flaky.compute().unwrap(), Value::from("ok"));
        assert_eq!(attempts.get(), 2);
        assert!(flaky.is_cached());
    }

    #[test]
    fn test_failure_report_fields() {
        let graph = TaskGraph::new();
        let handle = graph
            .register(|inputs: &Inputs| -> TaskResult<Value> {
                let divisor = inputs.int(1)?;
                if divisor == 0 {
                    bail!("attempt to divide by zero");
                }
                Ok(Value::from(inputs.int(0)? / divisor))
            })
            .unwrap()
            .name("divide")
            .arg(1)
            .arg(0)
            .kwarg("mode", "floor")
            .finish()
            .unwrap();

        let GraphError::Task(failure) = handle.compute().unwrap_err() else {
            panic!("expected a task failure");
        };

        assert_eq!(failure.parameters, vec!["1", "0", r#"mode="floor""#]);

        let text = failure.to_string();
        assert!(text.contains("method 'divide'"));
        assert!(text.contains(r#"divide(1, 0, mode="floor")"#));
        assert!(text.contains("attempt to divide by zero"));
    }

    #[test]
    fn test_panic_is_captured() {
        let graph = TaskGraph::new();
        let handle = graph
            .register(|_: &Inputs| -> TaskResult<Value> { panic!("bad state") })
            .unwrap()
            .finish()
            .unwrap();

        let GraphError::Task(failure) = handle.compute().unwrap_err() else {
            panic!("expected a task failure");
        };
        assert!(failure.trace.contains("bad state"));
    }

    #[test]
    fn test_protocol_guard() {
        let graph = TaskGraph::new();

        let pending = graph.register(add(1)).unwrap();
        let err = graph.register(add(2)).unwrap_err();
        assert!(matches!(err, GraphError::ProtocolMisuse { .. }));

        let err = graph.register_preset("to_list").unwrap_err();
        assert!(matches!(err, GraphError::ProtocolMisuse { .. }));

        let first = pending.arg(1).finish().unwrap();
        assert_eq!(first.compute().unwrap(), Value::Int(2));

        // the slot is free again
        let second = graph.register(add(2)).unwrap().arg(1).finish().unwrap();
        assert_eq!(second.compute().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_protocol_guard_on_redefine() {
        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();

        let pending = graph.redefine(&a, add(2)).unwrap();
        let err = graph.redefine(&a, add(3)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot start a new task definition while a redefinition of task #0 is still being built"
        );

        drop(pending);
        assert!(graph.register(add(1)).is_ok());
    }

    #[test]
    fn test_abandoned_builder_releases_slot() {
        let graph = TaskGraph::new();
        drop(graph.register(add(1)).unwrap());

        assert!(graph.register(add(1)).unwrap().finish().is_ok());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_unknown_preset_at_registration() {
        let graph = TaskGraph::new();
        let err = graph.register_preset("to_dict").unwrap_err();

        assert!(matches!(err, GraphError::UnknownPreset(ref name) if name == "to_dict"));
        assert!(graph.is_empty());
        assert!(graph.register(add(1)).is_ok());
    }

    #[test]
    fn test_presets_in_graph() {
        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(add(2)).unwrap().arg(1).finish().unwrap();

        let list = graph
            .register_preset("to_list")
            .unwrap()
            .arg(&a)
            .arg(&b)
            .arg("c")
            .finish()
            .unwrap();
        let item = graph
            .register_preset("get_item")
            .unwrap()
            .arg(&list)
            .arg(-1)
            .finish()
            .unwrap();
        let set = graph
            .register_preset("to_set")
            .unwrap()
            .args([&a, &a, &b])
            .finish()
            .unwrap();

        assert_eq!(list.compute().unwrap().to_string(), r#"[2, 3, "c"]"#);
        assert_eq!(item.compute().unwrap(), Value::from("c"));
        assert_eq!(set.compute().unwrap(), Value::set([Value::Int(3), Value::Int(2)]));
    }

    #[test]
    fn test_kwargs_resolve_handles() {
        let graph = TaskGraph::new();
        let base = graph.register(add(0)).unwrap().arg(7).finish().unwrap();

        let scaled = graph
            .register(|inputs: &Inputs| -> TaskResult<Value> {
                let factor = inputs
                    .kwarg("factor")
                    .and_then(Value::as_int)
                    .unwrap_or(1);
                Ok(Value::from(inputs.int(0)? * factor))
            })
            .unwrap()
            .arg(3)
            .kwarg("factor", &base)
            .finish()
            .unwrap();

        assert_eq!(scaled.compute().unwrap(), Value::Int(21));
        assert_eq!(graph.info(base.index()).unwrap().downstream, vec![1]);
    }

    #[test]
    fn test_cycle_rejected() {
        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(add(1)).unwrap().arg(&a).finish().unwrap();
        let c = graph.register(add(1)).unwrap().arg(&b).finish().unwrap();

        let err = graph.redefine(&a, add(1)).unwrap().arg(&c).finish().unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { target: 0, via: 2 }));

        let err = graph.redefine(&a, add(1)).unwrap().arg(&a).finish().unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { target: 0, via: 0 }));

        // the previous definition is untouched
        assert_eq!(c.compute().unwrap(), Value::Int(4));
    }

    #[test]
    fn test_stale_edge_does_not_count_as_cycle() {
        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(add(1)).unwrap().arg(&a).finish().unwrap();

        // b no longer reads from a, the a -> b edge stays
        graph.redefine(&b, add(1)).unwrap().arg(10).finish().unwrap();
        graph.redefine(&a, add(1)).unwrap().arg(&b).finish().unwrap();

        assert_eq!(a.compute().unwrap(), Value::Int(12));
        assert_eq!(graph.info(a.index()).unwrap().downstream, vec![1]);
        assert_eq!(graph.info(b.index()).unwrap().downstream, vec![0]);
    }

    #[test]
    fn test_foreign_handle() {
        let graph = TaskGraph::new();
        let other = TaskGraph::new();
        let foreign = other.register(add(1)).unwrap().arg(1).finish().unwrap();

        let err = graph.register(add(1)).unwrap().arg(&foreign).finish().unwrap_err();
        assert!(matches!(err, GraphError::ForeignHandle(0)));
        assert!(graph.is_empty());

        assert!(matches!(graph.redefine(&foreign, add(2)), Err(GraphError::ForeignHandle(0))));
        assert!(matches!(graph.invalidate(&foreign), Err(GraphError::ForeignHandle(0))));
    }

    #[test]
    fn test_unknown_node_id() {
        let graph = TaskGraph::new();
        let err = graph.info(NodeIndex::new(3)).unwrap_err();
        assert!(matches!(err, GraphError::UnknownNodeId(3)));
    }

    #[test]
    fn test_manual_invalidate() {
        let graph = TaskGraph::new();
        let calls = Rc::new(Cell::new(0));
        let a = graph.register(counted(&calls, add(1))).unwrap().arg(1).finish().unwrap();
        let b = graph.register(add(1)).unwrap().arg(&a).finish().unwrap();

        b.compute().unwrap();
        assert_eq!(graph.invalidate(&a).unwrap(), 2);
        assert_eq!(graph.invalidate(&a).unwrap(), 0);

        b.compute().unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_diamond_evaluates_shared_dependency_once() {
        let graph = TaskGraph::new();
        let calls = Rc::new(Cell::new(0));
        let root = graph.register(counted(&calls, add(1))).unwrap().arg(1).finish().unwrap();
        let left = graph.register(add(1)).unwrap().arg(&root).finish().unwrap();
        let right = graph.register(mul(2)).unwrap().arg(&root).finish().unwrap();
        let join = graph
            .register_preset("to_tuple")
            .unwrap()
            .arg(&left)
            .arg(&right)
            .finish()
            .unwrap();

        assert_eq!(join.compute().unwrap().to_string(), "(3, 4)");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_report_and_render() {
        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().name("inc").arg(1).finish().unwrap();
        let b = graph.register(mul(2)).unwrap().name("double").arg(&a).finish().unwrap();
        b.compute().unwrap();

        let report = graph.report().unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[1].name, "double");
        assert_eq!(report[1].upstream, vec![0]);
        assert_eq!(report[1].value, Some(Value::Int(4)));

        let json = graph.to_json().unwrap();
        assert!(json.contains(r#""name":"inc""#));
        assert!(json.contains(r#""value":4"#));

        assert_eq!(
            graph.to_string(),
            "graph LR\n    0[\"inc\"]\n    1[\"double\"]\n    0 --> 1\n"
        );
    }

    #[test]
    fn test_panic_unwinds_when_capture_disabled() {
        let graph = TaskGraph::config().catch_panics(false).finish();
        let handle = graph
            .register(|_: &Inputs| -> TaskResult<Value> { panic!("bad state") })
            .unwrap()
            .finish()
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handle.compute()));
        assert!(result.is_err());
        assert!(!handle.is_cached());

        let next = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        assert_eq!(next.compute().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_cycle_accepted_when_detection_disabled() {
        let graph = TaskGraph::config().detect_cycles(false).finish();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(add(1)).unwrap().arg(&a).finish().unwrap();

        let redefined = graph.redefine(&a, add(1)).unwrap().arg(&b).finish().unwrap();
        assert_eq!(redefined, a);

        let a_info = graph.info(a.index()).unwrap();
        assert_eq!(a_info.upstream, vec![1]);
        assert_eq!(a_info.downstream, vec![1]);

        let b_info = graph.info(b.index()).unwrap();
        assert_eq!(b_info.upstream, vec![0]);
        assert_eq!(b_info.downstream, vec![0]);
    }

    #[test]
    fn test_finish_drops_values_computed_during_redefinition() {
        let graph = TaskGraph::new();
        let a = graph.register(add(0)).unwrap().arg(10).finish().unwrap();
        let b = graph.register(mul(2)).unwrap().arg(&a).finish().unwrap();

        let builder = graph.redefine(&a, add(0)).unwrap().arg(30);

        // the old definition is still in place until finish
        assert_eq!(b.compute().unwrap(), Value::Int(20));
        assert!(b.is_cached());

        builder.finish().unwrap();
        assert!(!a.is_cached());
        assert!(!b.is_cached());
        assert_eq!(b.compute().unwrap(), Value::Int(60));
    }

    fn halve(inputs: &Inputs) -> TaskResult<Value> {
        Ok(Value::from(inputs.int(0)? / 2))
    }

    #[test]
    fn test_default_names() {
        assert_eq!(short_name("taskgraph::graph::tests::add::{{closure}}"), "add");
        assert_eq!(short_name("app::load<alloc::string::String>"), "load<alloc::string::String>");
        assert_eq!(short_name("double"), "double");

        let graph = TaskGraph::new();
        let a = graph.register(add(1)).unwrap().arg(1).finish().unwrap();
        let b = graph.register(halve).unwrap().arg(&a).finish().unwrap();

        assert_eq!(graph.info(a.index()).unwrap().name, "add");
        assert_eq!(graph.info(b.index()).unwrap().name, "halve");
        assert_eq!(b.compute().unwrap(), Value::Int(1));
    }
}
