//! Task definitions, their arguments and the per-node memo slot.
use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use anyhow::anyhow;
use petgraph::graph::NodeIndex;

use crate::error::{GraphError, TaskRuntimeError};
use crate::graph::TaskGraph;
use crate::handle::TaskHandle;
use crate::value::Value;

/// Result from a single executed task function.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

/// Type-erased task function as stored in the graph.
pub(crate) type TaskFn = Rc<dyn Fn(&Inputs) -> TaskResult<Value>>;

/// An argument passed to a task when it is registered.
///
/// Either a plain value, or a handle to another task in the same graph. Handle
/// arguments become dependency edges and are replaced by the upstream task's
/// result right before the function runs.
#[derive(Clone, Debug)]
pub enum Arg {
    Value(Value),
    Task(TaskHandle),
}

impl From<TaskHandle> for Arg {
    fn from(handle: TaskHandle) -> Self {
        Arg::Task(handle)
    }
}

impl From<&TaskHandle> for Arg {
    fn from(handle: &TaskHandle) -> Self {
        Arg::Task(handle.clone())
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Arg {
    fn from(value: Vec<T>) -> Self {
        Arg::Value(value.into())
    }
}

impl<T: Into<Value>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        Arg::Value(value.into())
    }
}

macro_rules! impl_arg_from {
    ($($T:ty),* $(,)?) => {
        $(
            impl From<$T> for Arg {
                fn from(value: $T) -> Self {
                    Arg::Value(value.into())
                }
            }
        )*
    };
}

impl_arg_from!(
    (),
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    String,
    &str,
    BTreeMap<String, Value>,
);

/// A bound argument: handles have been checked and reduced to node indices.
#[derive(Clone, Debug)]
pub(crate) enum Input {
    Value(Value),
    Node(NodeIndex),
}

impl Input {
    fn node(&self) -> Option<NodeIndex> {
        match self {
            Input::Node(index) => Some(*index),
            Input::Value(_) => None,
        }
    }

    fn resolve(&self, graph: &TaskGraph) -> Result<Value, GraphError> {
        match self {
            Input::Value(value) => Ok(value.clone()),
            Input::Node(index) => TaskNode::evaluate(graph, *index),
        }
    }
}

/// The resolved arguments a task function is called with.
///
/// Accessors return [`TaskResult`], so a task can use `?` on them and a
/// missing or mistyped argument surfaces as a regular task failure.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl Inputs {
    pub(crate) fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional arguments, in registration order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Keyword arguments, ordered by key.
    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, index: usize) -> TaskResult<&Value> {
        self.args.get(index).ok_or_else(|| {
            anyhow!(
                "missing positional argument #{index}, got {} argument(s)",
                self.args.len()
            )
        })
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn int(&self, index: usize) -> TaskResult<i64> {
        self.typed(index, "int", Value::as_int)
    }

    pub fn float(&self, index: usize) -> TaskResult<f64> {
        self.typed(index, "float", Value::as_float)
    }

    pub fn bool(&self, index: usize) -> TaskResult<bool> {
        self.typed(index, "bool", Value::as_bool)
    }

    pub fn str(&self, index: usize) -> TaskResult<&str> {
        self.typed(index, "str", Value::as_str)
    }

    /// Items of a list, tuple or set argument.
    pub fn list(&self, index: usize) -> TaskResult<&[Value]> {
        self.typed(index, "sequence", Value::as_slice)
    }

    fn typed<'a, T>(
        &'a self,
        index: usize,
        expected: &str,
        convert: impl FnOnce(&'a Value) -> Option<T>,
    ) -> TaskResult<T> {
        let value = self.arg(index)?;
        convert(value).ok_or_else(|| {
            anyhow!(
                "argument #{index} should be {expected}, got {} {}",
                value.kind(),
                value.repr()
            )
        })
    }
}

/// The immutable part of a node: what to call and with which arguments.
pub(crate) struct TaskDef {
    pub(crate) name: Cow<'static, str>,
    func: TaskFn,
    args: Vec<Input>,
    kwargs: BTreeMap<String, Input>,
}

impl TaskDef {
    pub(crate) fn new(
        name: Cow<'static, str>,
        func: TaskFn,
        args: Vec<Input>,
        kwargs: BTreeMap<String, Input>,
    ) -> Self {
        Self {
            name,
            func,
            args,
            kwargs,
        }
    }

    /// Indices of the tasks this definition reads from. May repeat.
    pub(crate) fn upstream(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .filter_map(Input::node)
    }

    /// Upward propagation: evaluates every upstream task and substitutes its
    /// value for the handle. Stops at the first failing dependency.
    pub(crate) fn resolve(&self, graph: &TaskGraph) -> Result<Inputs, GraphError> {
        let args = self
            .args
            .iter()
            .map(|input| input.resolve(graph))
            .collect::<Result<Vec<_>, _>>()?;

        let mut kwargs = BTreeMap::new();
        for (key, input) in &self.kwargs {
            kwargs.insert(key.clone(), input.resolve(graph)?);
        }

        Ok(Inputs::new(args, kwargs))
    }

    /// Calls the task function, turning an error or a panic into a
    /// [`TaskRuntimeError`].
    pub(crate) fn invoke(
        &self,
        inputs: &Inputs,
        catch_panics: bool,
    ) -> Result<Value, TaskRuntimeError> {
        let result = if catch_panics {
            catch_unwind(AssertUnwindSafe(|| (self.func)(inputs)))
                .unwrap_or_else(|panic| Err(panic_to_error(panic)))
        } else {
            (self.func)(inputs)
        };

        result.map_err(|err| TaskRuntimeError::new(&self.name, inputs, format!("{err:?}")))
    }
}

impl fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDef")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}

fn panic_to_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    if let Some(s) = panic.downcast_ref::<&str>() {
        anyhow!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        anyhow!("Task panicked: {s}")
    } else {
        anyhow!("Task panicked with unknown payload")
    }
}

/// One slot of the graph arena.
#[derive(Debug)]
pub(crate) struct TaskNode {
    pub(crate) index: NodeIndex,
    pub(crate) task: Rc<TaskDef>,
    /// `None` until computed, and again after invalidation.
    pub(crate) cache: Option<Value>,
}

impl TaskNode {
    pub(crate) fn new(index: NodeIndex, task: TaskDef) -> Self {
        Self {
            index,
            task: Rc::new(task),
            cache: None,
        }
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Drops the memoized value, returns whether there was one.
    pub(crate) fn clear(&mut self) -> bool {
        self.cache.take().is_some()
    }

    /// Returns the value of the task at `index`, computing it and everything
    /// it depends on if needed.
    ///
    /// No borrow of the graph is held while the task function runs. Failures
    /// are never cached, so the next call runs the function again.
    pub(crate) fn evaluate(graph: &TaskGraph, index: NodeIndex) -> Result<Value, GraphError> {
        let (task, catch_panics) = {
            let inner = graph.inner.borrow();
            let node = inner.lookup(index)?;

            if let Some(value) = &node.cache {
                tracing::trace!(task = index.index(), name = %node.task.name, "cache hit");
                return Ok(value.clone());
            }

            (node.task.clone(), inner.config.catch_panics)
        };

        let span = tracing::debug_span!("task", index = index.index(), name = %task.name);
        let _enter = span.enter();

        let inputs = task.resolve(graph)?;
        let value = task.invoke(&inputs, catch_panics).inspect_err(|err| {
            tracing::warn!(method = %err.method_name, "task failed");
        })?;

        let mut inner = graph.inner.borrow_mut();
        let node = inner.lookup_mut(index)?;

        // the slot may have been redefined by the task itself
        if Rc::ptr_eq(&node.task, &task) {
            node.cache = Some(value.clone());
        }

        Ok(value)
    }
}
