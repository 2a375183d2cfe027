use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::handle::TaskHandle;
use crate::task::{Arg, TaskFn};

/// Occupies the graph's single pending-operation slot for as long as it lives.
pub(crate) struct Pending {
    graph: TaskGraph,
}

impl Pending {
    /// The caller must have claimed the slot already.
    pub(crate) fn new(graph: TaskGraph) -> Self {
        Self { graph }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.graph.inner.try_borrow_mut() {
            inner.pending = None;
        }
    }
}

/// An in-progress task definition.
///
/// Returned by [`TaskGraph::register`] and [`TaskGraph::redefine`] (and their
/// preset variants). Arguments are collected with [`arg`](Self::arg) and
/// [`kwarg`](Self::kwarg), and [`finish`](Self::finish) puts the task into the
/// graph. Only one builder can exist per graph at a time; dropping it without
/// calling `finish` abandons the definition.
pub struct TaskBuilder {
    pending: Pending,
    target: Option<NodeIndex>,
    name: Cow<'static, str>,
    func: TaskFn,
    args: Vec<Arg>,
    kwargs: BTreeMap<String, Arg>,
}

impl TaskBuilder {
    pub(crate) fn new(
        pending: Pending,
        target: Option<NodeIndex>,
        name: Cow<'static, str>,
        func: TaskFn,
    ) -> Self {
        Self {
            pending,
            target,
            name,
            func,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Display name used in failure reports and graph renderings. Defaults to
    /// the type name of the function, or the preset name.
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends a positional argument. Passing a [`TaskHandle`] declares a
    /// dependency on that task.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets a keyword argument, replacing an earlier one with the same key.
    pub fn kwarg(mut self, key: impl Into<String>, arg: impl Into<Arg>) -> Self {
        self.kwargs.insert(key.into(), arg.into());
        self
    }

    /// Adds the task to the graph, or replaces the redefined one in place, and
    /// returns its handle.
    pub fn finish(self) -> Result<TaskHandle, GraphError> {
        let TaskBuilder {
            pending,
            target,
            name,
            func,
            args,
            kwargs,
        } = self;

        let graph = pending.graph.clone();
        let result = graph.attach(target, name, func, args, kwargs);

        // release the slot even when attaching failed
        drop(pending);

        result.map(|index| TaskHandle::new(index, graph))
    }
}

impl fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("target", &self.target.map(|index| index.index()))
            .field("name", &self.name)
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish_non_exhaustive()
    }
}
