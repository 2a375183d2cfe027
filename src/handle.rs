use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::graph::TaskGraph;
use crate::task::TaskNode;
use crate::value::Value;

/// A reference to a task in a [`TaskGraph`].
///
/// A `TaskHandle` is a lightweight token that represents the future result of
/// a task. It is returned when a task is registered and can be passed as an
/// argument to other tasks, which is how dependencies are declared. Cloning a
/// handle is cheap, and two handles are equal when they point at the same task
/// of the same graph.
///
/// Redefining a task keeps its index, so every handle issued for it, including
/// the ones captured as arguments by downstream tasks, now refers to the new
/// definition.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) index: NodeIndex,
    pub(crate) graph: TaskGraph,
}

impl TaskHandle {
    pub(crate) fn new(index: NodeIndex, graph: TaskGraph) -> Self {
        Self { index, graph }
    }

    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Computes the value of the task, reusing cached results wherever no
    /// upstream change happened since they were computed.
    pub fn compute(&self) -> Result<Value, GraphError> {
        TaskNode::evaluate(&self.graph, self.index)
    }

    /// Computes the value and prints it to stdout.
    pub fn print(&self) -> Result<(), GraphError> {
        println!("{}", self.compute()?);
        Ok(())
    }

    /// Whether a memoized value is currently available.
    pub fn is_cached(&self) -> bool {
        self.graph
            .inner
            .borrow()
            .lookup(self.index)
            .is_ok_and(TaskNode::is_cached)
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && Rc::ptr_eq(&self.graph.inner, &other.graph.inner)
    }
}

impl Eq for TaskHandle {}

impl Hash for TaskHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskHandle").field(&self.index.index()).finish()
    }
}
