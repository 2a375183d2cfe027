use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::task::Inputs;

/// Call signatures longer than this are broken one parameter per line.
const MAX_CALL_WIDTH: usize = 79;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("'{0}' is not a preset task method")]
    UnknownPreset(String),

    #[error("Task #{0} does not exist in this graph")]
    UnknownNodeId(usize),

    #[error("Cannot start a new task definition while {pending} is still being built")]
    ProtocolMisuse { pending: String },

    #[error("Handle to task #{0} belongs to a different graph")]
    ForeignHandle(usize),

    #[error("Redefining task #{target} would make it depend on itself through task #{via}")]
    CyclicDependency { target: usize, via: usize },

    #[error(transparent)]
    Task(#[from] TaskRuntimeError),
}

/// Failure raised by a task function during evaluation.
///
/// Carries the name of the failing method, the already resolved arguments it
/// was called with and the diagnostic text of the underlying error. The graph
/// never stores it: it travels back to whoever asked for the value.
#[derive(Debug, Clone, Error)]
pub struct TaskRuntimeError {
    pub method_name: String,
    pub parameters: Vec<String>,
    pub trace: String,
}

impl TaskRuntimeError {
    pub(crate) fn new(method_name: &Cow<'static, str>, inputs: &Inputs, trace: String) -> Self {
        let parameters = inputs
            .args()
            .iter()
            .map(|value| value.repr())
            .chain(
                inputs
                    .kwargs()
                    .iter()
                    .map(|(key, value)| format!("{key}={}", value.repr())),
            )
            .collect();

        Self {
            method_name: method_name.to_string(),
            parameters,
            trace,
        }
    }

    /// The failing call rendered as a signature, wrapped when it gets too long.
    fn call(&self) -> String {
        let call = format!("{}({})", self.method_name, self.parameters.join(", "));

        if call.chars().count() <= MAX_CALL_WIDTH {
            return call;
        }

        format!(
            "{}(\n    {}\n)",
            self.method_name,
            self.parameters.join(",\n    ")
        )
    }
}

impl fmt::Display for TaskRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let call = self.call();
        let trace = self.trace.trim_end();

        let width = call
            .lines()
            .chain(trace.lines())
            .map(|line| line.chars().count())
            .max()
            .unwrap_or(0);

        writeln!(
            f,
            "An error was raised when trying to do the task with method '{}'",
            self.method_name
        )?;
        writeln!(f, "{}", "=".repeat(width))?;
        writeln!(f, "{call}")?;
        writeln!(f, "{}", "-".repeat(width))?;
        writeln!(f, "{trace}")?;
        write!(f, "{}", "=".repeat(width))
    }
}
