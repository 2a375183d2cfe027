//! Built-in task functions addressable by name.
use std::rc::Rc;

use anyhow::{anyhow, bail, ensure};

use crate::error::GraphError;
use crate::task::{Inputs, TaskFn, TaskResult};
use crate::value::Value;

/// Names accepted by [`TaskGraph::register_preset`](crate::TaskGraph::register_preset).
pub const PRESETS: [&str; 4] = ["to_list", "to_tuple", "to_set", "get_item"];

pub(crate) fn resolve(name: &str) -> Result<TaskFn, GraphError> {
    let func: TaskFn = match name {
        "to_list" => Rc::new(to_list),
        "to_tuple" => Rc::new(to_tuple),
        "to_set" => Rc::new(to_set),
        "get_item" => Rc::new(get_item),
        _ => return Err(GraphError::UnknownPreset(name.to_string())),
    };

    Ok(func)
}

fn no_kwargs(name: &str, inputs: &Inputs) -> TaskResult<()> {
    ensure!(
        inputs.kwargs().is_empty(),
        "{name}() takes no keyword arguments"
    );
    Ok(())
}

fn to_list(inputs: &Inputs) -> TaskResult<Value> {
    no_kwargs("to_list", inputs)?;
    Ok(Value::List(inputs.args().to_vec()))
}

fn to_tuple(inputs: &Inputs) -> TaskResult<Value> {
    no_kwargs("to_tuple", inputs)?;
    Ok(Value::Tuple(inputs.args().to_vec()))
}

fn to_set(inputs: &Inputs) -> TaskResult<Value> {
    no_kwargs("to_set", inputs)?;
    Ok(Value::set(inputs.args().iter().cloned()))
}

/// `get_item(container, key)`: sequences and strings by integer position
/// (negative positions count from the end), maps by string key.
fn get_item(inputs: &Inputs) -> TaskResult<Value> {
    no_kwargs("get_item", inputs)?;
    ensure!(
        inputs.len() == 2,
        "get_item() takes exactly 2 arguments, got {}",
        inputs.len()
    );

    let container = inputs.arg(0)?;
    let key = inputs.arg(1)?;

    match (container, key) {
        (Value::List(items) | Value::Tuple(items), Value::Int(position)) => {
            let at = normalize(*position, items.len())
                .ok_or_else(|| anyhow!("index {position} out of range for length {}", items.len()))?;
            Ok(items[at].clone())
        }
        (Value::Str(text), Value::Int(position)) => {
            let len = text.chars().count();
            normalize(*position, len)
                .and_then(|at| text.chars().nth(at))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| anyhow!("index {position} out of range for length {len}"))
        }
        (Value::Map(map), Value::Str(name)) => map
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("key {name:?} not found")),
        (Value::Set(_), _) => bail!("set does not support indexing"),
        (container, key) => bail!(
            "cannot index {} with {} {}",
            container.kind(),
            key.kind(),
            key.repr()
        ),
    }
}

fn normalize(position: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let at = if position < 0 { len + position } else { position };
    if (0..len).contains(&at) {
        usize::try_from(at).ok()
    } else {
        None
    }
}
