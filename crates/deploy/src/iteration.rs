//! Expansion of one logical deployment step into concrete executions.

use crate::{EnvBag, config::FieldValue, config::NetworkSection};

/// Env key carrying the zero-based position of an iteration.
pub const INDEX: &str = "INDEX";

/// One concrete execution of a script.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Iteration {
    /// Overrides layered on top of the network's base environment.
    pub overrides: EnvBag,
    /// Position inside an iterator field, if any.
    pub index: Option<usize>,
}

impl Iteration {
    /// The overrides plus `INDEX` when this iteration has one.
    pub fn env(&self) -> EnvBag {
        match self.index {
            Some(index) => self.overrides.clone().with(INDEX, index.to_string()),
            None => self.overrides.clone(),
        }
    }
}

/// Expand `script` on a network into its iterations.
///
/// The field consulted is `iterator` when given, the script name otherwise:
/// - `Many(list)`: one iteration per element, indexed from zero,
/// - `Skip`: no iteration, the step is disabled on this network,
/// - `Single` or absent: a single iteration without overrides or index.
pub fn expand(section: &NetworkSection, script: &str, iterator: Option<&str>) -> Vec<Iteration> {
    let key = iterator.unwrap_or(script);

    match section.get(key) {
        Some(FieldValue::Many(items)) => items
            .iter()
            .enumerate()
            .map(|(index, overrides)| Iteration {
                overrides: overrides.clone(),
                index: Some(index),
            })
            .collect(),
        Some(FieldValue::Skip) => Vec::new(),
        Some(FieldValue::Single(_)) | None => {
            if iterator.is_some() {
                tracing::debug!(key, "Iterator field is not a list, running once");
            }
            vec![Iteration::default()]
        }
    }
}
