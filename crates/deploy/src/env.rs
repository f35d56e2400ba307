//! Subprocess environment projection.
//!
//! An [`EnvBag`] is the flat string map handed to the deployment tool. It is built
//! from the scalar fields of a resolved network config, iteration overrides, and a
//! few pipeline-injected keys, then rescoped with [`clear_prefix`].

use std::collections::BTreeMap;

use derive_more::{Deref, DerefMut, From};
use serde::{Deserialize, Serialize};

/// Separator between a scope prefix and the unscoped key (`STONE_WETH__ORACLE`).
pub const SCOPE_SEPARATOR: &str = "__";

/// Ordered string-to-string environment for a single tool invocation.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut, From,
)]
#[serde(transparent)]
pub struct EnvBag(BTreeMap<String, String>);

impl EnvBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Layer `other` on top of `self`; keys from `other` win.
    pub fn merge(mut self, other: &EnvBag) -> Self {
        for (key, value) in other.iter() {
            self.0.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Strip the `<prefix>__` segment from every key that contains it.
///
/// Keys without the segment pass through unchanged. When a stripped key collides
/// with an existing unscoped key the stripped value wins, since the scoped value
/// is the more specific one.
pub fn clear_prefix(env: &EnvBag, prefix: &str) -> EnvBag {
    let needle = format!("{prefix}{SCOPE_SEPARATOR}");
    let (scoped, plain): (Vec<_>, Vec<_>) = env.iter().partition(|(key, _)| key.contains(&needle));

    let mut out: EnvBag = plain
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in scoped {
        let unscoped = key.replacen(&needle, "", 1);
        tracing::trace!(%key, %unscoped, "Cleared env key prefix");
        out.insert(unscoped, value.clone());
    }

    out
}

/// Apply [`clear_prefix`] for each prefix in order.
pub fn clear_prefixes<'a>(env: &EnvBag, prefixes: impl IntoIterator<Item = &'a str>) -> EnvBag {
    prefixes
        .into_iter()
        .fold(env.clone(), |acc, prefix| clear_prefix(&acc, prefix))
}
