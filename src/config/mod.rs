//! The hierarchical configuration store templates render against (spec
//! §3 "RenderContext" / §4.C / §6). Opaque to the render engine beyond the
//! `ConfigStore` trait: the engine never knows this is backed by TOML.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::TemplateFsError;

/// Root namespace every config key is rooted under (spec §4.C `start`).
pub const ROOT_KEY: &str = "system:/config";

/// An opaque key reference. Cheap to clone, since array iteration copies
/// these constantly (spec §3 Section invariant: "copying a parent section
/// to a child duplicates the key reference").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigKey(String);

impl ConfigKey {
    pub fn root() -> Self {
        ConfigKey(ROOT_KEY.to_string())
    }

    /// Build a key from a `sel()` argument. Namespaced/absolute names (those
    /// with a `:` before any `/`) replace outright; anything else is
    /// equivalent to `root().join(name)`, which callers use for "append
    /// mode" (spec §4.C `sel`).
    pub fn from_name(name: &str) -> Self {
        if Self::is_namespaced(name) {
            ConfigKey(name.to_string())
        } else {
            ConfigKey::root().join(name)
        }
    }

    /// True when `name` carries a namespace prefix (a `:` preceding the
    /// first `/`), which spec §4.C calls "replace mode" syntax.
    pub fn is_namespaced(name: &str) -> bool {
        match (name.find(':'), name.find('/')) {
            (Some(colon), Some(slash)) => colon < slash,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn join(&self, segment: &str) -> Self {
        ConfigKey(format!("{}/{}", self.0, segment))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True iff `other` is a direct child of `self` (spec §4.C
    /// `select_next_array_key`: "directly below (no intermediate
    /// segments)").
    pub fn is_direct_child(&self, other: &ConfigKey) -> bool {
        match other.0.strip_prefix(&self.0) {
            Some(rest) => {
                let rest = match rest.strip_prefix('/') {
                    Some(r) => r,
                    None => return false,
                };
                !rest.is_empty() && !rest.contains('/')
            }
            None => false,
        }
    }

    pub fn is_within(&self, base: &ConfigKey) -> bool {
        self.0 == base.0 || self.0.starts_with(&format!("{}/", base.0))
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A materialized configuration value. Spec §4.C `get`: "Binary values of 2
/// or 8 bytes are formatted as decimal short/long respectively; other
/// binary widths are rejected with EINVAL; string values are copied
/// directly."
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    Short(i16),
    Long(i64),
}

impl ConfigValue {
    /// The engine-owned output bytes `get(ctx, out, kind=0)` would produce.
    pub fn materialize(&self) -> Vec<u8> {
        match self {
            ConfigValue::Str(s) => s.as_bytes().to_vec(),
            ConfigValue::Short(v) => v.to_string().into_bytes(),
            ConfigValue::Long(v) => v.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigEntry {
    pub value: Option<ConfigValue>,
    pub is_array: bool,
}

/// The key-set snapshot a render invocation works against (spec §3
/// RenderContext, §4.C "pre-populates the key-set"). Keys are kept sorted
/// in collation order so cursor arithmetic over `keys[]` matches spec
/// §4.C's "advance the cursor" / "stop when the cursor moves past the last
/// direct child" description directly.
#[derive(Debug, Default)]
pub struct KeySet {
    keys: Vec<ConfigKey>,
    entries: BTreeMap<ConfigKey, ConfigEntry>,
}

impl KeySet {
    pub fn insert(&mut self, key: ConfigKey, entry: ConfigEntry) {
        self.entries.insert(key.clone(), entry);
        match self.keys.binary_search(&key) {
            Ok(_) => {}
            Err(pos) => self.keys.insert(pos, key),
        }
    }

    pub fn lookup(&self, key: &ConfigKey) -> Option<&ConfigEntry> {
        self.entries.get(key)
    }

    pub fn position(&self, key: &ConfigKey) -> Option<usize> {
        self.keys.binary_search(key).ok()
    }

    pub fn key_at(&self, index: usize) -> Option<&ConfigKey> {
        self.keys.get(index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The config-store contract the render engine depends on. Spec §6:
/// "Opaque; consumed via hierarchical keys... Array-shaped values are
/// those whose meta-attribute `array` is present."
pub trait ConfigStore {
    /// Build (or refresh) the key-set snapshot for one render invocation.
    /// Spec §4.C: "pre-populates the key-set (empirically required to
    /// avoid spurious lookup errors)".
    fn snapshot(&self) -> KeySet;
}

/// A config store backed by a single TOML document. TOML tables become
/// nested keys; TOML arrays become an `array`-tagged key whose direct
/// children are named `#0`, `#1`, ... in document order (spec §4.C example
/// 5: `.../items/#0`, `.../items/#1`, ...).
#[derive(Debug, Clone)]
pub struct TomlConfigStore {
    document: toml::Value,
}

impl TomlConfigStore {
    pub fn from_str(text: &str) -> Result<Self, toml::de::Error> {
        let document = toml::Value::deserialize(toml::de::Deserializer::new(text))?;
        Ok(TomlConfigStore { document })
    }

    pub fn load(path: &Path) -> Result<Self, TemplateFsError> {
        let text = std::fs::read_to_string(path).map_err(|source| TemplateFsError::ConfigStoreRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&text).map_err(|source| TemplateFsError::ConfigStoreParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn empty() -> Self {
        TomlConfigStore {
            document: toml::Value::Table(Default::default()),
        }
    }

    fn populate(key: ConfigKey, value: &toml::Value, set: &mut KeySet) {
        match value {
            toml::Value::Array(items) => {
                set.insert(
                    key.clone(),
                    ConfigEntry {
                        value: None,
                        is_array: true,
                    },
                );
                for (i, item) in items.iter().enumerate() {
                    let child = key.join(&format!("#{i}"));
                    Self::populate(child, item, set);
                }
            }
            toml::Value::Table(map) => {
                set.insert(key.clone(), ConfigEntry::default());
                for (name, item) in map {
                    let child = key.join(name);
                    Self::populate(child, item, set);
                }
            }
            toml::Value::String(s) => set.insert(
                key,
                ConfigEntry {
                    value: Some(ConfigValue::Str(s.clone())),
                    is_array: false,
                },
            ),
            toml::Value::Integer(i) => {
                let value = if *i >= i16::MIN as i64 && *i <= i16::MAX as i64 {
                    ConfigValue::Short(*i as i16)
                } else {
                    ConfigValue::Long(*i)
                };
                set.insert(
                    key,
                    ConfigEntry {
                        value: Some(value),
                        is_array: false,
                    },
                );
            }
            other => set.insert(
                key,
                ConfigEntry {
                    value: Some(ConfigValue::Str(other.to_string())),
                    is_array: false,
                },
            ),
        }
    }
}

impl ConfigStore for TomlConfigStore {
    fn snapshot(&self) -> KeySet {
        let mut set = KeySet::default();
        Self::populate(ConfigKey::root(), &self.document, &mut set);
        set
    }
}

/// Resolve the config store document path a mount should use: an explicit
/// override, else `<templates-root>/../config.toml` is *not* assumed; the
/// daemon always takes an explicit `--config-store` path and falls back to
/// an empty store when none is given, matching spec §4.C's silence on
/// where the store document physically lives (it's named an "opaque"
/// external collaborator).
pub fn load_or_empty(path: Option<&PathBuf>) -> Result<TomlConfigStore, TemplateFsError> {
    match path {
        Some(p) => TomlConfigStore::load(p),
        None => Ok(TomlConfigStore::empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_tables_become_slash_joined_keys() {
        let store = TomlConfigStore::from_str("[sys]\nname = \"world\"\n").unwrap();
        let snapshot = store.snapshot();
        let key = ConfigKey::from_name("sys/name");
        assert_eq!(
            snapshot.lookup(&key).unwrap().value,
            Some(ConfigValue::Str("world".to_string()))
        );
    }

    #[test]
    fn arrays_become_array_tagged_keys_with_hash_children() {
        let store = TomlConfigStore::from_str("items = [\"a\", \"b\", \"c\"]\n").unwrap();
        let snapshot = store.snapshot();
        let items_key = ConfigKey::from_name("items");
        assert!(snapshot.lookup(&items_key).unwrap().is_array);
        for (i, expected) in ["a", "b", "c"].iter().enumerate() {
            let child = items_key.join(&format!("#{i}"));
            assert_eq!(
                snapshot.lookup(&child).unwrap().value,
                Some(ConfigValue::Str(expected.to_string()))
            );
        }
    }

    #[test]
    fn direct_child_detection_skips_grandchildren() {
        let base = ConfigKey::from_name("items");
        let direct = base.join("#0");
        let grandchild = direct.join("sub");
        assert!(base.is_direct_child(&direct));
        assert!(!base.is_direct_child(&grandchild));
    }

    #[test]
    fn namespaced_names_replace_instead_of_appending() {
        assert!(ConfigKey::is_namespaced("system:/config/sys/name"));
        assert!(!ConfigKey::is_namespaced("sys/name"));
        assert!(!ConfigKey::is_namespaced("name"));
    }
}
