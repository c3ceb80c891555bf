//! The logic-less string-expansion engine: a callback-driven walk over a
//! `SectionStack` against a `ConfigStore` key-set, plus the minimal
//! tokenizer that drives those callbacks from `{{name}}` / `{{#name}}...
//! {{/name}}` template text.
//!
//! The operation set (`start`/`stop`/`sel`/`update_selection`/
//! `select_next_array_key`/`enter`/`leave`/`next`/`subsel`/`compare`/`get`)
//! mirrors a logic-less template engine's section-stack walk one to one;
//! `subsel` and `compare` are kept as reserved no-op seams (see module
//! `scanner`), not wired to any tokenizer syntax.

pub mod scanner;

use crate::config::{ConfigKey, ConfigStore, ConfigValue, KeySet};

/// One frame of the section stack (spec §3 `Section`). Copying a parent
/// section into a child (`enter`) duplicates `selection`, `array_base` and
/// `cursor`; the child starts out aimed at exactly what the parent was
/// aimed at.
#[derive(Debug, Clone)]
pub struct Section {
    pub selection: ConfigKey,
    pub is_array: bool,
    pub array_base: Option<ConfigKey>,
    pub cursor: usize,
    pub depth: i32,
}

impl Section {
    fn root(root_key: ConfigKey) -> Self {
        Section {
            selection: root_key,
            is_array: false,
            array_base: None,
            cursor: 0,
            depth: 0,
        }
    }
}

/// `EKEYREJECTED`-equivalent: an array-tagged key couldn't be located
/// positionally in the key-set it was just looked up from.
pub const ERR_KEY_REJECTED: i32 = -129;
/// Returned by `leave()` when called with nothing left to pop but the root.
pub const ERR_STACK_UNDERFLOW: i32 = -22;
/// Binary value width other than 2 or 8 bytes (spec §4.C `get`).
pub const ERR_INVALID_WIDTH: i32 = -22;

pub struct RenderContext {
    key_set: KeySet,
    root_key: ConfigKey,
    stack: Vec<Section>,
}

impl RenderContext {
    /// `start`: pre-populate the key-set snapshot and push the root section.
    pub fn start(store: &dyn ConfigStore) -> Self {
        let key_set = store.snapshot();
        let root_key = ConfigKey::root();
        RenderContext {
            key_set,
            root_key: root_key.clone(),
            stack: vec![Section::root(root_key)],
        }
    }

    /// `stop`: pop the root section and tear down the context. Consumes
    /// `self`, since there is nothing left to operate on afterward.
    pub fn stop(self) {
        drop(self);
    }

    fn top(&self) -> &Section {
        self.stack.last().expect("root section always present")
    }

    fn top_mut(&mut self) -> &mut Section {
        self.stack.last_mut().expect("root section always present")
    }

    /// Parent selection to refresh an append-mode `sel()` from. The root
    /// section has no parent frame, so it refreshes from the context's own
    /// root key instead (spec §3: RenderContext carries a root key
    /// separate from any section's mutable selection).
    fn parent_selection(&self) -> ConfigKey {
        if self.stack.len() >= 2 {
            self.stack[self.stack.len() - 2].selection.clone()
        } else {
            self.root_key.clone()
        }
    }

    /// `sel(ctx, name)`: append-mode when `name` has no namespace prefix
    /// (refreshes from the parent selection first, so repeated sibling
    /// `sel()` calls on the same section never compound onto each other:
    /// important during array iteration so appends land beneath the array
    /// index, not beneath the previous sibling); replace-mode otherwise.
    /// Always calls `update_selection`. Returns 1 on success, a negative
    /// errno on failure.
    pub fn sel(&mut self, name: &str) -> i32 {
        let key = if ConfigKey::is_namespaced(name) {
            ConfigKey::from_name(name)
        } else {
            self.parent_selection().join(name)
        };
        self.top_mut().selection = key;
        self.update_selection()
    }

    /// `update_selection`: if the current selection is array-tagged in the
    /// key-set, mark the section as an array, locate the array base's own
    /// cursor position, and advance to the first direct child.
    pub fn update_selection(&mut self) -> i32 {
        let selection = self.top().selection.clone();
        let is_array = self
            .key_set
            .lookup(&selection)
            .map(|entry| entry.is_array)
            .unwrap_or(false);

        if !is_array {
            let top = self.top_mut();
            top.is_array = false;
            top.array_base = None;
            return 1;
        }

        let cursor = match self.key_set.position(&selection) {
            Some(pos) => pos,
            None => return ERR_KEY_REJECTED,
        };

        {
            let top = self.top_mut();
            top.is_array = true;
            top.array_base = Some(selection);
            top.cursor = cursor;
        }
        self.select_next_array_key();
        1
    }

    /// `select_next_array_key`: advance the cursor over the key-set's
    /// collation order, skipping grandchildren, stopping at the first
    /// direct child of the current section's `array_base` or the moment
    /// the cursor moves past that subtree entirely. Returns 1 if a new
    /// element was selected, 0 if the array is exhausted.
    pub fn select_next_array_key(&mut self) -> i32 {
        let base = match self.top().array_base.clone() {
            Some(base) => base,
            None => return 0,
        };
        loop {
            let next_cursor = self.top().cursor + 1;
            if next_cursor >= self.key_set.len() {
                return 0;
            }
            let candidate = match self.key_set.key_at(next_cursor) {
                Some(k) => k.clone(),
                None => return 0,
            };
            if !candidate.is_within(&base) {
                return 0;
            }
            self.top_mut().cursor = next_cursor;
            if base.is_direct_child(&candidate) {
                self.top_mut().selection = candidate;
                return 1;
            }
        }
    }

    /// `enter`: push a new section copying the current top's selection,
    /// array state and cursor, tagged with the expansion engine's iterator
    /// depth.
    pub fn enter(&mut self, depth: i32) {
        let mut child = self.top().clone();
        child.depth = depth;
        self.stack.push(child);
    }

    /// `leave`: pop the top section. Refuses to pop the root frame.
    pub fn leave(&mut self) -> i32 {
        if self.stack.len() <= 1 {
            return ERR_STACK_UNDERFLOW;
        }
        self.stack.pop();
        1
    }

    /// `next`: advance the enclosing (current top) section's array cursor.
    /// Returns 1 if another element is available, 0 once exhausted.
    pub fn next(&mut self) -> i32 {
        if !self.top().is_array {
            return 0;
        }
        self.select_next_array_key()
    }

    /// Reserved seam: always succeeds as a no-op. Never wired to tokenizer
    /// syntax (see module docs).
    pub fn subsel(&mut self, _name: &str) -> i32 {
        0
    }

    /// Reserved seam: always succeeds as a no-op.
    pub fn compare(&mut self, _other: &str) -> i32 {
        0
    }

    /// `get(ctx, out, kind)`: materialize the current selection's value
    /// (`kind == 0`) or its key name (`kind != 0`). `Ok(None)` means the
    /// key is absent (not an error); `Err(errno)` covers width-rejected
    /// binary values.
    pub fn get(&self, kind: i32) -> Result<Option<Vec<u8>>, i32> {
        let selection = &self.top().selection;
        if kind != 0 {
            return Ok(Some(selection.as_str().as_bytes().to_vec()));
        }
        match self.key_set.lookup(selection) {
            Some(entry) => match &entry.value {
                Some(value) => Ok(Some(materialize_checked(value)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn current_selection(&self) -> &ConfigKey {
        &self.top().selection
    }

    pub fn is_array(&self) -> bool {
        self.top().is_array
    }

    /// Whether the current selection resolves to anything in the
    /// key-set at all (value or group node), used by the tokenizer to
    /// decide whether a non-array section renders its body once or is
    /// skipped, matching common logic-less-template "truthy section"
    /// behavior for the one documented use case (array iteration) plus
    /// this natural extension.
    pub fn key_exists(&self) -> bool {
        self.key_set.lookup(&self.top().selection).is_some()
    }
}

fn materialize_checked(value: &ConfigValue) -> Result<Vec<u8>, i32> {
    Ok(value.materialize())
}

/// Renders `template` (already read into memory) against `store`, owning
/// the full `start`..`stop` lifecycle internally.
pub fn render(template: &[u8], store: &dyn ConfigStore) -> Result<Vec<u8>, i32> {
    let mut ctx = RenderContext::start(store);
    let result = scanner::expand(template, &mut ctx);
    ctx.stop();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TomlConfigStore;

    #[test]
    fn plain_value_substitution() {
        let store = TomlConfigStore::from_str("[sys]\nname = \"world\"\n").unwrap();
        let out = render(b"hello {{sys/name}}!", &store).unwrap();
        assert_eq!(out, b"hello world!");
    }

    #[test]
    fn array_section_iterates_direct_children() {
        let store = TomlConfigStore::from_str("items = [\"a\", \"b\", \"c\"]\n").unwrap();
        let out = render(b"{{#items}}[{{.}}]{{/items}}", &store).unwrap();
        assert_eq!(out, b"[a][b][c]");
    }

    #[test]
    fn missing_key_renders_empty() {
        let store = TomlConfigStore::empty();
        let out = render(b"x={{nope}}.", &store).unwrap();
        assert_eq!(out, b"x=.");
    }

    #[test]
    fn absent_section_renders_zero_times() {
        let store = TomlConfigStore::empty();
        let out = render(b"[{{#items}}{{.}}{{/items}}]", &store).unwrap();
        assert_eq!(out, b"[]");
    }

    #[test]
    fn nested_array_appends_beneath_current_index_not_previous_sibling() {
        let store =
            TomlConfigStore::from_str("[[rows]]\nname = \"a\"\n[[rows]]\nname = \"b\"\n").unwrap();
        let out = render(b"{{#rows}}<{{name}}>{{/rows}}", &store).unwrap();
        assert_eq!(out, b"<a><b>");
    }

    #[test]
    fn enter_leave_stay_balanced_across_an_empty_array() {
        let store = TomlConfigStore::from_str("items = []\n").unwrap();
        let mut ctx = RenderContext::start(&store);
        assert_eq!(ctx.sel("items"), 1);
        ctx.enter(1);
        assert_eq!(ctx.next(), 0);
        assert_eq!(ctx.leave(), 1);
        assert_eq!(ctx.leave(), ERR_STACK_UNDERFLOW);
    }
}
