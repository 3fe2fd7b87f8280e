//! Ordered, multi-valued header map.
//!
//! Wire fidelity requires that headers go out in a declared order, so the
//! map preserves insertion order, compares names case-insensitively, and
//! supports re-ordering against a preset's header-order list.

/// A multi-valued header map with case-insensitive lookup and stable
/// insertion order.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    // (name-as-inserted, value) pairs in insertion order.
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, preserving any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value. The replacement
    /// keeps the position of the first existing occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let mut value = Some(value.into());
        let mut first = true;
        self.entries.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(name) {
                if first {
                    first = false;
                    *v = value.take().unwrap_or_default();
                    true
                } else {
                    false
                }
            } else {
                true
            }
        });
        if let Some(value) = value {
            self.entries.push((name.to_string(), value));
        }
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate (name, value) pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn into_entries(self) -> Vec<(String, String)> {
        self.entries
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// Merge preset defaults with user headers and apply an order list.
///
/// The result starts with the intersection of `order` and the headers
/// actually present, in `order` order; headers not named by `order` follow
/// in their original insertion order. Preset defaults are added only where
/// the user did not supply the same name; user values win.
///
/// `user_agent` overrides any `user-agent` among the defaults, matching
/// how a preset's UA field is authoritative over its header table.
pub fn merge_ordered(
    defaults: &[(String, String)],
    user_agent: &str,
    user: &HeaderMap,
    order: &[String],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::with_capacity(defaults.len() + user.len());

    for (name, value) in defaults {
        if user.contains(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("user-agent") {
            merged.push((name.clone(), user_agent.to_string()));
        } else {
            merged.push((name.clone(), value.clone()));
        }
    }
    for (name, value) in user.iter() {
        merged.push((name.to_string(), value.to_string()));
    }

    apply_order(merged, order)
}

/// Stable-partition `headers` by an order list: listed names first in list
/// order (all values of a multi-valued name stay adjacent, in insertion
/// order), unlisted names afterwards in insertion order.
pub fn apply_order(headers: Vec<(String, String)>, order: &[String]) -> Vec<(String, String)> {
    if order.is_empty() {
        return headers;
    }
    let mut taken = vec![false; headers.len()];
    let mut out = Vec::with_capacity(headers.len());

    for wanted in order {
        for (i, (name, _)) in headers.iter().enumerate() {
            if !taken[i] && name.eq_ignore_ascii_case(wanted) {
                taken[i] = true;
                out.push(headers[i].clone());
            }
        }
    }
    for (i, entry) in headers.into_iter().enumerate() {
        if !taken[i] {
            out.push(entry);
        }
    }
    out
}
