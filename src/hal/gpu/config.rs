use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Macro definitions specializing a kernel template, ordered by name.
///
/// Equality and hashing depend only on the entries, never on insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KernelConfig(BTreeMap<String, String>);

impl KernelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.insert(name.into(), value.to_string());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.set(name, value);
        self
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[inline]
    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[inline]
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prepends one `#define NAME VALUE` line per entry to `template`.
    pub fn apply_to_template(&self, template: &str) -> String {
        let mut source = String::new();
        for (name, value) in &self.0 {
            source.push_str(&format!("#define {name} {value}\n"));
        }
        source.push_str(template);
        source.push('\n');
        source
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for KernelConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (name, value) in iter {
            config.set(name, value);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::hash::{BuildHasher, RandomState};

    use super::KernelConfig;

    #[test]
    fn test_order_independence() {
        let x = KernelConfig::new()
            .with("BLOCK_SIZE", 256)
            .with("ELEMENT_TYPE", "f32");
        let y: KernelConfig = [("ELEMENT_TYPE", "f32"), ("BLOCK_SIZE", "256")]
            .into_iter()
            .collect();
        assert_eq!(x, y);

        let state = RandomState::new();
        assert_eq!(state.hash_one(&x), state.hash_one(&y));

        let z = y.clone().with("BLOCK_SIZE", 128);
        assert_ne!(x, z);
        assert_eq!(z.len(), 2);
    }

    #[test]
    fn test_apply_to_template() {
        let config = KernelConfig::new().with("B", 2).with("A", 1);
        assert_eq!(
            config.apply_to_template("body"),
            "#define A 1\n#define B 2\nbody\n"
        );
    }
}
