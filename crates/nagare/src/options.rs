use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

/// A value stored in an [`Options`] map.
///
/// `Absent` is the "not set" sentinel: missing keys read as `Absent`, and
/// setting a key to `Absent` keeps the key but marks it unset.
#[derive(Debug, Clone, Default)]
pub enum OptionValue {
    #[default]
    Absent,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl OptionValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, OptionValue::Absent)
    }

    pub fn is_set(&self) -> bool {
        !self.is_absent()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            OptionValue::Int(i) => Some(*i != 0),
            OptionValue::Str(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            OptionValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            OptionValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Float(f) => Some(*f),
            OptionValue::Int(i) => Some(*i as f64),
            OptionValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            OptionValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            OptionValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Interprets the value as a non-negative number of seconds.
    pub fn as_duration(&self) -> Option<Duration> {
        self.as_f64()
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        use OptionValue::*;
        match (self, other) {
            (Absent, Absent) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for OptionValue {}

impl Hash for OptionValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            OptionValue::Absent => {}
            OptionValue::Bool(b) => b.hash(state),
            OptionValue::Int(i) => i.hash(state),
            OptionValue::Float(f) => f.to_bits().hash(state),
            OptionValue::Str(s) => s.hash(state),
            OptionValue::List(l) => l.hash(state),
            OptionValue::Map(m) => m.hash(state),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Absent => write!(f, "None"),
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::Float(v) => write!(f, "{v}"),
            OptionValue::Str(s) => write!(f, "{s}"),
            OptionValue::List(l) => write!(f, "{}", l.join(",")),
            OptionValue::Map(m) => {
                let pairs: Vec<_> = m.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{}", pairs.join(";"))
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for OptionValue {
            fn from(value: $ty) -> Self {
                OptionValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
            }
        })*
    };
}

impl_from_int!(i32, i64, u32, u64, usize);

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        OptionValue::List(value)
    }
}

impl From<Vec<&str>> for OptionValue {
    fn from(value: Vec<&str>) -> Self {
        OptionValue::List(value.into_iter().map(String::from).collect())
    }
}

impl From<BTreeMap<String, String>> for OptionValue {
    fn from(value: BTreeMap<String, String>) -> Self {
        OptionValue::Map(value)
    }
}

impl<T: Into<OptionValue>> From<Option<T>> for OptionValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(OptionValue::Absent, Into::into)
    }
}

pub type OptionGetter = fn(&Options, &str) -> OptionValue;
pub type OptionSetter = fn(&mut Options, &str, OptionValue);

/// Getter and setter overrides bound to an [`Options`] instance.
///
/// Hooks receive the normalized key. They must use [`Options::get_explicit`]
/// and [`Options::set_explicit`], otherwise they recurse into themselves.
pub struct OptionHooks {
    pub getters: &'static [(&'static str, OptionGetter)],
    pub setters: &'static [(&'static str, OptionSetter)],
}

impl OptionHooks {
    pub const NONE: OptionHooks = OptionHooks {
        getters: &[],
        setters: &[],
    };

    fn getter(&self, key: &str) -> Option<OptionGetter> {
        self.getters.iter().find(|(k, _)| *k == key).map(|(_, f)| *f)
    }

    fn setter(&self, key: &str) -> Option<OptionSetter> {
        self.setters.iter().find(|(k, _)| *k == key).map(|(_, f)| *f)
    }
}

impl fmt::Debug for OptionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionHooks")
            .field("getters", &self.getters.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("setters", &self.setters.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

/// `_` and `-` are interchangeable in option keys.
pub fn normalize_key(key: &str) -> String {
    key.replace('_', "-")
}

/// Key/value store with defaults and optional per-key hooks.
#[derive(Debug, Clone)]
pub struct Options {
    defaults: Arc<BTreeMap<String, OptionValue>>,
    options: BTreeMap<String, OptionValue>,
    hooks: &'static OptionHooks,
}

impl Default for Options {
    fn default() -> Self {
        Self::new(Vec::<(String, OptionValue)>::new())
    }
}

impl Options {
    pub fn new<K, V, I>(defaults: I) -> Self
    where
        K: AsRef<str>,
        V: Into<OptionValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::with_hooks(defaults, &OptionHooks::NONE)
    }

    pub fn with_hooks<K, V, I>(defaults: I, hooks: &'static OptionHooks) -> Self
    where
        K: AsRef<str>,
        V: Into<OptionValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        let defaults: BTreeMap<_, _> = defaults
            .into_iter()
            .map(|(k, v)| (normalize_key(k.as_ref()), v.into()))
            .collect();
        Self {
            options: defaults.clone(),
            defaults: Arc::new(defaults),
            hooks,
        }
    }

    pub fn get(&self, key: &str) -> OptionValue {
        let key = normalize_key(key);
        match self.hooks.getter(&key) {
            Some(getter) => getter(self, &key),
            None => self.get_explicit(&key),
        }
    }

    pub fn get_explicit(&self, key: &str) -> OptionValue {
        self.options
            .get(&normalize_key(key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) {
        let key = normalize_key(key);
        match self.hooks.setter(&key) {
            Some(setter) => setter(self, &key, value.into()),
            None => self.set_explicit(&key, value),
        }
    }

    pub fn set_explicit(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.options.insert(normalize_key(key), value.into());
    }

    /// Sets every entry through [`Options::set`], so hooks apply.
    pub fn update<K, V, I>(&mut self, values: I)
    where
        K: AsRef<str>,
        V: Into<OptionValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in values {
            self.set(key.as_ref(), value);
        }
    }

    /// Restores the defaults snapshot taken at construction.
    pub fn clear(&mut self) {
        self.options = (*self.defaults).clone();
    }

    pub fn defaults(&self) -> &BTreeMap<String, OptionValue> {
        &self.defaults
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v))
    }
}
