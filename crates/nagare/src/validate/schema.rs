use std::{borrow::Cow, collections::BTreeMap, fmt, sync::Arc};

use regex::Regex;
use url::Url;

use super::{error::ValidationError, value::Value, value::ValueType, xml::XmlElement};

pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type TransformFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Key of a [`Schema::Map`] entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapKey {
    Required(String),
    Optional(String),
    /// Every data key not named by another entry.
    AnyKey,
}

impl From<&str> for MapKey {
    fn from(key: &str) -> Self {
        MapKey::Required(key.to_string())
    }
}

pub fn optional(key: &str) -> MapKey {
    MapKey::Optional(key.to_string())
}

/// One step of a [`Schema::Get`] path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKey {
    Key(String),
    /// Negative indices count from the end.
    Index(i64),
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        PathKey::Key(key.to_string())
    }
}

impl From<i64> for PathKey {
    fn from(index: i64) -> Self {
        PathKey::Index(index)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Key(k) => write!(f, "{k:?}"),
            PathKey::Index(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlPart {
    Scheme,
    Host,
    Path,
    Query,
    Fragment,
}

impl UrlPart {
    fn name(&self) -> &'static str {
        match self {
            UrlPart::Scheme => "scheme",
            UrlPart::Host => "netloc",
            UrlPart::Path => "path",
            UrlPart::Query => "query",
            UrlPart::Fragment => "fragment",
        }
    }

    fn extract(&self, url: &Url) -> Value {
        match self {
            UrlPart::Scheme => Value::from(url.scheme()),
            UrlPart::Host => {
                let host = url.host_str().unwrap_or_default();
                match url.port() {
                    Some(port) => Value::Str(format!("{host}:{port}")),
                    None => Value::from(host),
                }
            }
            UrlPart::Path => Value::from(url.path()),
            UrlPart::Query => Value::from(url.query().unwrap_or_default()),
            UrlPart::Fragment => Value::from(url.fragment().unwrap_or_default()),
        }
    }
}

/// A declarative description of how to check and transform a [`Value`].
#[derive(Clone)]
pub enum Schema {
    /// Accepts anything unchanged.
    Pass,
    Type(ValueType),
    Equals(Value),
    Predicate {
        name: Cow<'static, str>,
        check: PredicateFn,
    },
    /// Extra data keys are only allowed when an `Optional` or `AnyKey` entry
    /// is present.
    Map(Vec<(MapKey, Schema)>),
    /// Positional list schema of fixed length.
    Sequence(Vec<Schema>),
    /// Every list item validated by the same schema.
    Each(Box<Schema>),
    All(Vec<Schema>),
    Any(Vec<Schema>),
    NoneOrAll(Vec<Schema>),
    Get {
        path: Vec<PathKey>,
        default: Value,
        strict: bool,
    },
    UnionGet(Vec<Vec<PathKey>>),
    Union(Vec<(String, Schema)>),
    Transform {
        name: Cow<'static, str>,
        func: TransformFn,
    },
    ParseJson,
    ParseXml,
    ParseQuery,
    Regex {
        pattern: Regex,
        search: bool,
    },
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
    Length {
        min: usize,
        max: Option<usize>,
    },
    Filter(PredicateFn),
    MapEach(TransformFn),
    Url(Vec<(UrlPart, Schema)>),
    XmlFind(String),
    XmlFindText(String),
    XmlFindAll(String),
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Pass => write!(f, "Pass"),
            Schema::Type(t) => write!(f, "Type({t})"),
            Schema::Equals(v) => write!(f, "Equals({v})"),
            Schema::Predicate { name, .. } => write!(f, "Predicate({name})"),
            Schema::Map(entries) => f.debug_list().entries(entries.iter()).finish(),
            Schema::Sequence(s) => f.debug_tuple("Sequence").field(s).finish(),
            Schema::Each(s) => f.debug_tuple("Each").field(s).finish(),
            Schema::All(s) => f.debug_tuple("All").field(s).finish(),
            Schema::Any(s) => f.debug_tuple("Any").field(s).finish(),
            Schema::NoneOrAll(s) => f.debug_tuple("NoneOrAll").field(s).finish(),
            Schema::Get { path, .. } => f.debug_tuple("Get").field(path).finish(),
            Schema::UnionGet(paths) => f.debug_tuple("UnionGet").field(paths).finish(),
            Schema::Union(s) => f.debug_tuple("Union").field(s).finish(),
            Schema::Transform { name, .. } => write!(f, "Transform({name})"),
            Schema::ParseJson => write!(f, "ParseJson"),
            Schema::ParseXml => write!(f, "ParseXml"),
            Schema::ParseQuery => write!(f, "ParseQuery"),
            Schema::Regex { pattern, search } => {
                write!(f, "Regex({:?}, search={search})", pattern.as_str())
            }
            Schema::Contains(v) => write!(f, "Contains({v})"),
            Schema::StartsWith(s) => write!(f, "StartsWith({s:?})"),
            Schema::EndsWith(s) => write!(f, "EndsWith({s:?})"),
            Schema::Length { min, max } => write!(f, "Length({min}, {max:?})"),
            Schema::Filter(_) => write!(f, "Filter"),
            Schema::MapEach(_) => write!(f, "MapEach"),
            Schema::Url(parts) => f.debug_tuple("Url").field(parts).finish(),
            Schema::XmlFind(p) => write!(f, "XmlFind({p:?})"),
            Schema::XmlFindText(p) => write!(f, "XmlFindText({p:?})"),
            Schema::XmlFindAll(p) => write!(f, "XmlFindAll({p:?})"),
        }
    }
}

impl From<ValueType> for Schema {
    fn from(value_type: ValueType) -> Self {
        Schema::Type(value_type)
    }
}

impl Schema {
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<MapKey>,
        I: IntoIterator<Item = (K, Schema)>,
    {
        Schema::Map(entries.into_iter().map(|(k, s)| (k.into(), s)).collect())
    }

    pub fn each(schema: Schema) -> Self {
        Schema::Each(Box::new(schema))
    }

    pub fn all(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Schema::All(schemas.into_iter().collect())
    }

    pub fn any(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Schema::Any(schemas.into_iter().collect())
    }

    pub fn none_or_all(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Schema::NoneOrAll(schemas.into_iter().collect())
    }

    /// `Get` over a single key, yielding `Null` when it is missing.
    pub fn get(key: impl Into<PathKey>) -> Self {
        Self::get_path([key.into()])
    }

    pub fn get_path(path: impl IntoIterator<Item = PathKey>) -> Self {
        Schema::Get {
            path: path.into_iter().collect(),
            default: Value::Null,
            strict: false,
        }
    }

    pub fn predicate<F>(name: impl Into<Cow<'static, str>>, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Schema::Predicate {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn transform<F>(name: impl Into<Cow<'static, str>>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Schema::Transform {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Full-string-prefix match returning the capture groups.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Schema::Regex {
            pattern: Regex::new(pattern)?,
            search: false,
        })
    }

    /// Like [`Schema::pattern`], but the match may start anywhere.
    pub fn search(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Schema::Regex {
            pattern: Regex::new(pattern)?,
            search: true,
        })
    }

    pub fn url(parts: impl IntoIterator<Item = (UrlPart, Schema)>) -> Self {
        Schema::Url(parts.into_iter().collect())
    }

    pub fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        validate(self, value)
    }

    /// Validates with `name` as the first crumb of any failure path.
    pub fn validate_with(&self, value: &Value, name: &str) -> Result<Value, ValidationError> {
        validate(self, value).map_err(|e| e.named(name))
    }
}

fn type_error(expected: impl fmt::Display, value: &Value) -> ValidationError {
    ValidationError::new(
        "Type",
        format!(
            "Type of {value} should be {expected}, but is {}",
            value.value_type()
        ),
    )
}

/// Runs `value` through `schema`. The input is never modified.
pub fn validate(schema: &Schema, value: &Value) -> Result<Value, ValidationError> {
    match schema {
        Schema::Pass => Ok(value.clone()),
        Schema::Type(expected) => {
            if expected.matches(value) {
                Ok(value.clone())
            } else {
                Err(type_error(expected, value))
            }
        }
        Schema::Equals(expected) => {
            if value == expected {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    "Equality",
                    format!("{value} does not equal {expected}"),
                ))
            }
        }
        Schema::Predicate { name, check } => {
            if check(value) {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    "Callable",
                    format!("{name}({value}) is not true"),
                ))
            }
        }
        Schema::Map(entries) => validate_map(entries, value),
        Schema::Sequence(schemas) => {
            let items = value.as_list().ok_or_else(|| type_error("list", value))?;
            if items.len() != schemas.len() {
                return Err(ValidationError::new(
                    "Sequence",
                    format!(
                        "Length of {value} should be {}, but is {}",
                        schemas.len(),
                        items.len()
                    ),
                ));
            }
            schemas
                .iter()
                .zip(items)
                .enumerate()
                .map(|(i, (schema, item))| {
                    validate(schema, item).map_err(|e| {
                        ValidationError::wrap(
                            "Sequence",
                            format!("Unable to validate item {i}"),
                            Some(format!("[{i}]")),
                            e,
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        Schema::Each(schema) => {
            let items = value.as_list().ok_or_else(|| type_error("list", value))?;
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    validate(schema, item).map_err(|e| {
                        ValidationError::wrap(
                            "Each",
                            format!("Unable to validate item {i}"),
                            Some(format!("[{i}]")),
                            e,
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        Schema::All(schemas) => {
            let mut current = value.clone();
            for schema in schemas {
                current = validate(schema, &current)?;
            }
            Ok(current)
        }
        Schema::Any(schemas) => {
            let mut errors = Vec::with_capacity(schemas.len());
            for schema in schemas {
                match validate(schema, value) {
                    Ok(result) => return Ok(result),
                    Err(err) => errors.push(err),
                }
            }
            Err(ValidationError::new("Any", "Unable to validate any of the schemas")
                .with_context(errors))
        }
        Schema::NoneOrAll(schemas) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                validate(&Schema::All(schemas.clone()), value)
            }
        }
        Schema::Get {
            path,
            default,
            strict,
        } => get_path(value, path, default, *strict),
        Schema::UnionGet(paths) => paths
            .iter()
            .map(|path| get_path(value, path, &Value::Null, false))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Schema::Union(entries) => {
            let mut result = BTreeMap::new();
            for (name, schema) in entries {
                let item = validate(schema, value).map_err(|e| {
                    ValidationError::wrap(
                        "Union",
                        format!("Could not validate union entry '{name}'"),
                        Some(name.clone()),
                        e,
                    )
                })?;
                result.insert(name.clone(), item);
            }
            Ok(Value::Map(result))
        }
        Schema::Transform { name, func } => func(value.clone())
            .map_err(|message| ValidationError::new("Transform", format!("{name}: {message}"))),
        Schema::ParseJson => {
            let parsed = match value {
                Value::Str(s) => serde_json::from_str::<serde_json::Value>(s),
                Value::Bytes(b) => serde_json::from_slice::<serde_json::Value>(b),
                other => return Err(type_error("str or bytes", other)),
            };
            parsed
                .map(Value::from)
                .map_err(|e| ValidationError::new("ParseJson", format!("Unable to parse JSON: {e}")))
        }
        Schema::ParseXml => {
            let text = match value {
                Value::Str(s) => Cow::Borrowed(s.as_str()),
                Value::Bytes(b) => String::from_utf8_lossy(b),
                other => return Err(type_error("str or bytes", other)),
            };
            XmlElement::parse(&text)
                .map(Value::from)
                .map_err(|e| ValidationError::new("ParseXml", format!("Unable to parse XML: {e}")))
        }
        Schema::ParseQuery => {
            let query = value.as_str().ok_or_else(|| type_error("str", value))?;
            let query = query.strip_prefix('?').unwrap_or(query);
            Ok(Value::Map(
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), Value::Str(v.into_owned())))
                    .collect(),
            ))
        }
        Schema::Regex { pattern, search } => {
            let text = value.as_str().ok_or_else(|| type_error("str", value))?;
            let captures = pattern
                .captures(text)
                .filter(|c| *search || c.get(0).is_some_and(|m| m.start() == 0))
                .ok_or_else(|| {
                    ValidationError::new(
                        "Regex",
                        format!("Pattern {:?} did not match {value}", pattern.as_str()),
                    )
                })?;

            let mut groups = BTreeMap::new();
            for (i, group) in captures.iter().enumerate() {
                let group = group.map_or(Value::Null, |m| Value::from(m.as_str()));
                groups.insert(i.to_string(), group);
            }
            for name in pattern.capture_names().flatten() {
                let group = captures
                    .name(name)
                    .map_or(Value::Null, |m| Value::from(m.as_str()));
                groups.insert(name.to_string(), group);
            }
            Ok(Value::Map(groups))
        }
        Schema::Contains(needle) => {
            let found = match (value, needle) {
                (Value::Str(s), Value::Str(n)) => s.contains(n.as_str()),
                (Value::List(items), needle) => items.contains(needle),
                (Value::Map(map), Value::Str(key)) => map.contains_key(key),
                _ => false,
            };
            if found {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    "Contains",
                    format!("{value} does not contain {needle}"),
                ))
            }
        }
        Schema::StartsWith(prefix) => {
            let text = value.as_str().ok_or_else(|| type_error("str", value))?;
            if text.starts_with(prefix.as_str()) {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    "StartsWith",
                    format!("{value} does not start with {prefix:?}"),
                ))
            }
        }
        Schema::EndsWith(suffix) => {
            let text = value.as_str().ok_or_else(|| type_error("str", value))?;
            if text.ends_with(suffix.as_str()) {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(
                    "EndsWith",
                    format!("{value} does not end with {suffix:?}"),
                ))
            }
        }
        Schema::Length { min, max } => {
            let len = match value {
                Value::Str(s) => s.chars().count(),
                Value::Bytes(b) => b.len(),
                Value::List(l) => l.len(),
                Value::Map(m) => m.len(),
                other => return Err(type_error("sized value", other)),
            };
            if len < *min {
                return Err(ValidationError::new(
                    "Length",
                    format!("Minimum length is {min}, but value is {len}"),
                ));
            }
            if let Some(max) = max.filter(|max| len > *max) {
                return Err(ValidationError::new(
                    "Length",
                    format!("Maximum length is {max}, but value is {len}"),
                ));
            }
            Ok(value.clone())
        }
        Schema::Filter(check) => match value {
            Value::List(items) => Ok(Value::List(
                items.iter().filter(|item| check(item)).cloned().collect(),
            )),
            Value::Map(map) => Ok(Value::Map(
                map.iter()
                    .filter(|(_, v)| check(v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            other => Err(type_error("list or map", other)),
        },
        Schema::MapEach(func) => {
            let apply = |item: &Value| {
                func(item.clone()).map_err(|message| ValidationError::new("MapEach", message))
            };
            match value {
                Value::List(items) => items
                    .iter()
                    .map(apply)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                Value::Map(map) => map
                    .iter()
                    .map(|(k, v)| apply(v).map(|v| (k.clone(), v)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(Value::Map),
                other => Err(type_error("list or map", other)),
            }
        }
        Schema::Url(parts) => {
            let text = value.as_str().ok_or_else(|| type_error("str", value))?;
            let url = Url::parse(text).map_err(|_| {
                ValidationError::new("Url", format!("{value} is not a valid URL"))
            })?;
            for (part, schema) in parts {
                validate(schema, &part.extract(&url)).map_err(|e| {
                    ValidationError::wrap(
                        "Url",
                        format!("Unable to validate URL attribute '{}'", part.name()),
                        Some(part.name().to_string()),
                        e,
                    )
                })?;
            }
            Ok(value.clone())
        }
        Schema::XmlFind(path) => {
            let element = value
                .as_element()
                .ok_or_else(|| type_error("element", value))?;
            element
                .find(path)
                .map(|found| Value::from(found.clone()))
                .ok_or_else(|| {
                    ValidationError::new(
                        "XmlFind",
                        format!("ElementPath {path:?} did not return an element"),
                    )
                })
        }
        Schema::XmlFindText(path) => {
            let element = value
                .as_element()
                .ok_or_else(|| type_error("element", value))?;
            element.find_text(path).map(Value::from).ok_or_else(|| {
                ValidationError::new(
                    "XmlFindText",
                    format!("ElementPath {path:?} did not return an element"),
                )
            })
        }
        Schema::XmlFindAll(path) => {
            let element = value
                .as_element()
                .ok_or_else(|| type_error("element", value))?;
            Ok(Value::List(
                element
                    .find_all(path)
                    .into_iter()
                    .map(|found| Value::from(found.clone()))
                    .collect(),
            ))
        }
    }
}

fn validate_map(entries: &[(MapKey, Schema)], value: &Value) -> Result<Value, ValidationError> {
    let data = value.as_map().ok_or_else(|| type_error("map", value))?;
    let is_named = |key: &str| {
        entries.iter().any(|(k, _)| match k {
            MapKey::Required(name) | MapKey::Optional(name) => name == key,
            MapKey::AnyKey => false,
        })
    };
    let allows_extra = entries
        .iter()
        .any(|(k, _)| matches!(k, MapKey::Optional(_) | MapKey::AnyKey));

    if !allows_extra {
        if let Some(extra) = data.keys().find(|k| !is_named(k)) {
            return Err(ValidationError::new(
                "Map",
                format!("Unexpected key '{extra}' in {value}"),
            ));
        }
    }

    let validate_entry = |key: &str, schema: &Schema, item: &Value| {
        validate(schema, item).map_err(|e| {
            ValidationError::wrap(
                "Map",
                format!("Unable to validate value of key '{key}'"),
                Some(key.to_string()),
                e,
            )
        })
    };

    let mut result = BTreeMap::new();
    for (key, schema) in entries {
        match key {
            MapKey::Required(name) => {
                let item = data.get(name).ok_or_else(|| {
                    ValidationError::new("Map", format!("Key '{name}' not found in {value}"))
                })?;
                result.insert(name.clone(), validate_entry(name, schema, item)?);
            }
            MapKey::Optional(name) => {
                if let Some(item) = data.get(name) {
                    result.insert(name.clone(), validate_entry(name, schema, item)?);
                }
            }
            MapKey::AnyKey => {
                for (name, item) in data.iter().filter(|(k, _)| !is_named(k)) {
                    result.insert(name.clone(), validate_entry(name, schema, item)?);
                }
            }
        }
    }
    Ok(Value::Map(result))
}

enum Lookup<'a> {
    Found(Cow<'a, Value>),
    Missing,
    Unsupported,
}

fn lookup<'a>(value: &'a Value, key: &PathKey) -> Lookup<'a> {
    match (value, key) {
        (Value::Map(map), PathKey::Key(k)) => map
            .get(k)
            .map_or(Lookup::Missing, |v| Lookup::Found(Cow::Borrowed(v))),
        (Value::Map(map), PathKey::Index(i)) => map
            .get(&i.to_string())
            .map_or(Lookup::Missing, |v| Lookup::Found(Cow::Borrowed(v))),
        (Value::List(items), PathKey::Index(i)) => {
            let index = if *i < 0 { items.len() as i64 + i } else { *i };
            usize::try_from(index)
                .ok()
                .and_then(|index| items.get(index))
                .map_or(Lookup::Missing, |v| Lookup::Found(Cow::Borrowed(v)))
        }
        (Value::Element(element), PathKey::Key(k)) => element
            .attr(k)
            .map_or(Lookup::Missing, |v| Lookup::Found(Cow::Owned(Value::from(v)))),
        _ => Lookup::Unsupported,
    }
}

fn get_path(
    value: &Value,
    path: &[PathKey],
    default: &Value,
    strict: bool,
) -> Result<Value, ValidationError> {
    let mut current = Cow::Borrowed(value);
    for (depth, key) in path.iter().enumerate() {
        let next = match lookup(&current, key) {
            Lookup::Found(next) => next.into_owned(),
            Lookup::Missing if strict => {
                return Err(ValidationError::new(
                    "Get",
                    format!("Item {key} was not found in object {current}"),
                ))
            }
            Lookup::Missing => return Ok(default.clone()),
            Lookup::Unsupported if depth > 0 && current.is_null() && !strict => {
                return Ok(default.clone())
            }
            Lookup::Unsupported => {
                return Err(ValidationError::new(
                    "Get",
                    format!("Could not get key {key} from object {current}"),
                ))
            }
        };
        current = Cow::Owned(next);
    }
    Ok(current.into_owned())
}
