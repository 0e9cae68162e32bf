use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::Arc,
};

use thiserror::Error;

use crate::options::OptionValue;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("{name} is not a valid argument for this plugin")]
    UnknownArgument { name: String },

    #[error("Cycle detected in plugin argument config: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Invalid value for argument {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArgumentAction {
    #[default]
    Store,
    StoreConst,
    StoreTrue,
    StoreFalse,
    Append,
    Count,
}

impl ArgumentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgumentAction::Store => "store",
            ArgumentAction::StoreConst => "store_const",
            ArgumentAction::StoreTrue => "store_true",
            ArgumentAction::StoreFalse => "store_false",
            ArgumentAction::Append => "append",
            ArgumentAction::Count => "count",
        }
    }

    fn is_boolean(&self) -> bool {
        matches!(self, ArgumentAction::StoreTrue | ArgumentAction::StoreFalse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nargs {
    Exact(usize),
    /// `?`
    Optional,
    /// `*`
    ZeroOrMore,
    /// `+`
    OneOrMore,
}

impl fmt::Display for Nargs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Nargs::Exact(n) => write!(f, "{n}"),
            Nargs::Optional => write!(f, "?"),
            Nargs::ZeroOrMore => write!(f, "*"),
            Nargs::OneOrMore => write!(f, "+"),
        }
    }
}

/// Conversion applied to a raw command-line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentType {
    Str,
    Int,
    Float,
    Bool,
    /// `a,b,c` into a list
    CommaList,
    /// `k=v;k=v` into a map
    KeyValue,
}

impl ArgumentType {
    pub fn name(&self) -> &'static str {
        match self {
            ArgumentType::Str => "str",
            ArgumentType::Int => "int",
            ArgumentType::Float => "float",
            ArgumentType::Bool => "bool",
            ArgumentType::CommaList => "comma_list",
            ArgumentType::KeyValue => "keyvalue",
        }
    }

    pub fn parse(&self, raw: &str) -> Result<OptionValue, String> {
        match self {
            ArgumentType::Str => Ok(OptionValue::Str(raw.to_string())),
            ArgumentType::Int => raw
                .trim()
                .parse::<i64>()
                .map(OptionValue::Int)
                .map_err(|e| e.to_string()),
            ArgumentType::Float => raw
                .trim()
                .parse::<f64>()
                .map(OptionValue::Float)
                .map_err(|e| e.to_string()),
            ArgumentType::Bool => OptionValue::from(raw)
                .as_bool()
                .map(OptionValue::Bool)
                .ok_or_else(|| format!("'{raw}' is not a boolean")),
            ArgumentType::CommaList => Ok(OptionValue::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            )),
            ArgumentType::KeyValue => parse_key_values(raw).map(OptionValue::Map),
        }
    }
}

/// Parses `k=v;k=v` pairs.
pub fn parse_key_values(raw: &str) -> Result<BTreeMap<String, String>, String> {
    raw.split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| format!("'{pair}' is not in key=value format"))
        })
        .collect()
}

fn normalize_name(name: &str) -> String {
    name.trim_start_matches('-').replace('_', "-").to_lowercase()
}

fn normalize_dest(name: &str) -> String {
    name.replace('-', "_")
}

/// An immutable plugin argument definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Argument {
    name: String,
    action: ArgumentAction,
    nargs: Option<Nargs>,
    r#const: OptionValue,
    default: OptionValue,
    value_type: Option<ArgumentType>,
    choices: Option<Arc<[String]>>,
    required: bool,
    help: Option<String>,
    metavar: Option<Arc<[String]>>,
    dest: Option<String>,
    requires: Arc<[String]>,
    prompt: Option<String>,
    sensitive: bool,
    argument_name: Option<String>,
}

impl Argument {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: &str) -> ArgumentBuilder {
        ArgumentBuilder {
            name: normalize_name(name),
            action: ArgumentAction::Store,
            nargs: None,
            r#const: OptionValue::Absent,
            default: OptionValue::Absent,
            value_type: None,
            choices: None,
            required: false,
            help: None,
            metavar: None,
            dest: None,
            requires: Vec::new(),
            prompt: None,
            sensitive: false,
            argument_name: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> ArgumentAction {
        self.action
    }

    pub fn nargs(&self) -> Option<Nargs> {
        self.nargs
    }

    pub fn const_value(&self) -> &OptionValue {
        &self.r#const
    }

    pub fn default(&self) -> &OptionValue {
        &self.default
    }

    pub fn value_type(&self) -> Option<ArgumentType> {
        self.value_type
    }

    pub fn choices(&self) -> Option<&[String]> {
        self.choices.as_deref()
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    pub fn metavar(&self) -> Option<&[String]> {
        self.metavar.as_deref()
    }

    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn sensitive(&self) -> bool {
        self.sensitive
    }

    fn full_name(&self, plugin: &str) -> String {
        match &self.argument_name {
            Some(name) => name.clone(),
            None => normalize_name(&format!("{plugin}-{}", self.name)),
        }
    }

    /// Command-line flag of this argument, `--{plugin}-{name}` unless a
    /// custom name was given.
    pub fn argument_name(&self, plugin: &str) -> String {
        format!("--{}", self.full_name(plugin))
    }

    /// Destination key within the plugin's own options.
    pub fn dest(&self) -> String {
        match &self.dest {
            Some(dest) => dest.clone(),
            None => normalize_dest(&self.name),
        }
    }

    /// Destination key within the parsed command line shared by all plugins.
    pub fn namespace_dest(&self, plugin: &str) -> String {
        normalize_dest(&self.full_name(plugin))
    }

    /// Keyword options for an external argument parser.
    ///
    /// Unset values are left out, and so is `const` for boolean store actions.
    pub fn options(&self) -> BTreeMap<&'static str, OptionValue> {
        let mut options = BTreeMap::new();
        options.insert("action", OptionValue::from(self.action.as_str()));
        if let Some(nargs) = self.nargs {
            let nargs = match nargs {
                Nargs::Exact(n) => OptionValue::from(n),
                other => OptionValue::from(other.to_string()),
            };
            options.insert("nargs", nargs);
        }
        if self.r#const.is_set() && !self.action.is_boolean() {
            options.insert("const", self.r#const.clone());
        }
        if self.default.is_set() {
            options.insert("default", self.default.clone());
        }
        if let Some(value_type) = self.value_type {
            options.insert("type", OptionValue::from(value_type.name()));
        }
        if let Some(choices) = &self.choices {
            options.insert("choices", OptionValue::List(choices.to_vec()));
        }
        if let Some(help) = &self.help {
            options.insert("help", OptionValue::from(help.as_str()));
        }
        if let Some(metavar) = &self.metavar {
            options.insert("metavar", OptionValue::List(metavar.to_vec()));
        }
        options
    }

    /// Converts a raw command-line value and checks it against `choices`.
    pub fn parse_value(&self, raw: &str) -> Result<OptionValue, ArgumentError> {
        if let Some(choices) = &self.choices {
            if !choices.iter().any(|c| c == raw) {
                return Err(ArgumentError::InvalidValue {
                    name: self.name.clone(),
                    reason: format!("'{raw}' is not one of {}", choices.join(", ")),
                });
            }
        }
        self.value_type
            .unwrap_or(ArgumentType::Str)
            .parse(raw)
            .map_err(|reason| ArgumentError::InvalidValue {
                name: self.name.clone(),
                reason,
            })
    }
}

#[derive(Debug, Clone)]
pub struct ArgumentBuilder {
    name: String,
    action: ArgumentAction,
    nargs: Option<Nargs>,
    r#const: OptionValue,
    default: OptionValue,
    value_type: Option<ArgumentType>,
    choices: Option<Vec<String>>,
    required: bool,
    help: Option<String>,
    metavar: Option<Vec<String>>,
    dest: Option<String>,
    requires: Vec<String>,
    prompt: Option<String>,
    sensitive: bool,
    argument_name: Option<String>,
}

impl ArgumentBuilder {
    pub fn action(mut self, action: ArgumentAction) -> Self {
        self.action = action;
        self
    }

    pub fn nargs(mut self, nargs: Nargs) -> Self {
        self.nargs = Some(nargs);
        self
    }

    pub fn const_value(mut self, value: impl Into<OptionValue>) -> Self {
        self.r#const = value.into();
        self
    }

    pub fn default(mut self, value: impl Into<OptionValue>) -> Self {
        self.default = value.into();
        self
    }

    pub fn value_type(mut self, value_type: ArgumentType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn metavar<I, S>(mut self, metavar: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metavar = Some(metavar.into_iter().map(Into::into).collect());
        self
    }

    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.requires = requires
            .into_iter()
            .map(|r| normalize_name(r.as_ref()))
            .collect();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn argument_name(mut self, name: &str) -> Self {
        self.argument_name = Some(normalize_name(name));
        self
    }

    pub fn build(self) -> Argument {
        let (r#const, default) = match self.action {
            ArgumentAction::StoreTrue => (
                OptionValue::Bool(true),
                match self.default {
                    OptionValue::Absent => OptionValue::Bool(false),
                    default => default,
                },
            ),
            ArgumentAction::StoreFalse => (
                OptionValue::Bool(false),
                match self.default {
                    OptionValue::Absent => OptionValue::Bool(true),
                    default => default,
                },
            ),
            _ => (self.r#const, self.default),
        };

        Argument {
            name: self.name,
            action: self.action,
            nargs: self.nargs,
            r#const,
            default,
            value_type: self.value_type,
            choices: self.choices.map(Arc::from),
            required: self.required,
            help: self.help,
            metavar: self.metavar.map(Arc::from),
            dest: self.dest,
            requires: Arc::from(self.requires),
            prompt: self.prompt,
            sensitive: self.sensitive,
            argument_name: self.argument_name,
        }
    }
}

/// The arguments a plugin accepts, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    arguments: Vec<Argument>,
}

impl Arguments {
    pub fn new<I: IntoIterator<Item = Argument>>(arguments: I) -> Self {
        let mut this = Self::default();
        for argument in arguments {
            this.add(argument);
        }
        this
    }

    /// Adds an argument, replacing any earlier one with the same name.
    pub fn add(&mut self, argument: Argument) {
        match self.arguments.iter_mut().find(|a| a.name == argument.name) {
            Some(existing) => *existing = argument,
            None => self.arguments.push(argument),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Argument> {
        let name = normalize_name(name);
        self.arguments.iter().find(|a| a.name == name)
    }

    /// Iterates in reverse insertion order.
    pub fn iter(&self) -> std::iter::Rev<std::slice::Iter<'_, Argument>> {
        self.arguments.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Every argument `name` depends on, directly or transitively.
    ///
    /// Walks depth-first in declaration order and yields each dependency
    /// once, even when several arguments require it.
    pub fn requires(&self, name: &str) -> Result<Vec<&Argument>, ArgumentError> {
        let root = self
            .get(name)
            .ok_or_else(|| ArgumentError::UnknownArgument {
                name: normalize_name(name),
            })?;

        let mut ancestors = vec![root.name.clone()];
        let mut visited = HashSet::from([root.name.clone()]);
        let mut result = Vec::new();
        self.visit_requires(root, &mut ancestors, &mut visited, &mut result)?;
        Ok(result)
    }

    fn visit_requires<'a>(
        &'a self,
        argument: &'a Argument,
        ancestors: &mut Vec<String>,
        visited: &mut HashSet<String>,
        result: &mut Vec<&'a Argument>,
    ) -> Result<(), ArgumentError> {
        for required in argument.requires.iter() {
            let dependency = self
                .get(required)
                .ok_or_else(|| ArgumentError::UnknownArgument {
                    name: required.clone(),
                })?;

            if ancestors.contains(&dependency.name) {
                let mut path = ancestors.clone();
                path.push(dependency.name.clone());
                return Err(ArgumentError::CycleDetected { path });
            }
            if !visited.insert(dependency.name.clone()) {
                continue;
            }

            result.push(dependency);
            ancestors.push(dependency.name.clone());
            self.visit_requires(dependency, ancestors, visited, result)?;
            ancestors.pop();
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Arguments {
    type Item = &'a Argument;
    type IntoIter = std::iter::Rev<std::slice::Iter<'a, Argument>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
