use std::fmt;

/// The single failure kind of the validation combinators.
///
/// `path` holds the crumbs leading to the innermost failure, `context` the
/// nested errors that caused this one.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    kind: &'static str,
    message: String,
    path: Vec<String>,
    context: Vec<ValidationError>,
}

impl ValidationError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: Vec::new(),
            context: Vec::new(),
        }
    }

    /// Wraps `inner`, taking over its path below `crumb`.
    pub(crate) fn wrap(
        kind: &'static str,
        message: impl Into<String>,
        crumb: Option<String>,
        inner: ValidationError,
    ) -> Self {
        let mut path: Vec<String> = crumb.into_iter().collect();
        path.extend(inner.path.iter().cloned());
        Self {
            kind,
            message: message.into(),
            path,
            context: vec![inner],
        }
    }

    pub(crate) fn with_context(mut self, context: Vec<ValidationError>) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn named(mut self, name: &str) -> Self {
        self.path.insert(0, name.to_string());
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &[ValidationError] {
        &self.context
    }

    /// The crumb trail, such as `response.data[2].id`.
    pub fn path(&self) -> String {
        let mut path = String::new();
        for crumb in &self.path {
            if !crumb.starts_with('[') && !path.is_empty() {
                path.push('.');
            }
            path.push_str(crumb);
        }
        path
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let header = if depth == 0 { "ValidationError" } else { "Context" };
        if depth == 0 && !self.path.is_empty() {
            writeln!(f, "{indent}{header}({}) at {}:", self.kind, self.path())?;
        } else {
            writeln!(f, "{indent}{header}({}):", self.kind)?;
        }
        for line in self.message.lines() {
            writeln!(f, "{indent}  {line}")?;
        }
        for context in &self.context {
            context.fmt_tree(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, 0)
    }
}

impl std::error::Error for ValidationError {}
