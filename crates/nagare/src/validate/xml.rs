use std::collections::BTreeMap;

use quick_xml::{events::BytesStart, events::Event, Reader};

/// A parsed XML element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub text: Option<String>,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// Parses a document and returns its root element.
    pub fn parse(xml: &str) -> Result<XmlElement, String> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => stack.push(Self::from_start(&e)?),
                Ok(Event::Empty(e)) => {
                    let element = Self::from_start(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = root.or(Some(element)),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| "unexpected closing tag".to_string())?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => root = root.or(Some(element)),
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = e.unescape().map_err(|e| e.to_string())?;
                    if let Some(current) = stack.last_mut() {
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::CData(e)) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    if let Some(current) = stack.last_mut() {
                        current.text.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(e.to_string()),
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err("unclosed element at end of document".to_string());
        }
        root.ok_or_else(|| "document has no root element".to_string())
    }

    fn from_start(e: &BytesStart<'_>) -> Result<XmlElement, String> {
        let mut element = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()));
        for attribute in e.attributes() {
            let attribute = attribute.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| e.to_string())?
                .into_owned();
            element.attributes.insert(key, value);
        }
        Ok(element)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// First element matching a simple element path.
    ///
    /// Paths are `/`-separated tag names relative to this element; `*` matches
    /// any tag and a leading `.//` searches all descendants.
    pub fn find(&self, path: &str) -> Option<&XmlElement> {
        self.find_all(path).into_iter().next()
    }

    pub fn find_text(&self, path: &str) -> Option<&str> {
        self.find(path).map(|e| e.text.as_deref().unwrap_or(""))
    }

    pub fn find_all(&self, path: &str) -> Vec<&XmlElement> {
        let (descendants, path) = match path.strip_prefix(".//") {
            Some(rest) => (true, rest),
            None => (false, path.trim_start_matches("./")),
        };
        let mut steps = path.split('/').filter(|s| !s.is_empty() && *s != ".");

        let mut current: Vec<&XmlElement> = match steps.next() {
            None => return vec![self],
            Some(first) if descendants => {
                let mut found = Vec::new();
                self.collect_descendants(first, &mut found);
                found
            }
            Some(first) => self.children.iter().filter(|c| c.matches(first)).collect(),
        };

        for step in steps {
            current = current
                .into_iter()
                .flat_map(|e| e.children.iter().filter(|c| c.matches(step)))
                .collect();
        }
        current
    }

    fn collect_descendants<'a>(&'a self, tag: &str, found: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.matches(tag) {
                found.push(child);
            }
            child.collect_descendants(tag, found);
        }
    }

    fn matches(&self, tag: &str) -> bool {
        tag == "*" || self.tag == tag
    }
}
