use thiserror::Error;

/// A parsed test filter. The engine promises only well-formedness; the
/// framework side understands this grammar:
/// `<filter/>`, `<test>`, `<or>`, `<and>`, `<not>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFilter {
    Empty,
    Test(String),
    Or(Vec<TestFilter>),
    And(Vec<TestFilter>),
    Not(Box<TestFilter>),
}

impl TestFilter {
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let mut parser = Parser::new(text);
        let filter = parser.parse_document()?;
        Ok(filter)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TestFilter::Empty)
    }

    /// Whether a case with this full name is selected.
    pub fn matches(&self, full_name: &str) -> bool {
        match self {
            TestFilter::Empty => true,
            TestFilter::Test(name) => name == full_name,
            TestFilter::Or(children) => children.iter().any(|child| child.matches(full_name)),
            TestFilter::And(children) => children.iter().all(|child| child.matches(full_name)),
            TestFilter::Not(child) => !child.matches(full_name),
        }
    }

    /// Whether the filter names this test explicitly, which is what lets
    /// an explicit case run.
    pub fn selects_explicitly(&self, full_name: &str) -> bool {
        match self {
            TestFilter::Test(name) => name == full_name,
            TestFilter::Or(children) => {
                children.iter().any(|child| child.selects_explicitly(full_name))
            }
            TestFilter::And(children) => {
                !children.is_empty()
                    && children.iter().any(|child| child.selects_explicitly(full_name))
                    && self.matches(full_name)
            }
            TestFilter::Empty | TestFilter::Not(_) => false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter is not well-formed: {detail}")]
    Malformed { detail: String },
    #[error("filter element `{element}` is not supported")]
    UnsupportedElement { element: String },
}

struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text.trim() }
    }

    fn parse_document(&mut self) -> Result<TestFilter, FilterError> {
        if self.rest.is_empty() || self.rest == "<filter/>" || self.rest == "<filter></filter>" {
            return Ok(TestFilter::Empty);
        }
        let inner = self.strip_element("filter")?;
        let mut inner_parser = Parser { rest: inner.trim() };
        let mut children = inner_parser.parse_children()?;
        match children.len() {
            0 => Ok(TestFilter::Empty),
            1 => Ok(children.remove(0)),
            // Multiple children of <filter> combine like <and>.
            _ => Ok(TestFilter::And(children)),
        }
    }

    fn parse_children(&mut self) -> Result<Vec<TestFilter>, FilterError> {
        let mut children = Vec::new();
        while !self.rest.is_empty() {
            children.push(self.parse_node()?);
            self.rest = self.rest.trim_start();
        }
        Ok(children)
    }

    fn parse_node(&mut self) -> Result<TestFilter, FilterError> {
        let element = self.peek_element_name()?;
        match element.as_str() {
            "test" => {
                let text = self.strip_element("test")?;
                Ok(TestFilter::Test(xml_unescape(text)))
            }
            "or" => {
                let inner = self.strip_element("or")?;
                let mut inner_parser = Parser { rest: inner.trim() };
                Ok(TestFilter::Or(inner_parser.parse_children()?))
            }
            "and" => {
                let inner = self.strip_element("and")?;
                let mut inner_parser = Parser { rest: inner.trim() };
                Ok(TestFilter::And(inner_parser.parse_children()?))
            }
            "not" => {
                let inner = self.strip_element("not")?;
                let mut inner_parser = Parser { rest: inner.trim() };
                let mut children = inner_parser.parse_children()?;
                match (children.pop(), children.is_empty()) {
                    (Some(child), true) => Ok(TestFilter::Not(Box::new(child))),
                    _ => Err(FilterError::Malformed {
                        detail: "<not> takes exactly one child".to_owned(),
                    }),
                }
            }
            other => Err(FilterError::UnsupportedElement {
                element: other.to_owned(),
            }),
        }
    }

    fn peek_element_name(&self) -> Result<String, FilterError> {
        let rest = self.rest.strip_prefix('<').ok_or_else(|| FilterError::Malformed {
            detail: format!("expected an element, found `{}`", snippet(self.rest)),
        })?;
        let end = rest
            .find(&['>', '/', ' '][..])
            .ok_or_else(|| FilterError::Malformed {
                detail: "unterminated element".to_owned(),
            })?;
        Ok(rest[..end].to_owned())
    }

    /// Consumes `<name>…</name>` (or the self-closing form) from the
    /// input and returns the inner text.
    fn strip_element(&mut self, name: &str) -> Result<&'a str, FilterError> {
        let self_closing = format!("<{name}/>");
        if let Some(rest) = self.rest.strip_prefix(self_closing.as_str()) {
            self.rest = rest;
            return Ok("");
        }
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let after_open =
            self.rest
                .strip_prefix(open.as_str())
                .ok_or_else(|| FilterError::Malformed {
                    detail: format!("expected `{open}`, found `{}`", snippet(self.rest)),
                })?;
        let close_at = find_matching_close(after_open, &open, &close).ok_or_else(|| {
            FilterError::Malformed {
                detail: format!("missing `{close}`"),
            }
        })?;
        let inner = &after_open[..close_at];
        self.rest = &after_open[close_at + close.len()..];
        Ok(inner)
    }
}

/// Position of the close tag matching an already-consumed open tag,
/// skipping nested same-name elements.
fn find_matching_close(text: &str, open: &str, close: &str) -> Option<usize> {
    let mut depth = 0_usize;
    let mut search_from = 0;
    loop {
        let close_at = text[search_from..].find(close)? + search_from;
        let opens_before = text[search_from..close_at].matches(open).count();
        depth += opens_before;
        if depth == 0 {
            return Some(close_at);
        }
        depth -= 1;
        search_from = close_at + close.len();
    }
}

fn snippet(text: &str) -> &str {
    &text[..text.len().min(24)]
}

pub fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
