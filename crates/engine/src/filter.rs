/// Builds the XML filter expression sent to drivers. The engine treats
/// filter contents as opaque beyond well-formedness; this builder only
/// guarantees the canonical shape and escaping.
#[derive(Debug, Clone, Default)]
pub struct TestFilterBuilder {
    test_names: Vec<String>,
    where_clause: Option<String>,
}

impl TestFilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fully-qualified test name to the selection, preserving
    /// insertion order.
    pub fn add_test(&mut self, full_name: impl Into<String>) -> &mut Self {
        self.test_names.push(full_name.into());
        self
    }

    /// Attaches an already-rendered where-clause XML fragment.
    pub fn select_where(&mut self, clause_xml: impl Into<String>) -> &mut Self {
        self.where_clause = Some(clause_xml.into());
        self
    }

    pub fn build(&self) -> String {
        let mut elements = Vec::new();
        match self.test_names.as_slice() {
            [] => {}
            [only] => elements.push(format!("<test>{}</test>", xml_escape(only))),
            names => {
                let tests: String = names
                    .iter()
                    .map(|name| format!("<test>{}</test>", xml_escape(name)))
                    .collect();
                elements.push(format!("<or>{tests}</or>"));
            }
        }
        if let Some(clause) = &self.where_clause {
            elements.push(clause.clone());
        }

        match elements.as_slice() {
            [] => "<filter/>".to_owned(),
            [only] => format!("<filter>{only}</filter>"),
            several => format!("<filter><and>{}</and></filter>", several.concat()),
        }
    }
}

/// Escapes the five XML-significant characters.
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
