use crate::codec::Value;

/// Symbol information returned by a `lookup` op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupInfo {
    pub ns: Option<String>,
    pub name: String,
    pub file: Option<String>,
    pub arglists: Option<String>,
    pub doc: Option<String>,
    /// Special-form usage, each rendered as a form.
    pub forms: Vec<String>,
}

impl LookupInfo {
    /// Parse the `info` field. An empty mapping means the symbol was not found.
    pub fn from_value(info: &Value) -> Option<Self> {
        let name = info.get_str("name")?.to_string();
        let text = |key: &str| {
            info.get_str(key)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            ns: text("ns"),
            name,
            file: text("file"),
            arglists: text("arglists-str").or_else(|| text("arglists")),
            doc: text("doc"),
            forms: info
                .get_list("forms")
                .unwrap_or_default()
                .iter()
                .map(render_form)
                .collect(),
        })
    }

    /// `ns/name`, or just `name` without a namespace.
    pub fn qualified_name(&self) -> String {
        match &self.ns {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    /// Argument lists without the outer parentheses.
    pub fn arglists_display(&self) -> Option<&str> {
        self.arglists
            .as_deref()
            .map(|s| s.trim_start_matches('(').trim_end_matches(')'))
    }
}

fn render_form(form: &Value) -> String {
    match form {
        Value::List(items) => format!(
            "({})",
            items.iter().map(render_form).collect::<Vec<_>>().join(" ")
        ),
        Value::Int(n) => n.to_string(),
        other => other
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}
