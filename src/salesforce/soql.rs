//! Compiles structured filters into SOQL text.
//!
//! Output uses the `+`-for-space form expected in a `q=` query parameter:
//! `SELECT+Id,Name+FROM+Account+WHERE+Active=true+AND+Name='Acme'+LIMIT+10`.

use url::form_urlencoded;

use crate::salesforce::payload::{join_display, rfc3339, Attributes, FieldValue};

/// Field filter: sorted field name to value. Every entry becomes one
/// predicate and predicates are joined with `AND`.
pub type Filter = Attributes;

/// A `SELECT` over one object with an optional equality/membership filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub object: String,
    pub fields: Vec<String>,
    pub filter: Filter,
    /// Appended as `LIMIT` when non-zero.
    pub limit: u64,
    /// Appended as `OFFSET` when non-zero.
    pub offset: u64,
}

impl SelectQuery {
    pub fn new<I, S>(object: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            object: object.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Renders the query in `+`-form. Identical input always yields identical text.
    pub fn compile(&self) -> String {
        let mut query = String::from("SELECT+");
        query.push_str(&self.fields.join(","));
        query.push_str("+FROM+");
        query.push_str(&self.object);

        if !self.filter.is_empty() {
            query.push_str("+WHERE+");
            query.push_str(&compile_where(&self.filter));
        }

        if self.limit > 0 {
            query.push_str(&format!("+LIMIT+{}", self.limit));
        }
        if self.offset > 0 {
            query.push_str(&format!("+OFFSET+{}", self.offset));
        }

        query
    }
}

/// Renders the predicates of a filter joined by `+AND+`, in key order.
pub fn compile_where(filter: &Filter) -> String {
    filter
        .iter()
        .map(|(field, value)| format!("{}{}", field, predicate(value)))
        .collect::<Vec<_>>()
        .join("+AND+")
}

fn predicate(value: &FieldValue) -> String {
    match value {
        FieldValue::String(s) => format!("={}", quote(s)),
        FieldValue::StringSet(items) => {
            let quoted: Vec<String> = items.iter().map(|s| quote(s)).collect();
            format!("+IN+({})", quoted.join(","))
        }
        FieldValue::Bool(b) => format!("={}", b),
        FieldValue::Int(n) => format!("={}", n),
        FieldValue::IntSet(items) => format!("+IN+({})", join_display(items, ",")),
        FieldValue::Float(f) => format!("={}", f),
        FieldValue::FloatSet(items) => format!("+IN+({})", join_display(items, ",")),
        FieldValue::Timestamp(ts) => format!("='{}'", rfc3339(ts)),
    }
}

/// Quotes a string literal. Embedded quotes are dropped, not escaped.
fn quote(value: &str) -> String {
    let stripped = value.replace('\'', "");
    format!("'{}'", form_urlencoded::byte_serialize(stripped.as_bytes()).collect::<String>())
}

/// Form-encodes free SOQL text for use as the `q=` parameter.
pub fn encode_soql(soql: &str) -> String {
    form_urlencoded::byte_serialize(soql.as_bytes()).collect()
}
