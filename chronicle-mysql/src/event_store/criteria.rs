use chronicle::{Constraint, FieldKind, MetadataMatcher, Operator};
use serde_json::Value;
use std::fmt::Write;

/// SQL Criteria Builder
///
/// Renders a metadata matcher into a SQL conjunction over a stream table,
/// using `JSON_EXTRACT` accessors. Field names were validated at matcher
/// construction; string values are escaped by doubling quotes and
/// backslashes, and every constraint is emitted exactly once regardless of
/// load direction.
pub(crate) struct CriteriaBuilder<'a> {
    matcher: &'a MetadataMatcher,
    builder: String,
}

impl<'a> CriteriaBuilder<'a> {
    pub fn new(matcher: &'a MetadataMatcher) -> Self {
        Self {
            matcher,
            builder: String::with_capacity(256),
        }
    }

    /// Builds the SQL criteria string.
    pub fn build(mut self) -> String {
        let mut constraints = self.matcher.constraints().iter().peekable();
        while let Some(constraint) = constraints.next() {
            self.push_constraint(constraint);
            if constraints.peek().is_some() {
                self.builder.push_str(" AND ");
            }
        }
        self.builder
    }

    fn push_constraint(&mut self, constraint: &Constraint) {
        match constraint.value() {
            Value::Number(number) => {
                let _ = write!(
                    self.builder,
                    "{} {} {number}",
                    json_accessor(constraint),
                    sql_operator(constraint.operator())
                );
            }
            Value::Bool(flag) => {
                // MySQL converts a bare TRUE to the JSON number 1, so the
                // comparison operand has to be a JSON boolean.
                let _ = write!(
                    self.builder,
                    "{} {} CAST('{flag}' AS JSON)",
                    json_accessor(constraint),
                    sql_operator(constraint.operator())
                );
            }
            Value::String(text) => {
                let _ = write!(
                    self.builder,
                    "{} {} '{}'",
                    text_accessor(constraint),
                    sql_operator(constraint.operator()),
                    escape(text)
                );
            }
            Value::Array(items) => self.push_list(constraint, items),
            // Matcher validation rejects the remaining value kinds.
            Value::Null | Value::Object(_) => self.builder.push_str("FALSE"),
        }
    }

    fn push_list(&mut self, constraint: &Constraint, items: &[Value]) {
        let keyword = sql_operator(constraint.operator());
        let numeric = items.iter().all(Value::is_number);
        let accessor = if numeric {
            json_accessor(constraint)
        } else {
            text_accessor(constraint)
        };
        let _ = write!(self.builder, "{accessor} {keyword} (");
        let mut items = items.iter().peekable();
        while let Some(item) = items.next() {
            match item {
                Value::Number(number) if numeric => {
                    let _ = write!(self.builder, "{number}");
                }
                other => {
                    let _ = write!(self.builder, "'{}'", escape(&literal(other)));
                }
            }
            if items.peek().is_some() {
                self.builder.push_str(", ");
            }
        }
        self.builder.push(')');
    }
}

/// Accessor yielding the raw JSON value, used for numeric and boolean
/// comparisons.
fn json_accessor(constraint: &Constraint) -> String {
    match constraint.kind() {
        FieldKind::Metadata => {
            format!("JSON_EXTRACT(metadata, '$.{}')", constraint.field())
        }
        FieldKind::Property => constraint.field().to_string(),
    }
}

/// Accessor yielding an unquoted string, used for textual comparisons.
fn text_accessor(constraint: &Constraint) -> String {
    match constraint.kind() {
        FieldKind::Metadata => {
            format!("JSON_UNQUOTE(JSON_EXTRACT(metadata, '$.{}'))", constraint.field())
        }
        FieldKind::Property => constraint.field().to_string(),
    }
}

fn sql_operator(operator: Operator) -> &'static str {
    match operator {
        Operator::Equals => "=",
        Operator::NotEquals => "!=",
        Operator::GreaterThan => ">",
        Operator::GreaterThanEquals => ">=",
        Operator::In => "IN",
        Operator::LowerThan => "<",
        Operator::LowerThanEquals => "<=",
        Operator::NotIn => "NOT IN",
        Operator::Regex => "REGEXP",
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "''")
}
