use std::fmt::Display;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Option<String>,
    pub to: String,
}

/// What differs between the discovered and the declared state of one task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    fields: Vec<FieldChange>,
    unconditional: bool,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Used when the current state could not be discovered; every field counts as changed.
    pub fn unconditional() -> Self {
        Self {
            fields: Vec::new(),
            unconditional: true,
        }
    }

    /// Records `field` when `actual` is missing or differs from `desired`.
    pub fn compare<T: PartialEq + Display>(
        &mut self,
        field: &str,
        actual: Option<&T>,
        desired: &T,
    ) -> &mut Self {
        if actual != Some(desired) {
            self.record(field, actual.map(ToString::to_string), desired.to_string());
        }
        self
    }

    pub fn record(&mut self, field: &str, from: Option<String>, to: String) -> &mut Self {
        self.fields.push(FieldChange {
            field: field.to_string(),
            from,
            to,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.unconditional && self.fields.is_empty()
    }

    pub fn is_unconditional(&self) -> bool {
        self.unconditional
    }

    /// True when `field` has to be rendered.
    pub fn touches(&self, field: &str) -> bool {
        self.unconditional || self.fields.iter().any(|f| f.field == field)
    }

    pub fn fields(&self) -> &[FieldChange] {
        &self.fields
    }

    pub fn summary(&self) -> String {
        if self.unconditional {
            return "unconditional (current state unknown)".into();
        }
        self.fields
            .iter()
            .map(|f| {
                format!(
                    "{}: {} -> {}",
                    f.field,
                    f.from.as_deref().unwrap_or("<absent>"),
                    f.to
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
