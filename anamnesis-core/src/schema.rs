//! Declarative field schema for extraction and reconciliation.
//!
//! The schema is the trust boundary between free-form model output and
//! persistent state: a candidate field is only eligible to touch a
//! patient record if its name is declared here and its value passes the
//! declared kind's validation. Schema declaration order is also the
//! audit order for `applied_changes` in reconciliation events.

use serde_json::Value;

/// Value type and validation rule for a declared field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Free text (trimmed, non-empty).
    Text,
    /// Whole number, optionally range-bounded. String digits coerce.
    Integer { min: Option<i64>, max: Option<i64> },
    /// Floating point, optionally range-bounded. Numeric strings coerce.
    Number { min: Option<f64>, max: Option<f64> },
    /// One of a closed set of variants (case-insensitive match).
    Enum(Vec<&'static str>),
    /// List of non-empty strings. A bare string coerces to a singleton.
    List,
}

/// How the reconciler merges a new value into an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Default: new value wins only on strictly higher confidence.
    Confidence,
    /// Always-overwrite: latest value replaces unconditionally.
    Overwrite,
    /// Always-overwrite, cumulative: list values are unioned, order
    /// preserved, duplicates dropped.
    Accumulate,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub policy: MergePolicy,
    /// One-line description fed to the extraction prompt.
    pub prompt_hint: &'static str,
}

/// Ordered collection of field specs. Order is declaration order.
#[derive(Debug, Clone)]
pub struct ExtractionSchema {
    fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position in declaration order; used to sort audit entries.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Validate and normalize a candidate value against the declared
    /// kind. Returns the normalized value, or `None` when the value
    /// fails the rule (the caller drops and logs it).
    pub fn validate(&self, name: &str, value: &Value) -> Option<Value> {
        let spec = self.get(name)?;
        match &spec.kind {
            FieldKind::Text => match value {
                Value::String(s) => {
                    let t = s.trim();
                    (!t.is_empty()).then(|| Value::String(t.to_string()))
                }
                _ => None,
            },
            FieldKind::Integer { min, max } => {
                let n = match value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return None;
                }
                Some(Value::from(n))
            }
            FieldKind::Number { min, max } => {
                let n = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }?;
                if !n.is_finite() || min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return None;
                }
                Some(Value::from(n))
            }
            FieldKind::Enum(variants) => match value {
                Value::String(s) => {
                    let t = s.trim();
                    variants
                        .iter()
                        .find(|v| v.eq_ignore_ascii_case(t))
                        .map(|v| Value::String(v.to_string()))
                }
                _ => None,
            },
            FieldKind::List => {
                let items: Vec<String> = match value {
                    Value::Array(arr) => arr
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    // Models sometimes return a bare string for a
                    // single-item list.
                    Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
                    _ => return None,
                };
                let deduped = dedupe_preserving_order(items);
                (!deduped.is_empty()).then(|| Value::from(deduped))
            }
        }
    }
}

/// Drop duplicate list entries while preserving first-seen order.
pub fn dedupe_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

impl ExtractionSchema {
    /// Default intake schema: the demographic scalars plus the
    /// cumulative history lists a medical intake interview collects.
    pub fn medical_intake() -> Self {
        Self::new(vec![
            FieldSpec {
                name: "name",
                kind: FieldKind::Text,
                policy: MergePolicy::Confidence,
                prompt_hint: "patient's full name",
            },
            FieldSpec {
                name: "age",
                kind: FieldKind::Integer { min: Some(0), max: Some(130) },
                policy: MergePolicy::Confidence,
                prompt_hint: "age in years (number)",
            },
            FieldSpec {
                name: "gender",
                kind: FieldKind::Enum(vec!["male", "female", "other"]),
                policy: MergePolicy::Confidence,
                prompt_hint: "one of: male, female, other",
            },
            FieldSpec {
                name: "height",
                kind: FieldKind::Text,
                policy: MergePolicy::Confidence,
                prompt_hint: "height, e.g. 5'10\" or 178 cm",
            },
            FieldSpec {
                name: "weight",
                kind: FieldKind::Text,
                policy: MergePolicy::Confidence,
                prompt_hint: "weight in pounds or kilograms",
            },
            FieldSpec {
                name: "medications",
                kind: FieldKind::List,
                policy: MergePolicy::Accumulate,
                prompt_hint: "current medications with dosage and frequency",
            },
            FieldSpec {
                name: "allergies",
                kind: FieldKind::List,
                policy: MergePolicy::Accumulate,
                prompt_hint: "allergies with severity and reaction if stated",
            },
            FieldSpec {
                name: "chronic_conditions",
                kind: FieldKind::List,
                policy: MergePolicy::Accumulate,
                prompt_hint: "ongoing conditions with diagnosis date and status",
            },
            FieldSpec {
                name: "surgeries",
                kind: FieldKind::List,
                policy: MergePolicy::Accumulate,
                prompt_hint: "past surgeries with dates and complications",
            },
            FieldSpec {
                name: "family_history",
                kind: FieldKind::List,
                policy: MergePolicy::Accumulate,
                prompt_hint: "conditions in immediate family, relation and onset age",
            },
            FieldSpec {
                name: "notes",
                kind: FieldKind::Text,
                policy: MergePolicy::Overwrite,
                prompt_hint: "anything relevant that fits no other field",
            },
        ])
    }
}
