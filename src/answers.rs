//! Answer records and the rules for turning them into display strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Keys that identify a record rather than describe it.
const IDENTIFIER_KEYS: &[&str] = &["id", "question_id", "category", "sample"];
const ALTERNATE_SEPARATOR: &str = ": ";
const LIST_SEPARATOR: &str = ", ";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnswerError {
    #[error("answer record has no `question_id` or `category`")]
    MissingTaxonomyId,
    #[error("answer record taxonomy id {0:?} is not a non-negative integer")]
    InvalidTaxonomyId(String),
}

/// One recorded answer for a taxonomy node and a sample.
///
/// The wire shape is a flat JSON object; the taxonomy id is read from
/// `question_id` or, failing that, `category`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct AnswerRecord {
    pub taxonomy_id: u32,
    pub sample: Option<String>,
    pub fields: Map<String, Value>,
}

impl AnswerRecord {
    pub fn new(taxonomy_id: u32, sample: Option<&str>) -> Self {
        Self {
            taxonomy_id,
            sample: sample.map(str::to_string),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    fn value_of(&self, name: &str) -> String {
        match name {
            "sample" => self.sample.clone().unwrap_or_default(),
            _ => self.fields.get(name).map(stringify_value).unwrap_or_default(),
        }
    }

    /// Resolves a field spec (`form`, or alternates like `form|gloss`).
    pub fn resolve(&self, field: &str) -> String {
        join_alternates(field, |name| self.value_of(name))
    }

    /// Tags attached to the record, from either `tags` or `tag`.
    pub fn tags(&self) -> Vec<String> {
        let value = self.fields.get("tags").or_else(|| self.fields.get("tag"));
        match value {
            Some(Value::Array(items)) => items
                .iter()
                .map(stringify_value)
                .filter(|tag| !tag.is_empty())
                .collect(),
            Some(other) => Some(stringify_value(other))
                .filter(|tag| !tag.is_empty())
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl TryFrom<Map<String, Value>> for AnswerRecord {
    type Error = AnswerError;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let raw_id = fields
            .remove("question_id")
            .filter(|value| !value.is_null())
            .or_else(|| fields.remove("category"))
            .ok_or(AnswerError::MissingTaxonomyId)?;
        fields.remove("category");
        let taxonomy_id = match &raw_id {
            Value::Number(number) => number.as_u64().and_then(|id| u32::try_from(id).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| AnswerError::InvalidTaxonomyId(raw_id.to_string()))?;
        let sample = match fields.remove("sample") {
            Some(Value::String(text)) => Some(text),
            Some(Value::Number(number)) => Some(number.to_string()),
            _ => None,
        };
        Ok(Self {
            taxonomy_id,
            sample,
            fields,
        })
    }
}

impl From<AnswerRecord> for Map<String, Value> {
    fn from(record: AnswerRecord) -> Self {
        let mut map = record.fields;
        map.insert("question_id".to_string(), Value::from(record.taxonomy_id));
        if let Some(sample) = record.sample {
            map.insert("sample".to_string(), Value::String(sample));
        }
        map
    }
}

/// Several records for the same taxonomy node and sample, folded together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedAnswer {
    pub taxonomy_id: u32,
    #[serde(rename = "_answers")]
    pub answers: Vec<AnswerRecord>,
    /// Deduplicated, comma-joined values per non-identifier field.
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl CombinedAnswer {
    pub fn from_records(taxonomy_id: u32, answers: Vec<AnswerRecord>) -> Self {
        let mut names: Vec<&str> = Vec::new();
        for record in &answers {
            for name in record.fields.keys() {
                if !IDENTIFIER_KEYS.contains(&name.as_str()) && !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        let fields = names
            .into_iter()
            .map(|name| {
                let mut seen: Vec<String> = Vec::new();
                for record in &answers {
                    let value = record.fields.get(name).map(stringify_value).unwrap_or_default();
                    if !value.is_empty() && !seen.contains(&value) {
                        seen.push(value);
                    }
                }
                (name.to_string(), seen.join(LIST_SEPARATOR))
            })
            .collect();
        Self {
            taxonomy_id,
            answers,
            fields,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Answer {
    Single(AnswerRecord),
    Combined(CombinedAnswer),
}

impl Answer {
    pub fn taxonomy_id(&self) -> u32 {
        match self {
            Answer::Single(record) => record.taxonomy_id,
            Answer::Combined(combined) => combined.taxonomy_id,
        }
    }

    pub fn is_combined(&self) -> bool {
        matches!(self, Answer::Combined(_))
    }

    /// One display string for the field spec.
    pub fn resolve_field(&self, field: &str) -> String {
        match self {
            Answer::Single(record) => record.resolve(field),
            Answer::Combined(combined) => join_alternates(field, |name| {
                combined.fields.get(name).cloned().unwrap_or_default()
            }),
        }
    }

    /// One display string per underlying record, empty values skipped.
    pub fn resolve_each(&self, field: &str) -> Vec<String> {
        let records: &[AnswerRecord] = match self {
            Answer::Single(record) => std::slice::from_ref(record),
            Answer::Combined(combined) => &combined.answers,
        };
        records
            .iter()
            .map(|record| record.resolve(field))
            .filter(|value| !value.is_empty())
            .collect()
    }
}

/// Groups a fetched batch by taxonomy id. Lone records stay as they are;
/// several records for one id become a [`CombinedAnswer`] in fetch order.
pub fn group_answers(records: Vec<AnswerRecord>) -> HashMap<u32, Answer> {
    let mut grouped: HashMap<u32, Vec<AnswerRecord>> = HashMap::new();
    for record in records {
        grouped.entry(record.taxonomy_id).or_default().push(record);
    }
    grouped
        .into_iter()
        .map(|(id, mut records)| {
            let answer = if records.len() == 1 {
                Answer::Single(records.remove(0))
            } else {
                Answer::Combined(CombinedAnswer::from_records(id, records))
            };
            (id, answer)
        })
        .collect()
}

fn join_alternates(field: &str, mut lookup: impl FnMut(&str) -> String) -> String {
    field
        .split('|')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| lookup(name))
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(ALTERNATE_SEPARATOR)
}

/// Display form of a raw answer value. `null`, missing and the literal
/// string `"null"` are all empty; arrays are comma-joined; a
/// `{source, language}` object reads as `source: language`.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) if text == "null" => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => items
            .iter()
            .map(stringify_value)
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>()
            .join(LIST_SEPARATOR),
        Value::Object(object) => match (object.get("source"), object.get("language")) {
            (Some(source), Some(language)) => format!(
                "{}{}{}",
                stringify_value(source),
                ALTERNATE_SEPARATOR,
                stringify_value(language)
            ),
            _ => value.to_string(),
        },
    }
}
