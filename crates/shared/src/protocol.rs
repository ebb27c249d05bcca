use serde::{Deserialize, Serialize};

use crate::domain::{Choice, ChoiceId};

/// Choice list endpoints answer with one of two row shapes:
/// `["2", "Alpha"]` pairs, or records `{"pk": 2, "fields": {"name": "Alpha"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChoiceRow {
    Pair(ChoiceId, String),
    Record { pk: ChoiceId, fields: RecordFields },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub name: String,
}

impl ChoiceRow {
    pub fn into_choice(self) -> Choice {
        match self {
            Self::Pair(id, label) => Choice { id, label },
            Self::Record { pk, fields } => Choice {
                id: pk,
                label: fields.name,
            },
        }
    }
}

impl From<Choice> for ChoiceRow {
    fn from(choice: Choice) -> Self {
        Self::Pair(choice.id, choice.label)
    }
}

pub fn parse_choice_rows(payload: serde_json::Value) -> Result<Vec<Choice>, serde_json::Error> {
    let rows: Vec<ChoiceRow> = serde_json::from_value(payload)?;
    Ok(rows.into_iter().map(ChoiceRow::into_choice).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LabelRow {
    Cells(Vec<serde_json::Value>),
    Record { fields: RecordFields },
}

/// Label lookup endpoints answer with a single row holding the display
/// text in its last cell, or with a record carrying `fields.name`.
pub fn parse_label_rows(payload: &serde_json::Value) -> Option<String> {
    let rows: Vec<LabelRow> = serde_json::from_value(payload.clone()).ok()?;
    match rows.into_iter().next()? {
        LabelRow::Cells(cells) => match cells.into_iter().last()? {
            serde_json::Value::String(text) => Some(text),
            serde_json::Value::Number(number) => Some(number.to_string()),
            _ => None,
        },
        LabelRow::Record { fields } => Some(fields.name),
    }
}

/// Externally-sourced partial state for a widget: a new selection and/or
/// choices to splice in or out, with no remote fetch involved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePatch {
    #[serde(default)]
    pub value: Option<ChoiceId>,
    #[serde(default)]
    pub added: Vec<ChoiceRow>,
    #[serde(default)]
    pub removed: Vec<ChoiceId>,
}

impl UpdatePatch {
    pub fn select(value: impl Into<ChoiceId>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
