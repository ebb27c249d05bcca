use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use shared::{
    domain::{Choice, ChoiceId},
    protocol::UpdatePatch,
};
use tokio::sync::{broadcast, Mutex};

use crate::{event_channel, Widget, WidgetError, WidgetEvent, WidgetId, WidgetValue};

struct OrderedState {
    chosen: Vec<ChoiceId>,
}

/// Ordered multi-select over a static choice set, partitioned into the
/// chosen ids (order significant) and the remaining available ones. The
/// initial selection arrives as a JSON array string; malformed or unknown
/// entries are hard failures, not recoverable states.
pub struct OrderedMultiSelect {
    id: WidgetId,
    choices: Vec<Choice>,
    inner: Mutex<OrderedState>,
    events: broadcast::Sender<WidgetEvent>,
}

impl OrderedMultiSelect {
    pub fn new(choices: Vec<Choice>, initial_json: &str) -> Result<Arc<Self>, WidgetError> {
        let selected: Vec<ChoiceId> = serde_json::from_str(initial_json).map_err(|err| {
            WidgetError::invalid_value(format!("malformed selection {initial_json:?}: {err}"))
        })?;
        Self::validate(&choices, &selected)?;
        Ok(Arc::new(Self {
            id: WidgetId::random(),
            choices,
            inner: Mutex::new(OrderedState { chosen: selected }),
            events: event_channel(),
        }))
    }

    fn validate(choices: &[Choice], selected: &[ChoiceId]) -> Result<(), WidgetError> {
        let mut seen = HashSet::new();
        for id in selected {
            if !choices.iter().any(|choice| &choice.id == id) {
                return Err(WidgetError::invalid_value(format!(
                    "selected id {id} is not among the choices"
                )));
            }
            if !seen.insert(id.clone()) {
                return Err(WidgetError::invalid_value(format!(
                    "selected id {id} appears twice"
                )));
            }
        }
        Ok(())
    }

    fn label_of(&self, id: &ChoiceId) -> Option<Choice> {
        self.choices.iter().find(|choice| &choice.id == id).cloned()
    }

    /// Choices not currently chosen, in their declaration order.
    pub async fn available(&self) -> Vec<Choice> {
        let state = self.inner.lock().await;
        self.choices
            .iter()
            .filter(|choice| !state.chosen.contains(&choice.id))
            .cloned()
            .collect()
    }

    /// Chosen choices in selection order.
    pub async fn chosen(&self) -> Vec<Choice> {
        let state = self.inner.lock().await;
        state
            .chosen
            .iter()
            .filter_map(|id| self.label_of(id))
            .collect()
    }

    pub async fn choose(&self, id: impl Into<ChoiceId>) -> Result<(), WidgetError> {
        let id = id.into();
        if self.label_of(&id).is_none() {
            return Err(WidgetError::invalid_value(format!(
                "cannot choose unknown id {id}"
            )));
        }
        {
            let mut state = self.inner.lock().await;
            if state.chosen.contains(&id) {
                return Ok(());
            }
            state.chosen.push(id);
        }
        self.notify().await;
        Ok(())
    }

    pub async fn withdraw(&self, id: &ChoiceId) -> Result<(), WidgetError> {
        let removed = {
            let mut state = self.inner.lock().await;
            let before = state.chosen.len();
            state.chosen.retain(|chosen| chosen != id);
            state.chosen.len() < before
        };
        if removed {
            self.notify().await;
        }
        Ok(())
    }

    /// Move a chosen id to `index`, clamped to the end of the list.
    pub async fn move_to(&self, id: &ChoiceId, index: usize) -> Result<(), WidgetError> {
        let moved = {
            let mut state = self.inner.lock().await;
            let Some(from) = state.chosen.iter().position(|chosen| chosen == id) else {
                return Err(WidgetError::invalid_value(format!(
                    "cannot reorder id {id}: not chosen"
                )));
            };
            let to = index.min(state.chosen.len() - 1);
            if from == to {
                false
            } else {
                let id = state.chosen.remove(from);
                state.chosen.insert(to, id);
                true
            }
        };
        if moved {
            self.notify().await;
        }
        Ok(())
    }

    pub async fn value_json(&self) -> String {
        let state = self.inner.lock().await;
        let raw: Vec<&str> = state.chosen.iter().map(|id| id.as_str()).collect();
        serde_json::to_string(&raw).unwrap_or_else(|_| "[]".to_string())
    }

    async fn notify(&self) {
        let value = WidgetValue::Multiple(self.inner.lock().await.chosen.clone());
        let _ = self.events.send(WidgetEvent::ValueChanged {
            widget: self.id,
            value,
        });
    }
}

#[async_trait]
impl Widget for OrderedMultiSelect {
    fn id(&self) -> WidgetId {
        self.id
    }

    async fn value(&self) -> WidgetValue {
        WidgetValue::Multiple(self.inner.lock().await.chosen.clone())
    }

    async fn set_value(&self, value: WidgetValue) -> Result<(), WidgetError> {
        let selected = value.ids();
        Self::validate(&self.choices, &selected)?;
        let changed = {
            let mut state = self.inner.lock().await;
            if state.chosen == selected {
                false
            } else {
                state.chosen = selected;
                true
            }
        };
        if changed {
            self.notify().await;
        }
        Ok(())
    }

    async fn update(&self, patch: UpdatePatch) -> Result<(), WidgetError> {
        if let Some(value) = patch.value {
            self.set_value(WidgetValue::Multiple(vec![value])).await?;
        }
        Ok(())
    }

    /// The choice set is static; there is nothing to re-fetch.
    async fn reload(&self, _params: &HashMap<String, String>) -> Result<(), WidgetError> {
        Ok(())
    }

    fn dependencies(&self) -> HashSet<String> {
        HashSet::new()
    }

    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> Arc<OrderedMultiSelect> {
        OrderedMultiSelect::new(
            vec![Choice::new("2", "Alpha"), Choice::new("3", "Beta")],
            r#"["3"]"#,
        )
        .expect("widget")
    }

    #[tokio::test]
    async fn partitions_choices_into_chosen_and_available() {
        let widget = widget();
        assert_eq!(widget.chosen().await, vec![Choice::new("3", "Beta")]);
        assert_eq!(widget.available().await, vec![Choice::new("2", "Alpha")]);
        assert_eq!(widget.value_json().await, r#"["3"]"#);
    }

    #[test]
    fn malformed_selection_json_is_a_hard_failure() {
        let result = OrderedMultiSelect::new(vec![Choice::new("2", "Alpha")], "{broken");
        assert!(matches!(result, Err(WidgetError::InvalidValue { .. })));
    }

    #[test]
    fn unknown_selected_id_is_a_hard_failure() {
        let result = OrderedMultiSelect::new(vec![Choice::new("2", "Alpha")], r#"["9"]"#);
        assert!(matches!(result, Err(WidgetError::InvalidValue { .. })));
    }

    #[test]
    fn duplicate_selected_id_is_a_hard_failure() {
        let result =
            OrderedMultiSelect::new(vec![Choice::new("2", "Alpha")], r#"["2", "2"]"#);
        assert!(matches!(result, Err(WidgetError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn choose_appends_and_withdraw_returns_to_available() {
        let widget = widget();
        widget.choose("2").await.expect("choose");
        assert_eq!(widget.value_json().await, r#"["3","2"]"#);
        assert!(widget.available().await.is_empty());

        widget.withdraw(&ChoiceId::new("3")).await.expect("withdraw");
        assert_eq!(widget.value_json().await, r#"["2"]"#);
        assert_eq!(widget.available().await, vec![Choice::new("3", "Beta")]);
    }

    #[tokio::test]
    async fn move_to_reorders_the_chosen_ids() {
        let widget = OrderedMultiSelect::new(
            vec![
                Choice::new("1", "One"),
                Choice::new("2", "Two"),
                Choice::new("3", "Three"),
            ],
            r#"["1", "2", "3"]"#,
        )
        .expect("widget");

        widget
            .move_to(&ChoiceId::new("3"), 0)
            .await
            .expect("reorder");
        assert_eq!(widget.value_json().await, r#"["3","1","2"]"#);

        widget
            .move_to(&ChoiceId::new("3"), 99)
            .await
            .expect("clamped reorder");
        assert_eq!(widget.value_json().await, r#"["1","2","3"]"#);
    }

    #[tokio::test]
    async fn set_value_notifies_only_on_difference() {
        let widget = widget();
        let mut events = widget.subscribe();

        widget
            .set_value(WidgetValue::Multiple(vec![ChoiceId::new("3")]))
            .await
            .expect("same selection");
        assert!(events.try_recv().is_err());

        widget
            .set_value(WidgetValue::Multiple(vec![
                ChoiceId::new("2"),
                ChoiceId::new("3"),
            ]))
            .await
            .expect("new selection");
        match events.try_recv().expect("one event") {
            WidgetEvent::ValueChanged { value, .. } => {
                assert_eq!(
                    value,
                    WidgetValue::Multiple(vec![ChoiceId::new("2"), ChoiceId::new("3")])
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn choosing_an_already_chosen_id_is_silent() {
        let widget = widget();
        let mut events = widget.subscribe();
        widget.choose("3").await.expect("idempotent choose");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn set_value_rejects_unknown_ids() {
        let widget = widget();
        let err = widget
            .set_value(WidgetValue::Multiple(vec![ChoiceId::new("9")]))
            .await
            .expect_err("must fail");
        assert!(matches!(err, WidgetError::InvalidValue { .. }));
    }
}
