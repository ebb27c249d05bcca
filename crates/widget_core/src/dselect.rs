use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use shared::{
    domain::{Choice, ChoiceId},
    protocol::{parse_choice_rows, UpdatePatch},
};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;
use transport::Backend;

use crate::{
    event_channel, template::UrlTemplate, Widget, WidgetError, WidgetEvent, WidgetId, WidgetValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Datatype {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub enum ChoiceSource {
    Static(Vec<Choice>),
    Remote(String),
}

struct SelectState {
    choices: Vec<Choice>,
    value: Option<ChoiceId>,
    template: Option<UrlTemplate>,
    fetch_seq: u64,
    ready: bool,
}

/// Single-valued select whose choice set comes from a static list or a
/// templated remote endpoint. A failed fetch restores the choices and
/// value captured at construction; a superseded fetch is discarded.
pub struct DynamicSelect {
    id: WidgetId,
    backend: Arc<dyn Backend>,
    datatype: Datatype,
    initial: Vec<Choice>,
    initial_value: Option<ChoiceId>,
    static_tags: HashSet<String>,
    inner: Mutex<SelectState>,
    events: broadcast::Sender<WidgetEvent>,
}

impl DynamicSelect {
    pub fn new(backend: Arc<dyn Backend>, initial: Vec<Choice>) -> Arc<Self> {
        Self::with_initial_value(backend, initial, None, Datatype::Text)
    }

    pub fn with_initial_value(
        backend: Arc<dyn Backend>,
        initial: Vec<Choice>,
        value: Option<ChoiceId>,
        datatype: Datatype,
    ) -> Arc<Self> {
        let value = value.filter(|id| initial.iter().any(|choice| &choice.id == id));
        Arc::new(Self {
            id: WidgetId::random(),
            backend,
            datatype,
            initial: initial.clone(),
            initial_value: value.clone(),
            static_tags: HashSet::new(),
            inner: Mutex::new(SelectState {
                choices: initial,
                value,
                template: None,
                fetch_seq: 0,
                ready: true,
            }),
            events: event_channel(),
        })
    }

    /// Remote-sourced select. The first fetch happens on `reload` (or
    /// `fill`), not at construction.
    pub fn remote(
        backend: Arc<dyn Backend>,
        url_template: &str,
        initial: Vec<Choice>,
        value: Option<ChoiceId>,
        datatype: Datatype,
    ) -> Arc<Self> {
        let template = UrlTemplate::new(url_template);
        let value = value.filter(|id| initial.iter().any(|choice| &choice.id == id));
        Arc::new(Self {
            id: WidgetId::random(),
            backend,
            datatype,
            initial: initial.clone(),
            initial_value: value.clone(),
            static_tags: template.tags().clone(),
            inner: Mutex::new(SelectState {
                choices: initial,
                value,
                template: Some(template),
                fetch_seq: 0,
                ready: true,
            }),
            events: event_channel(),
        })
    }

    pub async fn choices(&self) -> Vec<Choice> {
        self.inner.lock().await.choices.clone()
    }

    pub async fn selected(&self) -> Option<Choice> {
        let state = self.inner.lock().await;
        let value = state.value.as_ref()?;
        state
            .choices
            .iter()
            .find(|choice| &choice.id == value)
            .cloned()
    }

    /// Disabled while at most one choice is offered.
    pub async fn is_disabled(&self) -> bool {
        self.inner.lock().await.choices.len() <= 1
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.ready
    }

    pub async fn url(&self) -> Option<Result<String, WidgetError>> {
        let state = self.inner.lock().await;
        state
            .template
            .as_ref()
            .map(|template| template.render().map_err(WidgetError::from))
    }

    /// Populate choices from a static list or a remote source. A remote
    /// source replaces the widget's template and fetches immediately.
    pub async fn fill(&self, source: ChoiceSource) -> Result<(), WidgetError> {
        match source {
            ChoiceSource::Static(choices) => {
                let old = {
                    let mut state = self.inner.lock().await;
                    let old = state.value.clone();
                    Self::apply_choices(&mut state, choices);
                    old
                };
                self.notify_if_changed(old).await;
                Ok(())
            }
            ChoiceSource::Remote(raw) => {
                {
                    let mut state = self.inner.lock().await;
                    state.template = Some(UrlTemplate::new(&raw));
                }
                self.reload_now(&HashMap::new()).await
            }
        }
    }

    /// The stored value through the declared datatype: `Json` parses the
    /// identifier text and malformed JSON is a hard error.
    pub async fn cleaned_value(&self) -> Result<serde_json::Value, WidgetError> {
        let state = self.inner.lock().await;
        let Some(value) = state.value.as_ref() else {
            return Ok(serde_json::Value::Null);
        };
        match self.datatype {
            Datatype::Text => Ok(serde_json::Value::String(value.0.clone())),
            Datatype::Json => serde_json::from_str(&value.0).map_err(|err| {
                WidgetError::invalid_value(format!("malformed json value {:?}: {err}", value.0))
            }),
        }
    }

    pub async fn update_json(&self, raw: &str) -> Result<(), WidgetError> {
        let patch = UpdatePatch::parse(raw)
            .map_err(|err| WidgetError::invalid_payload(format!("malformed patch: {err}")))?;
        self.apply_update(patch).await
    }

    async fn apply_update(&self, patch: UpdatePatch) -> Result<(), WidgetError> {
        let old = {
            let mut state = self.inner.lock().await;
            let old = state.value.clone();

            for removed in &patch.removed {
                state.choices.retain(|choice| &choice.id != removed);
            }
            for added in patch.added {
                state.choices.push(added.into_choice());
            }

            if let Some(value) = patch.value {
                state.value = Some(value);
            }
            let resolved = Self::resolve(&state.choices, state.value.clone());
            state.value = resolved;
            old
        };
        self.notify_if_changed(old).await;
        Ok(())
    }

    async fn set_single(&self, value: Option<ChoiceId>) -> Result<(), WidgetError> {
        let old = {
            let mut state = self.inner.lock().await;
            let old = state.value.clone();
            state.value = Self::resolve(&state.choices, value);
            old
        };
        self.notify_if_changed(old).await;
        Ok(())
    }

    async fn reload_now(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<(), WidgetError> {
        let (url, seq) = {
            let mut state = self.inner.lock().await;
            let Some(template) = state.template.as_mut() else {
                return Ok(());
            };
            template.update(params);
            let rendered = template.render();
            state.fetch_seq += 1;
            let seq = state.fetch_seq;
            match rendered {
                Ok(url) => {
                    state.ready = false;
                    (url, seq)
                }
                Err(err) => {
                    // Unrenderable URL: same recovery as a failed fetch.
                    let old = state.value.clone();
                    Self::restore_initial(&mut state, &self.initial, &self.initial_value);
                    drop(state);
                    self.notify_if_changed(old).await;
                    return Err(err.into());
                }
            }
        };

        let result = self.backend.get(&url).await;

        let mut state = self.inner.lock().await;
        if state.fetch_seq != seq {
            debug!("widget: stale choice fetch discarded url={url}");
            return Ok(());
        }
        state.ready = true;

        match result {
            Ok(payload) => {
                let choices = match parse_choice_rows(payload) {
                    Ok(choices) => choices,
                    Err(err) => {
                        let old = state.value.clone();
                        Self::restore_initial(&mut state, &self.initial, &self.initial_value);
                        drop(state);
                        self.notify_if_changed(old).await;
                        return Err(WidgetError::invalid_payload(format!(
                            "choice rows from {url}: {err}"
                        )));
                    }
                };
                let old = state.value.clone();
                Self::apply_choices(&mut state, choices);
                drop(state);
                let _ = self.events.send(WidgetEvent::ChoicesReloaded {
                    widget: self.id,
                    url,
                });
                self.notify_if_changed(old).await;
                Ok(())
            }
            Err(error) => {
                let old = state.value.clone();
                Self::restore_initial(&mut state, &self.initial, &self.initial_value);
                drop(state);
                self.notify_if_changed(old).await;
                Err(error.into())
            }
        }
    }

    fn resolve(choices: &[Choice], value: Option<ChoiceId>) -> Option<ChoiceId> {
        value.filter(|id| choices.iter().any(|choice| &choice.id == id))
    }

    /// Replace the whole choice set; the selection survives when still
    /// offered, otherwise it falls back to the first choice.
    fn apply_choices(state: &mut SelectState, choices: Vec<Choice>) {
        let kept = Self::resolve(&choices, state.value.clone());
        state.value = kept.or_else(|| choices.first().map(|choice| choice.id.clone()));
        state.choices = choices;
    }

    fn restore_initial(state: &mut SelectState, initial: &[Choice], value: &Option<ChoiceId>) {
        state.choices = initial.to_vec();
        state.value = value.clone();
    }

    async fn notify_if_changed(&self, old: Option<ChoiceId>) {
        let new = self.inner.lock().await.value.clone();
        if new != old {
            let _ = self.events.send(WidgetEvent::ValueChanged {
                widget: self.id,
                value: WidgetValue::from(new),
            });
        }
    }
}

#[async_trait]
impl Widget for DynamicSelect {
    fn id(&self) -> WidgetId {
        self.id
    }

    async fn value(&self) -> WidgetValue {
        WidgetValue::from(self.inner.lock().await.value.clone())
    }

    async fn set_value(&self, value: WidgetValue) -> Result<(), WidgetError> {
        match value {
            WidgetValue::Empty => self.set_single(None).await,
            WidgetValue::Single(id) => self.set_single(Some(id)).await,
            WidgetValue::Multiple(mut ids) if ids.len() <= 1 => {
                self.set_single(ids.pop()).await
            }
            WidgetValue::Multiple(_) => Err(WidgetError::invalid_value(
                "dynamic select holds a single value",
            )),
        }
    }

    async fn update(&self, patch: UpdatePatch) -> Result<(), WidgetError> {
        self.apply_update(patch).await
    }

    async fn reload(&self, params: &HashMap<String, String>) -> Result<(), WidgetError> {
        self.reload_now(params).await
    }

    fn dependencies(&self) -> HashSet<String> {
        self.static_tags.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }
}
