use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{Choice, ChoiceId, SelectionMode},
    error::FetchError,
    protocol::{parse_choice_rows, parse_label_rows, UpdatePatch},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use transport::Backend;

use crate::{
    event_channel, expression::Expression, template::UrlTemplate, Widget, WidgetError,
    WidgetEvent, WidgetId, WidgetValue,
};

/// Validity window of the shared label-lookup cache.
pub const LABEL_CACHE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub url: String,
    pub mode: SelectionMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Selected(Vec<ChoiceId>),
    Cancelled,
}

/// Seam to the modal list-view picker. Implementations own the whole
/// popup interaction and come back with confirmed ids or a cancellation.
#[async_trait]
pub trait SelectionDialog: Send + Sync {
    async fn select(&self, request: SelectionRequest) -> Result<SelectionOutcome, WidgetError>;
}

pub struct MissingSelectionDialog;

#[async_trait]
impl SelectionDialog for MissingSelectionDialog {
    async fn select(&self, request: SelectionRequest) -> Result<SelectionOutcome, WidgetError> {
        Err(WidgetError::Fetch(FetchError::network(format!(
            "no selection dialog configured for {}",
            request.url
        ))))
    }
}

type Chooser = dyn Fn(&[Choice]) -> Option<Vec<ChoiceId>> + Send + Sync;

/// Headless list view: fetches the candidate rows behind the popup URL
/// with a form-encoded POST and delegates the pick to a chooser closure.
/// A `None` pick is a cancellation.
pub struct ListViewDialog {
    backend: Arc<dyn Backend>,
    chooser: Box<Chooser>,
}

impl ListViewDialog {
    pub fn new<F>(backend: Arc<dyn Backend>, chooser: F) -> Self
    where
        F: Fn(&[Choice]) -> Option<Vec<ChoiceId>> + Send + Sync + 'static,
    {
        Self {
            backend,
            chooser: Box::new(chooser),
        }
    }
}

#[async_trait]
impl SelectionDialog for ListViewDialog {
    async fn select(&self, request: SelectionRequest) -> Result<SelectionOutcome, WidgetError> {
        let fields = vec![(
            "selection".to_string(),
            match request.mode {
                SelectionMode::Single => "single".to_string(),
                SelectionMode::Multiple => "multiple".to_string(),
            },
        )];
        let payload = self.backend.post_form(&request.url, &fields).await?;
        let rows = parse_choice_rows(payload).map_err(|err| {
            WidgetError::invalid_payload(format!("list view rows from {}: {err}", request.url))
        })?;
        match (self.chooser)(&rows) {
            Some(ids) if !ids.is_empty() => Ok(SelectionOutcome::Selected(ids)),
            _ => Ok(SelectionOutcome::Cancelled),
        }
    }
}

#[derive(Clone, Default)]
pub enum QFilter {
    #[default]
    None,
    Literal(String),
    Expr(Expression),
}

#[derive(Clone)]
pub struct EntitySelectorOptions {
    pub popup_url: String,
    pub label_url: String,
    pub label: String,
    pub qfilter: QFilter,
    pub mode: SelectionMode,
    pub auto_popup: bool,
    pub enabled: bool,
}

impl Default for EntitySelectorOptions {
    fn default() -> Self {
        Self {
            popup_url: String::new(),
            label_url: String::new(),
            label: "Select".to_string(),
            qfilter: QFilter::None,
            mode: SelectionMode::Single,
            auto_popup: false,
            enabled: true,
        }
    }
}

struct SelectorState {
    value: Option<ChoiceId>,
    label: String,
    popup: UrlTemplate,
    label_seq: u64,
}

/// Popup-based entity picker. The control itself stays single-valued;
/// multiple selection grows the surrounding `SelectorList` instead.
pub struct EntitySelector {
    id: WidgetId,
    backend: Arc<dyn Backend>,
    dialog: Arc<dyn SelectionDialog>,
    options: EntitySelectorOptions,
    static_tags: HashSet<String>,
    inner: Mutex<SelectorState>,
    events: broadcast::Sender<WidgetEvent>,
}

impl EntitySelector {
    /// `backend` serves label lookups and is expected to be the shared
    /// cached backend (`LABEL_CACHE_TTL`) of the page.
    pub fn new(
        backend: Arc<dyn Backend>,
        dialog: Arc<dyn SelectionDialog>,
        options: EntitySelectorOptions,
    ) -> Arc<Self> {
        let mut popup = UrlTemplate::new(&options.popup_url);
        popup.set(
            "selection",
            match options.mode {
                SelectionMode::Single => "single",
                SelectionMode::Multiple => "multiple",
            },
        );
        match &options.qfilter {
            QFilter::None => {
                if popup.tags().contains("qfilter") {
                    popup.set("qfilter", "");
                }
            }
            QFilter::Literal(text) => popup.set("qfilter", text.clone()),
            QFilter::Expr(expr) => {
                // Context-free expressions resolve right away; the rest
                // wait for the first reload to supply their variables.
                if let Ok(text) = expr.eval_to_string(&HashMap::new()) {
                    popup.set("qfilter", text);
                }
            }
        }

        let mut static_tags = popup.unresolved();
        if let QFilter::Expr(expr) = &options.qfilter {
            // The filter tag is fed by the expression, whose variables are
            // the real dependencies.
            static_tags.remove("qfilter");
            static_tags.extend(expr.variables());
        }
        let label = options.label.clone();
        Arc::new(Self {
            id: WidgetId::random(),
            backend,
            dialog,
            options,
            static_tags,
            inner: Mutex::new(SelectorState {
                value: None,
                label,
                popup,
                label_seq: 0,
            }),
            events: event_channel(),
        })
    }

    pub fn is_multiple(&self) -> bool {
        self.options.mode.is_multiple()
    }

    pub fn is_auto_popup(&self) -> bool {
        self.options.auto_popup
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    pub async fn label(&self) -> String {
        self.inner.lock().await.label.clone()
    }

    pub async fn popup_url(&self) -> Result<String, WidgetError> {
        Ok(self.inner.lock().await.popup.render()?)
    }

    pub async fn set_qfilter(&self, text: impl Into<String>) {
        self.inner.lock().await.popup.set("qfilter", text);
    }

    pub async fn reset(&self) {
        self.set_single(None).await;
    }

    /// Run the picker. A disabled control ignores the click; cancellation
    /// and empty confirmations leave the prior value untouched.
    pub async fn open(&self) -> Result<SelectionOutcome, WidgetError> {
        if !self.options.enabled {
            debug!("widget: picker ignored on disabled selector");
            return Ok(SelectionOutcome::Cancelled);
        }

        let url = { self.inner.lock().await.popup.render()? };
        let outcome = self
            .dialog
            .select(SelectionRequest {
                url,
                mode: self.options.mode,
            })
            .await?;

        match outcome {
            SelectionOutcome::Selected(ids) if !ids.is_empty() => {
                self.set_single(Some(ids[0].clone())).await;
                Ok(SelectionOutcome::Selected(ids))
            }
            _ => Ok(SelectionOutcome::Cancelled),
        }
    }

    async fn set_single(&self, value: Option<ChoiceId>) {
        let (changed, seq) = {
            let mut state = self.inner.lock().await;
            let changed = state.value != value;
            state.value = value.clone();
            state.label_seq += 1;
            (changed, state.label_seq)
        };

        if changed {
            let _ = self.events.send(WidgetEvent::ValueChanged {
                widget: self.id,
                value: WidgetValue::from(value.clone()),
            });
        }

        self.resolve_label(value, seq).await;
    }

    /// Second remote lookup for the display text. Failures fall back to
    /// the placeholder label and surface once as an event; the stored
    /// value is never touched from here.
    async fn resolve_label(&self, value: Option<ChoiceId>, seq: u64) {
        let resolved = match value {
            None => None,
            Some(id) => {
                let mut template = UrlTemplate::new(&self.options.label_url);
                template.set("id", id.as_str());
                match template.render() {
                    Ok(url) => match self.backend.get(&url).await {
                        Ok(payload) => match parse_label_rows(&payload) {
                            Some(text) => Some(text),
                            None => {
                                warn!("widget: label payload from {url} had no usable row");
                                let _ = self.events.send(WidgetEvent::FetchFailed {
                                    widget: self.id,
                                    error: FetchError::new(200, "label payload had no usable row"),
                                });
                                None
                            }
                        },
                        Err(error) => {
                            let _ = self.events.send(WidgetEvent::FetchFailed {
                                widget: self.id,
                                error,
                            });
                            None
                        }
                    },
                    Err(err) => {
                        warn!("widget: label url unrenderable: {err}");
                        None
                    }
                }
            }
        };

        let mut state = self.inner.lock().await;
        if state.label_seq != seq {
            debug!("widget: stale label lookup discarded");
            return;
        }
        state.label = resolved.unwrap_or_else(|| self.options.label.clone());
    }
}

#[async_trait]
impl Widget for EntitySelector {
    fn id(&self) -> WidgetId {
        self.id
    }

    async fn value(&self) -> WidgetValue {
        WidgetValue::from(self.inner.lock().await.value.clone())
    }

    async fn set_value(&self, value: WidgetValue) -> Result<(), WidgetError> {
        match value {
            WidgetValue::Empty => {
                self.set_single(None).await;
                Ok(())
            }
            WidgetValue::Single(id) => {
                self.set_single(Some(id)).await;
                Ok(())
            }
            WidgetValue::Multiple(mut ids) if ids.len() <= 1 => {
                self.set_single(ids.pop()).await;
                Ok(())
            }
            WidgetValue::Multiple(_) => Err(WidgetError::invalid_value(
                "entity selector holds a single id; grow a selector list instead",
            )),
        }
    }

    async fn update(&self, patch: UpdatePatch) -> Result<(), WidgetError> {
        if let Some(value) = patch.value {
            self.set_single(Some(value)).await;
        }
        Ok(())
    }

    /// New tag values invalidate the current selection: the popup URL now
    /// describes a different entity population.
    async fn reload(&self, params: &HashMap<String, String>) -> Result<(), WidgetError> {
        {
            let mut state = self.inner.lock().await;
            state.popup.update(params);
            if let QFilter::Expr(expr) = &self.options.qfilter {
                let ctx: HashMap<String, serde_json::Value> = params
                    .iter()
                    .map(|(name, value)| {
                        (name.clone(), serde_json::Value::String(value.clone()))
                    })
                    .collect();
                match expr.eval_to_string(&ctx) {
                    Ok(text) => state.popup.set("qfilter", text),
                    // A missing input keeps the filter tag unresolved, the
                    // same incompleteness a bare template would report.
                    Err(crate::ExpressionError::UnknownVariable(_)) => {
                        state.popup.unset("qfilter");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        self.set_single(None).await;
        Ok(())
    }

    fn dependencies(&self) -> HashSet<String> {
        self.static_tags.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }
}

type SelectorFactory = dyn Fn() -> Arc<EntitySelector> + Send + Sync;

/// Container of sibling entity selectors. Keeps each control
/// single-valued while the list grows with every extra picked id, and
/// drives the auto-popup flow for appended members.
pub struct SelectorList {
    id: WidgetId,
    factory: Box<SelectorFactory>,
    selectors: Mutex<Vec<Arc<EntitySelector>>>,
    events: broadcast::Sender<WidgetEvent>,
}

impl SelectorList {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<EntitySelector> + Send + Sync + 'static,
    {
        Self {
            id: WidgetId::random(),
            factory: Box::new(factory),
            selectors: Mutex::new(Vec::new()),
            events: event_channel(),
        }
    }

    pub fn id(&self) -> WidgetId {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.events.subscribe()
    }

    pub async fn append(&self) -> Arc<EntitySelector> {
        let selector = (self.factory)();
        self.selectors.lock().await.push(Arc::clone(&selector));
        let _ = self.events.send(WidgetEvent::SelectorAppended {
            widget: selector.id(),
        });
        selector
    }

    pub async fn append_with_value(&self, id: ChoiceId) -> Arc<EntitySelector> {
        let selector = self.append().await;
        selector.set_single(Some(id)).await;
        selector
    }

    pub async fn remove(&self, widget: WidgetId) -> bool {
        let mut selectors = self.selectors.lock().await;
        let before = selectors.len();
        selectors.retain(|selector| selector.id() != widget);
        let removed = selectors.len() < before;
        drop(selectors);
        if removed {
            let _ = self.events.send(WidgetEvent::SelectorRemoved { widget });
        }
        removed
    }

    pub async fn selectors(&self) -> Vec<Arc<EntitySelector>> {
        self.selectors.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.selectors.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.selectors.lock().await.is_empty()
    }

    pub async fn values(&self) -> Vec<ChoiceId> {
        let selectors = self.selectors().await;
        let mut values = Vec::new();
        for selector in selectors {
            if let WidgetValue::Single(id) = selector.value().await {
                values.push(id);
            }
        }
        values
    }

    /// Open the picker of one member. In multiple mode every id beyond
    /// the first becomes a fresh sibling holding exactly that id.
    pub async fn open(&self, widget: WidgetId) -> Result<SelectionOutcome, WidgetError> {
        let Some(selector) = self
            .selectors
            .lock()
            .await
            .iter()
            .find(|selector| selector.id() == widget)
            .cloned()
        else {
            return Ok(SelectionOutcome::Cancelled);
        };

        let outcome = selector.open().await?;
        if let SelectionOutcome::Selected(ids) = &outcome {
            if selector.is_multiple() && ids.len() > 1 {
                for extra in &ids[1..] {
                    self.append_with_value(extra.clone()).await;
                }
            }
        }
        Ok(outcome)
    }

    /// Append a member and run its auto-popup: a selector mounting empty
    /// opens the picker immediately, and cancelling without a pick takes
    /// it out of the list again.
    pub async fn append_and_open(&self) -> Result<Option<Arc<EntitySelector>>, WidgetError> {
        let selector = self.append().await;
        if !selector.is_auto_popup() || !selector.value().await.is_empty() {
            return Ok(Some(selector));
        }

        let outcome = self.open(selector.id()).await?;
        if outcome == SelectionOutcome::Cancelled && selector.value().await.is_empty() {
            self.remove(selector.id()).await;
            return Ok(None);
        }
        Ok(Some(selector))
    }
}
