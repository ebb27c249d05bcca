use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ChoiceId, SelectionMode},
    protocol::parse_choice_rows,
};
use transport::{Backend, CachedBackend};

use crate::{
    dselect::{Datatype, DynamicSelect},
    entity_selector::{
        EntitySelector, EntitySelectorOptions, QFilter, SelectionDialog, LABEL_CACHE_TTL,
    },
    expression::Expression,
    ordered::OrderedMultiSelect,
    Widget, WidgetError,
};

/// Descriptor of a control to build: a kind marker plus the configuration
/// attributes carried by the mount point.
#[derive(Debug, Clone)]
pub struct ControlSpec {
    pub kind: String,
    pub attributes: HashMap<String, String>,
}

impl ControlSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn require(&self, name: &'static str) -> Result<&str, WidgetError> {
        self.attribute(name)
            .ok_or(WidgetError::MissingAttribute(name))
    }
}

pub type WidgetFactory =
    Box<dyn Fn(&ControlSpec) -> Result<Arc<dyn Widget>, WidgetError> + Send + Sync>;

/// Explicit factory map from kind markers to constructors. Passed to the
/// code assembling a page; nothing here is process-wide.
#[derive(Default)]
pub struct WidgetRegistry {
    factories: HashMap<String, WidgetFactory>,
}

impl WidgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: WidgetFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, spec: &ControlSpec) -> Result<Arc<dyn Widget>, WidgetError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| WidgetError::UnknownKind(spec.kind.clone()))?;
        factory(spec)
    }
}

fn spec_choices(spec: &ControlSpec, attribute: &str) -> Result<Vec<shared::domain::Choice>, WidgetError> {
    let Some(raw) = spec.attribute(attribute) else {
        return Ok(Vec::new());
    };
    let payload: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| WidgetError::invalid_payload(format!("{attribute} attribute: {err}")))?;
    parse_choice_rows(payload)
        .map_err(|err| WidgetError::invalid_payload(format!("{attribute} attribute: {err}")))
}

fn spec_datatype(spec: &ControlSpec) -> Result<Datatype, WidgetError> {
    match spec.attribute("datatype") {
        None | Some("text") => Ok(Datatype::Text),
        Some("json") => Ok(Datatype::Json),
        Some(other) => Err(WidgetError::invalid_value(format!(
            "unknown datatype {other:?}"
        ))),
    }
}

fn spec_flag(spec: &ControlSpec, name: &str) -> bool {
    matches!(spec.attribute(name), Some("true") | Some("1"))
}

/// Registry covering the stock widget kinds. `backend` serves choice and
/// list-view fetches; label lookups go through one shared cache.
pub fn standard_registry(
    backend: Arc<dyn Backend>,
    dialog: Arc<dyn SelectionDialog>,
) -> WidgetRegistry {
    standard_registry_with(backend, dialog, LABEL_CACHE_TTL)
}

/// Same registry with the label cache window taken from configuration
/// (`ClientSettings::label_cache_ttl`).
pub fn standard_registry_with(
    backend: Arc<dyn Backend>,
    dialog: Arc<dyn SelectionDialog>,
    label_cache_ttl: std::time::Duration,
) -> WidgetRegistry {
    let label_backend: Arc<dyn Backend> =
        CachedBackend::shared(Arc::clone(&backend), label_cache_ttl);

    let mut registry = WidgetRegistry::new();

    let select_backend = Arc::clone(&backend);
    registry.register(
        "dselect",
        Box::new(move |spec| {
            let choices = spec_choices(spec, "choices")?;
            let value = spec.attribute("value").map(ChoiceId::from);
            let datatype = spec_datatype(spec)?;
            let widget = match spec.attribute("url") {
                Some(url) => DynamicSelect::remote(
                    Arc::clone(&select_backend),
                    url,
                    choices,
                    value,
                    datatype,
                ),
                None => DynamicSelect::with_initial_value(
                    Arc::clone(&select_backend),
                    choices,
                    value,
                    datatype,
                ),
            };
            Ok(widget as Arc<dyn Widget>)
        }),
    );

    registry.register(
        "entityselector",
        Box::new(move |spec| {
            let qfilter = if let Some(raw) = spec.attribute("qfilter_expr") {
                QFilter::Expr(Expression::parse(raw)?)
            } else if let Some(text) = spec.attribute("qfilter") {
                QFilter::Literal(text.to_string())
            } else {
                QFilter::None
            };
            let mode = match spec.attribute("mode") {
                None | Some("single") => SelectionMode::Single,
                Some("multiple") => SelectionMode::Multiple,
                Some(other) => {
                    return Err(WidgetError::invalid_value(format!(
                        "unknown selection mode {other:?}"
                    )))
                }
            };
            let options = EntitySelectorOptions {
                popup_url: spec.require("popup_url")?.to_string(),
                label_url: spec.require("label_url")?.to_string(),
                label: spec
                    .attribute("label")
                    .unwrap_or("Select")
                    .to_string(),
                qfilter,
                mode,
                auto_popup: spec_flag(spec, "auto"),
                enabled: !spec_flag(spec, "disabled"),
            };
            let widget =
                EntitySelector::new(Arc::clone(&label_backend), Arc::clone(&dialog), options);
            Ok(widget as Arc<dyn Widget>)
        }),
    );

    registry.register(
        "ordered",
        Box::new(move |spec| {
            let choices = spec_choices(spec, "choices")?;
            let value = spec.attribute("value").unwrap_or("[]");
            let widget = OrderedMultiSelect::new(choices, value)?;
            Ok(widget as Arc<dyn Widget>)
        }),
    );

    registry
}
