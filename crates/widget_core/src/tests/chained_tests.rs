use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use shared::domain::{Choice, ChoiceId, SelectionMode};
use transport::{Backend, MockBackend};

use crate::{
    chained::ChainedSelects,
    dselect::{Datatype, DynamicSelect},
    entity_selector::{
        EntitySelector, EntitySelectorOptions, SelectionDialog, SelectionOutcome,
        SelectionRequest,
    },
    Widget, WidgetError, WidgetValue,
};

struct CancellingDialog;

#[async_trait]
impl SelectionDialog for CancellingDialog {
    async fn select(&self, _request: SelectionRequest) -> Result<SelectionOutcome, WidgetError> {
        Ok(SelectionOutcome::Cancelled)
    }
}

fn cancelling_dialog() -> Arc<dyn SelectionDialog> {
    Arc::new(CancellingDialog)
}

fn static_select(backend: &Arc<MockBackend>, pairs: &[(&str, &str)]) -> Arc<DynamicSelect> {
    DynamicSelect::new(
        Arc::clone(backend) as Arc<dyn Backend>,
        pairs.iter().map(|pair| Choice::from(*pair)).collect(),
    )
}

fn remote_select(backend: &Arc<MockBackend>, template: &str) -> Arc<DynamicSelect> {
    DynamicSelect::remote(
        Arc::clone(backend) as Arc<dyn Backend>,
        template,
        Vec::new(),
        None,
        Datatype::Text,
    )
}

#[tokio::test]
async fn changing_one_member_reloads_its_dependents_once() {
    let backend = Arc::new(MockBackend::new());
    backend
        .stub_get("/cities?country=42", json!([["5", "Lyon"], ["6", "Nice"]]))
        .await;

    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    chain.insert(
        "city",
        remote_select(&backend, "/cities?country=${country}"),
    );

    let report = chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");
    assert!(report.is_clean());

    assert_eq!(backend.call_count("/cities?country=42").await, 1);
    assert_eq!(backend.calls().await.len(), 1);
    let city = chain.widget("city").expect("member");
    assert_eq!(city.value().await, WidgetValue::single("5"));
}

#[tokio::test]
async fn members_without_the_changed_dependency_stay_untouched() {
    let backend = Arc::new(MockBackend::new());
    backend
        .stub_get("/cities?country=42", json!([["5", "Lyon"]]))
        .await;

    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    chain.insert("city", remote_select(&backend, "/cities?country=${country}"));
    chain.insert(
        "sector",
        remote_select(&backend, "/sectors?industry=${industry}"),
    );

    chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");

    // Only the city fetch happened; the sector widget has no changed
    // dependency and was never reloaded.
    assert_eq!(backend.calls().await.len(), 1);
    assert_eq!(
        chain.widget("sector").expect("member").value().await,
        WidgetValue::Empty
    );
}

#[tokio::test]
async fn reload_value_changes_cascade_to_transitive_dependents() {
    let backend = Arc::new(MockBackend::new());
    backend
        .stub_get("/regions?country=42", json!([["r1", "Rhone"]]))
        .await;
    backend
        .stub_get("/cities?region=r1", json!([["5", "Lyon"]]))
        .await;

    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    chain.insert(
        "region",
        remote_select(&backend, "/regions?country=${country}"),
    );
    chain.insert("city", remote_select(&backend, "/cities?region=${region}"));

    let report = chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");
    assert!(report.is_clean());

    assert_eq!(
        chain.widget("region").expect("member").value().await,
        WidgetValue::single("r1")
    );
    assert_eq!(
        chain.widget("city").expect("member").value().await,
        WidgetValue::single("5")
    );
}

#[tokio::test]
async fn failed_dependent_reloads_are_reported_not_fatal() {
    let backend = Arc::new(MockBackend::new());
    backend
        .stub_get_error("/cities?country=42", 500, "city endpoint down")
        .await;
    backend
        .stub_get("/regions?country=42", json!([["r1", "Rhone"]]))
        .await;
    backend
        .stub_get("/cities?region=r1", json!([]))
        .await;

    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    chain.insert(
        "broken_city",
        remote_select(&backend, "/cities?country=${country}"),
    );
    chain.insert(
        "region",
        remote_select(&backend, "/regions?country=${country}"),
    );

    let report = chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "broken_city");
    // The healthy sibling still reloaded.
    assert_eq!(
        chain.widget("region").expect("member").value().await,
        WidgetValue::single("r1")
    );
}

#[tokio::test]
async fn setting_an_unchanged_value_propagates_nothing() {
    let backend = Arc::new(MockBackend::new());

    let mut chain = ChainedSelects::new();
    let country = DynamicSelect::with_initial_value(
        Arc::clone(&backend) as Arc<dyn Backend>,
        vec![Choice::new("41", "Spain"), Choice::new("42", "France")],
        Some(ChoiceId::new("42")),
        Datatype::Text,
    );
    chain.insert("country", country);
    chain.insert("city", remote_select(&backend, "/cities?country=${country}"));

    let report = chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");
    assert!(report.is_clean());
    assert!(backend.calls().await.is_empty());
}

#[tokio::test]
async fn context_skips_empty_members() {
    let backend = Arc::new(MockBackend::new());
    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    chain.insert("city", remote_select(&backend, "/cities?country=${country}"));

    let country = chain.widget("country").expect("member");
    country
        .set_value(WidgetValue::single("41"))
        .await
        .expect("set");

    let context = chain.context().await;
    assert_eq!(context.get("country").map(String::as_str), Some("41"));
    assert!(!context.contains_key("city"));
}

#[tokio::test]
async fn unknown_member_name_is_an_error() {
    let chain = ChainedSelects::new();
    assert!(chain
        .set_value("nowhere", WidgetValue::single("1"))
        .await
        .is_err());
}

#[tokio::test]
async fn an_entity_selector_member_resets_when_its_dependency_changes() {
    let backend = Arc::new(MockBackend::new());
    backend.stub_get("/labels/7", json!([["Seven"]])).await;

    let mut chain = ChainedSelects::new();
    chain.insert(
        "country",
        static_select(&backend, &[("41", "Spain"), ("42", "France")]),
    );
    let contact = EntitySelector::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        cancelling_dialog(),
        EntitySelectorOptions {
            popup_url: "/popup?country=${country}&selection=${selection}".to_string(),
            label_url: "/labels/${id}".to_string(),
            mode: SelectionMode::Single,
            ..EntitySelectorOptions::default()
        },
    );
    contact
        .set_value(WidgetValue::single("7"))
        .await
        .expect("seed");
    chain.insert("contact", contact.clone());

    chain
        .set_value("country", WidgetValue::single("42"))
        .await
        .expect("set");

    assert_eq!(contact.value().await, WidgetValue::Empty);
    assert_eq!(
        contact.popup_url().await.expect("render"),
        "/popup?country=42&selection=single"
    );
}
