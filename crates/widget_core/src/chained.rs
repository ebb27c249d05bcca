use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::future::join_all;
use tracing::warn;

use crate::{
    registry::{ControlSpec, WidgetRegistry},
    Widget, WidgetError, WidgetValue,
};

/// Failed member reloads from one propagation pass. Propagation keeps
/// going past failures; each one is surfaced here exactly once.
#[derive(Default)]
pub struct PropagationReport {
    pub failed: Vec<(String, WidgetError)>,
}

impl PropagationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Named widgets sharing one parameter context. When a member's value
/// changes, every other member whose dependencies intersect the changed
/// keys is reloaded; value changes caused by those reloads cascade in
/// waves until the context settles.
pub struct ChainedSelects {
    members: Vec<(String, Arc<dyn Widget>)>,
}

impl ChainedSelects {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, widget: Arc<dyn Widget>) {
        self.members.push((name.into(), widget));
    }

    pub fn from_specs(
        registry: &WidgetRegistry,
        specs: &[(String, ControlSpec)],
    ) -> Result<Self, WidgetError> {
        let mut chain = Self::new();
        for (name, spec) in specs {
            chain.insert(name.clone(), registry.create(spec)?);
        }
        Ok(chain)
    }

    pub fn widget(&self, name: &str) -> Option<&Arc<dyn Widget>> {
        self.members
            .iter()
            .find(|(member, _)| member == name)
            .map(|(_, widget)| widget)
    }

    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Current name → rendered-value context fed into member templates.
    /// Empty members contribute nothing, keeping strict templates
    /// incomplete until their inputs exist.
    pub async fn context(&self) -> HashMap<String, String> {
        let mut context = HashMap::new();
        for (name, widget) in &self.members {
            if let Some(rendered) = widget.value().await.render() {
                context.insert(name.clone(), rendered);
            }
        }
        context
    }

    pub async fn values(&self) -> HashMap<String, WidgetValue> {
        let mut values = HashMap::new();
        for (name, widget) in &self.members {
            values.insert(name.clone(), widget.value().await);
        }
        values
    }

    /// Set one member's value and propagate to its dependents.
    pub async fn set_value(
        &self,
        name: &str,
        value: WidgetValue,
    ) -> Result<PropagationReport, WidgetError> {
        let widget = self
            .widget(name)
            .ok_or_else(|| WidgetError::UnknownMember(name.to_string()))?;
        let before = widget.value().await;
        widget.set_value(value).await?;
        if widget.value().await == before {
            return Ok(PropagationReport::default());
        }
        Ok(self.propagate(HashSet::from([name.to_string()])).await)
    }

    /// Breadth-first propagation: reload every member depending on a
    /// changed key, collect the members whose values changed in turn, and
    /// repeat. Each member reloads at most once per pass, so cyclic
    /// dependency declarations terminate.
    pub async fn propagate(&self, changed: HashSet<String>) -> PropagationReport {
        let mut report = PropagationReport::default();
        let mut wave = changed;
        let mut reloaded: HashSet<String> = HashSet::new();

        while !wave.is_empty() {
            let context = self.context().await;
            let mut targets = Vec::new();
            for (name, widget) in &self.members {
                if wave.contains(name) || reloaded.contains(name) {
                    continue;
                }
                if widget.dependencies().is_disjoint(&wave) {
                    continue;
                }
                targets.push((name.clone(), Arc::clone(widget)));
            }

            if targets.is_empty() {
                break;
            }

            let reloads = targets.iter().map(|(name, widget)| {
                let context = &context;
                async move {
                    let before = widget.value().await;
                    let result = widget.reload(context).await;
                    let after = widget.value().await;
                    (name.clone(), result, before != after)
                }
            });

            let mut next_wave = HashSet::new();
            for (name, result, value_changed) in join_all(reloads).await {
                reloaded.insert(name.clone());
                if let Err(error) = result {
                    warn!("widget: chained reload failed member={name}: {error}");
                    report.failed.push((name.clone(), error));
                }
                if value_changed {
                    next_wave.insert(name);
                }
            }
            wave = next_wave;
        }

        report
    }
}

impl Default for ChainedSelects {
    fn default() -> Self {
        Self::new()
    }
}
