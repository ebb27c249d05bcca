use std::{
    collections::{HashMap, HashSet},
    sync::OnceLock,
};

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unresolved template tag: {0}")]
    MissingTag(String),
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("tag pattern"))
}

/// Parametrized URL with `${tag}` placeholders. The raw text never
/// changes after construction; `update` only merges tag values, and every
/// `render` re-substitutes from the current values.
#[derive(Debug, Clone)]
pub struct UrlTemplate {
    raw: String,
    tags: HashSet<String>,
    params: HashMap<String, String>,
}

impl UrlTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let tags = tag_pattern()
            .captures_iter(&raw)
            .map(|captures| captures[1].to_string())
            .collect();
        Self {
            raw,
            tags,
            params: HashMap::new(),
        }
    }

    pub fn with_params(raw: impl Into<String>, params: HashMap<String, String>) -> Self {
        let mut template = Self::new(raw);
        template.params = params;
        template
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) {
        self.params.remove(name);
    }

    pub fn update(&mut self, params: &HashMap<String, String>) {
        for (name, value) in params {
            self.params.insert(name.clone(), value.clone());
        }
    }

    /// Tags that still have no value. Rendering succeeds iff this is empty.
    pub fn unresolved(&self) -> HashSet<String> {
        self.tags
            .iter()
            .filter(|tag| !self.params.contains_key(*tag))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.tags.iter().all(|tag| self.params.contains_key(tag))
    }

    pub fn render(&self) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.raw.len());
        let mut last_end = 0;
        for captures in tag_pattern().captures_iter(&self.raw) {
            let whole = captures.get(0).expect("capture");
            let tag = &captures[1];
            let value = self
                .params
                .get(tag)
                .ok_or_else(|| TemplateError::MissingTag(tag.to_string()))?;
            rendered.push_str(&self.raw[last_end..whole.start()]);
            rendered.push_str(value);
            last_end = whole.end();
        }
        rendered.push_str(&self.raw[last_end..]);
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn extracts_tag_names() {
        let template = UrlTemplate::new("/cities?country=${country}&region=${region}");
        let mut tags: Vec<_> = template.tags().iter().cloned().collect();
        tags.sort();
        assert_eq!(tags, vec!["country", "region"]);
    }

    #[test]
    fn renders_with_all_tags_resolved() {
        let mut template = UrlTemplate::new("/cities?country=${country}");
        template.set("country", "42");
        assert_eq!(template.render().expect("render"), "/cities?country=42");
    }

    #[test]
    fn repeated_tags_render_the_same_value() {
        let mut template = UrlTemplate::new("/${kind}/by-${kind}");
        template.set("kind", "city");
        assert_eq!(template.render().expect("render"), "/city/by-city");
    }

    #[test]
    fn missing_tag_is_an_error() {
        let template = UrlTemplate::new("/cities?country=${country}");
        assert_eq!(
            template.render(),
            Err(TemplateError::MissingTag("country".to_string()))
        );
        assert!(!template.is_complete());
    }

    #[test]
    fn update_merges_without_touching_the_raw_text() {
        let mut template = UrlTemplate::new("/cities?country=${country}");
        template.update(&params(&[("country", "42")]));
        assert_eq!(template.raw(), "/cities?country=${country}");
        assert_eq!(template.render().expect("render"), "/cities?country=42");

        template.update(&params(&[("country", "64")]));
        assert_eq!(template.render().expect("render"), "/cities?country=64");
    }

    #[test]
    fn extra_params_are_kept_but_do_not_affect_rendering() {
        let template = UrlTemplate::with_params("/static", params(&[("unused", "1")]));
        assert!(template.is_complete());
        assert_eq!(template.render().expect("render"), "/static");
    }

    #[test]
    fn unresolved_reports_only_unset_tags() {
        let mut template = UrlTemplate::new("/a/${x}/${y}");
        template.set("x", "1");
        assert_eq!(
            template.unresolved(),
            HashSet::from(["y".to_string()])
        );
    }

    #[test]
    fn template_without_tags_is_always_complete() {
        let template = UrlTemplate::new("/organisations");
        assert!(template.tags().is_empty());
        assert!(template.is_complete());
        assert_eq!(template.render().expect("render"), "/organisations");
    }
}
