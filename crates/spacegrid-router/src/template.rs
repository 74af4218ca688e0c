//! Package templates, compiled once per routing index entry.
//!
//! Every file under a version's `template_folder` is parsed into one
//! [`TemplateSet`] when the index is built, so templates can `extend` and
//! `include` their siblings. Requests render by name against the JSON model
//! from [`HttpContext::template_model`](spacegrid_core::HttpContext::template_model).
//! Output is HTML-escaped unless a value is piped through `|safe`.

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde_json::Value;

use crate::error::{RouteError, RouteResult};

#[derive(Debug, Clone)]
pub struct TemplateSet {
    env: Environment<'static>,
    names: Vec<String>,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateSet {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        // `data.post.title` renders empty when `data` has no `post`.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env, names: Vec::new() }
    }

    /// Parse and register `source` under `name`. A syntax error leaves the
    /// set unchanged.
    pub fn add(&mut self, name: &str, source: String) -> Result<(), minijinja::Error> {
        self.env.add_template_owned(name.to_string(), source)?;
        self.names.push(name.to_string());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.env.get_template(name).is_ok()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn render(&self, name: &str, model: &Value) -> RouteResult<String> {
        let template = self
            .env
            .get_template(name)
            .map_err(|_| RouteError::TemplateNotFound(name.to_string()))?;
        template.render(model).map_err(|e| RouteError::Render {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(templates: &[(&str, &str)]) -> TemplateSet {
        let mut set = TemplateSet::new();
        for (name, source) in templates {
            set.add(name, source.to_string()).unwrap();
        }
        set
    }

    #[test]
    fn renders_dotted_paths() {
        let set = set(&[("p.html", "<h1>{{ data.post.title }}</h1><p>#{{params.id}}</p>")]);
        let model = json!({"data": {"post": {"title": "Hello"}}, "params": {"id": "42"}});
        assert_eq!(set.render("p.html", &model).unwrap(), "<h1>Hello</h1><p>#42</p>");
    }

    #[test]
    fn missing_values_render_empty() {
        let set = set(&[("p.html", "[{{ data.nope.deeper }}]")]);
        assert_eq!(set.render("p.html", &json!({})).unwrap(), "[]");
    }

    #[test]
    fn escapes_html_unless_safe() {
        let set = set(&[("p.html", "{{ data.x }}|{{ data.x|safe }}")]);
        let out = set.render("p.html", &json!({"data": {"x": "<b>&"}})).unwrap();
        assert_eq!(out, "&lt;b&gt;&amp;|<b>&");
    }

    #[test]
    fn loops_and_conditionals() {
        let set = set(&[(
            "list.html",
            "{% for post in data.posts %}{% if post.draft %}-{% else %}{{ post.title }};{% endif %}{% endfor %}",
        )]);
        let model = json!({"data": {"posts": [
            {"title": "a"}, {"title": "b", "draft": true}, {"title": "c"}
        ]}});
        assert_eq!(set.render("list.html", &model).unwrap(), "a;-c;");
    }

    #[test]
    fn templates_extend_siblings() {
        let set = set(&[
            ("base.html", "<main>{% block body %}{% endblock %}</main>"),
            ("post.html", "{% extends \"base.html\" %}{% block body %}{{ params.id }}{% endblock %}"),
        ]);
        let out = set.render("post.html", &json!({"params": {"id": "7"}})).unwrap();
        assert_eq!(out, "<main>7</main>");
    }

    #[test]
    fn syntax_errors_are_rejected_at_compile() {
        let mut set = TemplateSet::new();
        assert!(set.add("bad.html", "{% for x in %}".to_string()).is_err());
        assert!(!set.contains("bad.html"));
        assert!(set.is_empty());
    }

    #[test]
    fn unknown_template_and_runtime_errors() {
        let set = set(&[("p.html", "{{ data.items | nosuchfilter }}")]);
        assert!(matches!(
            set.render("other.html", &json!({})),
            Err(RouteError::TemplateNotFound(name)) if name == "other.html"
        ));
        assert!(matches!(set.render("p.html", &json!({})), Err(RouteError::Render { .. })));
    }
}
