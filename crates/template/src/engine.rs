//! Merge-tag rendering, built on a single `minijinja`
//! environment — the teacher's `kumo-template` wraps both `minijinja`
//! and `handlebars` behind one `TemplateEngine`, but merge-tag syntax
//! here is syntactically a strict subset of Jinja (`{{ field | filter
//! }}`, `{% if %}`), so the handlebars half of that crate has no
//! counterpart in this spec and is not carried over.
use crate::context::RenderContext;
use minijinja::value::Value as JinjaValue;
use minijinja::Environment;
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Unresolved variables produce a warning, output renders with them
    /// substituted as empty strings.
    Strict,
    /// Unresolved variables render as empty strings silently.
    Lax,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOutput {
    pub text: String,
    pub warnings: Vec<String>,
}

static MERGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)").unwrap());

fn make_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_filter("date_format", date_format_filter);
    env.add_filter("number_format", number_format_filter);
    env.add_filter("title_case", title_case_filter);
    env
}

/// `{{ some_date | date_format("%Y-%m-%d") }}` — parses an RFC 3339
/// timestamp and reformats it with a `strftime`-style pattern.
fn date_format_filter(value: String, fmt: String) -> Result<String, minijinja::Error> {
    let parsed = chrono::DateTime::parse_from_rfc3339(&value).map_err(|err| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("not a valid timestamp: {err}"),
        )
    })?;
    Ok(parsed.format(&fmt).to_string())
}

/// `{{ amount | number_format(2) }}` — fixed-decimal numeric formatting.
fn number_format_filter(value: f64, decimals: Option<usize>) -> String {
    format!("{:.*}", decimals.unwrap_or(2), value)
}

fn title_case_filter(value: String) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders `source` against `ctx`. Strict mode additionally scans the
/// template for merge tags whose root identifier resolves to nothing in
/// `ctx`'s top-level keys and reports them as warnings;
/// the rendered output is identical in both modes, since jinja's lenient
/// undefined behavior already substitutes missing values as empty
/// strings, which is exactly what Lax mode specifies and what Strict
/// mode's "partial output" amounts to once the warnings are collected.
pub fn render(source: &str, ctx: &RenderContext, mode: RenderMode) -> anyhow::Result<RenderOutput> {
    let env = make_environment();
    let value = JinjaValue::from_serialize(ctx.to_value());
    let text = env.render_str(source, value)?;

    let warnings = match mode {
        RenderMode::Lax => Vec::new(),
        RenderMode::Strict => {
            let known = ctx.known_top_level_keys();
            let mut seen = std::collections::HashSet::new();
            let mut warnings = Vec::new();
            for caps in MERGE_TAG.captures_iter(source) {
                let path = &caps[1];
                let root = path.split('.').next().unwrap_or(path);
                if !known.contains(root) && seen.insert(path.to_string()) {
                    warnings.push(format!("unresolved merge tag: {path}"));
                }
            }
            warnings
        }
    };

    Ok(RenderOutput { text, warnings })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn ctx_with(key: &str, value: serde_json::Value) -> RenderContext {
        let mut ctx = RenderContext::default();
        ctx.subscriber.insert(key.to_string(), value);
        ctx
    }

    #[test]
    fn scalar_substitution() {
        let ctx = ctx_with("first_name", json!("Jane"));
        let out = render("Hello {{ first_name }}!", &ctx, RenderMode::Lax).unwrap();
        assert_eq!(out.text, "Hello Jane!");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn lax_mode_renders_missing_as_empty_without_warnings() {
        let ctx = RenderContext::default();
        let out = render("Hi {{ missing }}.", &ctx, RenderMode::Lax).unwrap();
        assert_eq!(out.text, "Hi .");
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn strict_mode_reports_unresolved_warnings() {
        let ctx = RenderContext::default();
        let out = render("Hi {{ missing }}.", &ctx, RenderMode::Strict).unwrap();
        assert_eq!(out.text, "Hi .");
        assert_eq!(out.warnings, vec!["unresolved merge tag: missing"]);
    }

    #[test]
    fn conditionals_work() {
        let ctx = ctx_with("vip", json!(true));
        let out = render(
            "{% if vip %}VIP{% else %}Standard{% endif %}",
            &ctx,
            RenderMode::Lax,
        )
        .unwrap();
        assert_eq!(out.text, "VIP");
    }

    #[test]
    fn filters_apply() {
        let ctx = ctx_with("amount", json!(19.999));
        let out = render("{{ amount | number_format(2) }}", &ctx, RenderMode::Lax).unwrap();
        assert_eq!(out.text, "20.00");

        let ctx2 = ctx_with("name", json!("jane doe"));
        let out2 = render("{{ name | title_case }}", &ctx2, RenderMode::Lax).unwrap();
        assert_eq!(out2.text, "Jane Doe");
    }
}
