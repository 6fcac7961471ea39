//! Template interpolation for YAML configs, filenames and connection URLs.
//!
//! Supports `{{ token }}` substitution where a token is either one of the
//! built-in functions (`YYYY`, `MM`, `DD`, `stream_name`, `format`,
//! `compression`, `ext`) or the name of an `MVR_TMPL_*` variable. Unknown
//! tokens render as empty strings so a first rendering pass can leave
//! holes for values that only resolve on the second pass.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::core::collect_mvr_vars;

static TEMPLATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.?([A-Za-z_][A-Za-z0-9_$]*)\s*\}\}").unwrap());

/// Values available to a template rendering pass.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub stream_name: String,
    pub format: String,
    pub compression: String,
    /// `MVR_TMPL_*` variables (prefix stripped).
    pub vars: BTreeMap<String, String>,
    /// Date used by the `YYYY`/`MM`/`DD` functions; `None` means today.
    pub today: Option<NaiveDate>,
}

impl TemplateContext {
    /// Context with only the environment template variables loaded.
    pub fn from_env() -> Self {
        Self {
            vars: collect_mvr_vars("TMPL"),
            ..Default::default()
        }
    }

    /// Context carrying a resolved stream config for the second pass.
    pub fn for_stream(stream_name: &str, format: &str, compression: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            format: format.to_string(),
            compression: compression.to_string(),
            vars: collect_mvr_vars("TMPL"),
            today: None,
        }
    }

    fn date(&self) -> NaiveDate {
        self.today
            .unwrap_or_else(|| chrono::Local::now().date_naive())
    }
}

/// File extension for a format/compression pair.
///
/// Snappy prefixes (`users.snappy.parquet`), gzip suffixes
/// (`users.csv.gz`); unknown formats contribute no base extension.
pub fn file_extension(format: &str, compression: &str) -> String {
    let mut ext = match format.to_lowercase().as_str() {
        "csv" => ".csv".to_string(),
        "jsonl" => ".jsonl".to_string(),
        "parquet" => ".parquet".to_string(),
        _ => String::new(),
    };
    match compression.to_lowercase().as_str() {
        "gzip" => ext.push_str(".gz"),
        "snappy" => ext = format!(".snappy{}", ext),
        _ => {}
    }
    ext
}

/// Render a template string against the context.
pub fn render(template: &str, ctx: &TemplateContext) -> String {
    TEMPLATE_REGEX
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            match token {
                "YYYY" => ctx.date().format("%Y").to_string(),
                "MM" => ctx.date().format("%m").to_string(),
                "DD" => ctx.date().format("%d").to_string(),
                "stream_name" => ctx.stream_name.clone(),
                "format" => ctx.format.clone(),
                "compression" => ctx.compression.clone(),
                "ext" => file_extension(&ctx.format, &ctx.compression),
                other => ctx.vars.get(other).cloned().unwrap_or_default(),
            }
        })
        .into_owned()
}

/// First-pass rendering: substitute only `MVR_TMPL_*` variables.
///
/// Function tokens (`stream_name`, `ext`, dates) are left verbatim so the
/// second pass can render them with values the first pass resolved.
pub fn render_vars(template: &str, ctx: &TemplateContext) -> String {
    TEMPLATE_REGEX
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            match ctx.vars.get(token) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_template_snappy_parquet() {
        let ctx = TemplateContext {
            stream_name: "users".into(),
            format: "parquet".into(),
            compression: "snappy".into(),
            today: NaiveDate::from_ymd_opt(2025, 1, 15),
            ..Default::default()
        };
        let rendered = render("folder/{{YYYY}}/{{MM}}/{{DD}}/{{stream_name}}{{ext}}", &ctx);
        assert_eq!(rendered, "folder/2025/01/15/users.snappy.parquet");
    }

    #[test]
    fn test_ext_forms() {
        assert_eq!(file_extension("csv", "gzip"), ".csv.gz");
        assert_eq!(file_extension("jsonl", ""), ".jsonl");
        assert_eq!(file_extension("parquet", "snappy"), ".snappy.parquet");
        assert_eq!(file_extension("arrow", ""), "");
        assert_eq!(file_extension("arrow", "gzip"), ".gz");
    }

    #[test]
    fn test_tmpl_vars_and_unknown_tokens() {
        let mut vars = BTreeMap::new();
        vars.insert("SCHEMA".to_string(), "public".to_string());
        let ctx = TemplateContext {
            vars,
            ..Default::default()
        };
        assert_eq!(render("{{SCHEMA}}.users", &ctx), "public.users");
        // unknown tokens render empty, leaving the hole for a later pass
        assert_eq!(render("x{{missing}}y", &ctx), "xy");
        // dotted form is accepted too
        assert_eq!(render("{{ .SCHEMA }}.users", &ctx), "public.users");
    }

    #[test]
    fn test_render_vars_leaves_functions_for_second_pass() {
        let mut vars = BTreeMap::new();
        vars.insert("ENVIRONMENT".to_string(), "prod".to_string());
        let ctx = TemplateContext {
            vars,
            ..Default::default()
        };
        let rendered = render_vars("{{ENVIRONMENT}}/{{stream_name}}{{ext}}", &ctx);
        assert_eq!(rendered, "prod/{{stream_name}}{{ext}}");
    }

    #[test]
    fn test_non_template_text_untouched() {
        let ctx = TemplateContext::default();
        assert_eq!(render("SELECT * FROM t WHERE a > $1", &ctx), "SELECT * FROM t WHERE a > $1");
    }
}
