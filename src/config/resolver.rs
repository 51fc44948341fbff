//! `{{path.to.field}}` template resolution.
//!
//! Every string leaf of the configuration may reference values from a fixed
//! context: the whole `runtime` section plus `ports`, `image` and `pod` of each
//! service. Referenced values that are themselves templated are resolved
//! recursively; meeting a reference that is already being resolved for the same
//! leaf is a cycle.

use super::schema::{AirpodsConfig, validate};
use super::{ConfigError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use toml::{Table, Value};
use tracing::debug;

/// Upper bound on substitution rounds and nesting per value.
pub const MAX_RESOLUTION_DEPTH: usize = 100;

static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("template pattern is valid"));

/// Lookup context for template references.
pub fn build_context(config: &AirpodsConfig, document: &Table) -> Table {
    let mut services = Table::new();
    for (name, service) in &config.services {
        let ports = service
            .ports
            .iter()
            .map(|port| {
                let mut entry = Table::new();
                entry.insert("host".to_string(), Value::Integer(i64::from(port.host)));
                entry.insert(
                    "container".to_string(),
                    Value::Integer(i64::from(port.container)),
                );
                Value::Table(entry)
            })
            .collect();

        let mut entry = Table::new();
        entry.insert("ports".to_string(), Value::Array(ports));
        entry.insert("image".to_string(), Value::String(service.image.clone()));
        entry.insert("pod".to_string(), Value::String(service.pod_name(name)));
        services.insert(name.clone(), Value::Table(entry));
    }

    let mut context = Table::new();
    context.insert(
        "runtime".to_string(),
        document
            .get("runtime")
            .cloned()
            .unwrap_or_else(|| Value::Table(Table::new())),
    );
    context.insert("services".to_string(), Value::Table(services));
    context
}

/// Look up a dotted path; numeric segments index arrays.
pub fn lookup<'a>(path: &str, context: &'a Table) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Table(table) => table.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Unresolved references collected across the whole document.
#[derive(Debug, Default)]
struct Missing {
    references: BTreeSet<String>,
    locations: BTreeSet<String>,
}

struct Resolver<'a> {
    context: &'a Table,
}

impl Resolver<'_> {
    /// Resolve one top-level value with fixed-point rounds.
    fn resolve_value(&self, text: &str, location: &str, missing: &mut Missing) -> Result<String> {
        let mut current = text.to_string();
        for _ in 0..MAX_RESOLUTION_DEPTH {
            if !TEMPLATE_PATTERN.is_match(&current) {
                return Ok(current);
            }
            let mut chain = Vec::new();
            let next = self.substitute(&current, location, &mut chain, missing)?;
            if next == current {
                return Ok(current);
            }
            current = next;
        }

        let reference = TEMPLATE_PATTERN
            .captures(&current)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        Err(ConfigError::TemplateCycle {
            reference,
            location: location.to_string(),
        })
    }

    /// One substitution pass over `text`; `chain` holds the references being
    /// resolved on the way here.
    fn substitute(
        &self,
        text: &str,
        location: &str,
        chain: &mut Vec<String>,
        missing: &mut Missing,
    ) -> Result<String> {
        if chain.len() >= MAX_RESOLUTION_DEPTH {
            return Err(ConfigError::TemplateCycle {
                reference: chain.last().cloned().unwrap_or_default(),
                location: location.to_string(),
            });
        }

        let mut output = String::with_capacity(text.len());
        let mut last = 0;

        for caps in TEMPLATE_PATTERN.captures_iter(text) {
            let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            output.push_str(&text[last..whole.start()]);
            last = whole.end();

            let reference = inner.as_str().trim();
            if chain.iter().any(|seen| seen == reference) {
                return Err(ConfigError::TemplateCycle {
                    reference: reference.to_string(),
                    location: location.to_string(),
                });
            }

            match lookup(reference, self.context) {
                Some(Value::String(nested)) => {
                    chain.push(reference.to_string());
                    let resolved = self.substitute(nested, location, chain, missing)?;
                    chain.pop();
                    output.push_str(&resolved);
                }
                Some(Value::Integer(value)) => output.push_str(&value.to_string()),
                Some(Value::Float(value)) => output.push_str(&value.to_string()),
                Some(Value::Boolean(value)) => output.push_str(&value.to_string()),
                Some(Value::Datetime(value)) => output.push_str(&value.to_string()),
                // absent, or a table/array that has no scalar rendering
                _ => {
                    missing.references.insert(reference.to_string());
                    missing.locations.insert(location.to_string());
                    output.push_str(whole.as_str());
                }
            }
        }

        output.push_str(&text[last..]);
        Ok(output)
    }

    fn walk(&self, value: &mut Value, location: &str, missing: &mut Missing) -> Result<()> {
        match value {
            Value::String(text) => {
                if text.contains("{{") {
                    let resolved = self.resolve_value(text, location, missing)?;
                    if resolved != *text {
                        debug!("Resolved template at {}: {}", location, resolved);
                    }
                    *text = resolved;
                }
            }
            Value::Table(table) => self.walk_table(table, location, missing)?,
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.walk(item, &join(location, &index.to_string()), missing)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn walk_table(&self, table: &mut Table, location: &str, missing: &mut Missing) -> Result<()> {
        for (key, value) in table.iter_mut() {
            self.walk(value, &join(location, key), missing)?;
        }
        Ok(())
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Resolve template markers in a single string against `context`.
///
/// # Errors
///
/// [`ConfigError::UnresolvedReferences`] lists every reference that could not
/// be found; [`ConfigError::TemplateCycle`] reports a self-referencing chain.
pub fn resolve_string(text: &str, context: &Table, location: &str) -> Result<String> {
    let resolver = Resolver { context };
    let mut missing = Missing::default();
    let resolved = resolver.resolve_value(text, location, &mut missing)?;
    missing.into_result()?;
    Ok(resolved)
}

impl Missing {
    fn into_result(self) -> Result<()> {
        if self.references.is_empty() {
            return Ok(());
        }
        Err(ConfigError::UnresolvedReferences {
            references: self.references.into_iter().collect(),
            locations: self.locations.into_iter().collect(),
        })
    }
}

/// Resolve every templated string in the configuration and re-validate.
pub fn resolve_templates(config: &AirpodsConfig) -> Result<AirpodsConfig> {
    let mut document = config.to_document()?;
    let context = build_context(config, &document);
    let resolver = Resolver { context: &context };

    let mut missing = Missing::default();
    resolver.walk_table(&mut document, "", &mut missing)?;
    missing.into_result()?;

    validate(&document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_document;

    fn context(text: &str) -> Table {
        text.parse().unwrap()
    }

    #[test]
    fn test_no_markers_is_identity() {
        let ctx = context("a = \"x\"\n");
        assert_eq!(
            resolve_string("plain value", &ctx, "loc").unwrap(),
            "plain value"
        );
    }

    #[test]
    fn test_repeated_reference_in_one_value() {
        let ctx = context("a = \"x\"\n");
        assert_eq!(resolve_string("{{a}}/{{a}}", &ctx, "loc").unwrap(), "x/x");
        assert_eq!(resolve_string("{{ a }}", &ctx, "loc").unwrap(), "x");
    }

    #[test]
    fn test_nested_and_indexed_lookups() {
        let ctx = context(
            "[runtime]\nnet = \"airpods_network\"\nlabel = \"{{runtime.net}}-x\"\n\
             [services.ollama]\nports = [{ host = 1, container = 11434 }]\n",
        );
        assert_eq!(
            resolve_string("http://ollama:{{services.ollama.ports.0.container}}", &ctx, "l")
                .unwrap(),
            "http://ollama:11434"
        );
        assert_eq!(
            resolve_string("{{runtime.label}}", &ctx, "l").unwrap(),
            "airpods_network-x"
        );
    }

    #[test]
    fn test_cycle_fails_fast() {
        let ctx = context("[runtime]\na = \"{{runtime.b}}\"\nb = \"{{runtime.a}}\"\n");
        match resolve_string("{{runtime.a}}", &ctx, "services.x.env.K") {
            Err(ConfigError::TemplateCycle { reference, location }) => {
                assert_eq!(reference, "runtime.a");
                assert_eq!(location, "services.x.env.K");
            }
            other => panic!("expected TemplateCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_all_missing_references_reported_together() {
        let ctx = context("a = \"x\"\n[t]\nk = 1\n");
        match resolve_string("{{nope}} {{a}} {{also.nope}} {{t}}", &ctx, "loc") {
            Err(ConfigError::UnresolvedReferences { references, locations }) => {
                assert_eq!(references, ["also.nope", "nope", "t"]);
                assert_eq!(locations, ["loc"]);
            }
            other => panic!("expected UnresolvedReferences, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_resolves() {
        let config = validate(&default_document().unwrap()).unwrap();
        let resolved = resolve_templates(&config).unwrap();
        let webui = resolved.service("open-webui").unwrap();
        assert_eq!(webui.env["OLLAMA_BASE_URL"], "http://ollama:11434");
    }

    #[test]
    fn test_unresolved_in_document_names_location() {
        let mut doc = default_document().unwrap();
        let env = doc
            .get_mut("services")
            .and_then(Value::as_table_mut)
            .and_then(|s| s.get_mut("ollama"))
            .and_then(Value::as_table_mut)
            .and_then(|s| s.get_mut("env"))
            .and_then(Value::as_table_mut)
            .unwrap();
        env.insert(
            "BROKEN".to_string(),
            Value::String("{{services.missing.image}}".to_string()),
        );

        let config = validate(&doc).unwrap();
        match resolve_templates(&config) {
            Err(ConfigError::UnresolvedReferences { references, locations }) => {
                assert_eq!(references, ["services.missing.image"]);
                assert_eq!(locations, ["services.ollama.env.BROKEN"]);
            }
            other => panic!("expected UnresolvedReferences, got {other:?}"),
        }
    }
}
