//! Engine functions and filters available inside templates.
//!
//! Two groups live here:
//!
//! - **Dependency functions** (`service`, `nodes`, `key`, `key_exists`,
//!   `secrets`): each parses its argument into a dependency query, looks
//!   it up through the execution's [`Recaller`], and records the identity
//!   as used. When no value is cached yet the identity is recorded as
//!   missing and the function yields its zero-form (empty list, empty
//!   string, `false`) so the pass can continue and report every miss.
//! - **Filters** (`base64_decode`, `base64_encode`, `base64_url_decode`,
//!   `base64_url_encode`, `parse_json`, `to_yaml`, `to_toml`):
//!   stateless helpers complementing the engine's built-ins (`split`,
//!   `json_encode`, `lower`, `upper`, `title`, ...).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use parking_lot::Mutex;
use tera::Tera;

use crate::dep::{
    CatalogNodesQuery, Dependency, HealthServiceQuery, KvExistsQuery, KvGetQuery, Value,
    VaultListQuery,
};
use crate::template::Recaller;

/// Per-execution lookup state shared with the registered functions.
pub(crate) struct ExecState {
    recaller: Arc<dyn Recaller>,
    missing: Mutex<BTreeSet<String>>,
    used: Mutex<BTreeSet<String>>,
}

impl ExecState {
    pub(crate) fn new(recaller: Arc<dyn Recaller>) -> Arc<Self> {
        Arc::new(Self {
            recaller,
            missing: Mutex::new(BTreeSet::new()),
            used: Mutex::new(BTreeSet::new()),
        })
    }

    pub(crate) fn missing(&self) -> BTreeSet<String> {
        self.missing.lock().clone()
    }

    pub(crate) fn used(&self) -> BTreeSet<String> {
        self.used.lock().clone()
    }

    fn lookup(
        &self,
        dep: Arc<dyn Dependency>,
        zero: tera::Value,
    ) -> tera::Result<tera::Value> {
        let id = dep.id();
        self.used.lock().insert(id.clone());
        match self.recaller.recall(dep) {
            Some(value) => dep_value(&value),
            None => {
                self.missing.lock().insert(id);
                Ok(zero)
            }
        }
    }
}

/// Strip the variant tag: templates see the payload, not the enum shape.
fn dep_value(value: &Value) -> tera::Result<tera::Value> {
    let json = |v: serde_json::Result<serde_json::Value>| {
        v.map_err(|e| tera::Error::msg(e.to_string()))
    };
    match value {
        Value::HealthServices(list) => json(serde_json::to_value(list)),
        Value::Nodes(list) => json(serde_json::to_value(list)),
        Value::KvPair(pair) => Ok(tera::Value::String(pair.clone().unwrap_or_default())),
        Value::KvExists(exists) => Ok(tera::Value::Bool(*exists)),
        Value::SecretKeys(keys) => json(serde_json::to_value(keys)),
    }
}

fn required_str(
    func: &str,
    args: &HashMap<String, tera::Value>,
    name: &str,
) -> tera::Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            tera::Error::msg(format!("{func}: missing required string argument `{name}`"))
        })
}

fn optional_str(args: &HashMap<String, tera::Value>, name: &str) -> String {
    args.get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Register the dependency functions bound to one execution's state.
pub(crate) fn register_functions(tera: &mut Tera, state: &Arc<ExecState>) {
    let st = Arc::clone(state);
    tera.register_function(
        "service",
        move |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            let query = required_str("service", args, "name")?;
            let dep = HealthServiceQuery::shared(&query).map_err(|e| tera::Error::msg(e.to_string()))?;
            st.lookup(dep, tera::Value::Array(vec![]))
        },
    );

    let st = Arc::clone(state);
    tera.register_function(
        "nodes",
        move |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            let query = optional_str(args, "query");
            let dep = CatalogNodesQuery::shared(&query).map_err(|e| tera::Error::msg(e.to_string()))?;
            st.lookup(dep, tera::Value::Array(vec![]))
        },
    );

    let st = Arc::clone(state);
    tera.register_function(
        "key",
        move |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            let query = required_str("key", args, "name")?;
            let dep = KvGetQuery::shared(&query).map_err(|e| tera::Error::msg(e.to_string()))?;
            st.lookup(dep, tera::Value::String(String::new()))
        },
    );

    let st = Arc::clone(state);
    tera.register_function(
        "key_exists",
        move |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            let query = required_str("key_exists", args, "name")?;
            let dep = KvExistsQuery::shared(&query).map_err(|e| tera::Error::msg(e.to_string()))?;
            st.lookup(dep, tera::Value::Bool(false))
        },
    );

    let st = Arc::clone(state);
    tera.register_function(
        "secrets",
        move |args: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            let query = required_str("secrets", args, "path")?;
            let dep = VaultListQuery::shared(&query).map_err(|e| tera::Error::msg(e.to_string()))?;
            st.lookup(dep, tera::Value::Array(vec![]))
        },
    );
}

/// Register the stateless filters.
pub(crate) fn register_filters(tera: &mut Tera) {
    tera.register_filter("base64_decode", base64_decode);
    tera.register_filter("base64_encode", base64_encode);
    tera.register_filter("base64_url_decode", base64_url_decode);
    tera.register_filter("base64_url_encode", base64_url_encode);
    tera.register_filter("parse_json", parse_json);
    tera.register_filter("to_yaml", to_yaml);
    tera.register_filter("to_toml", to_toml);
}

/// A template function that always fails.
///
/// Merge it over a built-in name to disable that function for one
/// template.
pub fn deny_function() -> Arc<dyn tera::Function> {
    Arc::new(
        |_: &HashMap<String, tera::Value>| -> tera::Result<tera::Value> {
            Err(tera::Error::msg("function disabled"))
        },
    )
}

fn string_input<'a>(filter: &str, value: &'a tera::Value) -> tera::Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| tera::Error::msg(format!("{filter}: expected a string")))
}

fn base64_decode(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let encoded = string_input("base64_decode", value)?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| tera::Error::msg(format!("base64_decode: {e}")))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|e| tera::Error::msg(format!("base64_decode: {e}")))?;
    Ok(tera::Value::String(decoded))
}

fn base64_encode(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let plain = string_input("base64_encode", value)?;
    Ok(tera::Value::String(STANDARD.encode(plain)))
}

fn base64_url_decode(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let encoded = string_input("base64_url_decode", value)?;
    let bytes = URL_SAFE
        .decode(encoded)
        .map_err(|e| tera::Error::msg(format!("base64_url_decode: {e}")))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|e| tera::Error::msg(format!("base64_url_decode: {e}")))?;
    Ok(tera::Value::String(decoded))
}

fn base64_url_encode(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let plain = string_input("base64_url_encode", value)?;
    Ok(tera::Value::String(URL_SAFE.encode(plain)))
}

fn parse_json(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let raw = string_input("parse_json", value)?;
    serde_json::from_str(raw).map_err(|e| tera::Error::msg(format!("parse_json: {e}")))
}

fn to_yaml(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let rendered =
        serde_yaml::to_string(value).map_err(|e| tera::Error::msg(format!("to_yaml: {e}")))?;
    Ok(tera::Value::String(rendered.trim_end().to_string()))
}

fn to_toml(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let rendered =
        toml::to_string(value).map_err(|e| tera::Error::msg(format!("to_toml: {e}")))?;
    Ok(tera::Value::String(rendered.trim_end().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::template::{Template, TemplateInput};

    fn render(contents: &str) -> Result<String, crate::error::Error> {
        let tmpl = Template::new(TemplateInput {
            contents: contents.to_string(),
            ..Default::default()
        });
        tmpl.execute(Arc::new(Store::new())).map(|r| r.output)
    }

    #[test]
    fn test_base64_decode() {
        assert_eq!(render(r#"{{ "aGVsbG8=" | base64_decode }}"#).unwrap(), "hello");
    }

    #[test]
    fn test_base64_decode_invalid() {
        assert!(render(r#"{{ "aGVsxxbG8=" | base64_decode }}"#).is_err());
    }

    #[test]
    fn test_base64_encode() {
        assert_eq!(render(r#"{{ "hello" | base64_encode }}"#).unwrap(), "aGVsbG8=");
    }

    #[test]
    fn test_base64_url_round_trip() {
        assert_eq!(
            render(r#"{{ "dGVzdGluZzEyMw==" | base64_url_decode }}"#).unwrap(),
            "testing123"
        );
        assert_eq!(
            render(r#"{{ "testing123" | base64_url_encode }}"#).unwrap(),
            "dGVzdGluZzEyMw=="
        );
        assert!(render(r#"{{ "aGVsxxbG8=" | base64_url_decode }}"#).is_err());
    }

    #[test]
    fn test_split_to_json() {
        assert_eq!(
            render(r#"{{ "a,b,c" | split(pat=",") | json_encode() }}"#).unwrap(),
            r#"["a","b","c"]"#
        );
    }

    #[test]
    fn test_case_helpers() {
        assert_eq!(render(r#"{{ "HI" | lower }}"#).unwrap(), "hi");
        assert_eq!(render(r#"{{ "hi" | upper }}"#).unwrap(), "HI");
        assert_eq!(
            render(r#"{{ "this is a sentence" | title }}"#).unwrap(),
            "This Is A Sentence"
        );
    }

    #[test]
    fn test_parse_json_to_yaml() {
        assert_eq!(
            render(r#"{{ '{"foo":"bar"}' | parse_json | to_yaml }}"#).unwrap(),
            "foo: bar"
        );
    }

    #[test]
    fn test_parse_json_to_toml() {
        assert_eq!(
            render(r#"{{ '{"foo":"bar"}' | parse_json | to_toml }}"#).unwrap(),
            "foo = \"bar\""
        );
    }

    #[test]
    fn test_parse_json_invalid() {
        assert!(render(r#"{{ "{nope" | parse_json }}"#).is_err());
    }

    #[test]
    fn test_dependency_functions_record_identity() {
        let tmpl = Template::new(TemplateInput {
            contents: r#"{% for s in service(name="web") %}{{ s.name }}{% endfor %}{{ key_exists(name="notify") }}"#
                .to_string(),
            ..Default::default()
        });
        let result = tmpl.execute(Arc::new(Store::new())).unwrap();
        assert_eq!(result.output, "false");
        assert!(result.missing.contains("health.service(web|passing)"));
        assert!(result.missing.contains("kv.exists(notify)"));
        assert_eq!(result.missing, result.used);
    }
}
