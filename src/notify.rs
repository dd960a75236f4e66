use crate::config::NotifyConfig;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Variables available to notification templates.
#[derive(Debug, Clone, Default)]
pub struct NotifyVars {
    pub repository: String,
    pub registry: String,
    pub ssh_host: String,
    pub reference: String,
    pub commit: String,
    pub tag: String,
}

impl NotifyVars {
    fn as_map(&self) -> BTreeMap<&'static str, &str> {
        BTreeMap::from([
            ("repository", self.repository.as_str()),
            ("registry", self.registry.as_str()),
            ("ssh_host", self.ssh_host.as_str()),
            ("ref", self.reference.as_str()),
            ("commit", self.commit.as_str()),
            ("tag", self.tag.as_str()),
        ])
    }
}

/// Deliver the context's webhook notification. Best effort: failures are
/// logged and swallowed, a deploy never fails because its announcement did.
pub async fn send(client: &reqwest::Client, notify: &NotifyConfig, vars: &NotifyVars) {
    let payload = build_payload(notify, vars);
    info!("Notifying {}", notify.url);
    match client.post(&notify.url).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => warn!(
            "Notification to {} returned status {}",
            notify.url,
            response.status()
        ),
        Err(e) => warn!("Notification to {} failed: {}", notify.url, e),
    }
}

/// Rendered text merged into the descriptor's static fields. The delivery
/// URL never appears in the body; empty values are dropped.
pub fn build_payload(notify: &NotifyConfig, vars: &NotifyVars) -> Value {
    let mut body = Map::new();
    for (key, value) in &notify.fields {
        let Ok(value) = serde_json::to_value(value) else {
            continue;
        };
        if is_empty(&value) {
            continue;
        }
        body.insert(key.clone(), value);
    }
    if let Some(template) = &notify.text {
        let rendered = render(template, &vars.as_map());
        if !rendered.is_empty() {
            body.insert("text".to_string(), Value::String(rendered));
        }
    }
    Value::Object(body)
}

/// Substitute `{{var}}` placeholders. Unknown variables render empty.
pub fn render(template: &str, vars: &BTreeMap<&'static str, &str>) -> String {
    let Ok(re) = Regex::new(r"\{\{\s*([A-Za-z_]+)\s*}}") else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures| {
        vars.get(&caps[1]).copied().unwrap_or_default().to_string()
    })
    .into_owned()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
