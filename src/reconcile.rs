use crate::error::Result;
use crate::executor::{CommandOutput, Kubectl};
use crate::manifest::Manifest;
use serde_json::Value;
use tracing::{debug, warn};

/// Live cluster state for one manifest.
#[derive(Debug, Clone)]
pub struct LiveStatus {
    /// The live object, with its status block stripped.
    pub resource: Value,
    /// Tag of the image the first container is running.
    pub tag: String,
    /// The stripped status block.
    pub status: Value,
}

/// A manifest paired with whatever the cluster reported for it.
#[derive(Debug, Clone)]
pub struct ManifestStatus {
    pub manifest: Manifest,
    pub live: Option<LiveStatus>,
}

/// Query the cluster for the objects the given manifests declare and map
/// each live record back to its manifest. Returns `None` when the query
/// failed for anything other than a benign "not found".
pub async fn status(
    kubectl: &Kubectl,
    context: &str,
    manifests: Vec<Manifest>,
) -> Result<Option<Vec<ManifestStatus>>> {
    if manifests.is_empty() {
        warn!("No manifests to query for context {}", context);
        return Ok(None);
    }

    let args = get_args(&manifests);
    let output = kubectl.execute(context, &args, None).await?;
    if !usable(&output) {
        if !output.stderr.trim().is_empty() {
            warn!("{}", output.stderr.trim());
        }
        return Ok(None);
    }

    Ok(Some(parse_statuses(&output.stdout, manifests)?))
}

/// One batched get covering every (kind, name) pair, scoped to the namespace
/// of the first manifest. Cross-namespace manifest sets are not supported.
fn get_args(manifests: &[Manifest]) -> Vec<String> {
    let mut args = vec!["--output=json".to_string()];
    if let Some(namespace) = manifests.first().and_then(Manifest::namespace) {
        args.push("--namespace".to_string());
        args.push(namespace.to_string());
    }
    args.push("get".to_string());
    for manifest in manifests {
        let (Some(kind), Some(name)) = (manifest.kind(), manifest.name()) else {
            continue;
        };
        args.push(format!("{}/{}", kind.to_lowercase(), name));
    }
    args
}

/// The query result is usable when the command succeeded or only complained
/// about missing objects, and actually produced output.
fn usable(output: &CommandOutput) -> bool {
    (output.success || output.stderr.contains("not found")) && !output.stdout.trim().is_empty()
}

/// Parse the get output (a single object or a heterogeneous list) and match
/// records back to manifests by (kind, name, namespace-or-"default").
fn parse_statuses(stdout: &str, manifests: Vec<Manifest>) -> Result<Vec<ManifestStatus>> {
    let parsed: Value = serde_json::from_str(stdout)?;
    let items: Vec<Value> = match parsed.get("items").and_then(Value::as_array) {
        Some(items) => items.clone(),
        None => vec![parsed],
    };

    let mut statuses: Vec<ManifestStatus> = manifests
        .into_iter()
        .map(|manifest| ManifestStatus {
            manifest,
            live: None,
        })
        .collect();

    for mut item in items {
        // TODO: support multiple containers
        let Some(tag) = first_container_tag(&item) else {
            debug!("Dropping live record without a readable container image");
            continue;
        };

        let status = item
            .as_object_mut()
            .and_then(|object| object.remove("status"))
            .unwrap_or(Value::Null);

        let kind = item
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = json_str(&item, &["metadata", "name"])
            .unwrap_or_default()
            .to_string();
        let namespace = json_str(&item, &["metadata", "namespace"])
            .unwrap_or("default")
            .to_string();

        let owner = statuses.iter_mut().find(|entry| {
            entry.manifest.kind() == Some(kind.as_str())
                && entry.manifest.name() == Some(name.as_str())
                && entry.manifest.namespace().unwrap_or("default") == namespace
        });
        let Some(owner) = owner else {
            debug!("Dropping live record {}/{} with no owning manifest", kind, name);
            continue;
        };
        owner.live = Some(LiveStatus {
            resource: item,
            tag,
            status,
        });
    }

    Ok(statuses)
}

/// Tag of the first container image under either template shape. An image
/// without a tag separator reports the whole reference.
fn first_container_tag(item: &Value) -> Option<String> {
    const PATHS: [&[&str]; 2] = [
        &["spec", "template", "spec", "containers"],
        &["spec", "jobTemplate", "spec", "template", "spec", "containers"],
    ];
    for path in PATHS {
        let containers = json_dig(item, path).and_then(Value::as_array);
        let Some(first) = containers.and_then(|c| c.first()) else {
            continue;
        };
        let image = first.get("image").and_then(Value::as_str)?;
        return image.rsplit(':').next().map(str::to_string);
    }
    None
}

fn json_dig<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |acc, key| acc.get(*key))
}

fn json_str<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    json_dig(value, path).and_then(Value::as_str)
}
