use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::image::Image;
use serde::Deserialize;
use serde_yaml_ng::Value;

/// Container lists live under one of two nestings, depending on whether the
/// object is deployment-shaped or cronjob-shaped.
pub const CONTAINER_PATHS: [&[&str]; 2] = [
    &["spec", "template", "spec", "containers"],
    &["spec", "jobTemplate", "spec", "template", "spec", "containers"],
];

/// One Kubernetes manifest document. The value is kept whole so unknown
/// fields round-trip untouched through rewrite and apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest(Value);

impl Manifest {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        dig(&self.0, &["metadata", "name"]).and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        dig(&self.0, &["metadata", "namespace"]).and_then(Value::as_str)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(&self.0)?)
    }
}

/// Load every manifest document under `platform/<context>/` at `commit`,
/// flattened in path order. Blobs may hold multiple YAML documents; empty
/// documents are dropped.
pub async fn load(repo: &GitRepo, commit: &str, context: &str) -> Result<Vec<Manifest>> {
    let prefix = format!("platform/{context}/");
    let entries = repo.blobs_under(commit, &prefix).await?;
    if entries.is_empty() {
        return Err(Error::ManifestNotFound(context.to_string()));
    }

    let mut documents = Vec::new();
    for entry in entries {
        let text = repo.show(commit, &entry.path).await?;
        for doc in serde_yaml_ng::Deserializer::from_str(&text) {
            let value = Value::deserialize(doc)?;
            if !value.is_null() {
                documents.push(Manifest::from_value(value));
            }
        }
    }
    Ok(documents)
}

/// Rewrite container image references to the resolved remote artifacts and
/// return the documents that reference at least one configured image.
///
/// Input documents are never mutated; rewriting happens on deep copies. A
/// container image that equals a configured image's untagged `registry/name`
/// coordinate is replaced with the fully tagged one. An untagged image that
/// matches nothing is an error: it would deploy an artifact nobody built.
pub fn rewrite(documents: &[Manifest], images: &[Image]) -> Result<Vec<Manifest>> {
    let mut selected = Vec::new();

    for document in documents {
        let mut document = document.clone();
        let mut matched = false;

        for path in CONTAINER_PATHS {
            let Some(containers) = dig_mut(&mut document.0, path).and_then(Value::as_sequence_mut)
            else {
                continue;
            };
            for container in containers {
                let Some(reference) = container.get("image").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(image) = images.iter().find(|i| i.remote_repo() == reference) {
                    let remote_image = image.remote_image().ok_or_else(|| Error::Resolution {
                        reference: image.name().to_string(),
                        detail: "image has no resolved tag".to_string(),
                    })?;
                    if let Some(mapping) = container.as_mapping_mut() {
                        mapping.insert(
                            Value::String("image".to_string()),
                            Value::String(remote_image),
                        );
                    }
                    matched = true;
                } else if !reference.contains(':') {
                    return Err(Error::UnknownImageReference(reference.to_string()));
                }
            }
        }

        if matched {
            selected.push(document);
        }
    }

    Ok(selected)
}

/// Serialize a document set as one YAML stream for `apply -f -`.
pub fn to_stream(documents: &[Manifest]) -> Result<String> {
    let mut rendered = Vec::with_capacity(documents.len());
    for document in documents {
        rendered.push(document.to_yaml()?);
    }
    Ok(rendered.join("---\n"))
}

fn dig<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |acc, key| acc.get(*key))
}

fn dig_mut<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |acc, key| acc.get_mut(*key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn image(name: &str, tag: &str) -> Image {
        let mut image = Image::new(name, Path::new("/repo"), "Dockerfile", "registry.example.com");
        image.set_commit("abc12345deadbeefabc12345deadbeefabc12345");
        image.set_tag(tag);
        image
    }

    fn manifest(yaml: &str) -> Manifest {
        Manifest::from_value(serde_yaml_ng::from_str(yaml).expect("valid yaml"))
    }

    fn deployment(image_ref: &str) -> Manifest {
        manifest(&format!(
            r#"
kind: Deployment
metadata:
  name: svc
spec:
  template:
    spec:
      containers:
        - name: svc
          image: {image_ref}
"#
        ))
    }

    fn container_image(manifest: &Manifest, path: &[&str]) -> String {
        dig(&manifest.0, path)
            .and_then(Value::as_sequence)
            .and_then(|seq| seq.first())
            .and_then(|c| c.get("image"))
            .and_then(Value::as_str)
            .expect("container image")
            .to_string()
    }

    #[test]
    fn untagged_match_is_rewritten() {
        let docs = vec![deployment("registry.example.com/svc")];
        let images = vec![image("svc", "abc12345")];

        let selected = rewrite(&docs, &images).expect("rewrite");
        assert_eq!(selected.len(), 1);
        assert_eq!(
            container_image(&selected[0], CONTAINER_PATHS[0]),
            "registry.example.com/svc:abc12345"
        );
        // input untouched
        assert_eq!(
            container_image(&docs[0], CONTAINER_PATHS[0]),
            "registry.example.com/svc"
        );
    }

    #[test]
    fn tagged_references_pass_through() {
        let docs = vec![deployment("registry.example.com/svc:v1.2")];
        let images = vec![image("svc", "abc12345")];

        let selected = rewrite(&docs, &images).expect("rewrite");
        // pinned to a foreign tag: untouched and therefore unselected
        assert!(selected.is_empty());
    }

    #[test]
    fn untagged_unknown_reference_is_fatal() {
        let docs = vec![deployment("registry.example.com/unknown-app")];
        let images = vec![image("svc", "abc12345")];

        let err = rewrite(&docs, &images).unwrap_err();
        assert!(matches!(err, Error::UnknownImageReference(_)));
    }

    #[test]
    fn documents_without_matches_are_excluded() {
        let docs = vec![
            deployment("registry.example.com/svc"),
            manifest("kind: ConfigMap\nmetadata:\n  name: settings\ndata: {}\n"),
        ];
        let images = vec![image("svc", "abc12345")];

        let selected = rewrite(&docs, &images).expect("rewrite");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), Some("svc"));
    }

    #[test]
    fn cronjob_containers_are_rewritten_too() {
        let docs = vec![manifest(
            r#"
kind: CronJob
metadata:
  name: sweeper
spec:
  jobTemplate:
    spec:
      template:
        spec:
          containers:
            - name: sweeper
              image: registry.example.com/sweeper
"#,
        )];
        let images = vec![image("sweeper", "abc12345")];

        let selected = rewrite(&docs, &images).expect("rewrite");
        assert_eq!(selected.len(), 1);
        assert_eq!(
            container_image(&selected[0], CONTAINER_PATHS[1]),
            "registry.example.com/sweeper:abc12345"
        );
    }

    #[test]
    fn stream_joins_documents() {
        let docs = vec![
            manifest("kind: Deployment\nmetadata:\n  name: a\n"),
            manifest("kind: Service\nmetadata:\n  name: b\n"),
        ];
        let stream = to_stream(&docs).expect("stream");
        assert!(stream.contains("---\n"));
        assert!(stream.contains("name: a"));
        assert!(stream.contains("name: b"));
    }

    #[test]
    fn accessors_read_identity_fields() {
        let m = manifest(
            "kind: StatefulSet\nmetadata:\n  name: db\n  namespace: storage\n",
        );
        assert_eq!(m.kind(), Some("StatefulSet"));
        assert_eq!(m.name(), Some("db"));
        assert_eq!(m.namespace(), Some("storage"));
    }
}
