//! Image extraction from arbitrary resources.
//!
//! Each extractor path is a slash-separated list of object fields. A `*`
//! segment expands every element of an array or every entry of an object.
//! Once all segments are consumed the walk must stand on an object, whose
//! value field holds the image string.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::PolicyError;
use crate::expression;
use crate::image::ImageInfo;
use crate::policy::ImageExtractorConfig;

/// Group name used when an extractor does not set one.
pub const DEFAULT_EXTRACTOR_NAME: &str = "custom";

/// One image found in a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    /// The (normalized) image string as it was parsed.
    pub raw: String,
    /// The parsed reference.
    pub info: ImageInfo,
    /// JSON pointer of the value field the image came from.
    pub pointer: String,
}

/// Images keyed by location: the JSON pointer, or the configured key field.
///
/// When two extractors produce the same key the later one wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedImages {
    images: BTreeMap<String, ExtractedImage>,
}

impl ExtractedImages {
    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Returns `true` when nothing was found.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Look up an image by location key.
    pub fn get(&self, key: &str) -> Option<&ExtractedImage> {
        self.images.get(key)
    }

    /// Iterate `(location key, image)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtractedImage)> {
        self.images.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The value bound to `images` in the evaluation context:
    /// `{"containers": {<key>: <image info + jsonPointer>}}`.
    pub fn to_context_value(&self) -> Value {
        let containers: Map<String, Value> = self
            .images
            .iter()
            .map(|(key, image)| (key.clone(), image.info.to_context_value(&image.pointer)))
            .collect();
        let mut images = Map::new();
        images.insert("containers".to_owned(), Value::Object(containers));
        Value::Object(images)
    }

    fn insert(&mut self, key: String, image: ExtractedImage) {
        if let Some(previous) = self.images.insert(key.clone(), image) {
            debug!(
                key = %key,
                previous = %previous.raw,
                "image key collision; later extractor wins"
            );
        }
    }
}

/// An extractor with its path split and defaults applied.
struct Extractor<'a> {
    name: &'a str,
    fields: Vec<&'a str>,
    value: &'a str,
    key: Option<&'a str>,
    jmes_path: Option<&'a str>,
}

impl<'a> Extractor<'a> {
    fn new(config: &'a ImageExtractorConfig) -> Result<Self, PolicyError> {
        let mut fields: Vec<&str> = config
            .path
            .split('/')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        let value = match config.value.as_deref().filter(|v| !v.trim().is_empty()) {
            Some(value) => value,
            None => fields
                .pop()
                .ok_or_else(|| PolicyError::InvalidPath(config.path.clone()))?,
        };
        Ok(Self {
            name: config.name.as_deref().unwrap_or(DEFAULT_EXTRACTOR_NAME),
            fields,
            value,
            key: config.key.as_deref().filter(|k| !k.is_empty()),
            jmes_path: config.jmes_path.as_deref().filter(|j| !j.is_empty()),
        })
    }

    fn walk(
        &self,
        node: &Value,
        depth: usize,
        path: &mut Vec<String>,
        out: &mut ExtractedImages,
    ) -> Result<(), PolicyError> {
        if node.is_null() {
            return Ok(());
        }

        match self.fields.get(depth) {
            Some(&"*") => match node {
                Value::Array(items) => {
                    for (idx, item) in items.iter().enumerate() {
                        path.push(idx.to_string());
                        self.walk(item, depth + 1, path, out)?;
                        path.pop();
                    }
                    Ok(())
                }
                Value::Object(entries) => {
                    for (name, item) in entries {
                        path.push(name.clone());
                        self.walk(item, depth + 1, path, out)?;
                        path.pop();
                    }
                    Ok(())
                }
                _ => Err(PolicyError::InvalidType {
                    pointer: pointer(path, None),
                }),
            },
            Some(field) => {
                let object = node.as_object().ok_or_else(|| PolicyError::InvalidImageConfig {
                    pointer: pointer(path, None),
                })?;
                let child = object.get(*field).unwrap_or(&Value::Null);
                path.push((*field).to_owned());
                let result = self.walk(child, depth + 1, path, out);
                path.pop();
                result
            }
            None => {
                let object = node.as_object().ok_or_else(|| PolicyError::InvalidImageConfig {
                    pointer: pointer(path, None),
                })?;
                self.leaf(object, path, out)
            }
        }
    }

    fn leaf(
        &self,
        object: &Map<String, Value>,
        path: &[String],
        out: &mut ExtractedImages,
    ) -> Result<(), PolicyError> {
        let pointer = pointer(path, Some(self.value));
        let key = match self.key {
            Some(field) => object
                .get(field)
                .and_then(Value::as_str)
                .ok_or_else(|| PolicyError::InvalidKey {
                    field: field.to_owned(),
                    pointer: pointer.clone(),
                })?
                .to_owned(),
            None => pointer.clone(),
        };

        let raw = match object.get(self.value).and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => value,
            _ => {
                trace!(pointer = %pointer, extractor = self.name, "image not present");
                return Ok(());
            }
        };

        let raw = match self.jmes_path {
            Some(expression) => match expression::search(
                expression,
                &Value::String(raw.to_owned()),
            )? {
                Value::String(normalized) => normalized,
                produced => {
                    return Err(PolicyError::NotAString {
                        expression: expression.to_owned(),
                        produced,
                    });
                }
            },
            None => raw.to_owned(),
        };

        let info = ImageInfo::parse(&raw).map_err(|source| PolicyError::InvalidImage {
            image: raw.clone(),
            source,
        })?;
        trace!(pointer = %pointer, key = %key, image = %info, "extracted image");
        out.insert(key, ExtractedImage { raw, info, pointer });
        Ok(())
    }
}

fn pointer(path: &[String], leaf: Option<&str>) -> String {
    let mut pointer = String::new();
    for segment in path.iter().map(String::as_str).chain(leaf) {
        pointer.push('/');
        pointer.push_str(segment);
    }
    if pointer.is_empty() {
        pointer.push('/');
    }
    pointer
}

/// Run every extractor over `resource` and merge the results.
pub fn extract_images(
    resource: &Value,
    configs: &[ImageExtractorConfig],
) -> Result<ExtractedImages, PolicyError> {
    let mut out = ExtractedImages::default();
    for config in configs {
        let extractor = Extractor::new(config)?;
        extractor.walk(resource, 0, &mut Vec::new(), &mut out)?;
    }
    debug!(count = out.len(), "images extracted");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_definition() -> Value {
        json!({
            "containerDefinitions": [
                {
                    "essential": true,
                    "image": "httpd:2.4",
                    "name": "sample-fargate-app",
                    "portMappings": [{ "containerPort": 80, "hostPort": 80 }]
                }
            ],
            "cpu": "256",
            "family": "fargate-task-definition"
        })
    }

    fn config(path: &str) -> ImageExtractorConfig {
        ImageExtractorConfig {
            name: Some("test".to_owned()),
            path: path.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn wildcard_over_array() {
        let images =
            extract_images(&task_definition(), &[config("/containerDefinitions/*/image/")])
                .unwrap();
        assert_eq!(images.len(), 1);
        let image = images.get("/containerDefinitions/0/image").unwrap();
        assert_eq!(image.info.to_string(), "docker.io/httpd:2.4");
        assert_eq!(image.pointer, "/containerDefinitions/0/image");
    }

    #[test]
    fn missing_value_field_is_skipped() {
        let images =
            extract_images(&task_definition(), &[config("/containerDefinitions/*/invalid/")])
                .unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn blank_value_is_skipped() {
        let doc = json!({ "containers": [{ "image": "  " }, { "image": "nginx" }] });
        let images = extract_images(&doc, &[config("containers/*/image")]).unwrap();
        assert_eq!(images.len(), 1);
        assert!(images.get("/containers/1/image").is_some());
    }

    #[test]
    fn literal_segment_on_array_is_invalid_config() {
        let err = extract_images(&task_definition(), &[config("/containerDefinitions/0/image/")])
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidImageConfig { .. }), "got: {err}");
    }

    #[test]
    fn wildcard_on_scalar_is_invalid_type() {
        let err = extract_images(&task_definition(), &[config("/cpu/*/image")]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidType { .. }), "got: {err}");
    }

    #[test]
    fn wildcard_over_object_entries() {
        let doc = json!({
            "services": {
                "web": { "image": "nginx:1" },
                "db": { "image": "postgres:16" }
            }
        });
        let images = extract_images(&doc, &[config("services/*/image")]).unwrap();
        let keys: Vec<&str> = images.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["/services/db/image", "/services/web/image"]);
    }

    #[test]
    fn empty_container_yields_nothing() {
        let doc = json!({ "containers": [] });
        assert!(extract_images(&doc, &[config("containers/*/image")]).unwrap().is_empty());
    }

    #[test]
    fn explicit_value_and_key() {
        let doc = json!({ "containers": [{ "name": "web", "ref": "nginx:1.25" }] });
        let cfg = ImageExtractorConfig {
            path: "/containers/*".to_owned(),
            value: Some("ref".to_owned()),
            key: Some("name".to_owned()),
            ..Default::default()
        };
        let images = extract_images(&doc, &[cfg]).unwrap();
        let image = images.get("web").unwrap();
        assert_eq!(image.pointer, "/containers/0/ref");
    }

    #[test]
    fn missing_key_field_is_an_error() {
        let doc = json!({ "containers": [{ "ref": "nginx:1.25" }] });
        let cfg = ImageExtractorConfig {
            path: "/containers/*".to_owned(),
            value: Some("ref".to_owned()),
            key: Some("name".to_owned()),
            ..Default::default()
        };
        let err = extract_images(&doc, &[cfg]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidKey { .. }), "got: {err}");
    }

    #[test]
    fn jmespath_normalizes_value() {
        let doc = json!({ "steps": [{ "uses": "docker://alpine:3.19" }] });
        let cfg = ImageExtractorConfig {
            path: "/steps/*/uses".to_owned(),
            jmes_path: Some("trim_prefix(@, 'docker://')".to_owned()),
            ..Default::default()
        };
        let images = extract_images(&doc, &[cfg]).unwrap();
        assert_eq!(images.get("/steps/0/uses").unwrap().raw, "alpine:3.19");
    }

    #[test]
    fn jmespath_must_produce_string() {
        let doc = json!({ "steps": [{ "uses": "alpine" }] });
        let cfg = ImageExtractorConfig {
            path: "/steps/*/uses".to_owned(),
            jmes_path: Some("length(@)".to_owned()),
            ..Default::default()
        };
        let err = extract_images(&doc, &[cfg]).unwrap_err();
        assert!(err.to_string().contains("must produce a string"), "got: {err}");
    }

    #[test]
    fn unparseable_image_is_reported() {
        let doc = json!({ "containers": [{ "image": "Nginx:1" }] });
        let err = extract_images(&doc, &[config("containers/*/image")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid image 'Nginx:1' (repository name must be lowercase)"
        );
    }

    #[test]
    fn later_extractor_wins_on_collision() {
        let doc = json!({
            "a": [{ "image": "nginx:1", "id": "x" }],
            "b": [{ "image": "nginx:2", "id": "x" }]
        });
        let keyed = |path: &str| ImageExtractorConfig {
            path: path.to_owned(),
            key: Some("id".to_owned()),
            ..Default::default()
        };
        let images = extract_images(&doc, &[keyed("a/*/image"), keyed("b/*/image")]).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images.get("x").unwrap().info.tag, "2");
    }

    #[test]
    fn empty_path_is_invalid() {
        let err = extract_images(&json!({}), &[config(" / ")]).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPath(_)));
    }

    #[test]
    fn context_value_groups_under_containers() {
        let images =
            extract_images(&task_definition(), &[config("containerDefinitions/*/image")])
                .unwrap();
        let value = images.to_context_value();
        assert_eq!(
            value["containers"]["/containerDefinitions/0/image"]["registry"],
            "docker.io"
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// A single wildcard over N present values yields N distinct pointers.
            #[test]
            fn one_entry_per_element(n in 0usize..16) {
                let items: Vec<Value> = (0..n)
                    .map(|i| json!({ "image": format!("app{i}:v1") }))
                    .collect();
                let doc = json!({ "containers": items });
                let images = extract_images(&doc, &[config("containers/*/image")]).unwrap();
                prop_assert_eq!(images.len(), n);
                for i in 0..n {
                    let key = format!("/containers/{i}/image");
                    prop_assert!(images.get(&key).is_some());
                }
            }
        }
    }
}
