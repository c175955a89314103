//! Records exchanged with the remote platform.
//!
//! Every record is decoded by field name. Keys the pipeline does not use are
//! kept in an `extra` map so that annotations and project metas survive a
//! download/upload round trip unchanged.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Server-assigned keys that must not be sent back to a different instance.
const SERVER_ASSIGNED_KEYS: &[&str] = &[
    "id",
    "classId",
    "tagId",
    "labelerLogin",
    "createdAt",
    "updatedAt",
];

/// The four container levels of the platform hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Team,
    Workspace,
    Project,
    Dataset,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Team => "Team",
            NodeKind::Workspace => "Workspace",
            NodeKind::Project => "Project",
            NodeKind::Dataset => "Dataset",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A team, workspace, project or dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    pub name: String,
    /// Id of the containing node; `None` for teams.
    pub parent_id: Option<i64>,
}

impl NodeInfo {
    pub fn new(id: i64, name: impl Into<String>, parent_id: Option<i64>) -> Self {
        Self {
            id,
            name: name.into(),
            parent_id,
        }
    }
}

/// Dataset reference stored in the checkpoint for both sides of a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
}

impl From<&NodeInfo> for DatasetRef {
    fn from(node: &NodeInfo) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            project_id: node.parent_id.unwrap_or_default(),
        }
    }
}

/// An image in a dataset. Identity for diffing is `name` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl ImageRecord {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            meta: Map::new(),
        }
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }
}

/// A tag attached to an image or to a labeled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationTag {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// A labeled object inside an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationObject {
    #[serde(rename = "geometryType")]
    pub geometry_type: String,
    #[serde(rename = "classTitle", default, skip_serializing_if = "Option::is_none")]
    pub class_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<AnnotationTag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationObject {
    pub fn new(geometry_type: impl Into<String>, class_title: impl Into<String>) -> Self {
        Self {
            geometry_type: geometry_type.into(),
            class_title: Some(class_title.into()),
            tags: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Annotation payload of a single image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub objects: Vec<AnnotationObject>,
    #[serde(default)]
    pub tags: Vec<AnnotationTag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Annotation {
    /// True if any object has a geometry type from `types`.
    pub fn has_geometry_in(&self, types: &std::collections::BTreeSet<String>) -> bool {
        self.objects
            .iter()
            .any(|object| types.contains(&object.geometry_type))
    }

    /// True if any image-level tag is named `tag_name`.
    pub fn has_tag(&self, tag_name: &str) -> bool {
        self.tags.iter().any(|tag| tag.name == tag_name)
    }

    /// Bind this annotation to `meta`.
    ///
    /// Every object class and every tag must be defined in `meta`. Ids that
    /// the source instance assigned are stripped so the target can assign
    /// its own.
    pub fn materialize(&self, meta: &ProjectMeta) -> Result<Annotation> {
        let classes: HashSet<&str> = meta.classes.iter().map(|c| c.title.as_str()).collect();
        let tag_names: HashSet<&str> = meta.tags.iter().map(|t| t.name.as_str()).collect();

        let check_tag = |tag: &AnnotationTag| -> Result<AnnotationTag> {
            if !tag_names.contains(tag.name.as_str()) {
                return Err(SyncError::SchemaMismatch {
                    message: format!("tag '{}' is not defined in project meta", tag.name),
                });
            }
            Ok(AnnotationTag {
                name: tag.name.clone(),
                extra: strip_server_keys(&tag.extra),
            })
        };

        let mut objects = Vec::with_capacity(self.objects.len());
        for object in &self.objects {
            if let Some(title) = &object.class_title {
                if !classes.contains(title.as_str()) {
                    return Err(SyncError::SchemaMismatch {
                        message: format!("class '{}' is not defined in project meta", title),
                    });
                }
            }
            objects.push(AnnotationObject {
                geometry_type: object.geometry_type.clone(),
                class_title: object.class_title.clone(),
                tags: object.tags.iter().map(check_tag).collect::<Result<_>>()?,
                extra: strip_server_keys(&object.extra),
            });
        }

        Ok(Annotation {
            objects,
            tags: self.tags.iter().map(check_tag).collect::<Result<_>>()?,
            extra: self.extra.clone(),
        })
    }
}

fn strip_server_keys(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !SERVER_ASSIGNED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Annotation bound 1:1 to an image by image id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationRecord {
    pub image_id: i64,
    #[serde(default)]
    pub image_name: String,
    pub annotation: Annotation,
}

/// Object class definition in a project meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjClass {
    pub title: String,
    pub shape: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ObjClass {
    pub fn new(title: impl Into<String>, shape: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            shape: shape.into(),
            extra: Map::new(),
        }
    }
}

/// Tag type definition in a project meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMeta {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TagMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// Class and tag schema of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    #[serde(default)]
    pub classes: Vec<ObjClass>,
    #[serde(default)]
    pub tags: Vec<TagMeta>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectMeta {
    pub fn class_titles(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.title.as_str()).collect()
    }

    /// Additive merge: definitions from `source` whose name is missing here
    /// are appended. Existing definitions are left untouched.
    pub fn merged_with(&self, source: &ProjectMeta) -> ProjectMeta {
        let mut merged = self.clone();

        for class in &source.classes {
            if !merged.classes.iter().any(|c| c.title == class.title) {
                merged.classes.push(ObjClass {
                    title: class.title.clone(),
                    shape: class.shape.clone(),
                    extra: strip_server_keys(&class.extra),
                });
            }
        }
        for tag in &source.tags {
            if !merged.tags.iter().any(|t| t.name == tag.name) {
                merged.tags.push(TagMeta {
                    name: tag.name.clone(),
                    extra: strip_server_keys(&tag.extra),
                });
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    #[test]
    fn test_image_record_decodes_by_name() {
        let raw = json!({
            "id": 7,
            "name": "b.jpg",
            "hash": "abc",
            "width": 640,
            "meta": {"Source URL": "https://example.com/b.jpg"}
        });
        let image: ImageRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(image.id, 7);
        assert_eq!(image.name, "b.jpg");
        assert_eq!(image.meta["Source URL"], "https://example.com/b.jpg");
    }

    #[test]
    fn test_annotation_keeps_unknown_fields() {
        let raw = json!({
            "description": "",
            "size": {"height": 10, "width": 20},
            "tags": [{"name": "inference", "value": null}],
            "objects": [{
                "id": 11,
                "classId": 3,
                "classTitle": "cat",
                "geometryType": "bitmap",
                "bitmap": {"data": "eJw=", "origin": [0, 0]}
            }]
        });
        let ann: Annotation = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(ann.objects[0].geometry_type, "bitmap");
        assert_eq!(ann.tags[0].name, "inference");
        assert_eq!(serde_json::to_value(&ann).unwrap(), raw);
    }

    #[test]
    fn test_geometry_and_tag_checks() {
        let ann = Annotation {
            objects: vec![AnnotationObject::new("polygon", "dog")],
            tags: vec![AnnotationTag::new("inference")],
            extra: Map::new(),
        };
        let types: BTreeSet<String> = ["bitmap".to_string()].into();
        assert!(!ann.has_geometry_in(&types));
        let types: BTreeSet<String> = ["polygon".to_string()].into();
        assert!(ann.has_geometry_in(&types));
        assert!(ann.has_tag("inference"));
        assert!(!ann.has_tag("review"));
    }

    #[test]
    fn test_materialize_strips_ids_and_validates() {
        let raw = json!({
            "tags": [{"name": "inference", "tagId": 4, "id": 99}],
            "objects": [{"id": 1, "classId": 2, "classTitle": "cat", "geometryType": "bitmap"}]
        });
        let ann: Annotation = serde_json::from_value(raw).unwrap();

        let meta = ProjectMeta {
            classes: vec![ObjClass::new("cat", "bitmap")],
            tags: vec![TagMeta::new("inference")],
            extra: Map::new(),
        };
        let bound = ann.materialize(&meta).unwrap();
        assert!(!bound.objects[0].extra.contains_key("id"));
        assert!(!bound.objects[0].extra.contains_key("classId"));
        assert!(!bound.tags[0].extra.contains_key("tagId"));

        let empty = ProjectMeta::default();
        let err = ann.materialize(&empty).unwrap_err();
        assert!(matches!(err, SyncError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_meta_merge_is_additive() {
        let target = ProjectMeta {
            classes: vec![ObjClass::new("cat", "polygon")],
            tags: vec![],
            extra: Map::new(),
        };
        let source = ProjectMeta {
            classes: vec![ObjClass::new("cat", "bitmap"), ObjClass::new("dog", "bitmap")],
            tags: vec![TagMeta::new("inference")],
            extra: Map::new(),
        };
        let merged = target.merged_with(&source);
        assert_eq!(merged.class_titles(), vec!["cat", "dog"]);
        // Existing definitions win.
        assert_eq!(merged.classes[0].shape, "polygon");
        assert_eq!(merged.tags.len(), 1);
    }
}
