//! MCP content values and annotations.
//!
//! [`Content`] is the sum type carried by tool results, resource reads,
//! and prompt messages, discriminated on the wire by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who a piece of content is intended for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human user.
    User,
    /// The model.
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// Optional display metadata attachable to any content value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    /// Intended audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<Role>>,
    /// Importance in `[0, 1]`; 1 means effectively required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    /// ISO 8601 timestamp of the last modification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// The contents of a resource: text or base64 binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceContents {
    /// Textual contents.
    #[serde(rename_all = "camelCase")]
    Text {
        /// URI of the resource.
        uri: String,
        /// MIME type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// The text.
        text: String,
        /// Optional metadata.
        #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
        #[allow(clippy::pub_underscore_fields)]
        _meta: Option<Map<String, Value>>,
    },
    /// Binary contents, base64-encoded.
    #[serde(rename_all = "camelCase")]
    Blob {
        /// URI of the resource.
        uri: String,
        /// MIME type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Base64 payload.
        blob: String,
        /// Optional metadata.
        #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
        #[allow(clippy::pub_underscore_fields)]
        _meta: Option<Map<String, Value>>,
    },
}

impl ResourceContents {
    /// The URI these contents belong to.
    pub fn uri(&self) -> &str {
        match self {
            Self::Text { uri, .. } | Self::Blob { uri, .. } => uri,
        }
    }
}

/// A content value, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Content {
    /// Plain text.
    #[serde(rename = "text", rename_all = "camelCase")]
    Text {
        /// The text.
        text: String,
        /// Optional annotations.
        #[serde(skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// An image, base64-encoded.
    #[serde(rename = "image", rename_all = "camelCase")]
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type, e.g. `image/png`.
        mime_type: String,
        /// Optional annotations.
        #[serde(skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// An audio clip, base64-encoded.
    #[serde(rename = "audio", rename_all = "camelCase")]
    Audio {
        /// Base64 payload.
        data: String,
        /// MIME type, e.g. `audio/wav`.
        mime_type: String,
        /// Optional annotations.
        #[serde(skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// A link to a resource the client may read later.
    #[serde(rename = "resource_link", rename_all = "camelCase")]
    ResourceLink {
        /// URI of the linked resource.
        uri: String,
        /// Display name.
        name: String,
        /// Human-readable description.
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// MIME type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        /// Optional annotations.
        #[serde(skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
    /// A resource embedded inline.
    #[serde(rename = "resource", rename_all = "camelCase")]
    Resource {
        /// The embedded contents.
        resource: ResourceContents,
        /// Optional annotations.
        #[serde(skip_serializing_if = "Option::is_none")]
        annotations: Option<Annotations>,
    },
}

impl Content {
    /// Plain text content with no annotations.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            annotations: None,
        }
    }
}

/// The content of a prompt message.
///
/// Early servers emitted a single content object; the protocol later
/// grew an ordered list form. Both shapes round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptContent {
    /// A single content value.
    Single(Content),
    /// An ordered sequence of content values.
    Multiple(Vec<Content>),
}

impl From<Content> for PromptContent {
    fn from(content: Content) -> Self {
        Self::Single(content)
    }
}

impl From<Vec<Content>> for PromptContent {
    fn from(contents: Vec<Content>) -> Self {
        Self::Multiple(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_content_tagging() {
        let content = Content::text("hello");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "hello");

        let back: Content = serde_json::from_value(value).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn all_variants_round_trip() {
        let variants = vec![
            Content::text("t"),
            Content::Image {
                data: "aGk=".into(),
                mime_type: "image/png".into(),
                annotations: None,
            },
            Content::Audio {
                data: "aGk=".into(),
                mime_type: "audio/wav".into(),
                annotations: Some(Annotations {
                    audience: Some(vec![Role::User]),
                    priority: Some(0.5),
                    last_modified: Some("2025-01-12T15:00:58Z".into()),
                }),
            },
            Content::ResourceLink {
                uri: "file:///a.txt".into(),
                name: "a.txt".into(),
                description: None,
                mime_type: Some("text/plain".into()),
                annotations: None,
            },
            Content::Resource {
                resource: ResourceContents::Text {
                    uri: "file:///a.txt".into(),
                    mime_type: Some("text/plain".into()),
                    text: "body".into(),
                    _meta: None,
                },
                annotations: None,
            },
        ];

        for content in variants {
            let value = serde_json::to_value(&content).unwrap();
            let back: Content = serde_json::from_value(value).unwrap();
            assert_eq!(back, content);
        }
    }

    #[test]
    fn embedded_resource_wire_shape() {
        let content = Content::Resource {
            resource: ResourceContents::Blob {
                uri: "file:///img.bin".into(),
                mime_type: None,
                blob: "AAAA".into(),
                _meta: None,
            },
            annotations: None,
        };
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["type"], "resource");
        assert_eq!(value["resource"]["blob"], "AAAA");
    }

    #[test]
    fn resource_contents_meta_round_trips() {
        let mut meta = Map::new();
        meta.insert("revision".to_string(), json!(3));
        let contents = ResourceContents::Text {
            uri: "mem://doc".into(),
            mime_type: None,
            text: "x".into(),
            _meta: Some(meta),
        };
        let value = serde_json::to_value(&contents).unwrap();
        assert_eq!(value["_meta"]["revision"], 3);
        let back: ResourceContents = serde_json::from_value(value).unwrap();
        assert_eq!(back, contents);
    }

    #[test]
    fn prompt_content_accepts_both_shapes() {
        let single: PromptContent = serde_json::from_value(json!({
            "type": "text", "text": "hi"
        }))
        .unwrap();
        assert!(matches!(single, PromptContent::Single(_)));

        let multiple: PromptContent = serde_json::from_value(json!([
            {"type": "text", "text": "hi"},
            {"type": "text", "text": "there"}
        ]))
        .unwrap();
        match &multiple {
            PromptContent::Multiple(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list form, got {other:?}"),
        }

        for content in [single, multiple] {
            let value = serde_json::to_value(&content).unwrap();
            let back: PromptContent = serde_json::from_value(value).unwrap();
            assert_eq!(back, content);
        }
    }
}
