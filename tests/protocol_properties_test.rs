//! Property tests: pagination partitions the registry, and wire values
//! survive marshal/unmarshal round trips.

use proptest::prelude::*;

use mcp_runtime::server::registry::{encode_cursor, paginate};
use mcp_runtime::types::{
    Annotations, Content, JSONRPCResponse, PromptContent, RequestId, ResourceContents, Role,
};

fn unique_keys() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::btree_set("[a-z]{1,8}", 0..20)
        .prop_map(|set| set.into_iter().collect())
}

fn content_strategy() -> impl Strategy<Value = Content> {
    let annotations = proptest::option::of(
        (proptest::option::of(0.0f64..=1.0), proptest::bool::ANY).prop_map(
            |(priority, to_user)| Annotations {
                audience: Some(vec![if to_user { Role::User } else { Role::Assistant }]),
                priority,
                last_modified: None,
            },
        ),
    );
    (any::<String>(), annotations).prop_map(|(text, annotations)| Content::Text {
        text,
        annotations,
    })
}

proptest! {
    #[test]
    fn pagination_partitions_the_list(keys in unique_keys(), limit in 1usize..6) {
        let items: Vec<(String, String)> = keys
            .iter()
            .map(|k| (k.clone(), format!("v-{k}")))
            .collect();

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        let mut rounds = 0;
        loop {
            let (page, next) = paginate(&items, cursor.as_deref(), Some(limit)).unwrap();
            prop_assert!(page.len() <= limit);
            // A cursor is present exactly when the page is full.
            prop_assert_eq!(next.is_some(), page.len() == limit);
            collected.extend(page);
            rounds += 1;
            prop_assert!(rounds <= items.len() + 2, "pagination did not terminate");
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        let full: Vec<String> = items.iter().map(|(_, v)| v.clone()).collect();
        prop_assert_eq!(collected, full);
    }

    #[test]
    fn cursor_encoding_round_trips(key in "[ -~]{0,32}") {
        let cursor = encode_cursor(&key);
        let decoded = mcp_runtime::server::registry::decode_cursor(&cursor).unwrap();
        prop_assert_eq!(decoded, key);
    }

    #[test]
    fn request_ids_round_trip(n in any::<i64>(), s in "[a-zA-Z0-9-]{0,16}") {
        for id in [RequestId::Number(n), RequestId::String(s)] {
            let value = serde_json::to_value(&id).unwrap();
            let back: RequestId = serde_json::from_value(value).unwrap();
            prop_assert_eq!(back, id);
        }
    }

    #[test]
    fn text_content_round_trips(content in content_strategy()) {
        let value = serde_json::to_value(&content).unwrap();
        let back: Content = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, content);
    }

    #[test]
    fn prompt_content_round_trips_either_shape(texts in proptest::collection::vec(any::<String>(), 1..4), single in proptest::bool::ANY) {
        let contents: Vec<Content> = texts.iter().map(Content::text).collect();
        let content = if single {
            PromptContent::Single(contents[0].clone())
        } else {
            PromptContent::Multiple(contents)
        };
        let value = serde_json::to_value(&content).unwrap();
        let back: PromptContent = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, content);
    }

    #[test]
    fn responses_round_trip(id in any::<i64>(), ok in proptest::bool::ANY, message in ".{0,40}") {
        let response = if ok {
            JSONRPCResponse::success(RequestId::Number(id), serde_json::json!({"m": message}))
        } else {
            JSONRPCResponse::error(
                RequestId::Number(id),
                mcp_runtime::JSONRPCError { code: -32603, message, data: None },
            )
        };
        let value = serde_json::to_value(&response).unwrap();
        let back: JSONRPCResponse = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, response);
    }

    #[test]
    fn resource_contents_round_trip(uri in "[a-z]{2,6}://[a-z/]{0,20}", text in any::<String>()) {
        let contents = ResourceContents::Text {
            uri,
            mime_type: Some("text/plain".to_string()),
            text,
            _meta: None,
        };
        let value = serde_json::to_value(&contents).unwrap();
        let back: ResourceContents = serde_json::from_value(value).unwrap();
        prop_assert_eq!(back, contents);
    }
}
