//! Inlines resources referenced as `mcp://<server>/<resource>` in user messages.

use std::{collections::HashSet, time::Duration};

use super::types::ChatMessage;
use crate::mcp::{ServerManager, uri::extract_mcp_uris};

/// Reads every resource referenced by a user message and prepends one system
/// message per resource. Unreadable references are logged and skipped.
/// Returns the number of resources added.
pub async fn inject_resource_context(
    manager: &ServerManager,
    messages: &mut Vec<ChatMessage>,
    timeout: Duration,
    request_id: &str,
) -> usize {
    let mut seen = HashSet::new();
    let uris: Vec<_> = messages
        .iter()
        .filter(|m| m.role == "user")
        .flat_map(|m| extract_mcp_uris(&m.text()))
        .filter(|uri| seen.insert(uri.clone()))
        .collect();
    if uris.is_empty() {
        return 0;
    }

    let mut context = Vec::with_capacity(uris.len());
    for uri in uris {
        match manager
            .read_resource(&uri.server, &uri.resource, timeout)
            .await
        {
            Ok(result) => {
                tracing::debug!(request_id = %request_id, resource = %uri, "Injected resource context");
                context.push(ChatMessage::system(format!(
                    "Resource from {uri}:\n{}",
                    result.text()
                )));
            }
            Err(e) => {
                tracing::warn!(request_id = %request_id, resource = %uri, error = %e, "Failed to read referenced resource");
            }
        }
    }

    let added = context.len();
    messages.splice(0..0, context);
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{FakeReply, FakeTransport};
    use crate::mcp::{ConnectionPool, McpServerConfig, PoolConfig, Transport};
    use serde_json::json;
    use std::sync::Arc;

    async fn manager(fake: FakeTransport) -> (ServerManager, Arc<FakeTransport>) {
        let manager = ServerManager::new(Arc::new(ConnectionPool::new(PoolConfig::default())));
        let fake = Arc::new(fake);
        manager
            .register(
                McpServerConfig::stdio("docs", "unused", vec![]),
                Arc::clone(&fake) as Arc<dyn Transport>,
            )
            .unwrap()
            .establish()
            .await
            .unwrap();
        (manager, fake)
    }

    #[tokio::test]
    async fn test_injects_resource_before_conversation() {
        let (manager, fake) = manager(FakeTransport::new().on(
            "resources/read",
            FakeReply::Result(json!({
                "contents": [{"uri": "file:///guide.md", "text": "# Guide"}]
            })),
        ))
        .await;

        let mut messages = vec![ChatMessage::user(
            "Summarize mcp://docs/file:///guide.md and mcp://docs/file:///guide.md please",
        )];
        let added =
            inject_resource_context(&manager, &mut messages, Duration::from_secs(5), "r").await;

        assert_eq!(added, 1);
        assert_eq!(fake.count("resources/read"), 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(
            messages[0].text(),
            "Resource from mcp://docs/file:///guide.md:\n# Guide"
        );
    }

    #[tokio::test]
    async fn test_unknown_server_is_skipped() {
        let (manager, _fake) = manager(FakeTransport::new()).await;
        let mut messages = vec![ChatMessage::user("see mcp://nowhere/thing")];
        let added =
            inject_resource_context(&manager, &mut messages, Duration::from_secs(5), "r").await;
        assert_eq!(added, 0);
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_assistant_mentions_are_ignored() {
        let (manager, fake) = manager(FakeTransport::new()).await;
        let mut messages = vec![ChatMessage::assistant("try mcp://docs/readme")];
        inject_resource_context(&manager, &mut messages, Duration::from_secs(5), "r").await;
        assert_eq!(fake.count("resources/read"), 0);
    }
}
