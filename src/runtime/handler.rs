use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::CommandAction;

/// One platform operation, registered under its command action. Handlers
/// are idempotent: re-running a start for a live session or a stop for a
/// missing workload both succeed.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Action-to-handler lookup for the command loop. An action with no
/// registered handler is answered with `failed(unknown_action)`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandAction, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: CommandAction, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(action, handler);
    }

    pub fn get(&self, action: CommandAction) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&action).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandHandler for Echo {
        async fn handle(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn lookup_and_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry.register(CommandAction::ListSessions, Arc::new(Echo));

        let handler = registry.get(CommandAction::ListSessions).unwrap();
        let out = handler.handle(serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out["x"], 1);

        assert!(registry.get(CommandAction::StartSession).is_none());
    }
}
