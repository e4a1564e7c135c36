//! Per-session conversation history.
//!
//! Append-only log of user messages, assistant messages, tool calls, and
//! tool results. A snapshot of the tail is attached to every webhook
//! dispatch so workflows can see what the user actually asked for.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    UserMessage {
        text: String,
        ts: DateTime<Utc>,
    },
    AssistantMessage {
        text: String,
        ts: DateTime<Utc>,
    },
    ToolCall {
        tool_call_id: String,
        function_name: String,
        args: Value,
        ts: DateTime<Utc>,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
        ts: DateTime<Utc>,
    },
}

/// Aggregate counters, included in the final session audit record.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ContextCounters {
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub tool_calls: u64,
    pub tool_results: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConversationContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered event log for one session. Callers wrap it in a per-session
/// mutex; appends are never interleaved mid-item.
pub struct ConversationContext {
    items: Vec<ContextItem>,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    counters: ContextCounters,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationContext {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            items: Vec::new(),
            started_at: now,
            last_activity: now,
            counters: ContextCounters::default(),
        }
    }

    pub fn push_user_message(&mut self, text: impl Into<String>) {
        self.counters.user_messages += 1;
        self.push(ContextItem::UserMessage {
            text: text.into(),
            ts: Utc::now(),
        });
    }

    pub fn push_assistant_message(&mut self, text: impl Into<String>) {
        self.counters.assistant_messages += 1;
        self.push(ContextItem::AssistantMessage {
            text: text.into(),
            ts: Utc::now(),
        });
    }

    pub fn push_tool_call(&mut self, tool_call_id: &str, function_name: &str, args: Value) {
        self.counters.tool_calls += 1;
        self.push(ContextItem::ToolCall {
            tool_call_id: tool_call_id.into(),
            function_name: function_name.into(),
            args,
            ts: Utc::now(),
        });
    }

    pub fn push_tool_result(&mut self, tool_call_id: &str, result: Value) {
        self.counters.tool_results += 1;
        self.push(ContextItem::ToolResult {
            tool_call_id: tool_call_id.into(),
            result,
            ts: Utc::now(),
        });
    }

    fn push(&mut self, item: ContextItem) {
        self.last_activity = Utc::now();
        self.items.push(item);
    }

    /// The last `n` items, oldest first.
    pub fn last_n(&self, n: usize) -> &[ContextItem] {
        let start = self.items.len().saturating_sub(n);
        &self.items[start..]
    }

    /// Full transcript.
    pub fn transcript(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn counters(&self) -> ContextCounters {
        self.counters
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// JSON snapshot of the last `n` items for webhook payloads.
    pub fn snapshot(&self, n: usize) -> Value {
        serde_json::json!({
            "started_at": self.started_at,
            "items": self.last_n(n),
            "counters": self.counters,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_counters() {
        let mut ctx = ConversationContext::new();
        ctx.push_user_message("send an email to bob");
        ctx.push_tool_call("tc_1", "send_email", serde_json::json!({"to": "bob"}));
        ctx.push_tool_result("tc_1", serde_json::json!({"success": true}));
        ctx.push_assistant_message("Done.");

        let counters = ctx.counters();
        assert_eq!(counters.user_messages, 1);
        assert_eq!(counters.assistant_messages, 1);
        assert_eq!(counters.tool_calls, 1);
        assert_eq!(counters.tool_results, 1);
        assert_eq!(ctx.transcript().len(), 4);
    }

    #[test]
    fn last_n_clamps_to_length() {
        let mut ctx = ConversationContext::new();
        ctx.push_user_message("one");
        ctx.push_user_message("two");
        assert_eq!(ctx.last_n(10).len(), 2);
        assert_eq!(ctx.last_n(1).len(), 1);
        match &ctx.last_n(1)[0] {
            ContextItem::UserMessage { text, .. } => assert_eq!(text, "two"),
            other => panic!("expected user message, got {other:?}"),
        }
    }

    #[test]
    fn timestamps_are_monotonic() {
        let mut ctx = ConversationContext::new();
        for i in 0..5 {
            ctx.push_user_message(format!("m{i}"));
        }
        let ts: Vec<_> = ctx
            .transcript()
            .iter()
            .map(|item| match item {
                ContextItem::UserMessage { ts, .. } => *ts,
                _ => unreachable!(),
            })
            .collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn snapshot_shape() {
        let mut ctx = ConversationContext::new();
        ctx.push_user_message("hello");
        let snap = ctx.snapshot(10);
        assert_eq!(snap["items"][0]["type"], "user_message");
        assert_eq!(snap["counters"]["user_messages"], 1);
    }
}
