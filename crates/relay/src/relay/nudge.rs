//! Agent nudging.
//!
//! Converts a gate event into a `response.create` carrying an
//! instructions override, so the model verbalises the state change to
//! the user. Strictly best-effort: a closed upstream socket skips the
//! nudge with a log line and nothing else.

use vr_protocol::{upstream, GateStatus};

use super::registry::SessionHandle;

/// Instructions the model receives for each gate status.
pub fn instructions_for(status: GateStatus, function_name: &str, detail: Option<&str>) -> String {
    let detail_suffix = detail
        .filter(|d| !d.is_empty())
        .map(|d| format!(" Details: {d}"))
        .unwrap_or_default();

    match status {
        GateStatus::Preparing => format!(
            "Briefly tell the user you are preparing to execute {function_name}.{detail_suffix}"
        ),
        GateStatus::ReadyToSend => format!(
            "The {function_name} action is ready. Ask the user to confirm before you proceed, \
             referencing what is about to happen.{detail_suffix}"
        ),
        GateStatus::Completed => format!(
            "Announce that {function_name} completed and summarise the result for the user.{detail_suffix}"
        ),
        GateStatus::Cancelled => format!(
            "Acknowledge politely that {function_name} was cancelled.{detail_suffix}"
        ),
        GateStatus::Failed => format!(
            "Apologise that {function_name} failed and invite the user to try again.{detail_suffix}"
        ),
    }
}

/// Send the nudge for a gate status. Best-effort.
pub async fn nudge_agent(
    session: &SessionHandle,
    status: GateStatus,
    function_name: &str,
    detail: Option<&str>,
) {
    let instructions = instructions_for(status, function_name, detail);
    let event = upstream::response_create_with_instructions(&instructions);
    if !session.send_upstream(event).await {
        tracing::debug!(
            session_id = %session.session_id,
            status = status.as_str(),
            "upstream closed, skipping agent nudge"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::{test_handle, UpstreamFrame};

    #[test]
    fn templates_reference_the_action() {
        for status in [
            GateStatus::Preparing,
            GateStatus::ReadyToSend,
            GateStatus::Completed,
            GateStatus::Cancelled,
            GateStatus::Failed,
        ] {
            let text = instructions_for(status, "send_email", None);
            assert!(text.contains("send_email"), "{status:?}: {text}");
        }
    }

    #[test]
    fn detail_is_appended_when_present() {
        let text = instructions_for(GateStatus::Completed, "send_email", Some("Email sent."));
        assert!(text.contains("Email sent."));
        let text = instructions_for(GateStatus::Completed, "send_email", Some(""));
        assert!(!text.contains("Details:"));
    }

    #[tokio::test]
    async fn nudge_sends_instructions_override() {
        let (session, _b, mut upstream_rx) = test_handle("c1");
        nudge_agent(&session, GateStatus::ReadyToSend, "send_email", None).await;

        let UpstreamFrame::Text(text) = upstream_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let event: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(event["type"], "response.create");
        assert!(event["response"]["instructions"]
            .as_str()
            .unwrap()
            .contains("confirm"));
    }

    #[tokio::test]
    async fn nudge_is_silent_when_upstream_gone() {
        let (session, _b, upstream_rx) = test_handle("c1");
        drop(upstream_rx);
        // Must not panic or error.
        nudge_agent(&session, GateStatus::Failed, "send_email", None).await;
    }
}
