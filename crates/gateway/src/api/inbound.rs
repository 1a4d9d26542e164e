//! Inbound channel contract: the normalized envelope chat connectors post.
//!
//! `POST /v1/inbound` runs one blocking turn on the shared session and
//! returns the outbound actions for the connector to perform. Busy and
//! "still working" notices are pushed through the chat sink while the
//! request is pending.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use tt_domain::error::Error;

use crate::api::{api_error, status_for};
use crate::outbound::ChannelNotifier;
use crate::runtime::{TurnReply, TurnRequest};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    /// Connector name: `"web"`, `"telegram"`, `"slack"`, etc.
    pub channel: String,
    /// Raw peer ID of the sender.
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Conversation id recorded with the capture. Defaults to
    /// `<channel>:<peer_id>`.
    #[serde(default)]
    pub session_id: Option<String>,
    /// The user's message text.
    pub text: String,
    /// Fetch memory context for this turn.
    #[serde(default = "d_true")]
    pub with_context: bool,
}

fn d_true() -> bool {
    true
}

impl InboundEnvelope {
    fn conversation_id(&self) -> String {
        match (&self.session_id, &self.peer_id) {
            (Some(id), _) => id.clone(),
            (None, Some(peer)) => format!("{}:{peer}", self.channel),
            (None, None) => self.channel.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InboundResponse {
    pub session_id: String,
    pub actions: Vec<OutboundAction>,
    /// The reply was withheld because it looked like tool output.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suppressed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<TurnReply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OutboundAction {
    #[serde(rename = "type")]
    pub action_type: String,
    pub text: String,
}

impl OutboundAction {
    fn message(text: impl Into<String>) -> Self {
        Self {
            action_type: "message".into(),
            text: text.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn inbound(
    State(state): State<AppState>,
    Json(body): Json<InboundEnvelope>,
) -> Response {
    if body.text.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "text must not be empty");
    }
    if body.channel.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "channel must not be empty");
    }

    let session_id = body.conversation_id();
    let label = format!("chat:{}", body.channel);
    let notifier = ChannelNotifier::new(state.sink.clone(), body.channel.clone());

    let mut req = TurnRequest::new(&label, &body.channel, &body.text)
        .session_id(&session_id)
        .busy(&notifier)
        .progress(&notifier);
    if !body.with_context {
        req = req.without_context();
    }

    let span = tracing::info_span!(
        "inbound",
        request_id = %uuid::Uuid::new_v4(),
        channel = %body.channel,
        session_id = %session_id,
    );
    let result = state.bridge.ask(req).instrument(span).await;
    into_response(session_id, result)
}

fn into_response(session_id: String, result: tt_domain::error::Result<TurnReply>) -> Response {
    match result {
        Ok(turn) => Json(InboundResponse {
            session_id,
            actions: vec![OutboundAction::message(turn.text.clone())],
            suppressed: false,
            turn: Some(turn),
            error: None,
        })
        .into_response(),
        Err(Error::GarbageResponse(_)) => Json(InboundResponse {
            session_id,
            actions: Vec::new(),
            suppressed: true,
            turn: None,
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "inbound turn failed");
            let actions = e
                .user_apology()
                .map(|text| vec![OutboundAction::message(text)])
                .unwrap_or_default();
            (
                status_for(&e),
                Json(InboundResponse {
                    session_id,
                    actions,
                    suppressed: false,
                    turn: None,
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;

    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn conversation_id_defaults() {
        let env: InboundEnvelope =
            serde_json::from_str(r#"{"channel":"telegram","peer_id":"42","text":"hi"}"#).unwrap();
        assert_eq!(env.conversation_id(), "telegram:42");
        assert!(env.with_context);

        let env: InboundEnvelope =
            serde_json::from_str(r#"{"channel":"web","text":"hi","session_id":"s-9"}"#).unwrap();
        assert_eq!(env.conversation_id(), "s-9");
    }

    #[tokio::test]
    async fn busy_session_returns_apology_action() {
        let resp = into_response("web".into(), Err(Error::SessionBusy("held".into())));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["actions"][0]["type"], "message");
        assert!(body["actions"][0]["text"].as_str().unwrap().starts_with("Sorry"));
    }

    #[tokio::test]
    async fn garbage_is_suppressed_silently() {
        let resp = into_response("web".into(), Err(Error::GarbageResponse("dump".into())));
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["suppressed"], true);
        assert!(body["actions"].as_array().unwrap().is_empty());
    }
}
