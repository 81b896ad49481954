//! Wire messages exchanged with the chat client.
//!
//! Inbound events arrive as JSON text frames; every outbound message carries
//! `role: "assistant"` and a `type` tag.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::AssistantTurn;

/// What the client asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GenerateVisualizations,
    RefineVisualizations,
    AnalyzeVisualization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessageBody {
    pub question: String,
    pub session_id: Uuid,
}

/// One inbound chat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub user_message_body: UserMessageBody,
    #[serde(default)]
    pub reply_to_assistant_message_uuid: Option<Uuid>,
}

/// Fields shared by `viz_code` and `analyze_visualization` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationBody {
    pub assistant_message_uuid: Uuid,
    pub reason: String,
    pub viz_name: String,
    pub columns_involved: Vec<String>,
    pub pd_code: String,
    pub pd_viz_code: String,
    pub svg_json: String,
    pub data: Vec<serde_json::Value>,
}

impl VisualizationBody {
    pub fn from_turn(turn: &AssistantTurn) -> Self {
        Self {
            assistant_message_uuid: turn.id,
            reason: turn.reason.clone(),
            viz_name: turn.viz_name.clone(),
            columns_involved: turn.columns_involved.clone(),
            pd_code: turn.extract_code.clone(),
            pd_viz_code: turn.render_code.clone(),
            svg_json: turn.svg_json.clone(),
            data: turn.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack {
        content: String,
    },
    VizCode {
        #[serde(flatten)]
        body: VisualizationBody,
        extra_attrs: serde_json::Value,
    },
    AnalyzeVisualization {
        #[serde(flatten)]
        body: VisualizationBody,
    },
    Error {
        content: String,
    },
}

/// A reply as sent on the wire: `{"role": "assistant", "type": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: String,
    #[serde(flatten)]
    pub reply: Reply,
}

impl OutboundMessage {
    pub fn assistant(reply: Reply) -> Self {
        Self {
            role: "assistant".to_string(),
            reply,
        }
    }

    pub fn ack(content: impl Into<String>) -> Self {
        Self::assistant(Reply::Ack {
            content: content.into(),
        })
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::assistant(Reply::Error {
            content: content.into(),
        })
    }

    pub fn viz_code(turn: &AssistantTurn) -> Self {
        Self::assistant(Reply::VizCode {
            body: VisualizationBody::from_turn(turn),
            extra_attrs: turn.extra_attrs.clone(),
        })
    }

    /// Analysis reply: the prior turn's identity with the analysis text in
    /// `reason` and no data rows.
    pub fn analysis(turn: &AssistantTurn, analysis: &str) -> Self {
        let mut body = VisualizationBody::from_turn(turn);
        body.reason = analysis.to_string();
        body.data = Vec::new();
        Self::assistant(Reply::AnalyzeVisualization { body })
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self.reply {
            Reply::Ack { .. } => "ack",
            Reply::VizCode { .. } => "viz_code",
            Reply::AnalyzeVisualization { .. } => "analyze_visualization",
            Reply::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_event_parses_wire_shape() {
        let session = Uuid::new_v4();
        let raw = json!({
            "type": "refine_visualizations",
            "user_message_body": {"question": "only sedans", "session_id": session},
            "reply_to_assistant_message_uuid": null
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind, EventKind::RefineVisualizations);
        assert_eq!(event.user_message_body.session_id, session);
        assert!(event.reply_to_assistant_message_uuid.is_none());
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let raw = json!({
            "type": "delete_everything",
            "user_message_body": {"question": "", "session_id": Uuid::new_v4()}
        });
        assert!(serde_json::from_value::<InboundEvent>(raw).is_err());
    }

    #[test]
    fn ack_serializes_with_role_and_type() {
        let value = serde_json::to_value(OutboundMessage::ack("Refining visualization...")).unwrap();
        assert_eq!(
            value,
            json!({"role": "assistant", "type": "ack", "content": "Refining visualization..."})
        );
    }

    #[test]
    fn viz_code_is_flat() {
        let turn = AssistantTurn {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            parent_user_turn_id: None,
            viz_name: "bar_chart".into(),
            columns_involved: vec!["vehicle_type".into()],
            reason: "counts".into(),
            extract_code: "extract_df = df".into(),
            render_code: "plt.bar({}, {})".into(),
            svg_json: "{}".into(),
            data: vec![json!({"vehicle_type": "suv"})],
            extra_attrs: json!({}),
            created_at: 0,
        };
        let value = serde_json::to_value(OutboundMessage::viz_code(&turn)).unwrap();
        assert_eq!(value["type"], "viz_code");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["viz_name"], "bar_chart");
        assert_eq!(value["pd_code"], "extract_df = df");
        assert_eq!(value["data"].as_array().unwrap().len(), 1);

        let analysis = serde_json::to_value(OutboundMessage::analysis(&turn, "mostly suvs")).unwrap();
        assert_eq!(analysis["type"], "analyze_visualization");
        assert_eq!(analysis["reason"], "mostly suvs");
        assert_eq!(analysis["data"], json!([]));
    }
}
