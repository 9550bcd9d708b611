use serde::{Deserialize, Serialize};

/// Election RPCs. Every message is one-way; replies travel as separate
/// messages and are matched to their request only by term and sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaftMessage {
    #[serde(rename_all = "camelCase")]
    RequestVote { term: u64, candidate_id: String },
    VoteResponse { term: u64, granted: bool },
    /// Append-entries without entries.
    #[serde(rename_all = "camelCase")]
    Heartbeat { term: u64, leader_id: String },
    HeartbeatAck { term: u64, success: bool },
}

impl RaftMessage {
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::Heartbeat { term, .. }
            | RaftMessage::HeartbeatAck { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "REQUEST_VOTE",
            RaftMessage::VoteResponse { .. } => "VOTE_RESPONSE",
            RaftMessage::Heartbeat { .. } => "HEARTBEAT",
            RaftMessage::HeartbeatAck { .. } => "HEARTBEAT_ACK",
        }
    }
}

/// A message as it travels on the wire: the payload plus its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    #[serde(flatten)]
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: impl Into<String>, message: RaftMessage) -> Self {
        Self {
            from: from.into(),
            message,
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// An envelope addressed to one peer, produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: String,
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_vote_uses_camel_case_fields() {
        let env = Envelope::new(
            "a",
            RaftMessage::RequestVote {
                term: 3,
                candidate_id: "a".to_string(),
            },
        );
        let value: serde_json::Value = serde_json::to_value(&env).expect("serialize");
        assert_eq!(value["type"], "REQUEST_VOTE");
        assert_eq!(value["from"], "a");
        assert_eq!(value["term"], 3);
        assert_eq!(value["candidateId"], "a");
    }

    #[test]
    fn decodes_heartbeat_line_from_peer() {
        let line = "{\"from\":\"b\",\"type\":\"HEARTBEAT\",\"term\":7,\"leaderId\":\"b\"}\n";
        let env = Envelope::from_line(line).expect("decode");
        assert_eq!(env.from, "b");
        assert_eq!(
            env.message,
            RaftMessage::Heartbeat {
                term: 7,
                leader_id: "b".to_string()
            }
        );
        assert_eq!(env.message.term(), 7);
        assert_eq!(env.message.kind(), "HEARTBEAT");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let line = "{\"from\":\"b\",\"type\":\"ELECTION_START\",\"term\":1}";
        assert!(Envelope::from_line(line).is_err());
    }

    #[test]
    fn to_line_is_newline_terminated() {
        let env = Envelope::new(
            "c",
            RaftMessage::HeartbeatAck {
                term: 2,
                success: false,
            },
        );
        let line = env.to_line().expect("encode");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(Envelope::from_line(&line).expect("decode"), env);
    }
}
