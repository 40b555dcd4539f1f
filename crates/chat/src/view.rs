use duet_storage::{MessageId, MessageRecord, UserId};

/// Label for messages stored without a usable sender name.
pub const UNKNOWN_SENDER_LABEL: &str = "Unknown";

/// One message as a particular viewer renders it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub seq: u64,
    pub sender_id: UserId,
    pub sender_label: String,
    pub text: String,
    /// Sent by the viewer; own messages are drawn on the other side and without a label.
    pub is_own: bool,
    pub created_at_unix_millis: u64,
}

impl MessageView {
    pub fn for_viewer(record: &MessageRecord, viewer: &UserId) -> Self {
        let sender_label = match record.sender_display_name.trim() {
            "" => UNKNOWN_SENDER_LABEL.to_string(),
            name => name.to_string(),
        };

        Self {
            id: record.id,
            seq: record.seq,
            sender_id: record.sender_id.clone(),
            sender_label,
            text: record.text.clone(),
            is_own: &record.sender_id == viewer,
            created_at_unix_millis: record.created_at_unix_millis,
        }
    }
}

pub fn render_for_viewer(messages: &[MessageRecord], viewer: &UserId) -> Vec<MessageView> {
    messages
        .iter()
        .map(|record| MessageView::for_viewer(record, viewer))
        .collect()
}
