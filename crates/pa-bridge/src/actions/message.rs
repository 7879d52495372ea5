//! Message actions

use serde_json::{Value, json};

use super::{bool_flag, throw_for_missing_fields};
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::TransactionKind;

/// A text message to send
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub chat_guid: String,
    pub message: String,
    pub attributed_body: Option<Value>,
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    /// Message being replied to
    pub selected_message_guid: Option<String>,
    pub part_index: i64,
    /// Let the messaging app detect links and dates
    pub dd_scan: bool,
}

/// A message assembled from several parts (text, mentions, attachments)
#[derive(Debug, Clone, Default)]
pub struct MultipartMessage {
    pub chat_guid: String,
    pub parts: Vec<Value>,
    pub subject: Option<String>,
    pub effect_id: Option<String>,
    pub selected_message_guid: Option<String>,
    pub part_index: i64,
    pub dd_scan: bool,
}

#[derive(Clone)]
pub struct MessageActions {
    broker: PrivateApiBroker,
}

impl MessageActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    pub async fn send(&self, message: &OutgoingMessage) -> Result<Value> {
        const ACTION: &str = "send-message";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("chatGuid", &message.chat_guid), ("message", &message.message)],
        )?;

        let data = json!({
            "chatGuid": message.chat_guid,
            "message": message.message,
            "attributedBody": message.attributed_body,
            "subject": message.subject,
            "effectId": message.effect_id,
            "selectedMessageGuid": message.selected_message_guid,
            "partIndex": message.part_index,
            "ddScan": bool_flag(message.dd_scan),
        });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    pub async fn send_multipart(&self, message: &MultipartMessage) -> Result<Value> {
        const ACTION: &str = "send-multipart";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("chatGuid", &message.chat_guid), ("parts", &message.parts)],
        )?;

        let data = json!({
            "chatGuid": message.chat_guid,
            "parts": message.parts,
            "subject": message.subject,
            "effectId": message.effect_id,
            "selectedMessageGuid": message.selected_message_guid,
            "partIndex": message.part_index,
            "ddScan": bool_flag(message.dd_scan),
        });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    /// Send a tapback (`love`, `like`, `-love` to remove, ...)
    pub async fn react(
        &self,
        chat_guid: &str,
        selected_message_guid: &str,
        reaction_type: &str,
        part_index: i64,
    ) -> Result<Value> {
        const ACTION: &str = "send-reaction";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[
                ("chatGuid", &chat_guid),
                ("selectedMessageGuid", &selected_message_guid),
                ("reactionType", &reaction_type),
            ],
        )?;

        let data = json!({
            "chatGuid": chat_guid,
            "selectedMessageGuid": selected_message_guid,
            "reactionType": reaction_type,
            "partIndex": part_index,
        });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    pub async fn edit(
        &self,
        chat_guid: &str,
        message_guid: &str,
        edited_message: &str,
        backwards_compat_message: &str,
        part_index: i64,
    ) -> Result<Value> {
        const ACTION: &str = "edit-message";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[
                ("chatGuid", &chat_guid),
                ("messageGuid", &message_guid),
                ("editedMessage", &edited_message),
                ("backwardsCompatibilityMessage", &backwards_compat_message),
            ],
        )?;

        let data = json!({
            "chatGuid": chat_guid,
            "messageGuid": message_guid,
            "editedMessage": edited_message,
            "backwardsCompatibilityMessage": backwards_compat_message,
            "partIndex": part_index,
        });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    pub async fn unsend(&self, chat_guid: &str, message_guid: &str, part_index: i64) -> Result<Value> {
        const ACTION: &str = "unsend-message";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("chatGuid", &chat_guid), ("messageGuid", &message_guid)],
        )?;

        let data = json!({
            "chatGuid": chat_guid,
            "messageGuid": message_guid,
            "partIndex": part_index,
        });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    /// Path of the media embedded in an app balloon message
    pub async fn get_embedded_media(&self, chat_guid: &str, message_guid: &str) -> Result<Value> {
        const ACTION: &str = "balloon-bundle-media-path";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("chatGuid", &chat_guid), ("messageGuid", &message_guid)],
        )?;

        let data = json!({ "chatGuid": chat_guid, "messageGuid": message_guid });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }

    /// Deliver a message to a recipient whose focus mode silenced it
    pub async fn notify_silenced(&self, chat_guid: &str, message_guid: &str) -> Result<Value> {
        const ACTION: &str = "notify-anyways";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("chatGuid", &chat_guid), ("messageGuid", &message_guid)],
        )?;

        let data = json!({ "chatGuid": chat_guid, "messageGuid": message_guid });
        self.broker.request(ACTION, data, TransactionKind::Message).await
    }
}
