//! Chat management actions

use serde_json::{Value, json};

use super::throw_for_missing_fields;
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::TransactionKind;

#[derive(Clone)]
pub struct ChatActions {
    broker: PrivateApiBroker,
}

impl ChatActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    async fn chat_request(&self, action: &str, chat_guid: &str) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(action, &[("chatGuid", &chat_guid)])?;
        self.broker
            .request(action, json!({ "chatGuid": chat_guid }), TransactionKind::Chat)
            .await
    }

    async fn participant_request(&self, action: &str, chat_guid: &str, address: &str) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(action, &[("chatGuid", &chat_guid), ("address", &address)])?;
        let data = json!({ "chatGuid": chat_guid, "address": address });
        self.broker.request(action, data, TransactionKind::Chat).await
    }

    async fn typing(&self, action: &str, chat_guid: &str) -> Result<()> {
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(action, &[("chatGuid", &chat_guid)])?;
        self.broker.send(action, json!({ "chatGuid": chat_guid })).await
    }

    /// Show our typing indicator; returns once written
    pub async fn start_typing(&self, chat_guid: &str) -> Result<()> {
        self.typing("start-typing", chat_guid).await
    }

    pub async fn stop_typing(&self, chat_guid: &str) -> Result<()> {
        self.typing("stop-typing", chat_guid).await
    }

    pub async fn mark_read(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("mark-chat-read", chat_guid).await
    }

    pub async fn mark_unread(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("mark-chat-unread", chat_guid).await
    }

    pub async fn set_display_name(&self, chat_guid: &str, new_name: &str) -> Result<Value> {
        const ACTION: &str = "set-display-name";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("chatGuid", &chat_guid), ("newName", &new_name)])?;
        let data = json!({ "chatGuid": chat_guid, "newName": new_name });
        self.broker.request(ACTION, data, TransactionKind::Chat).await
    }

    pub async fn add_participant(&self, chat_guid: &str, address: &str) -> Result<Value> {
        self.participant_request("add-participant", chat_guid, address).await
    }

    pub async fn remove_participant(&self, chat_guid: &str, address: &str) -> Result<Value> {
        self.participant_request("remove-participant", chat_guid, address).await
    }

    pub async fn leave(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("leave-chat", chat_guid).await
    }

    pub async fn delete(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("delete-chat", chat_guid).await
    }

    /// Create a chat with the given participants, optionally sending a
    /// first message
    pub async fn create(&self, addresses: &[String], message: Option<&str>, service: &str) -> Result<Value> {
        const ACTION: &str = "create-chat";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("addresses", &addresses), ("service", &service)])?;
        let data = json!({
            "addresses": addresses,
            "message": message,
            "service": service,
        });
        self.broker.request(ACTION, data, TransactionKind::Chat).await
    }

    /// Set the group photo; `None` removes it
    pub async fn set_group_photo(&self, chat_guid: &str, file_path: Option<&str>) -> Result<Value> {
        const ACTION: &str = "update-group-photo";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("chatGuid", &chat_guid)])?;
        let data = json!({ "chatGuid": chat_guid, "filePath": file_path });
        self.broker.request(ACTION, data, TransactionKind::Chat).await
    }

    pub async fn should_offer_contact_sharing(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("should-offer-contact-sharing", chat_guid).await
    }

    pub async fn share_contact_card(&self, chat_guid: &str) -> Result<Value> {
        self.chat_request("share-contact-card", chat_guid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing;
    use crate::error::BridgeError;

    const GROUP: &str = "iMessage;+;chat123";

    #[tokio::test]
    async fn test_typing_is_fire_and_forget() {
        let broker = testing::broker().await;
        let mut requests = testing::echo_helper(&broker).await;
        let actions = ChatActions::new(broker.clone());

        actions.start_typing(GROUP).await.unwrap();
        actions.stop_typing(GROUP).await.unwrap();

        let start = requests.recv().await.unwrap();
        assert_eq!(start["action"], "start-typing");
        assert!(start.get("transactionId").is_none());
        assert_eq!(requests.recv().await.unwrap()["action"], "stop-typing");
        assert!(broker.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_participant_actions() {
        let broker = testing::broker().await;
        let mut requests = testing::echo_helper(&broker).await;
        let actions = ChatActions::new(broker);

        actions.add_participant(GROUP, "a@icloud.com").await.unwrap();
        actions.remove_participant(GROUP, "a@icloud.com").await.unwrap();

        let add = requests.recv().await.unwrap();
        assert_eq!(add["action"], "add-participant");
        assert_eq!(add["data"]["address"], "a@icloud.com");
        assert_eq!(requests.recv().await.unwrap()["action"], "remove-participant");
    }

    #[tokio::test]
    async fn test_create_requires_addresses() {
        let broker = testing::broker().await;
        let _requests = testing::echo_helper(&broker).await;
        let actions = ChatActions::new(broker);

        let err = actions.create(&[], Some("hello"), "iMessage").await.unwrap_err();
        assert!(matches!(err, BridgeError::Validation { ref fields, .. } if fields == "addresses"));
    }

    #[tokio::test]
    async fn test_rename_and_photo_payloads() {
        let broker = testing::broker().await;
        let mut requests = testing::echo_helper(&broker).await;
        let actions = ChatActions::new(broker);

        actions.set_display_name(GROUP, "Team").await.unwrap();
        actions.set_group_photo(GROUP, None).await.unwrap();

        let rename = requests.recv().await.unwrap();
        assert_eq!(rename["data"]["newName"], "Team");
        let photo = requests.recv().await.unwrap();
        assert_eq!(photo["action"], "update-group-photo");
        assert!(photo["data"]["filePath"].is_null());
    }

    #[tokio::test]
    async fn test_unavailable_before_validation() {
        let broker = testing::broker().await;
        let actions = ChatActions::new(broker);

        let err = actions.leave("").await.unwrap_err();
        assert!(matches!(err, BridgeError::HelperNotRunning));
    }
}
