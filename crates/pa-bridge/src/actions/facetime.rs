//! FaceTime actions

use serde_json::{Value, json};
use tracing::debug;

use super::throw_for_missing_fields;
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::TransactionKind;

#[derive(Clone)]
pub struct FaceTimeActions {
    broker: PrivateApiBroker,
}

/// Link field of a helper response, wherever it was put
fn response_link(response: &Value) -> Option<&str> {
    response
        .get("url")
        .or_else(|| response.get("link"))
        .and_then(Value::as_str)
}

impl FaceTimeActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    /// Answer an incoming call and start tracking it
    pub async fn answer_call(&self, call_uuid: &str) -> Result<Value> {
        const ACTION: &str = "answer-call";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("callUUID", &call_uuid)])?;

        let response = self
            .broker
            .request(ACTION, json!({ "callUUID": call_uuid }), TransactionKind::Other)
            .await?;

        let sessions = self.broker.sessions();
        match response_link(&response) {
            Some(link) => sessions.set_link(call_uuid, link),
            None => sessions.track(call_uuid),
        }
        Ok(response)
    }

    pub async fn leave_call(&self, call_uuid: &str) -> Result<Value> {
        const ACTION: &str = "leave-call";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("callUUID", &call_uuid)])?;

        let response = self
            .broker
            .request(ACTION, json!({ "callUUID": call_uuid }), TransactionKind::Other)
            .await?;
        self.broker.sessions().invalidate(call_uuid);
        Ok(response)
    }

    /// Shareable link for an existing call, or for a new one without a uuid
    pub async fn generate_link(&self, call_uuid: Option<&str>) -> Result<Value> {
        self.broker.throw_for_bad_status()?;

        let response = self
            .broker
            .request("generate-link", json!({ "callUUID": call_uuid }), TransactionKind::Other)
            .await?;

        if let (Some(call_uuid), Some(link)) = (call_uuid, response_link(&response)) {
            debug!("FaceTime link generated for {}", call_uuid);
            self.broker.sessions().set_link(call_uuid, link);
        }
        Ok(response)
    }

    /// Let someone waiting in a call's lobby in
    pub async fn admit_participant(&self, conversation_uuid: &str, handle_uuid: &str) -> Result<Value> {
        const ACTION: &str = "admit-pending-member";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(
            ACTION,
            &[("conversationUUID", &conversation_uuid), ("handleUUID", &handle_uuid)],
        )?;

        let data = json!({
            "conversationUUID": conversation_uuid,
            "handleUUID": handle_uuid,
        });
        self.broker.request(ACTION, data, TransactionKind::Other).await
    }
}
