//! Attachment actions

use serde_json::{Value, json};

use super::throw_for_missing_fields;
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::TransactionKind;

#[derive(Clone)]
pub struct AttachmentActions {
    broker: PrivateApiBroker,
}

impl AttachmentActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    /// Ask the messaging app to re-download an attachment purged from disk
    pub async fn download_purged(&self, attachment_guid: &str) -> Result<Value> {
        const ACTION: &str = "download-purged-attachment";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("attachmentGuid", &attachment_guid)])?;
        let data = json!({ "attachmentGuid": attachment_guid });
        self.broker.request(ACTION, data, TransactionKind::Attachment).await
    }
}
