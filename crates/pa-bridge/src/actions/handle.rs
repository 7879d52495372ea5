//! Handle lookups

use serde_json::{Value, json};

use super::throw_for_missing_fields;
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::TransactionKind;

#[derive(Clone)]
pub struct HandleActions {
    broker: PrivateApiBroker,
}

/// `email` for addresses containing `@`, otherwise `phone`
fn alias_type(address: &str) -> &'static str {
    if address.contains('@') { "email" } else { "phone" }
}

impl HandleActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    async fn lookup(&self, action: &str, address: &str) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(action, &[("address", &address)])?;
        let data = json!({ "address": address, "aliasType": alias_type(address) });
        self.broker.request(action, data, TransactionKind::Handle).await
    }

    /// Whether the handle currently has a focus mode silencing notifications
    pub async fn focus_status(&self, address: &str) -> Result<Value> {
        self.lookup("check-focus-status", address).await
    }

    pub async fn imessage_availability(&self, address: &str) -> Result<Value> {
        self.lookup("check-imessage-availability", address).await
    }

    pub async fn facetime_availability(&self, address: &str) -> Result<Value> {
        self.lookup("check-facetime-availability", address).await
    }
}
