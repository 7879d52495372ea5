//! iCloud account actions

use serde_json::{Value, json};

use super::throw_for_missing_fields;
use crate::broker::PrivateApiBroker;
use crate::error::Result;
use crate::transaction::{Transaction, TransactionKind};

#[derive(Clone)]
pub struct CloudActions {
    broker: PrivateApiBroker,
}

impl CloudActions {
    pub fn new(broker: PrivateApiBroker) -> Self {
        Self { broker }
    }

    /// Account details: signed-in Apple ID, aliases, active alias
    pub async fn account_info(&self) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        self.broker
            .write("get-account-info", None, Some(Transaction::new(TransactionKind::Other)))
            .await
            .map(|response| response.unwrap_or(Value::Null))
    }

    /// Shared name and photo for a handle, or for this account without one
    pub async fn contact_card(&self, address: Option<&str>) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        self.broker
            .request("get-nickname-info", json!({ "address": address }), TransactionKind::Other)
            .await
    }

    /// Switch the alias outgoing messages are sent from
    pub async fn modify_active_alias(&self, alias: &str) -> Result<Value> {
        const ACTION: &str = "modify-active-alias";
        self.broker.throw_for_bad_status()?;
        throw_for_missing_fields(ACTION, &[("alias", &alias)])?;
        self.broker
            .request(ACTION, json!({ "alias": alias }), TransactionKind::Other)
            .await
    }

    /// Ask Find My to refresh friend locations; updates arrive as events
    pub async fn refresh_findmy_friends(&self) -> Result<Value> {
        self.broker.throw_for_bad_status()?;
        self.broker
            .request("refresh-findmy-friends", Value::Null, TransactionKind::FindMy)
            .await
    }
}
