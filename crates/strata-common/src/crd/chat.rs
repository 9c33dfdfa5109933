//! Chat Custom Resource Definition
//!
//! A notification channel. Instances reference a Chat by name to receive
//! maintenance-window notifications.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Specification for a Chat
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "Chat",
    plural = "chats",
    shortname = "stc",
    namespaced,
    status = "ChatStatus",
    printcolumn = r#"{"name":"Channel","type":"string","jsonPath":".spec.channel"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ChatSpec {
    /// Channel name known to the notification sink
    pub channel: String,
}

/// Status of a Chat
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for a Chat
    pub enum ChatReason: "Chat" {
        /// Not yet attempted
        Pending => Initial,
        /// The sink has no such channel
        ChannelNotFound => Transient,
        /// The sink could not be reached
        ConnectionFailed => Transient,
        /// Channel verified
        Connected => Succeeded,
    }
}

impl Reason for ChatReason {
    const KIND: &'static str = "Chat";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::ChannelNotFound,
        Self::ConnectionFailed,
        Self::Connected,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(Chat, ChatReason, ResourceKind::Chat);
