//! User Custom Resource Definition
//!
//! A login role on an Instance. The password is read from a Secret at
//! creation time and sent to the instance agent; it is never stored in
//! the User's status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SecretKeyRef};
use super::{impl_managed, ResourceKind};
use crate::reason::{Reason, ReasonClass};

/// Specification for a User
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strata.dev",
    version = "v1alpha1",
    kind = "User",
    plural = "users",
    shortname = "stu",
    namespaced,
    status = "UserStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instance"}"#,
    printcolumn = r#"{"name":"Username","type":"string","jsonPath":".spec.username"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[-1:].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Owning Instance
    pub instance: String,
    /// Role name on the database server
    pub username: String,
    /// Secret key holding the password
    pub password_secret: SecretKeyRef,
}

/// Status of a User
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// Availability condition history, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

crate::reason_enum! {
    /// Condition reasons for a User
    pub enum UserReason: "User" {
        /// Not yet attempted
        Pending => Initial,
        /// Owning Instance missing or not ready
        InstanceAccessError => Transient,
        /// Instance agent unreachable
        AgentAccessError => Transient,
        /// Password Secret missing, key absent, or value empty
        PasswordError => Transient,
        /// Agent rejected the request or an unclassified error occurred
        AgentFailed => Transient,
        /// Role exists on the server
        Created => Succeeded,
    }
}

impl Reason for UserReason {
    const KIND: &'static str = "User";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::InstanceAccessError,
        Self::AgentAccessError,
        Self::PasswordError,
        Self::AgentFailed,
        Self::Created,
    ];

    fn class(self) -> ReasonClass {
        self.class_of()
    }
}

impl_managed!(User, UserReason, ResourceKind::User);
