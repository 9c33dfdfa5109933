//! The convergence step shared by every controller
//!
//! A controller does one unit of work and maps the result to a single
//! [`Outcome`]. [`apply`] then decides what to persist:
//!
//! - current reason terminal: nothing, wait for a change
//! - same reason as now: nothing, requeue after the backoff for how long
//!   the reason has persisted (no requeue for terminal success)
//! - new reason: check the kind's transition table, append the condition,
//!   patch status, publish an Event, wait for the resulting watch event

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info};

use strata_common::crd::{current_reason, latest, push_condition, Condition, Managed};
use strata_common::events::{actions, event_type_for};
use strata_common::reason::check_transition;
use strata_common::{BackoffTable, Error, Reason};

use crate::context::Context;

/// Result of one unit of work, mapped to a reason
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome<R> {
    /// Reason to record
    pub reason: R,
    /// Human-readable detail
    pub message: String,
    /// Extra status fields written alongside a new condition
    pub fields: Map<String, Value>,
}

impl<R: Reason> Outcome<R> {
    /// Outcome with no extra status fields
    pub fn new(reason: R, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Add a status field persisted with the condition
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// What the convergence step does with an outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// No status write; requeue after the wait if one is given
    Unchanged(Option<Duration>),
    /// Append a condition for the new reason
    Transition,
}

/// Decide how to handle `reason` given the condition history
pub fn decide<R: Reason>(
    history: &[Condition],
    reason: R,
    backoff: &BackoffTable,
    now: DateTime<Utc>,
) -> Result<Decision, Error> {
    let current = current_reason::<R>(history);
    match current {
        Some(current) if current.is_terminal() => Ok(Decision::Unchanged(None)),
        Some(current) if current == reason => {
            let since = latest(history)
                .map(|c| c.last_transition_time)
                .unwrap_or(now);
            Ok(Decision::Unchanged(Some(backoff.next(since, now))))
        }
        _ => {
            check_transition(current, reason)?;
            Ok(Decision::Transition)
        }
    }
}

/// Whether the resource sits in a terminal reason and needs no work
pub fn absorbed<K: Managed>(resource: &K) -> bool {
    resource.current_reason().is_some_and(|r| r.is_terminal())
}

/// Persist an outcome for a resource and pick the next action
pub async fn apply<K: Managed>(
    resource: &K,
    outcome: Outcome<K::Reason>,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_else(|| "default".to_string());
    let now = Utc::now();
    let history = resource.conditions();

    match decide(history, outcome.reason, &ctx.backoff, now)? {
        Decision::Unchanged(None) => Ok(Action::await_change()),
        Decision::Unchanged(Some(wait)) => {
            debug!(
                kind = %K::KIND,
                name = %name,
                reason = %outcome.reason,
                wait_secs = wait.as_secs(),
                "reason unchanged, requeueing"
            );
            Ok(Action::requeue(wait))
        }
        Decision::Transition => {
            let mut conditions = history.to_vec();
            push_condition(
                &mut conditions,
                Condition::for_reason(outcome.reason, outcome.message.clone(), now),
            );
            let mut patch = outcome.fields;
            patch.insert("conditions".to_string(), serde_json::to_value(&conditions)?);

            match ctx
                .store
                .patch_status(K::KIND, &namespace, &name, Value::Object(patch))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(kind = %K::KIND, name = %name, "resource deleted before status write");
                    return Ok(Action::await_change());
                }
                Err(e) => return Err(e),
            }

            info!(
                kind = %K::KIND,
                name = %name,
                namespace = %namespace,
                reason = %outcome.reason,
                message = %outcome.message,
                "condition changed"
            );
            let note = (!outcome.message.is_empty()).then_some(outcome.message);
            ctx.events
                .publish(
                    &resource.object_ref(&()),
                    event_type_for(outcome.reason),
                    &outcome.reason.to_string(),
                    actions::RECONCILE,
                    note,
                )
                .await;
            Ok(Action::await_change())
        }
    }
}
