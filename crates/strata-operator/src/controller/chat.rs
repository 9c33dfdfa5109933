//! Chat controller
//!
//! A Chat names a channel of the notification sink. It becomes ready once the
//! sink confirms the channel exists; maintenance jobs only post to ready Chats.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, instrument};

use strata_common::crd::{Chat, ChatReason};
use strata_common::Error;

use crate::context::Context;
use crate::converge::{absorbed, apply, Outcome};
use crate::notify::NotifyError;

/// Reconcile a Chat
#[instrument(skip(chat, ctx), fields(chat = %chat.name_any()))]
pub async fn reconcile(chat: Arc<Chat>, ctx: Arc<Context>) -> Result<Action, Error> {
    if absorbed(chat.as_ref()) {
        debug!("chat settled");
        return Ok(Action::await_change());
    }

    let channel = &chat.spec.channel;
    let outcome = match ctx.notifier.resolve(channel).await {
        Ok(()) => Outcome::new(ChatReason::Connected, format!("channel {channel} resolved")),
        Err(e @ NotifyError::ChannelNotFound(_)) => {
            Outcome::new(ChatReason::ChannelNotFound, e.to_string())
        }
        Err(e @ NotifyError::ConnectionFailed(_)) => {
            Outcome::new(ChatReason::ConnectionFailed, e.to_string())
        }
    };
    apply(chat.as_ref(), outcome, &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::agent_client::MockAgentConnector;
    use crate::controller::fixtures::{history, last_reason, meta, recording_store};
    use crate::notify::MockNotificationSink;
    use strata_common::crd::{ChatSpec, ChatStatus};

    fn chat(channel: &str, reason: Option<ChatReason>) -> Arc<Chat> {
        Arc::new(Chat {
            metadata: meta("ops"),
            spec: ChatSpec {
                channel: channel.to_string(),
            },
            status: Some(ChatStatus {
                conditions: history(reason),
            }),
        })
    }

    fn context_with(
        notifier: MockNotificationSink,
    ) -> (Arc<Context>, Arc<std::sync::Mutex<Vec<serde_json::Value>>>) {
        let (store, patches) = recording_store();
        let ctx = Context::for_testing(
            Arc::new(store),
            Arc::new(MockAgentConnector::new()),
            Arc::new(notifier),
        );
        (Arc::new(ctx), patches)
    }

    #[tokio::test]
    async fn resolved_channel_connects() {
        let mut notifier = MockNotificationSink::new();
        notifier.expect_resolve().returning(|_| Ok(()));
        let (ctx, patches) = context_with(notifier);

        reconcile(chat("ops-alerts", None), ctx)
            .await
            .expect("reconcile");
        assert_eq!(last_reason(&patches).as_deref(), Some("Connected"));
    }

    #[tokio::test]
    async fn sink_errors_map_to_reasons() {
        for (error, reason) in [
            (NotifyError::ChannelNotFound("x".to_string()), "ChannelNotFound"),
            (NotifyError::ConnectionFailed("x".to_string()), "ConnectionFailed"),
        ] {
            let mut notifier = MockNotificationSink::new();
            notifier
                .expect_resolve()
                .returning(move |_| Err(error.clone()));
            let (ctx, patches) = context_with(notifier);

            reconcile(chat("ops-alerts", Some(ChatReason::Pending)), ctx)
                .await
                .expect("reconcile");
            assert_eq!(last_reason(&patches).as_deref(), Some(reason));
        }
    }

    #[tokio::test]
    async fn connected_chat_is_not_resolved_again() {
        let mut notifier = MockNotificationSink::new();
        notifier.expect_resolve().never();
        let (ctx, _) = context_with(notifier);

        let action = reconcile(chat("ops-alerts", Some(ChatReason::Connected)), ctx)
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }
}
