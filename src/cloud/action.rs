//! Waiting for asynchronous backend actions
//!
//! An [`Action`] is polled until it leaves the `running` state. The progress of
//! a running action is exposed as a stream; [`ActionWaiter::wait`] drains that
//! stream and resolves to success or the first error. Dropping the returned
//! future stops polling.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tracing::debug;

use super::client::ActionClient;
use super::types::{Action, ActionStatus};
use crate::error::{Error, Result};

/// Default interval between two polls of a running action
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct ActionWaiter {
    client: Arc<dyn ActionClient>,
    poll_interval: Duration,
}

impl ActionWaiter {
    pub fn new(client: Arc<dyn ActionClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Progress percentages of `action` until it completes
    ///
    /// The stream ends after the action succeeded; a failed action or a
    /// failed poll yields a single error as the last item.
    pub fn watch_progress(&self, action: Action) -> impl Stream<Item = Result<u8>> + Send + '_ {
        stream::unfold(Some((action, true)), move |state| async move {
            let (current, first) = state?;
            let current = if first {
                current
            } else {
                tokio::time::sleep(self.poll_interval).await;
                match self.client.get_by_id(current.id).await {
                    Ok(action) => action,
                    Err(e) => return Some((Err(e), None)),
                }
            };

            match current.status {
                ActionStatus::Running => Some((Ok(current.progress), Some((current, false)))),
                ActionStatus::Success => Some((Ok(100), None)),
                ActionStatus::Error => {
                    let (code, message) = current
                        .error
                        .as_ref()
                        .map(|e| (e.code.clone(), e.message.clone()))
                        .unwrap_or_else(|| ("unknown".to_string(), "action failed".to_string()));
                    Some((
                        Err(Error::ActionFailed {
                            id: current.id,
                            code,
                            message,
                        }),
                        None,
                    ))
                }
            }
        })
    }

    /// Block until `action` completed successfully or failed
    pub async fn wait(&self, action: &Action) -> Result<()> {
        let progress = self.watch_progress(action.clone());
        futures::pin_mut!(progress);

        while let Some(update) = progress.next().await {
            let percent = update?;
            debug!(
                action = action.id,
                command = %action.command,
                progress = percent,
                "Waiting for action"
            );
        }
        Ok(())
    }
}
