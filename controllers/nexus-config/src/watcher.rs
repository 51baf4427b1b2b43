//! Resource watchers.
//!
//! Each category gets one background task that consumes a watch stream and
//! hands every event's snapshot to the category callback, one at a time and
//! in stream order. The task ends when its token is cancelled or when the
//! stream ends and the reconnect policy gives up.
//!
//! The API server closes every watch after one session. A stream that ends
//! at or past that point is renewed at once from the last resource version
//! seen, under any policy. Only an early end consults the reconnect policy.

use crate::backoff::FibonacciBackoff;
use crate::config::{ReconnectPolicy, WatchSettings};
use crate::reconciler::{CategoryCallback, ReconcileAction, action_for};
use cluster_client::{ANY_RESOURCE_VERSION, ClusterClient, ClusterError, LabelSelector, WatchEvent, WatchStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECONNECT_MIN_DELAY_SECS: u64 = 1;
const RECONNECT_MAX_DELAY_SECS: u64 = 60;
/// A stream that stayed open this long resets the reconnect budget
const HEALTHY_STREAM: Duration = Duration::from_secs(30);
/// Ends this close to the session length count as a normal session close
const SESSION_SLACK: Duration = Duration::from_secs(5);

/// Handle to a running watch task
#[derive(Debug)]
pub struct WatcherHandle {
    label: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ask the task to stop. Returns immediately; the task drops its stream
    /// at its next suspension point.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

enum StreamEnd {
    Cancelled,
    Exhausted,
}

struct WatchTask {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    selector: LabelSelector,
    callback: CategoryCallback,
    settings: WatchSettings,
    label: String,
    token: CancellationToken,
}

/// Open a watch on `selector` in `namespace` from `resource_version` and
/// spawn its consuming task.
///
/// Fails only when the stream cannot be opened; no task is spawned then.
pub async fn start_watch(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    selector: LabelSelector,
    resource_version: String,
    callback: CategoryCallback,
    settings: WatchSettings,
) -> Result<WatcherHandle, ClusterError> {
    let stream = client.watch(&namespace, &selector, &resource_version).await?;
    let label = format!("{} watcher ({})", callback.category(), selector);
    let token = CancellationToken::new();

    info!("Starting {} in namespace {} at version {}", label, namespace, resource_version);

    let task = WatchTask {
        client,
        namespace,
        selector,
        callback,
        settings,
        label: label.clone(),
        token: token.clone(),
    };
    let task = tokio::spawn(task.run(stream, resource_version));

    Ok(WatcherHandle { label, token, task })
}

impl WatchTask {
    async fn run(self, mut stream: WatchStream, mut version: String) {
        let mut backoff = FibonacciBackoff::new(RECONNECT_MIN_DELAY_SECS, RECONNECT_MAX_DELAY_SECS);
        let mut attempts: u32 = 0;

        loop {
            let opened_at = Instant::now();
            if let StreamEnd::Cancelled = self.consume(&mut stream, &mut version).await {
                debug!("{} cancelled", self.label);
                return;
            }
            let lived = opened_at.elapsed();

            if lived >= HEALTHY_STREAM {
                backoff.reset();
                attempts = 0;
            }

            if self.session_completed(lived) {
                debug!("{} session closed after {:?}; renewing from version {}", self.label, lived, version);
                match self.client.watch(&self.namespace, &self.selector, &version).await {
                    Ok(next) => {
                        stream = next;
                        continue;
                    }
                    Err(e) => warn!("{} failed to renew: {}", self.label, e),
                }
            }

            let max_attempts = match self.settings.reconnect {
                ReconnectPolicy::Never => {
                    warn!("{} stream ended; no further updates until restart", self.label);
                    return;
                }
                ReconnectPolicy::Backoff { max_attempts } => max_attempts,
            };

            match self.resubscribe(&version, &mut backoff, &mut attempts, max_attempts).await {
                Some(next) => stream = next,
                None => return,
            }
        }
    }

    fn session_completed(&self, lived: Duration) -> bool {
        lived >= self.settings.session.saturating_sub(SESSION_SLACK)
    }

    /// Process events until the stream ends or the token fires.
    ///
    /// `version` follows the newest resource version delivered and falls
    /// back to any version once the server reports it expired.
    async fn consume(&self, stream: &mut WatchStream, version: &mut String) -> StreamEnd {
        loop {
            let item = tokio::select! {
                biased;
                () = self.token.cancelled() => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    if let Some(seen) = event.resource().resource_version.as_deref() {
                        seen.clone_into(version);
                    }
                    self.handle(event).await;
                }
                Some(Err(ClusterError::Expired(reason))) => {
                    warn!("{} resource version {} expired: {}", self.label, version, reason);
                    ANY_RESOURCE_VERSION.clone_into(version);
                }
                Some(Err(e)) => warn!("{} stream error: {}", self.label, e),
                None => return StreamEnd::Exhausted,
            }
        }
    }

    async fn handle(&self, event: WatchEvent) {
        let kind = event.kind();
        let resource = event.into_resource();
        debug!("{} received {} for {}", self.label, kind, resource.qualified_name());

        match action_for(kind) {
            ReconcileAction::Upsert => {
                if let Err(e) = self.callback.apply(&resource).await {
                    warn!(
                        "Failed to apply {} config {} after {}: {}",
                        self.callback.category(),
                        resource.qualified_name(),
                        kind,
                        e
                    );
                }
            }
        }
    }

    /// Re-open the watch, sleeping with backoff before each try
    async fn resubscribe(
        &self,
        version: &str,
        backoff: &mut FibonacciBackoff,
        attempts: &mut u32,
        max_attempts: u32,
    ) -> Option<WatchStream> {
        loop {
            if *attempts >= max_attempts {
                error!("{} giving up after {} reconnect attempts", self.label, attempts);
                return None;
            }
            *attempts += 1;

            let delay = backoff.next_delay();
            info!(
                "{} stream ended; reconnecting in {:?} (attempt {}/{})",
                self.label, delay, attempts, max_attempts
            );

            tokio::select! {
                biased;
                () = self.token.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            match self.client.watch(&self.namespace, &self.selector, version).await {
                Ok(stream) => return Some(stream),
                Err(e) => warn!("{} failed to reopen: {}", self.label, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{ConfigReconciler, ResourceCategory};
    use crate::test_utils::{RecordingReconciler, TEST_NAMESPACE, blobstore_selector, labeled, repository_selector};
    use cluster_client::MockClusterClient;

    async fn watch(
        mock: &MockClusterClient,
        recorder: &Arc<RecordingReconciler>,
        category: ResourceCategory,
        selector: LabelSelector,
        reconnect: ReconnectPolicy,
    ) -> WatcherHandle {
        let settings = WatchSettings {
            reconnect,
            ..WatchSettings::default()
        };
        watch_with(mock, recorder, category, selector, settings).await
    }

    async fn watch_with(
        mock: &MockClusterClient,
        recorder: &Arc<RecordingReconciler>,
        category: ResourceCategory,
        selector: LabelSelector,
        settings: WatchSettings,
    ) -> WatcherHandle {
        let reconciler: Arc<dyn ConfigReconciler> = recorder.clone();
        start_watch(
            Arc::new(mock.clone()),
            TEST_NAMESPACE.to_string(),
            selector,
            "10".to_string(),
            CategoryCallback::new(category, reconciler),
            settings,
        )
        .await
        .unwrap()
    }

    fn versions(mock: &MockClusterClient) -> Vec<String> {
        mock.watch_calls().into_iter().map(|call| call.resource_version).collect()
    }

    /// Every stream counts as having lived a full session
    fn instant_sessions(reconnect: ReconnectPolicy) -> WatchSettings {
        WatchSettings {
            reconnect,
            session: Duration::ZERO,
        }
    }

    async fn wait_finished(handle: &WatcherHandle) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_every_event_kind_applies_snapshot_in_order() {
        let mock = MockClusterClient::new();
        let feed = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Never,
        )
        .await;

        let r1 = labeled("r1", "repository");
        let r1_v2 = r1.clone().with_data("config", "{\"online\":false}");
        feed.send(Ok(WatchEvent::Added(r1.clone()))).unwrap();
        feed.send(Ok(WatchEvent::Modified(r1_v2.clone()))).unwrap();
        feed.send(Ok(WatchEvent::Deleted(r1_v2.clone()))).unwrap();

        recorder.wait_for(3).await;

        assert_eq!(recorder.snapshots(), vec![r1, r1_v2.clone(), r1_v2]);
        assert!(recorder
            .applied()
            .iter()
            .all(|(category, _)| *category == ResourceCategory::Repository));
        handle.cancel();
    }

    #[tokio::test]
    async fn test_stream_and_callback_errors_do_not_stop_watch() {
        let mock = MockClusterClient::new();
        let feed = mock.watch_feed(&blobstore_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        recorder.fail_on("broken");
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::BlobStore,
            blobstore_selector(),
            ReconnectPolicy::Never,
        )
        .await;

        feed.send(Ok(WatchEvent::Added(labeled("broken", "blobstore")))).unwrap();
        feed.send(Err(ClusterError::Api("watch error 500: decode failure".to_string()))).unwrap();
        feed.send(Ok(WatchEvent::Added(labeled("default", "blobstore")))).unwrap();

        recorder.wait_for(2).await;

        assert_eq!(
            recorder.applied(),
            vec![
                (ResourceCategory::BlobStore, "broken".to_string()),
                (ResourceCategory::BlobStore, "default".to_string()),
            ]
        );
        assert!(!handle.is_finished());
        handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_closes_stream() {
        let mock = MockClusterClient::new();
        let feed = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Never,
        )
        .await;

        handle.cancel();

        tokio::time::timeout(Duration::from_secs(5), feed.closed()).await.unwrap();
        wait_finished(&handle).await;
        assert!(recorder.applied().is_empty());
    }

    #[tokio::test]
    async fn test_stream_end_without_reconnect_stops_task() {
        let mock = MockClusterClient::new();
        let feed = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Never,
        )
        .await;

        feed.send(Ok(WatchEvent::Added(labeled("r1", "repository")))).unwrap();
        drop(feed);

        wait_finished(&handle).await;
        assert_eq!(recorder.applied().len(), 1);
        assert_eq!(mock.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_end_with_reconnect_resubscribes() {
        let mock = MockClusterClient::new();
        let first = mock.watch_feed(&repository_selector());
        let second = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Backoff { max_attempts: 3 },
        )
        .await;

        first.send(Ok(WatchEvent::Added(labeled("r1", "repository")))).unwrap();
        drop(first);
        second.send(Ok(WatchEvent::Added(labeled("r2", "repository")))).unwrap();

        recorder.wait_for(2).await;

        assert_eq!(
            recorder.applied(),
            vec![
                (ResourceCategory::Repository, "r1".to_string()),
                (ResourceCategory::Repository, "r2".to_string()),
            ]
        );
        assert_eq!(mock.watch_calls().len(), 2);
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), second.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_budget_exhausted() {
        let mock = MockClusterClient::new();
        let feed = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Backoff { max_attempts: 0 },
        )
        .await;

        drop(feed);

        wait_finished(&handle).await;
        assert_eq!(mock.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_spawns_nothing() {
        let mock = MockClusterClient::new();
        mock.fail_watch(&repository_selector());
        let reconciler: Arc<dyn ConfigReconciler> = Arc::new(RecordingReconciler::default());

        let result = start_watch(
            Arc::new(mock.clone()),
            TEST_NAMESPACE.to_string(),
            repository_selector(),
            ANY_RESOURCE_VERSION.to_string(),
            CategoryCallback::new(ResourceCategory::Repository, reconciler),
            WatchSettings::default(),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_session_close_renews_without_reconnect_policy() {
        let mock = MockClusterClient::new();
        let first = mock.watch_feed(&repository_selector());
        let second = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch_with(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            instant_sessions(ReconnectPolicy::Never),
        )
        .await;

        first
            .send(Ok(WatchEvent::Added(labeled("r1", "repository").with_resource_version("17"))))
            .unwrap();
        drop(first);
        second.send(Ok(WatchEvent::Added(labeled("r2", "repository")))).unwrap();

        recorder.wait_for(2).await;

        assert_eq!(versions(&mock), vec!["10", "17"]);
        assert!(!handle.is_finished());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(5), second.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_last_seen_version() {
        let mock = MockClusterClient::new();
        let first = mock.watch_feed(&repository_selector());
        let second = mock.watch_feed(&repository_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch(
            &mock,
            &recorder,
            ResourceCategory::Repository,
            repository_selector(),
            ReconnectPolicy::Backoff { max_attempts: 3 },
        )
        .await;

        first
            .send(Ok(WatchEvent::Modified(labeled("r1", "repository").with_resource_version("11"))))
            .unwrap();
        first
            .send(Ok(WatchEvent::Modified(labeled("r1", "repository").with_resource_version("12"))))
            .unwrap();
        drop(first);
        second.send(Ok(WatchEvent::Added(labeled("r2", "repository")))).unwrap();

        recorder.wait_for(3).await;

        assert_eq!(versions(&mock), vec!["10", "12"]);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_expired_version_restarts_from_any_version() {
        let mock = MockClusterClient::new();
        let first = mock.watch_feed(&blobstore_selector());
        let second = mock.watch_feed(&blobstore_selector());
        let recorder = Arc::new(RecordingReconciler::default());
        let handle = watch_with(
            &mock,
            &recorder,
            ResourceCategory::BlobStore,
            blobstore_selector(),
            instant_sessions(ReconnectPolicy::Never),
        )
        .await;

        first
            .send(Ok(WatchEvent::Added(labeled("default", "blobstore").with_resource_version("15"))))
            .unwrap();
        first
            .send(Err(ClusterError::Expired("too old resource version: 15".to_string())))
            .unwrap();
        drop(first);
        second.send(Ok(WatchEvent::Added(labeled("default", "blobstore")))).unwrap();

        recorder.wait_for(2).await;

        assert_eq!(versions(&mock), vec!["10", ANY_RESOURCE_VERSION]);
        handle.cancel();
    }
}
