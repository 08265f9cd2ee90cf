//! Human review queue for decisions that cannot auto-publish.
//!
//! A `HUMAN_REVIEW` decision becomes exactly one review item. Publication
//! waits on [`ReviewStore::wait_for_resolution`] until a reviewer approves
//! or rejects it, or the wait times out.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decision::QualityDecision;
use crate::errors::{ReviewError, StageguardError};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::store::{collections, save_document, DocumentStore};
use crate::utils::{now_utc, Timestamp};

/// A reviewer's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewOutcome {
    /// Publish.
    Approved,
    /// Do not publish.
    Rejected,
}

impl fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Lifecycle state of a review item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    /// Awaiting a reviewer.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
}

impl From<ReviewOutcome> for ReviewStatus {
    fn from(outcome: ReviewOutcome) -> Self {
        match outcome {
            ReviewOutcome::Approved => Self::Approved,
            ReviewOutcome::Rejected => Self::Rejected,
        }
    }
}

impl ReviewStatus {
    /// The outcome, once resolved.
    #[must_use]
    pub fn outcome(self) -> Option<ReviewOutcome> {
        match self {
            Self::Pending => None,
            Self::Approved => Some(ReviewOutcome::Approved),
            Self::Rejected => Some(ReviewOutcome::Rejected),
        }
    }
}

/// A decision held for human review, stored at `reviews/<review_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Review id.
    pub review_id: String,
    /// Run the decision belongs to.
    pub run_id: String,
    /// Digest of the decision under review.
    pub decision_digest: String,
    /// The decision itself.
    pub decision: QualityDecision,
    /// Current state.
    pub status: ReviewStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Resolution time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Timestamp>,
    /// Who resolved it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

/// Storage and signalling for review items.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Creates the review item for a `HUMAN_REVIEW` decision and returns its
    /// id. Submitting the same decision again returns the existing id.
    async fn create_review_item(&self, decision: &QualityDecision)
        -> Result<String, StageguardError>;

    /// Looks up an item.
    async fn get_review_item(&self, review_id: &str) -> Result<Option<ReviewItem>, StageguardError>;

    /// Records a reviewer's verdict and wakes any waiters.
    async fn resolve_review(
        &self,
        review_id: &str,
        outcome: ReviewOutcome,
        resolved_by: &str,
    ) -> Result<ReviewItem, StageguardError>;

    /// Waits until the item is resolved or `timeout` elapses.
    async fn wait_for_resolution(
        &self,
        review_id: &str,
        timeout: Duration,
    ) -> Result<ReviewOutcome, StageguardError>;
}

#[derive(Default)]
struct QueueState {
    items: HashMap<String, ReviewItem>,
    waiters: HashMap<String, Vec<oneshot::Sender<ReviewOutcome>>>,
}

/// In-process review queue, optionally mirrored to a document store.
pub struct InMemoryReviewQueue {
    state: Mutex<QueueState>,
    store: Option<Arc<dyn DocumentStore>>,
    events: Arc<dyn EventSink>,
}

impl Default for InMemoryReviewQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReviewQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Mirrors every item write to `reviews/<review_id>`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Pending review ids, sorted by creation time.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut pending: Vec<&ReviewItem> = state
            .items
            .values()
            .filter(|item| item.status == ReviewStatus::Pending)
            .collect();
        pending.sort_by_key(|item| item.created_at);
        pending.into_iter().map(|item| item.review_id.clone()).collect()
    }

    /// Callers currently blocked on `review_id`.
    #[must_use]
    pub fn waiting(&self, review_id: &str) -> usize {
        self.state
            .lock()
            .waiters
            .get(review_id)
            .map_or(0, |waiters| waiters.iter().filter(|w| !w.is_closed()).count())
    }

    fn prune_waiters(&self, review_id: &str) {
        let mut state = self.state.lock();
        if let Some(waiters) = state.waiters.get_mut(review_id) {
            waiters.retain(|waiter| !waiter.is_closed());
            if waiters.is_empty() {
                state.waiters.remove(review_id);
            }
        }
    }

    /// Number of items, resolved or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no item was ever created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn mirror(&self, item: &ReviewItem) -> Result<(), StageguardError> {
        if let Some(store) = &self.store {
            save_document(store.as_ref(), collections::REVIEWS, &item.review_id, item).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewQueue {
    async fn create_review_item(
        &self,
        decision: &QualityDecision,
    ) -> Result<String, StageguardError> {
        if !decision.decision.requires_review() {
            return Err(ReviewError::NotRequired {
                run_id: decision.run_id.clone(),
            }
            .into());
        }

        let digest = decision.digest();
        let item = {
            let mut state = self.state.lock();
            let existing = state
                .items
                .values()
                .find(|item| item.run_id == decision.run_id && item.decision_digest == digest);
            if let Some(existing) = existing {
                return Ok(existing.review_id.clone());
            }

            let item = ReviewItem {
                review_id: Uuid::new_v4().to_string(),
                run_id: decision.run_id.clone(),
                decision_digest: digest,
                decision: decision.clone(),
                status: ReviewStatus::Pending,
                created_at: now_utc(),
                resolved_at: None,
                resolved_by: None,
            };
            state.items.insert(item.review_id.clone(), item.clone());
            item
        };

        self.mirror(&item).await?;
        info!(
            review_id = %item.review_id,
            run_id = %item.run_id,
            issues = item.decision.issues.len(),
            "Review item created"
        );
        self.events.try_emit(
            event_types::REVIEW_CREATED,
            Some(json!({"review_id": item.review_id, "run_id": item.run_id})),
        );
        Ok(item.review_id)
    }

    async fn get_review_item(&self, review_id: &str) -> Result<Option<ReviewItem>, StageguardError> {
        Ok(self.state.lock().items.get(review_id).cloned())
    }

    async fn resolve_review(
        &self,
        review_id: &str,
        outcome: ReviewOutcome,
        resolved_by: &str,
    ) -> Result<ReviewItem, StageguardError> {
        let (item, waiters) = {
            let mut state = self.state.lock();
            let Some(item) = state.items.get_mut(review_id) else {
                return Err(ReviewError::NotFound {
                    review_id: review_id.to_string(),
                }
                .into());
            };
            if item.status != ReviewStatus::Pending {
                return Err(ReviewError::AlreadyResolved {
                    review_id: review_id.to_string(),
                }
                .into());
            }
            item.status = outcome.into();
            item.resolved_at = Some(now_utc());
            item.resolved_by = Some(resolved_by.to_string());
            let item = item.clone();
            let waiters = state.waiters.remove(review_id).unwrap_or_default();
            (item, waiters)
        };

        for waiter in waiters {
            // A waiter that already timed out has dropped its receiver.
            let _ = waiter.send(outcome);
        }

        self.mirror(&item).await?;
        info!(review_id, %outcome, resolved_by, "Review resolved");
        self.events.try_emit(
            event_types::REVIEW_RESOLVED,
            Some(json!({"review_id": review_id, "outcome": outcome, "resolved_by": resolved_by})),
        );
        Ok(item)
    }

    async fn wait_for_resolution(
        &self,
        review_id: &str,
        timeout: Duration,
    ) -> Result<ReviewOutcome, StageguardError> {
        let rx = {
            let mut state = self.state.lock();
            let Some(item) = state.items.get(review_id) else {
                return Err(ReviewError::NotFound {
                    review_id: review_id.to_string(),
                }
                .into());
            };
            if let Some(outcome) = item.status.outcome() {
                return Ok(outcome);
            }
            let (tx, rx) = oneshot::channel();
            let waiters = state.waiters.entry(review_id.to_string()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
            rx
        };

        let result = tokio::time::timeout(timeout, rx).await;
        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(StageguardError::Internal(format!(
                "review {review_id} was dropped before resolution"
            ))),
            Err(_) => {
                self.prune_waiters(review_id);
                warn!(
                    review_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "Timed out waiting for review"
                );
                Err(ReviewError::TimedOut {
                    review_id: review_id.to_string(),
                    timeout_seconds: timeout.as_secs(),
                }
                .into())
            }
        }
    }
}

impl fmt::Debug for InMemoryReviewQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryReviewQueue")
            .field("items", &self.len())
            .field("pending", &self.pending().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{PublishDecision, QualityIssue};
    use crate::store::InMemoryDocumentStore;
    use std::collections::BTreeMap;

    fn decision(kind: PublishDecision) -> QualityDecision {
        QualityDecision {
            run_id: "2024-05-01".into(),
            decision: kind,
            issues: vec![QualityIssue::major("PROVIDER_FALLBACK", "tts fallback")],
            reasons: vec!["1 major issue(s) require human review".into()],
            metrics_snapshot: BTreeMap::new(),
            timestamp_utc: now_utc(),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_decision() {
        let queue = InMemoryReviewQueue::new();
        let d = decision(PublishDecision::HumanReview);

        let first = queue.create_review_item(&d).await.unwrap();
        let second = queue.create_review_item(&d).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending(), vec![first]);
    }

    #[tokio::test]
    async fn test_create_rejects_auto_publish() {
        let queue = InMemoryReviewQueue::new();
        let err = queue
            .create_review_item(&decision(PublishDecision::AutoPublish))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REVIEW_NOT_REQUIRED");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_resolves_on_approval() {
        let queue = Arc::new(InMemoryReviewQueue::new());
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();

        let waiter = {
            let queue = queue.clone();
            let id = id.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_resolution(&id, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let item = queue
            .resolve_review(&id, ReviewOutcome::Approved, "editor@example.com")
            .await
            .unwrap();
        assert_eq!(item.status, ReviewStatus::Approved);
        assert_eq!(item.resolved_by.as_deref(), Some("editor@example.com"));

        assert_eq!(waiter.await.unwrap().unwrap(), ReviewOutcome::Approved);
    }

    #[tokio::test]
    async fn test_wait_after_resolution_returns_immediately() {
        let queue = InMemoryReviewQueue::new();
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();
        queue
            .resolve_review(&id, ReviewOutcome::Rejected, "editor")
            .await
            .unwrap();

        let outcome = queue
            .wait_for_resolution(&id, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(outcome, ReviewOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let queue = InMemoryReviewQueue::new();
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();
        let err = queue
            .wait_for_resolution(&id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REVIEW_TIMED_OUT");
    }

    #[tokio::test]
    async fn test_timed_out_waits_release_their_slot() {
        let queue = InMemoryReviewQueue::new();
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();
        for _ in 0..3 {
            let _ = queue
                .wait_for_resolution(&id, Duration::from_millis(5))
                .await;
        }
        assert_eq!(queue.waiting(&id), 0);
        assert!(queue.state.lock().waiters.get(&id).is_none());

        let queue = Arc::new(queue);
        let waiter = {
            let queue = Arc::clone(&queue);
            let id = id.clone();
            tokio::spawn(async move {
                queue
                    .wait_for_resolution(&id, Duration::from_secs(5))
                    .await
            })
        };
        while queue.waiting(&id) == 0 {
            tokio::task::yield_now().await;
        }
        queue
            .resolve_review(&id, ReviewOutcome::Approved, "editor")
            .await
            .unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ReviewOutcome::Approved);
    }

    #[tokio::test]
    async fn test_resolve_twice_and_unknown() {
        let queue = InMemoryReviewQueue::new();
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();
        queue.resolve_review(&id, ReviewOutcome::Approved, "a").await.unwrap();

        let again = queue.resolve_review(&id, ReviewOutcome::Rejected, "b").await.unwrap_err();
        assert_eq!(again.code(), "REVIEW_ALREADY_RESOLVED");
        let missing = queue
            .resolve_review("nope", ReviewOutcome::Approved, "a")
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "REVIEW_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_items_mirrored_to_store() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let queue = InMemoryReviewQueue::new().with_store(store.clone());
        let id = queue
            .create_review_item(&decision(PublishDecision::HumanReview))
            .await
            .unwrap();
        queue.resolve_review(&id, ReviewOutcome::Approved, "a").await.unwrap();

        let doc = store.get_document(collections::REVIEWS, &id).await.unwrap().unwrap();
        assert_eq!(doc["status"], "approved");
    }
}
