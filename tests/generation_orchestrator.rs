use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imagegen::billing::{
    next_reset_after, InMemoryQuotaStore, QuotaLedger, QuotaStore, Subscriber, Tier,
};
use imagegen::generation::{
    BackendError, BackendErrorKind, BackendRequest, BackendResponse, CancelOutcome,
    CompensationPolicy, DescriptorPostProcessor, GenerationBackend, GenerationInput,
    GenerationParameters, GenerationRecord, GenerationRequest, GenerationStatus, GenerationStore,
    InMemoryGenerationStore, InputImage, Orchestrator, OrchestratorConfig, Quality, RawImage,
};
use imagegen::generation::models::GenerationPatch;
use imagegen::generation::StoreError;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// key: generation-orchestrator-tests -> end-to-end flows over in-memory stores

type Step = Result<BackendResponse, BackendError>;

#[derive(Default)]
struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    delay: Option<Duration>,
    requests: Mutex<Vec<BackendRequest>>,
}

impl ScriptedBackend {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn invoke(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(images(1)))
    }
}

fn images(count: usize) -> BackendResponse {
    BackendResponse {
        images: (0..count)
            .map(|index| RawImage {
                url: format!("https://cdn.test/out/{index}.png"),
                width: Some(1024),
                height: Some(1024),
                format: None,
                size_bytes: Some(2048),
            })
            .collect(),
        metadata: json!({"model": "scripted"}),
        usage: json!({"gpu_ms": 1200}),
    }
}

fn failure(kind: BackendErrorKind) -> Step {
    Err(BackendError::new(kind, "scripted failure"))
}

struct Harness {
    orchestrator: Orchestrator,
    ledger: QuotaLedger,
    quota: InMemoryQuotaStore,
    records: InMemoryGenerationStore,
    backend: Arc<ScriptedBackend>,
}

fn harness(backend: ScriptedBackend, config: OrchestratorConfig) -> Harness {
    let quota = InMemoryQuotaStore::new();
    let ledger = QuotaLedger::new(Arc::new(quota.clone()));
    let records = InMemoryGenerationStore::new();
    let backend = Arc::new(backend);
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        Arc::new(records.clone()),
        backend.clone(),
        Arc::new(DescriptorPostProcessor),
        config,
    );
    Harness {
        orchestrator,
        ledger,
        quota,
        records,
        backend,
    }
}

fn seed(harness: &Harness, tier: Tier, used: i64) -> Uuid {
    let mut subscriber = Subscriber::new(
        format!("subject-{}", Uuid::new_v4()),
        tier,
        next_reset_after(Utc::now()),
    );
    subscriber.monthly_usage = used;
    let id = subscriber.id;
    harness.quota.put(subscriber);
    id
}

async fn used(harness: &Harness, subscriber_id: Uuid) -> i64 {
    harness.ledger.snapshot(subscriber_id).await.unwrap().used
}

fn assert_all_terminal(harness: &Harness) {
    for record in harness.records.all() {
        assert!(
            record.status.is_terminal(),
            "record {} left {}",
            record.id,
            record.status
        );
    }
}

fn stored(harness: &Harness, id: Uuid) -> GenerationRecord {
    harness
        .records
        .all()
        .into_iter()
        .find(|record| record.id == id)
        .expect("record stored")
}

#[tokio::test(start_paused = true)]
async fn free_tier_spends_last_credit_then_is_refused() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 9);

    let first = h
        .orchestrator
        .text_to_image(subscriber, "a cat", GenerationParameters::default())
        .await;
    assert!(first.success, "{:?}", first.error);
    let data = first.data.as_ref().unwrap();
    assert_eq!(data.images.len(), 1);
    assert_eq!(data.usage.credits_charged, 1);
    assert_eq!(data.usage.quota_used, 10);
    assert_eq!(data.usage.quota_remaining, 0);
    assert_eq!(data.usage.backend, Some(json!({"gpu_ms": 1200})));
    assert_eq!(data.generation_record.status, GenerationStatus::Completed);
    assert!(data.generation_record.processing_time_ms.is_some());
    assert_eq!(used(&h, subscriber).await, 10);

    let second = h
        .orchestrator
        .text_to_image(subscriber, "a cat", GenerationParameters::default())
        .await;
    assert!(!second.success);
    assert_eq!(second.error_code(), Some("QUOTA_EXCEEDED"));
    let error = second.error.as_ref().unwrap();
    assert_eq!(error.details.as_ref().unwrap()["remaining"], 0);
    let refused = stored(&h, second.generation_id.unwrap());
    assert_eq!(refused.status, GenerationStatus::Failed);
    assert_eq!(refused.error_message.as_deref(), Some("Monthly quota exceeded"));

    assert_eq!(used(&h, subscriber).await, 10);
    assert_eq!(h.backend.calls(), 1);
    assert_all_terminal(&h);

    let snapshot = h.ledger.snapshot(subscriber).await.unwrap();
    assert_eq!(snapshot.total_generated, 1);
}

#[tokio::test(start_paused = true)]
async fn plus_tier_ultra_is_rejected_before_any_record() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Plus, 0);

    let result = h
        .orchestrator
        .text_to_image(
            subscriber,
            "a castle",
            GenerationParameters {
                quality: Quality::Ultra,
                ..GenerationParameters::default()
            },
        )
        .await;

    assert_eq!(result.error_code(), Some("SUBSCRIPTION_REQUIRED"));
    assert!(result.generation_id.is_none());
    assert!(h.records.is_empty());
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(used(&h, subscriber).await, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_into_one_result() {
    let backend = ScriptedBackend::new(vec![
        failure(BackendErrorKind::UpstreamError),
        failure(BackendErrorKind::RateLimited),
        Ok(images(2)),
    ]);
    let h = harness(backend, OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Plus, 0);

    let result = h
        .orchestrator
        .text_to_image(
            subscriber,
            "two lanterns",
            GenerationParameters {
                batch_size: 2,
                ..GenerationParameters::default()
            },
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(h.backend.calls(), 3);
    let data = result.data.unwrap();
    assert_eq!(data.images.len(), 2);
    assert_eq!(data.generation_record.output_images, data.images);
    assert_eq!(h.records.len(), 1);
    // 1.0 * 2 * 0.96 rounds up to 2 credits, charged once.
    assert_eq!(used(&h, subscriber).await, 2);
    assert_all_terminal(&h);
}

#[tokio::test(start_paused = true)]
async fn safety_rejection_fails_after_one_attempt_and_releases() {
    let backend = ScriptedBackend::new(vec![failure(BackendErrorKind::SafetyRejected)]);
    let h = harness(backend, OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 3);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "something forbidden", GenerationParameters::default())
        .await;

    assert_eq!(result.error_code(), Some("BACKEND_REJECTED"));
    assert_eq!(h.backend.calls(), 1);
    let record = stored(&h, result.generation_id.unwrap());
    assert_eq!(record.status, GenerationStatus::Failed);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("safety_rejected"));
    assert_eq!(used(&h, subscriber).await, 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_keep_credits_when_charging_always() {
    let backend = ScriptedBackend::new(vec![
        failure(BackendErrorKind::Timeout),
        failure(BackendErrorKind::Timeout),
        failure(BackendErrorKind::Timeout),
    ]);
    let config = OrchestratorConfig {
        compensation: CompensationPolicy::ChargeAlways,
        ..OrchestratorConfig::default()
    };
    let h = harness(backend, config);
    let subscriber = seed(&h, Tier::Free, 0);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "a tram", GenerationParameters::default())
        .await;

    assert_eq!(result.error_code(), Some("BACKEND_UNAVAILABLE"));
    assert_eq!(
        result.error.unwrap().details.unwrap()["attempts"],
        json!(3)
    );
    assert_eq!(h.backend.calls(), 3);
    assert_eq!(used(&h, subscriber).await, 1);
    assert_all_terminal(&h);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_release_credits_by_default() {
    let backend = ScriptedBackend::new(vec![
        failure(BackendErrorKind::UpstreamError),
        failure(BackendErrorKind::UpstreamError),
        failure(BackendErrorKind::UpstreamError),
    ]);
    let h = harness(backend, OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 0);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "a tram", GenerationParameters::default())
        .await;

    assert_eq!(result.error_code(), Some("BACKEND_UNAVAILABLE"));
    assert_eq!(used(&h, subscriber).await, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_backend_output_is_a_post_processing_failure() {
    let backend = ScriptedBackend::new(vec![Ok(images(0))]);
    let h = harness(backend, OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 0);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "nothing", GenerationParameters::default())
        .await;

    assert_eq!(result.error_code(), Some("POST_PROCESSING_FAILED"));
    let record = stored(&h, result.generation_id.unwrap());
    assert!(record
        .error_message
        .unwrap()
        .starts_with("processing_error"));
    assert_eq!(used(&h, subscriber).await, 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_the_record_with_timeout() {
    let h = harness(
        ScriptedBackend::slow(Duration::from_secs(60)),
        OrchestratorConfig {
            deadline: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        },
    );
    let subscriber = seed(&h, Tier::Free, 0);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "slow sunrise", GenerationParameters::default())
        .await;

    assert_eq!(result.error_code(), Some("GENERATION_TIMEOUT"));
    let record = stored(&h, result.generation_id.unwrap());
    assert_eq!(record.status, GenerationStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("generation timed out"));
    assert_eq!(used(&h, subscriber).await, 0);
}

#[tokio::test(start_paused = true)]
async fn explicit_cancel_marks_record_canceled() {
    let h = harness(
        ScriptedBackend::slow(Duration::from_secs(30)),
        OrchestratorConfig::default(),
    );
    let subscriber = seed(&h, Tier::Free, 2);

    let worker = h.orchestrator.clone();
    let running = tokio::spawn(async move {
        worker
            .text_to_image(subscriber, "endless corridor", GenerationParameters::default())
            .await
    });
    while h.backend.calls() == 0 {
        tokio::task::yield_now().await;
    }
    let generation_id = h.records.all()[0].id;
    assert_eq!(h.orchestrator.in_flight_count(), 1);

    // Another subscriber cannot cancel it.
    let stranger = seed(&h, Tier::Free, 0);
    assert!(h.orchestrator.cancel(stranger, generation_id).await.is_err());

    let outcome = h
        .orchestrator
        .cancel(subscriber, generation_id)
        .await
        .unwrap();
    assert_eq!(outcome, CancelOutcome::Signalled);

    let result = running.await.unwrap();
    assert_eq!(result.error_code(), Some("GENERATION_CANCELED"));
    assert_eq!(stored(&h, generation_id).status, GenerationStatus::Canceled);
    assert_eq!(used(&h, subscriber).await, 2);
    assert_eq!(h.orchestrator.in_flight_count(), 0);

    let again = h
        .orchestrator
        .cancel(subscriber, generation_id)
        .await
        .unwrap();
    assert_eq!(
        again,
        CancelOutcome::AlreadyFinished(GenerationStatus::Canceled)
    );
}

#[tokio::test(start_paused = true)]
async fn caller_token_cancellation_fails_the_record() {
    let h = harness(
        ScriptedBackend::slow(Duration::from_secs(30)),
        OrchestratorConfig::default(),
    );
    let subscriber = seed(&h, Tier::Free, 0);
    let token = CancellationToken::new();

    let worker = h.orchestrator.clone();
    let child = token.clone();
    let running = tokio::spawn(async move {
        let request = GenerationRequest::new("walk away", GenerationInput::TextToImage);
        worker.generate_with_cancel(subscriber, request, child).await
    });
    while h.backend.calls() == 0 {
        tokio::task::yield_now().await;
    }
    token.cancel();

    let result = running.await.unwrap();
    assert_eq!(result.error_code(), Some("GENERATION_CANCELED"));
    let record = stored(&h, result.generation_id.unwrap());
    assert_eq!(record.status, GenerationStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("generation canceled"));
    assert_eq!(used(&h, subscriber).await, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_never_overshoot_the_limit() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 0);

    let handles: Vec<_> = (0..15)
        .map(|index| {
            let worker = h.orchestrator.clone();
            tokio::spawn(async move {
                worker
                    .text_to_image(
                        subscriber,
                        format!("tile {index}"),
                        GenerationParameters::default(),
                    )
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut refused = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        match result.error_code() {
            None => succeeded += 1,
            Some("QUOTA_EXCEEDED") => refused += 1,
            Some(other) => panic!("unexpected code {other}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(refused, 5);
    assert_eq!(used(&h, subscriber).await, 10);
    assert_eq!(h.records.len(), 15);
    assert_all_terminal(&h);
}

#[tokio::test(start_paused = true)]
async fn image_to_image_passes_strength_and_charges_type_factor() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Plus, 0);

    let result = h
        .orchestrator
        .image_to_image(
            subscriber,
            "make it winter",
            InputImage::new("https://img.test/park.jpg"),
            0.35,
            GenerationParameters {
                quality: Quality::Hd,
                ..GenerationParameters::default()
            },
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    // 1.2 * 1.5 * 0.98 = 1.764, rounded up.
    assert_eq!(result.data.unwrap().usage.credits_charged, 2);
    let sent = h.backend.requests.lock().unwrap()[0].clone();
    assert_eq!(sent.strength, Some(0.35));
    assert_eq!(sent.input_images.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refine_and_multi_image_flow_through_the_same_pipeline() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Pro, 0);

    let refined = h
        .orchestrator
        .refine(
            subscriber,
            "crisper edges",
            InputImage::new("https://img.test/draft.png"),
            Some("keep the palette".to_string()),
            GenerationParameters::default(),
        )
        .await;
    assert!(refined.success, "{:?}", refined.error);

    let blended = h
        .orchestrator
        .multi_image(
            subscriber,
            "merge the scenes",
            vec![
                InputImage::new("https://img.test/a.png"),
                InputImage::new("https://img.test/b.png"),
            ],
            GenerationParameters::default(),
        )
        .await;
    assert!(blended.success, "{:?}", blended.error);

    let requests = h.backend.requests.lock().unwrap().clone();
    assert_eq!(requests[0].instructions.as_deref(), Some("keep the palette"));
    assert_eq!(requests[1].input_images.len(), 2);
    assert_all_terminal(&h);
}

#[tokio::test]
async fn deleted_subscribers_are_unavailable() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Pro, 0);
    assert!(h.ledger.soft_delete(subscriber).await.unwrap());

    let result = h
        .orchestrator
        .text_to_image(subscriber, "ghost", GenerationParameters::default())
        .await;
    assert_eq!(result.error_code(), Some("SUBSCRIBER_UNAVAILABLE"));
    assert!(h.records.is_empty());

    let unknown = h
        .orchestrator
        .text_to_image(Uuid::new_v4(), "ghost", GenerationParameters::default())
        .await;
    assert_eq!(unknown.error_code(), Some("SUBSCRIBER_UNAVAILABLE"));
}

#[tokio::test]
async fn preview_matches_the_charged_price() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Pro, 495);
    let request = GenerationRequest::new(
        "city at night",
        GenerationInput::MultiImage {
            sources: vec![
                InputImage::new("https://img.test/1.png"),
                InputImage::new("https://img.test/2.png"),
            ],
        },
    )
    .with_parameters(GenerationParameters {
        quality: Quality::Ultra,
        batch_size: 4,
        ..GenerationParameters::default()
    });

    let preview = h
        .orchestrator
        .preview_cost(subscriber, &request)
        .await
        .unwrap();
    assert_eq!(preview.credits, 12);
    assert_eq!(preview.quota_remaining, 5);
    assert!(!preview.affordable);
    assert!(h.records.is_empty());

    let result = h.orchestrator.generate(subscriber, request).await;
    assert_eq!(result.error_code(), Some("QUOTA_EXCEEDED"));
}

#[tokio::test]
async fn orphaned_records_can_be_canceled_once_stale() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 4);
    let request = GenerationRequest::new("lost worker", GenerationInput::TextToImage);

    let period = next_reset_after(Utc::now());
    let mut orphan = GenerationRecord::pending(subscriber, &request, 1);
    orphan.begin_processing(period).unwrap();
    orphan.updated_at = Utc::now() - chrono::Duration::hours(1);
    h.records.create(&orphan).await.unwrap();

    let mut fresh = GenerationRecord::pending(subscriber, &request, 1);
    fresh.begin_processing(period).unwrap();
    h.records.create(&fresh).await.unwrap();

    assert_eq!(
        h.orchestrator.cancel(subscriber, orphan.id).await.unwrap(),
        CancelOutcome::Canceled
    );
    assert_eq!(stored(&h, orphan.id).status, GenerationStatus::Canceled);
    assert_eq!(used(&h, subscriber).await, 3);

    assert_eq!(
        h.orchestrator.cancel(subscriber, fresh.id).await.unwrap(),
        CancelOutcome::RunningElsewhere
    );
}

#[tokio::test]
async fn orphan_cancel_does_not_refund_a_closed_period() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Free, 4);
    let request = GenerationRequest::new("last month", GenerationInput::TextToImage);

    let mut orphan = GenerationRecord::pending(subscriber, &request, 2);
    orphan
        .begin_processing(Utc::now() - chrono::Duration::days(2))
        .unwrap();
    orphan.updated_at = Utc::now() - chrono::Duration::hours(1);
    h.records.create(&orphan).await.unwrap();

    assert_eq!(
        h.orchestrator.cancel(subscriber, orphan.id).await.unwrap(),
        CancelOutcome::Canceled
    );
    assert_eq!(stored(&h, orphan.id).status, GenerationStatus::Canceled);
    assert_eq!(used(&h, subscriber).await, 4);
}

/// Closes the subscriber's period and spends the new one while the call is outstanding.
struct RolloverThenReject {
    ledger: QuotaLedger,
    quota: InMemoryQuotaStore,
    subscriber_id: Uuid,
}

#[async_trait]
impl GenerationBackend for RolloverThenReject {
    async fn invoke(&self, _request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut subscriber = self
            .quota
            .subscriber(self.subscriber_id)
            .await
            .unwrap()
            .unwrap();
        subscriber.quota_reset_date = Utc::now() - chrono::Duration::seconds(1);
        self.quota.put(subscriber);
        self.ledger
            .check_and_reserve(self.subscriber_id, 10)
            .await
            .unwrap();
        Err(BackendError::new(
            BackendErrorKind::SafetyRejected,
            "rejected after rollover",
        ))
    }
}

#[tokio::test]
async fn failure_after_period_rollover_keeps_new_period_usage() {
    let quota = InMemoryQuotaStore::new();
    let ledger = QuotaLedger::new(Arc::new(quota.clone()));
    let period = Utc::now() + chrono::Duration::hours(1);
    let subscriber = Subscriber::new("rollover", Tier::Free, period);
    let subscriber_id = subscriber.id;
    quota.put(subscriber);

    let records = InMemoryGenerationStore::new();
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        Arc::new(records.clone()),
        Arc::new(RolloverThenReject {
            ledger: ledger.clone(),
            quota: quota.clone(),
            subscriber_id,
        }),
        Arc::new(DescriptorPostProcessor),
        OrchestratorConfig::default(),
    );

    let result = orchestrator
        .text_to_image(subscriber_id, "late in the month", GenerationParameters::default())
        .await;
    assert_eq!(result.error_code(), Some("BACKEND_REJECTED"));

    let record = records
        .get(result.generation_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, GenerationStatus::Failed);
    assert_eq!(record.quota_period, Some(period));
    assert_eq!(ledger.snapshot(subscriber_id).await.unwrap().used, 10);
}

/// Refuses the first terminal patch, as a store outage mid-settlement would.
struct DropsFirstTerminalUpdate {
    inner: InMemoryGenerationStore,
    dropped: AtomicBool,
}

#[async_trait]
impl GenerationStore for DropsFirstTerminalUpdate {
    async fn create(&self, record: &GenerationRecord) -> Result<Uuid, StoreError> {
        self.inner.create(record).await
    }

    async fn update(&self, id: Uuid, patch: &GenerationPatch) -> Result<(), StoreError> {
        if patch.status.is_terminal() && !self.dropped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.update(id, patch).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn list_for_subscriber(
        &self,
        subscriber_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GenerationRecord>, StoreError> {
        self.inner
            .list_for_subscriber(subscriber_id, limit, offset)
            .await
    }

    async fn prune_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_terminal_before(cutoff).await
    }
}

#[tokio::test]
async fn unpersisted_failure_is_refunded_once_by_orphan_cancel() {
    let quota = InMemoryQuotaStore::new();
    let ledger = QuotaLedger::new(Arc::new(quota.clone()));
    let mut subscriber = Subscriber::new("store-outage", Tier::Free, next_reset_after(Utc::now()));
    subscriber.monthly_usage = 2;
    let subscriber_id = subscriber.id;
    quota.put(subscriber);

    let records = InMemoryGenerationStore::new();
    let config = OrchestratorConfig {
        deadline: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        Arc::new(DropsFirstTerminalUpdate {
            inner: records.clone(),
            dropped: AtomicBool::new(false),
        }),
        Arc::new(ScriptedBackend::new(vec![failure(
            BackendErrorKind::SafetyRejected,
        )])),
        Arc::new(DescriptorPostProcessor),
        config,
    );

    let result = orchestrator
        .text_to_image(subscriber_id, "a lost write", GenerationParameters::default())
        .await;
    assert_eq!(result.error_code(), Some("BACKEND_REJECTED"));
    let id = result.generation_id.unwrap();

    // The reservation stays with the stuck record instead of being refunded early.
    let stuck = records.get(id).await.unwrap().unwrap();
    assert_eq!(stuck.status, GenerationStatus::Processing);
    assert_eq!(ledger.snapshot(subscriber_id).await.unwrap().used, 3);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        orchestrator.cancel(subscriber_id, id).await.unwrap(),
        CancelOutcome::Canceled
    );
    assert_eq!(
        records.get(id).await.unwrap().unwrap().status,
        GenerationStatus::Canceled
    );
    assert_eq!(ledger.snapshot(subscriber_id).await.unwrap().used, 2);
}

#[tokio::test]
async fn surplus_backend_images_are_capped_at_the_requested_batch() {
    let backend = ScriptedBackend::new(vec![Ok(images(3))]);
    let h = harness(backend, OrchestratorConfig::default());
    let subscriber = seed(&h, Tier::Plus, 0);

    let result = h
        .orchestrator
        .text_to_image(subscriber, "one lantern", GenerationParameters::default())
        .await;

    let data = result.data.unwrap();
    assert_eq!(data.images.len(), 1);
    assert_eq!(data.usage.credits_charged, 1);
    assert_eq!(stored(&h, result.generation_id.unwrap()).output_images.len(), 1);
}

#[tokio::test]
async fn records_are_scoped_to_their_subscriber() {
    let h = harness(ScriptedBackend::default(), OrchestratorConfig::default());
    let owner = seed(&h, Tier::Plus, 0);
    let other = seed(&h, Tier::Plus, 0);

    let result = h
        .orchestrator
        .text_to_image(owner, "mine", GenerationParameters::default())
        .await;
    let id = result.generation_id.unwrap();

    assert!(h.orchestrator.get_generation(owner, id).await.is_ok());
    let err = h.orchestrator.get_generation(other, id).await.unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let listed = h
        .orchestrator
        .list_generations(owner, 500, 0)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(h
        .orchestrator
        .list_generations(other, 10, 0)
        .await
        .unwrap()
        .is_empty());
}
