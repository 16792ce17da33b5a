use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::billing::ledger::{LedgerError, QuotaLedger};
use crate::billing::models::{QuotaReservation, Tier};
use crate::config;

use super::backend::{BackendRequest, BackendResponse, GenerationBackend};
use super::cost::{self, CostBreakdown};
use super::error::GenerationError;
use super::models::{
    GenerationData, GenerationInput, GenerationParameters, GenerationRecord, GenerationRequest,
    GenerationResult, GenerationStatus, GenerationUsage, InputImage, OutputImage,
};
use super::postprocess::PostProcessor;
use super::retry::{execute_with_retry, RetryPolicy};
use super::store::GenerationStore;
use super::validation::validate_request;

pub const MAX_LIST_LIMIT: i64 = 100;

/// What happens to reserved credits when a generation does not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationPolicy {
    ReleaseOnFailure,
    ChargeAlways,
}

impl CompensationPolicy {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "charge" | "charge_always" | "charge-always" => CompensationPolicy::ChargeAlways,
            _ => CompensationPolicy::ReleaseOnFailure,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub deadline: Duration,
    pub compensation: CompensationPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deadline: Duration::from_secs(120),
            compensation: CompensationPolicy::ReleaseOnFailure,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: *config::GENERATION_MAX_ATTEMPTS,
                base_delay: Duration::from_millis(*config::GENERATION_RETRY_BASE_DELAY_MS),
                max_delay: Duration::from_millis(*config::GENERATION_RETRY_MAX_DELAY_MS),
                ..RetryPolicy::default()
            },
            deadline: Duration::from_secs(*config::GENERATION_DEADLINE_SECS),
            compensation: CompensationPolicy::parse(&config::GENERATION_QUOTA_COMPENSATION),
        }
    }
}

/// Price of a request as the subscriber would be charged right now.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct CostPreview {
    pub credits: i64,
    pub breakdown: CostBreakdown,
    pub tier: Tier,
    pub quota_remaining: i64,
    pub quota_reset_date: DateTime<Utc>,
    pub affordable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// A live worker in this process was signalled and will mark the record canceled.
    Signalled,
    /// No worker owned the record; it was canceled directly.
    Canceled,
    /// The record had already reached this terminal status.
    AlreadyFinished(GenerationStatus),
    /// The record is still within its deadline on a worker outside this process.
    RunningElsewhere,
}

struct InFlight {
    subscriber_id: Uuid,
    token: CancellationToken,
    explicit: AtomicBool,
}

struct InFlightGuard {
    registry: Arc<DashMap<Uuid, Arc<InFlight>>>,
    generation_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.generation_id);
    }
}

struct Executed {
    images: Vec<OutputImage>,
    response: BackendResponse,
    attempts: u32,
}

/// key: generation-orchestrator -> validate, price, reserve, generate, settle
#[derive(Clone)]
pub struct Orchestrator {
    ledger: QuotaLedger,
    records: Arc<dyn GenerationStore>,
    backend: Arc<dyn GenerationBackend>,
    post_processor: Arc<dyn PostProcessor>,
    config: OrchestratorConfig,
    in_flight: Arc<DashMap<Uuid, Arc<InFlight>>>,
}

impl Orchestrator {
    pub fn new(
        ledger: QuotaLedger,
        records: Arc<dyn GenerationStore>,
        backend: Arc<dyn GenerationBackend>,
        post_processor: Arc<dyn PostProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            records,
            backend,
            post_processor,
            config,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub async fn text_to_image(
        &self,
        subscriber_id: Uuid,
        prompt: impl Into<String>,
        parameters: GenerationParameters,
    ) -> GenerationResult {
        let request = GenerationRequest::new(prompt, GenerationInput::TextToImage)
            .with_parameters(parameters);
        self.generate(subscriber_id, request).await
    }

    pub async fn image_to_image(
        &self,
        subscriber_id: Uuid,
        prompt: impl Into<String>,
        source: InputImage,
        strength: f32,
        parameters: GenerationParameters,
    ) -> GenerationResult {
        let request =
            GenerationRequest::new(prompt, GenerationInput::ImageToImage { source, strength })
                .with_parameters(parameters);
        self.generate(subscriber_id, request).await
    }

    pub async fn multi_image(
        &self,
        subscriber_id: Uuid,
        prompt: impl Into<String>,
        sources: Vec<InputImage>,
        parameters: GenerationParameters,
    ) -> GenerationResult {
        let request = GenerationRequest::new(prompt, GenerationInput::MultiImage { sources })
            .with_parameters(parameters);
        self.generate(subscriber_id, request).await
    }

    pub async fn refine(
        &self,
        subscriber_id: Uuid,
        prompt: impl Into<String>,
        source: InputImage,
        instructions: Option<String>,
        parameters: GenerationParameters,
    ) -> GenerationResult {
        let request =
            GenerationRequest::new(prompt, GenerationInput::Refine { source, instructions })
                .with_parameters(parameters);
        self.generate(subscriber_id, request).await
    }

    pub async fn generate(
        &self,
        subscriber_id: Uuid,
        request: GenerationRequest,
    ) -> GenerationResult {
        self.generate_with_cancel(subscriber_id, request, CancellationToken::new())
            .await
    }

    /// Runs one request end to end. Never returns an error: every failure is folded into
    /// the result, and any record created along the way is left in a terminal state.
    /// Cancelling `token` aborts the run and fails the record.
    pub async fn generate_with_cancel(
        &self,
        subscriber_id: Uuid,
        request: GenerationRequest,
        token: CancellationToken,
    ) -> GenerationResult {
        let generation_type = request.generation_type();
        let tier = match self.admit(subscriber_id, &request).await {
            Ok(tier) => tier,
            Err(err) => {
                info!(
                    %subscriber_id,
                    generation_type = generation_type.as_str(),
                    code = err.code(),
                    error = %err,
                    "generation request refused"
                );
                return GenerationResult::failed(err.to_body(), None);
            }
        };

        let parameters = &request.parameters;
        let credits = cost::cost(
            generation_type,
            parameters.quality,
            parameters.batch_size,
            parameters.aspect_ratio,
            parameters.style,
        );

        let mut record = GenerationRecord::pending(subscriber_id, &request, credits);
        if let Err(err) = self.records.create(&record).await {
            error!(%subscriber_id, error = %err, "failed to create generation record");
            let err = GenerationError::from(err);
            return GenerationResult::failed(err.to_body(), None);
        }
        let generation_id = record.id;

        let entry = Arc::new(InFlight {
            subscriber_id,
            token: token.child_token(),
            explicit: AtomicBool::new(false),
        });
        self.in_flight.insert(generation_id, entry.clone());
        let _guard = InFlightGuard {
            registry: self.in_flight.clone(),
            generation_id,
        };

        info!(
            generation = %generation_id,
            %subscriber_id,
            %tier,
            generation_type = generation_type.as_str(),
            credits,
            "generation accepted"
        );

        match self.run(&mut record, &request, tier, &entry).await {
            Ok(data) => GenerationResult::succeeded(data),
            Err(err) => {
                warn!(
                    generation = %generation_id,
                    %subscriber_id,
                    code = err.code(),
                    error = %err,
                    "generation failed"
                );
                GenerationResult::failed(err.to_body(), Some(generation_id))
            }
        }
    }

    async fn admit(
        &self,
        subscriber_id: Uuid,
        request: &GenerationRequest,
    ) -> Result<Tier, GenerationError> {
        let subscriber = self
            .ledger
            .subscriber(subscriber_id)
            .await?
            .filter(|subscriber| subscriber.is_usable())
            .ok_or(GenerationError::SubscriberUnavailable(subscriber_id))?;
        validate_request(request, subscriber.tier)?;
        Ok(subscriber.tier)
    }

    async fn run(
        &self,
        record: &mut GenerationRecord,
        request: &GenerationRequest,
        tier: Tier,
        entry: &InFlight,
    ) -> Result<GenerationData, GenerationError> {
        if entry.token.is_cancelled() {
            self.settle_failure(record, &GenerationError::Canceled, entry, None)
                .await;
            return Err(GenerationError::Canceled);
        }

        let reservation = match self
            .ledger
            .check_and_reserve(record.subscriber_id, record.cost)
            .await
        {
            Ok(reservation) => reservation,
            Err(LedgerError::QuotaExceeded {
                remaining,
                reset_date,
            }) => {
                let err = GenerationError::QuotaExceeded {
                    tier,
                    remaining,
                    reset_date,
                };
                self.settle_failure(record, &err, entry, None).await;
                return Err(err);
            }
            Err(err) => {
                let err = GenerationError::from(err);
                self.settle_failure(record, &err, entry, None).await;
                return Err(err);
            }
        };

        let mut processing = record.clone();
        let persisted = match processing.begin_processing(reservation.reset_date) {
            Ok(patch) => self
                .records
                .update(record.id, &patch)
                .await
                .map_err(GenerationError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = persisted {
            self.settle_failure(record, &err, entry, Some(&reservation))
                .await;
            return Err(err);
        }
        *record = processing;

        let started = Instant::now();
        let executed = match self.execute(record, request, tier, &entry.token).await {
            Ok(executed) => executed,
            Err(err) => {
                self.settle_failure(record, &err, entry, Some(&reservation))
                    .await;
                return Err(err);
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let mut completed = record.clone();
        let persisted = match completed.complete(
            executed.images.clone(),
            elapsed_ms,
            executed.response.metadata.clone(),
        ) {
            Ok(patch) => self
                .records
                .update(record.id, &patch)
                .await
                .map_err(GenerationError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = persisted {
            self.settle_failure(record, &err, entry, Some(&reservation))
                .await;
            return Err(err);
        }
        *record = completed;

        if let Err(err) = self
            .ledger
            .record_generated(record.subscriber_id, executed.images.len() as i64)
            .await
        {
            warn!(generation = %record.id, error = %err, "failed to bump lifetime generation count");
        }

        info!(
            generation = %record.id,
            subscriber_id = %record.subscriber_id,
            images = executed.images.len(),
            attempts = executed.attempts,
            processing_time_ms = elapsed_ms,
            credits = reservation.credits,
            "generation completed"
        );

        let usage = GenerationUsage {
            credits_charged: reservation.credits,
            quota_used: reservation.usage_after,
            quota_limit: reservation.limit,
            quota_remaining: reservation.remaining(),
            quota_reset_date: reservation.reset_date,
            backend: Some(executed.response.usage).filter(|usage| !usage.is_null()),
        };

        Ok(GenerationData {
            images: executed.images,
            metadata: executed.response.metadata,
            usage,
            generation_record: record.clone(),
        })
    }

    async fn execute(
        &self,
        record: &GenerationRecord,
        request: &GenerationRequest,
        tier: Tier,
        token: &CancellationToken,
    ) -> Result<Executed, GenerationError> {
        let deadline = Instant::now() + self.config.deadline;
        let backend_request = BackendRequest::from_request(request);
        let generation_id = record.id;

        let call = execute_with_retry(&self.config.retry, deadline, |attempt| {
            debug!(
                target: "generation.backend",
                generation = %generation_id,
                attempt,
                "invoking generation backend"
            );
            self.backend.invoke(&backend_request)
        });
        let outcome = tokio::select! {
            _ = token.cancelled() => return Err(GenerationError::Canceled),
            result = call => result?,
        };

        // Credits cover the requested batch only; surplus backend output is dropped.
        let requested = request.parameters.batch_size.max(1) as usize;
        let mut raw_images = outcome.value.images.clone();
        if raw_images.len() > requested {
            warn!(
                generation = %generation_id,
                returned = raw_images.len(),
                requested,
                "backend returned more images than requested; truncating"
            );
            raw_images.truncate(requested);
        }
        let images = tokio::select! {
            _ = token.cancelled() => return Err(GenerationError::Canceled),
            result = timeout_at(deadline, self.post_processor.process(raw_images, tier)) => {
                match result {
                    Ok(processed) => processed?,
                    Err(_) => return Err(GenerationError::DeadlineExceeded),
                }
            }
        };

        Ok(Executed {
            images,
            response: outcome.value,
            attempts: outcome.attempts,
        })
    }

    /// Moves the record to its terminal failure state and, when credits were reserved,
    /// applies the compensation policy. Errors here are logged, never surfaced.
    ///
    /// A record whose terminal state could not be persisted stays `processing` in the
    /// store; its reservation is then left for the orphan cancel path, which refunds
    /// from the stored `quota_period` once the deadline has passed.
    async fn settle_failure(
        &self,
        record: &mut GenerationRecord,
        err: &GenerationError,
        entry: &InFlight,
        reservation: Option<&QuotaReservation>,
    ) {
        let stored_processing = record.status == GenerationStatus::Processing;
        let explicit = entry.explicit.load(Ordering::SeqCst);
        let transition = if explicit {
            record.cancel()
        } else {
            record.fail(err.to_string())
        };
        let persisted = match transition {
            Ok(patch) => match self.records.update(record.id, &patch).await {
                Ok(()) => true,
                Err(store_err) => {
                    error!(
                        generation = %record.id,
                        status = %patch.status,
                        error = %store_err,
                        "failed to persist terminal generation state"
                    );
                    false
                }
            },
            Err(transition_err) => {
                error!(generation = %record.id, error = %transition_err, "cannot settle generation");
                false
            }
        };

        let Some(reservation) = reservation else {
            return;
        };
        if persisted || !stored_processing {
            self.compensate(
                record.id,
                reservation.subscriber_id,
                reservation.credits,
                Some(reservation.reset_date),
            )
            .await;
        } else {
            warn!(
                generation = %record.id,
                credits = reservation.credits,
                "generation left processing; reservation deferred to orphan cancel"
            );
        }
    }

    /// `period` is the reset date the credits were reserved against; a refund never
    /// crosses into a later period.
    async fn compensate(
        &self,
        generation_id: Uuid,
        subscriber_id: Uuid,
        credits: i64,
        period: Option<DateTime<Utc>>,
    ) {
        match self.config.compensation {
            CompensationPolicy::ChargeAlways => {
                debug!(
                    generation = %generation_id,
                    credits,
                    "keeping credits for unsuccessful generation"
                );
            }
            CompensationPolicy::ReleaseOnFailure => {
                let Some(period) = period else {
                    warn!(
                        generation = %generation_id,
                        %subscriber_id,
                        credits,
                        "no reservation period recorded; credits not released"
                    );
                    return;
                };
                match self.ledger.release(subscriber_id, credits, period).await {
                    Ok(true) => info!(
                        generation = %generation_id,
                        %subscriber_id,
                        credits,
                        "released credits for unsuccessful generation"
                    ),
                    Ok(false) => info!(
                        generation = %generation_id,
                        %subscriber_id,
                        credits,
                        %period,
                        "reservation period already closed; credits not released"
                    ),
                    Err(err) => error!(
                        generation = %generation_id,
                        %subscriber_id,
                        credits,
                        error = %err,
                        "failed to release credits"
                    ),
                }
            }
        }
    }

    pub async fn preview_cost(
        &self,
        subscriber_id: Uuid,
        request: &GenerationRequest,
    ) -> Result<CostPreview, GenerationError> {
        let tier = self.admit(subscriber_id, request).await?;
        let parameters = &request.parameters;
        let breakdown = cost::breakdown(
            request.generation_type(),
            parameters.quality,
            parameters.batch_size,
            parameters.aspect_ratio,
            parameters.style,
        );
        let snapshot = self.ledger.snapshot(subscriber_id).await?;
        Ok(CostPreview {
            credits: breakdown.credits,
            affordable: breakdown.credits <= snapshot.remaining,
            breakdown,
            tier,
            quota_remaining: snapshot.remaining,
            quota_reset_date: snapshot.reset_date,
        })
    }

    pub async fn cancel(
        &self,
        subscriber_id: Uuid,
        generation_id: Uuid,
    ) -> Result<CancelOutcome, GenerationError> {
        let live = self
            .in_flight
            .get(&generation_id)
            .map(|entry| entry.value().clone());
        if let Some(entry) = live {
            if entry.subscriber_id != subscriber_id {
                return Err(GenerationError::NotFound(generation_id));
            }
            entry.explicit.store(true, Ordering::SeqCst);
            entry.token.cancel();
            info!(generation = %generation_id, %subscriber_id, "generation cancel requested");
            return Ok(CancelOutcome::Signalled);
        }

        let mut record = self.get_generation(subscriber_id, generation_id).await?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(record.status));
        }

        let stale_after = chrono::Duration::from_std(self.config.deadline)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        if Utc::now() < record.updated_at + stale_after {
            return Ok(CancelOutcome::RunningElsewhere);
        }

        let was_processing = record.status == GenerationStatus::Processing;
        let patch = record.cancel()?;
        self.records.update(generation_id, &patch).await?;
        warn!(generation = %generation_id, %subscriber_id, "canceled orphaned generation");
        // Only processing records hold a reservation.
        if was_processing && record.cost > 0 {
            self.compensate(generation_id, subscriber_id, record.cost, record.quota_period)
                .await;
        }
        Ok(CancelOutcome::Canceled)
    }

    pub async fn get_generation(
        &self,
        subscriber_id: Uuid,
        generation_id: Uuid,
    ) -> Result<GenerationRecord, GenerationError> {
        self.records
            .get(generation_id)
            .await?
            .filter(|record| record.subscriber_id == subscriber_id)
            .ok_or(GenerationError::NotFound(generation_id))
    }

    pub async fn list_generations(
        &self,
        subscriber_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<GenerationRecord>, GenerationError> {
        Ok(self
            .records
            .list_for_subscriber(
                subscriber_id,
                limit.clamp(1, MAX_LIST_LIMIT),
                offset.max(0),
            )
            .await?)
    }
}
