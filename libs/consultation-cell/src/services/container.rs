use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::ConsultationError;
use crate::models::{LifecycleConfig, RelayConfig, SchedulerConfig};
use crate::services::audit::{AuditSink, BufferedAuditSink, SupabaseAuditSink};
use crate::services::clock::{Clock, SystemClock};
use crate::services::counter::{CounterService, InMemoryCounterService, RedisCounterService};
use crate::services::dispatch::{DispatchQueue, DispatchRelay, InMemoryDispatchQueue, RedisDispatchQueue};
use crate::services::lifecycle::{LifecycleComponents, LifecycleEngine};
use crate::services::notification::{
    LoggingNotificationDispatcher, NotificationDispatcher, WebhookNotificationDispatcher,
};
use crate::services::payment::{
    GatewayPaymentProvider, MockPaymentProvider, PaymentProvider, UnconfiguredPaymentProvider,
};
use crate::services::records::ClinicalRecordService;
use crate::services::redis_pool;
use crate::services::scheduler::{InMemoryTaskScheduler, RedisTaskScheduler, SchedulerWorker, TaskScheduler};
use crate::services::store::{InMemoryTransitionStore, TransitionStore};
use crate::services::supabase_store::SupabaseTransitionStore;

/// Everything the HTTP layer and the background workers share. Built once at
/// startup and passed around as `Arc<ConsultationServices>`.
pub struct ConsultationServices {
    pub config: Arc<AppConfig>,
    pub engine: Arc<LifecycleEngine>,
    pub records: Arc<ClinicalRecordService>,
    pub relay: Arc<DispatchRelay>,
    pub scheduler_worker: Arc<SchedulerWorker>,
}

impl ConsultationServices {
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self, ConsultationError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn TransitionStore>;
        let audit: Arc<dyn AuditSink>;
        if config.is_configured() {
            let supabase = Arc::new(SupabaseClient::new(&config));
            store = Arc::new(SupabaseTransitionStore::new(supabase.clone()));
            audit = Arc::new(SupabaseAuditSink::new(supabase));
        } else {
            warn!("Supabase not configured, consultations are kept in memory");
            store = Arc::new(InMemoryTransitionStore::new());
            audit = Arc::new(BufferedAuditSink::default());
        }

        let counters: Arc<dyn CounterService>;
        let scheduler: Arc<dyn TaskScheduler>;
        let dispatch: Arc<dyn DispatchQueue>;
        match config.redis_url.as_deref() {
            Some(url) if config.uses_redis() => {
                let pool = redis_pool::connect(url).await?;
                counters = Arc::new(RedisCounterService::new(pool.clone()));
                scheduler = Arc::new(RedisTaskScheduler::new(pool.clone()));
                dispatch = Arc::new(RedisDispatchQueue::new(pool));
            }
            _ => {
                warn!("REDIS_URL not set, rate limits and timers are local to this process");
                counters = Arc::new(InMemoryCounterService::new(clock.clone()));
                scheduler = Arc::new(InMemoryTaskScheduler::new());
                dispatch = Arc::new(InMemoryDispatchQueue::new());
            }
        }

        let components = LifecycleComponents {
            store,
            counters,
            scheduler,
            dispatch,
            audit,
            payments: payment_provider(&config),
            clock,
        };

        Ok(Self::assemble(config.clone(), components, notification_dispatcher(&config)))
    }

    /// Fully in-process services for tests and local development.
    pub fn in_memory(config: Arc<AppConfig>, clock: Arc<dyn Clock>) -> Self {
        let components = LifecycleComponents {
            store: Arc::new(InMemoryTransitionStore::new()),
            counters: Arc::new(InMemoryCounterService::new(clock.clone())),
            scheduler: Arc::new(InMemoryTaskScheduler::new()),
            dispatch: Arc::new(InMemoryDispatchQueue::new()),
            audit: Arc::new(BufferedAuditSink::default()),
            payments: Arc::new(MockPaymentProvider::new(config.enable_mock_payment)),
            clock,
        };
        Self::assemble(config, components, Arc::new(LoggingNotificationDispatcher))
    }

    pub fn assemble(
        config: Arc<AppConfig>,
        components: LifecycleComponents,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let engine = Arc::new(LifecycleEngine::new(
            components.clone(),
            LifecycleConfig::from(config.as_ref()),
        ));
        let records = Arc::new(ClinicalRecordService::new(
            components.store.clone(),
            components.audit.clone(),
            components.clock.clone(),
        ));
        let relay = Arc::new(DispatchRelay::new(
            components.dispatch.clone(),
            notifier,
            components.scheduler.clone(),
            components.clock.clone(),
            RelayConfig::from(config.as_ref()),
        ));
        let scheduler_worker = Arc::new(SchedulerWorker::new(
            components.scheduler,
            engine.clone(),
            components.clock,
            SchedulerConfig::from(config.as_ref()),
        ));

        Self {
            config,
            engine,
            records,
            relay,
            scheduler_worker,
        }
    }
}

fn payment_provider(config: &AppConfig) -> Arc<dyn PaymentProvider> {
    if config.enable_mock_payment {
        warn!("Mock payments enabled");
        return Arc::new(MockPaymentProvider::new(true));
    }
    match (&config.payment_gateway_url, &config.payment_gateway_api_key) {
        (Some(url), Some(key)) => Arc::new(GatewayPaymentProvider::new(url, key)),
        _ => Arc::new(UnconfiguredPaymentProvider),
    }
}

fn notification_dispatcher(config: &AppConfig) -> Arc<dyn NotificationDispatcher> {
    match &config.notification_webhook_url {
        Some(url) => Arc::new(WebhookNotificationDispatcher::new(url)),
        None => Arc::new(LoggingNotificationDispatcher),
    }
}

/// Scheduler and dispatch loops running on the tokio runtime.
pub struct BackgroundWorkers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    pub fn spawn(services: &ConsultationServices) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let mut handles = Vec::new();

        let scheduler = services.scheduler_worker.clone();
        let scheduler_shutdown = receiver.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        }));

        for i in 0..services.relay.worker_count() {
            let relay = services.relay.clone();
            let relay_shutdown = receiver.clone();
            handles.push(tokio::spawn(async move {
                relay.run(format!("dispatch-{}", i), relay_shutdown).await;
            }));
        }

        info!("Started {} background workers", handles.len());
        Self { shutdown, handles }
    }

    pub async fn shutdown(self) {
        info!("Stopping background workers");
        if self.shutdown.send(true).is_err() {
            warn!("Background workers already stopped");
        }

        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Background worker ended abnormally: {}", e);
            }
        }
        info!("Background workers stopped");
    }
}
