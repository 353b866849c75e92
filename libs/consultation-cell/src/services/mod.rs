pub mod audit;
pub mod clock;
pub mod container;
pub mod counter;
pub mod dispatch;
pub mod lifecycle;
pub mod notification;
pub mod payment;
pub mod rate_limit;
pub mod records;
pub mod redis_pool;
pub mod scheduler;
pub mod store;
pub mod supabase_store;

pub use audit::{AuditSink, BufferedAuditSink, SupabaseAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use container::{BackgroundWorkers, ConsultationServices};
pub use counter::{CounterService, InMemoryCounterService, RedisCounterService};
pub use dispatch::{DispatchQueue, DispatchRelay, InMemoryDispatchQueue, RedisDispatchQueue};
pub use lifecycle::{LifecycleComponents, LifecycleEngine};
pub use notification::{
    LoggingNotificationDispatcher, NotificationDispatcher, RecordingNotificationDispatcher,
    WebhookNotificationDispatcher,
};
pub use payment::{GatewayPaymentProvider, MockPaymentProvider, PaymentProvider, UnconfiguredPaymentProvider};
pub use rate_limit::{RateLimitReservation, RateLimiter};
pub use records::ClinicalRecordService;
pub use scheduler::{InMemoryTaskScheduler, RedisTaskScheduler, SchedulerWorker, TaskHandler, TaskScheduler};
pub use store::{InMemoryTransitionStore, TransitionStore};
pub use supabase_store::SupabaseTransitionStore;
