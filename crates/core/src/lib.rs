pub mod analytics;
pub mod canonical;
pub mod config;
pub mod confirmation;
pub mod domain;
pub mod errors;

pub use analytics::{AnalyticsEvent, AnalyticsEventType, AnalyticsSink, AnalyticsStatus};
pub use canonical::{canonical_json, hash_json, request_hash, CanonicalError, RequestValue};
pub use confirmation::{ConfirmationError, ConfirmationSigner};
pub use domain::conversation::{
    ConversationSummary, Message, MessageId, MessagePayload, MessageRole, Session, SessionId,
};
pub use domain::envelope::{EnvelopeOutcome, ToolResultEnvelope};
pub use domain::idempotency::{ConflictPolicy, IdempotencyRecord};
pub use domain::trace::{ToolInvocationTrace, TraceId, TraceStatus};
pub use errors::{ApplicationError, DomainError, InterfaceError};
