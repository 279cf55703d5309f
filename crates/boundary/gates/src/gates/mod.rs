//! The eight reference gates, K1 through K8.

pub mod approval;
pub mod behavioral;
pub mod bounds;
pub mod durability;
pub mod idempotency;
pub mod permission;
pub mod schema;
pub mod trace;

pub use approval::{ApprovalGate, OperationApprovalPolicy};
pub use behavioral::{BehaviorRule, BehavioralEvalGate, RuleBasedEvaluator, RuleCondition};
pub use bounds::{BoundsGate, InMemoryQuota, COST_ATTRIBUTE};
pub use durability::DurabilityGate;
pub use idempotency::IdempotencyGate;
pub use permission::{PermissionGate, StaticPermissions};
pub use schema::{FieldSchema, FieldType, SchemaGate, SchemaRegistry};
pub use trace::{parse_traceparent, SpanTraceInjector, TraceGate, TRACEPARENT_ATTRIBUTE};
