//! Reference crossing scenarios
//!
//! Each scenario builds a fresh kernel over the reference gates, drives one
//! crossing, and checks where it ends up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure};
use boundary_gates::{
    ApprovalGate, BehavioralEvalGate, BoundsGate, DurabilityGate, FieldSchema, FieldType,
    IdempotencyGate, InMemoryQuota, OperationApprovalPolicy, PermissionGate, ReferenceGates,
    RuleBasedEvaluator, RuleCondition, SchemaGate, SchemaRegistry, SpanTraceInjector,
    StaticPermissions, TraceGate, COST_ATTRIBUTE,
};
use boundary_kernel::mocks::FlakyLedger;
use boundary_kernel::{
    ApprovalInbox, AuditLedger, BoundaryKernel, BroadcastEventSink, CrossingRequest,
    CrossingState, FanoutEventSink, IdempotencyIndex, InFlightKeys, KernelConfig, KernelContext, KernelError,
    KernelEvent, KernelServices, TracingEventSink,
};
use boundary_types::{GateId, GateSet};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::output::{print_failure, print_header, print_info, print_success};

const OPERATION: &str = "payments.transfer";
const ACTOR: &str = "agent-1";

struct Bench {
    services: KernelServices,
    ledger: Arc<FlakyLedger>,
    events: Arc<BroadcastEventSink>,
}

/// Reference gates over an in-memory ledger that fails its first
/// `ledger_failures` appends.
fn bench(config: &KernelConfig, ledger_failures: usize) -> anyhow::Result<Bench> {
    let ledger = Arc::new(FlakyLedger::failing(ledger_failures));
    let inbox = Arc::new(ApprovalInbox::new());
    let index: Arc<dyn IdempotencyIndex> = ledger.clone();
    let audit: Arc<dyn AuditLedger> = ledger.clone();
    let keys = Arc::new(InFlightKeys::new());

    let gates = ReferenceGates {
        schema: Arc::new(SchemaGate::new(Arc::new(SchemaRegistry::new().register(
            OPERATION,
            FieldSchema::new()
                .required("to", FieldType::String)
                .required("amount", FieldType::Number),
        )))),
        permission: Arc::new(PermissionGate::new(Arc::new(
            StaticPermissions::new().grant(ACTOR, "payments.*"),
        ))),
        bounds: Arc::new(BoundsGate::new(Arc::new(
            InMemoryQuota::new(Duration::from_secs(60)).limit(OPERATION, 100),
        ))),
        trace: Arc::new(TraceGate::new(Arc::new(SpanTraceInjector::new()))),
        idempotency: Arc::new(IdempotencyGate::new(index, keys.clone())),
        durability: Arc::new(DurabilityGate::new(audit.clone())),
        approval: Arc::new(ApprovalGate::new(
            Arc::new(OperationApprovalPolicy::new().above("amount", 1_000_000.0)),
            inbox.clone(),
        )),
        behavioral: Arc::new(BehavioralEvalGate::new(
            Arc::new(RuleBasedEvaluator::new().rule(
                "sandbox-actor",
                1.0,
                RuleCondition::ActorPrefix {
                    prefix: "sandbox-".into(),
                },
            )),
            0.8,
        )),
    };

    let pipeline = gates
        .into_builder()
        .config(config)
        .approvals(inbox)
        .build()?;
    let events = Arc::new(BroadcastEventSink::new(config.event_buffer));
    let services = KernelServices::new(pipeline, audit, config)
        .with_events(Arc::new(
            FanoutEventSink::new()
                .with(Arc::new(TracingEventSink))
                .with(events.clone()),
        ))
        .with_in_flight_keys(keys);
    Ok(Bench {
        services,
        ledger,
        events,
    })
}

fn transfer(payload: serde_json::Value) -> CrossingRequest {
    CrossingRequest::new(OPERATION, ACTOR, payload)
}

/// A: a well-formed request commits exactly one audit record.
async fn happy_path(config: &KernelConfig) -> anyhow::Result<String> {
    let bench = bench(config, 0)?;
    let mut rx = bench.events.subscribe();
    let kernel = BoundaryKernel::new(bench.services);
    let (_, receipt) = kernel
        .execute(
            transfer(json!({"to": "acct-2", "amount": 250})),
            CancellationToken::new(),
            |_| async { Ok::<_, String>(()) },
        )
        .await?;

    ensure!(receipt.wal_written, "receipt without a WAL entry");
    ensure!(bench.ledger.inner().len().await == 1, "expected one audit record");

    let mut transitions = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, KernelEvent::Transition { .. }) {
            transitions += 1;
        }
    }
    ensure!(transitions == 4, "expected 4 transitions, saw {transitions}");
    Ok(format!(
        "committed {} after {transitions} transitions",
        receipt.correlation_id
    ))
}

/// B: an invalid schema fails K1 before any other gate runs.
async fn schema_fail_fast(config: &KernelConfig) -> anyhow::Result<String> {
    let bench = bench(config, 0)?;
    let mut ctx = KernelContext::new(bench.services);
    let admission = ctx
        .enter(transfer(json!({"amount": 250})), &CancellationToken::new())
        .await?;

    let snap = ctx.snapshot();
    ensure!(
        matches!(admission.error(), Some(KernelError::SchemaViolation { .. })),
        "expected SchemaViolation, got {:?}",
        admission.error()
    );
    ensure!(snap.gates_failed == [GateId::K1].into_iter().collect::<GateSet>());
    ensure!(snap.gates_passed.is_empty());
    ensure!(bench.ledger.inner().is_empty().await, "failed crossing was audited");
    ctx.acknowledge_fault(admission.handle())?;
    Ok(format!("refused at K1, failed={}", snap.gates_failed))
}

/// C: schema and permission pass, bounds fail.
async fn bounds_failure(config: &KernelConfig) -> anyhow::Result<String> {
    let bench = bench(config, 0)?;
    let mut ctx = KernelContext::new(bench.services);
    let request = transfer(json!({"to": "acct-2", "amount": 250})).with_attribute(COST_ATTRIBUTE, "1000");
    let admission = ctx.enter(request, &CancellationToken::new()).await?;

    let snap = ctx.snapshot();
    ensure!(
        matches!(admission.error(), Some(KernelError::BoundsExceeded { .. })),
        "expected BoundsExceeded, got {:?}",
        admission.error()
    );
    ensure!(snap.gates_passed == [GateId::K1, GateId::K2].into_iter().collect::<GateSet>());
    ensure!(snap.gates_failed == [GateId::K3].into_iter().collect::<GateSet>());
    ensure!(snap.state == CrossingState::Faulted);
    Ok(format!(
        "passed={} failed={}",
        snap.gates_passed, snap.gates_failed
    ))
}

/// D: the ledger append fails after the operation ran; an idempotent retry
/// commits once.
async fn durability_failure(config: &KernelConfig) -> anyhow::Result<String> {
    let bench = bench(config, 1)?;
    let kernel = BoundaryKernel::new(bench.services);
    let payload = json!({"to": "acct-2", "amount": 75});

    let failure = match kernel
        .execute(transfer(payload.clone()), CancellationToken::new(), |_| async {
            Ok::<_, String>(())
        })
        .await
    {
        Ok(_) => bail!("append was expected to fail"),
        Err(failure) => failure,
    };
    ensure!(matches!(failure.error, KernelError::DurabilityFailure { .. }));
    let Some(handle) = failure.handle else {
        bail!("faulted crossing returned without a handle");
    };
    ensure!(kernel.state(&handle) == Some(CrossingState::Faulted));
    ensure!(bench.ledger.inner().is_empty().await);
    kernel.acknowledge_fault(&handle).await?;

    let (_, receipt) = kernel
        .execute(transfer(payload), CancellationToken::new(), |_| async {
            Ok::<_, String>(())
        })
        .await?;
    ensure!(receipt.idempotency_key == handle.idempotency_key);
    ensure!(bench.ledger.inner().len().await == 1);
    Ok(format!("faulted, then retried as {}", receipt.correlation_id))
}

/// E: a second entry on a busy context is refused and changes nothing.
async fn reentrancy(config: &KernelConfig) -> anyhow::Result<String> {
    let bench = bench(config, 0)?;
    let mut ctx = KernelContext::new(bench.services);
    let cancel = CancellationToken::new();
    let admission = ctx
        .enter(transfer(json!({"to": "acct-2", "amount": 5})), &cancel)
        .await?;
    ensure!(admission.is_admitted());

    let before = ctx.snapshot();
    match ctx
        .enter(transfer(json!({"to": "acct-3", "amount": 6})), &cancel)
        .await
    {
        Err(KernelError::ReentrancyViolation { .. }) => {}
        other => bail!("expected ReentrancyViolation, got {other:?}"),
    }
    ensure!(ctx.snapshot() == before, "existing crossing was modified");
    Ok(format!("refused while {}", before.state))
}

pub async fn execute(config: &KernelConfig, only: Option<char>) -> anyhow::Result<()> {
    print_header("Boundary crossing scenarios");

    let mut failed = 0;
    for label in ['A', 'B', 'C', 'D', 'E'] {
        if only.is_some_and(|o| o.to_ascii_uppercase() != label) {
            continue;
        }
        tracing::debug!(scenario = %label, "running scenario");
        let (title, result) = match label {
            'A' => ("happy path", happy_path(config).await),
            'B' => ("schema fail-fast", schema_fail_fast(config).await),
            'C' => ("bounds failure", bounds_failure(config).await),
            'D' => ("durability failure", durability_failure(config).await),
            _ => ("reentrancy", reentrancy(config).await),
        };
        match result {
            Ok(summary) => print_success(&format!("{label} {title}: {summary}")),
            Err(e) => {
                failed += 1;
                print_failure(&format!("{label} {title}: {e:#}"));
            }
        }
    }

    if failed > 0 {
        bail!("{failed} scenario(s) failed");
    }
    print_info("all scenarios behaved as expected");
    Ok(())
}
