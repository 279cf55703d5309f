//! The eight reference gates assembled behind a `BoundaryKernel`.

use std::sync::Arc;
use std::time::Duration;

use boundary_gates::{
    ApprovalGate, BehavioralEvalGate, BoundsGate, DurabilityGate, FieldSchema, FieldType,
    IdempotencyGate, InMemoryQuota, OperationApprovalPolicy, PermissionGate, ReferenceGates,
    RuleBasedEvaluator, RuleCondition, SchemaGate, SchemaRegistry, SpanTraceInjector,
    StaticPermissions, TraceGate,
};
use boundary_kernel::mocks::{FlakyLedger, RecordingEventSink};
use boundary_kernel::{
    Admission, ApprovalInbox, AuditLedger, BoundaryKernel, CrossingRequest, CrossingState,
    GateId, IdempotencyIndex, InFlightKeys, KernelConfig, KernelError, KernelServices, Trigger,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct Fixture {
    kernel: Arc<BoundaryKernel>,
    ledger: Arc<FlakyLedger>,
    inbox: Arc<ApprovalInbox>,
    traces: Arc<SpanTraceInjector>,
    sink: Arc<RecordingEventSink>,
}

fn fixture(ledger_failures: usize) -> Fixture {
    let ledger = Arc::new(FlakyLedger::failing(ledger_failures));
    let inbox = Arc::new(ApprovalInbox::new());
    let traces = Arc::new(SpanTraceInjector::new());

    let schemas = SchemaRegistry::new()
        .register(
            "payments.transfer",
            FieldSchema::new()
                .required("to", FieldType::String)
                .required("amount", FieldType::Number),
        )
        .register("accounts.close", FieldSchema::new().required("account", FieldType::String));
    let permissions = StaticPermissions::new()
        .grant("agent-1", "payments.*")
        .grant("agent-1", "accounts.close")
        .grant("agent-2", "payments.transfer");
    let quota = InMemoryQuota::new(Duration::from_secs(60)).limit("payments.transfer", 3);
    let evaluator = RuleBasedEvaluator::new().rule(
        "huge-transfer",
        1.0,
        RuleCondition::FieldAbove {
            field: "amount".into(),
            limit: 1_000_000.0,
        },
    );

    let index: Arc<dyn IdempotencyIndex> = ledger.clone();
    let audit: Arc<dyn AuditLedger> = ledger.clone();
    let keys = Arc::new(InFlightKeys::new());
    let gates = ReferenceGates {
        schema: Arc::new(SchemaGate::new(Arc::new(schemas))),
        permission: Arc::new(PermissionGate::new(Arc::new(permissions))),
        bounds: Arc::new(BoundsGate::new(Arc::new(quota)).max_payload_bytes(4096)),
        trace: Arc::new(TraceGate::new(traces.clone())),
        idempotency: Arc::new(IdempotencyGate::new(index, keys.clone())),
        durability: Arc::new(DurabilityGate::new(audit.clone())),
        approval: Arc::new(ApprovalGate::new(
            Arc::new(OperationApprovalPolicy::new().always("accounts.close")),
            inbox.clone(),
        )),
        behavioral: Arc::new(BehavioralEvalGate::new(Arc::new(evaluator), 0.8)),
    };

    let config = KernelConfig::default();
    let pipeline = gates
        .into_builder()
        .config(&config)
        .approvals(inbox.clone())
        .build()
        .unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let services = KernelServices::new(pipeline, audit, &config)
        .with_events(sink.clone())
        .with_in_flight_keys(keys);

    Fixture {
        kernel: Arc::new(BoundaryKernel::new(services)),
        ledger,
        inbox,
        traces,
        sink,
    }
}

fn transfer(amount: u64) -> CrossingRequest {
    CrossingRequest::new(
        "payments.transfer",
        "agent-1",
        json!({"to": "acct-9", "amount": amount}),
    )
}

#[tokio::test]
async fn committed_transfer_is_traced_and_audited() {
    let fx = fixture(0);
    let (receipt_value, receipt) = fx
        .kernel
        .execute(transfer(100), CancellationToken::new(), |handle| async move {
            Ok::<_, String>(handle.correlation_id)
        })
        .await
        .unwrap();

    assert_eq!(receipt.correlation_id, receipt_value);
    assert!(fx.traces.context_for(&receipt.correlation_id).is_some());
    let record = fx.ledger.inner().get(&receipt.correlation_id).await.unwrap();
    assert_eq!(record.summary.operation, "payments.transfer");
    assert_eq!(fx.sink.triggers().last(), Some(&Trigger::ExitSuccess));
}

#[tokio::test]
async fn duplicate_of_committed_crossing_is_refused_by_k5() {
    let fx = fixture(0);
    let ok = |_| async { Ok::<_, String>(()) };

    fx.kernel
        .execute(transfer(100), CancellationToken::new(), ok)
        .await
        .unwrap();
    let failure = fx
        .kernel
        .execute(transfer(100), CancellationToken::new(), ok)
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        KernelError::IdempotencyConflict { .. }
    ));
    assert_eq!(fx.ledger.inner().len().await, 1);
}

#[tokio::test]
async fn duplicate_of_in_flight_crossing_is_refused_by_k5() {
    let fx = fixture(0);
    let cancel = CancellationToken::new();

    let first = fx.kernel.open(transfer(100), &cancel).await.unwrap();
    assert!(first.is_admitted());
    let second = fx.kernel.open(transfer(100), &cancel).await.unwrap();
    assert!(matches!(
        second.error(),
        Some(KernelError::IdempotencyConflict { detail, .. }) if detail.contains("in flight")
    ));

    fx.kernel.record_complete(first.handle()).await.unwrap();
    fx.kernel.exit(first.handle()).await.unwrap();
    fx.kernel.acknowledge_fault(second.handle()).await.unwrap();

    assert_eq!(fx.ledger.inner().len().await, 1);
    assert!(fx.kernel.services().in_flight_keys.is_empty());
    assert!(fx.kernel.in_flight().is_empty());
}

#[tokio::test]
async fn retry_after_durability_failure_passes_k5() {
    let fx = fixture(1);
    let ok = |_| async { Ok::<_, String>(()) };

    let failure = fx
        .kernel
        .execute(transfer(250), CancellationToken::new(), ok)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, KernelError::DurabilityFailure { .. }));
    let handle = failure.handle.unwrap();
    assert_eq!(fx.kernel.state(&handle), Some(CrossingState::Faulted));
    fx.kernel.acknowledge_fault(&handle).await.unwrap();

    let (_, receipt) = fx
        .kernel
        .execute(transfer(250), CancellationToken::new(), ok)
        .await
        .unwrap();
    assert_eq!(receipt.idempotency_key, handle.idempotency_key);
    assert_eq!(fx.ledger.inner().len().await, 1);
}

#[tokio::test]
async fn schema_and_permission_failures_map_to_their_errors() {
    let fx = fixture(0);
    let cancel = CancellationToken::new();

    let malformed = CrossingRequest::new("payments.transfer", "agent-1", json!({"amount": 5}));
    let admission = fx.kernel.open(malformed, &cancel).await.unwrap();
    assert!(matches!(
        admission.error(),
        Some(KernelError::SchemaViolation { detail, .. }) if detail.contains("`to`")
    ));

    let stranger = CrossingRequest::new(
        "payments.transfer",
        "agent-7",
        json!({"to": "x", "amount": 5}),
    );
    let admission = fx.kernel.open(stranger, &cancel).await.unwrap();
    assert!(matches!(
        admission.error(),
        Some(KernelError::PermissionDenied { .. })
    ));
    assert_eq!(fx.kernel.in_flight().len(), 2);
}

#[tokio::test]
async fn quota_exhaustion_fails_k3() {
    let fx = fixture(0);
    let ok = |_| async { Ok::<_, String>(()) };
    for amount in 1..=3 {
        fx.kernel
            .execute(transfer(amount), CancellationToken::new(), ok)
            .await
            .unwrap();
    }
    let failure = fx
        .kernel
        .execute(transfer(4), CancellationToken::new(), ok)
        .await
        .unwrap_err();
    assert!(matches!(failure.error, KernelError::BoundsExceeded { .. }));
    assert_eq!(failure.error.gate(), Some(GateId::K3));
}

#[tokio::test]
async fn behavioral_gate_blocks_outliers() {
    let fx = fixture(0);
    let failure = fx
        .kernel
        .execute(transfer(5_000_000), CancellationToken::new(), |_| async {
            Ok::<_, String>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(failure.error, KernelError::EvalGateFailure { .. }));
}

#[tokio::test]
async fn close_account_waits_for_human_approval() {
    let fx = fixture(0);
    let request = CrossingRequest::new("accounts.close", "agent-1", json!({"account": "acct-1"}));

    let opener = {
        let kernel = fx.kernel.clone();
        tokio::spawn(async move { kernel.open(request, &CancellationToken::new()).await })
    };

    let pending = loop {
        if let Some(req) = fx.inbox.pending().into_iter().next() {
            break req;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(pending.operation, "accounts.close");
    assert_eq!(
        fx.kernel.in_flight(),
        vec![(pending.correlation_id, CrossingState::Entering)]
    );
    assert!(fx.inbox.approve(&pending.token));

    let admission = opener.await.unwrap().unwrap();
    let handle = match admission {
        Admission::Admitted(handle) => handle,
        other => panic!("expected admission, got {other:?}"),
    };
    fx.kernel.record_complete(&handle).await.unwrap();
    fx.kernel.exit(&handle).await.unwrap();
    assert!(fx.kernel.in_flight().is_empty());
}

#[tokio::test]
async fn denied_approval_is_approval_denied() {
    let fx = fixture(0);
    let request = CrossingRequest::new("accounts.close", "agent-1", json!({"account": "acct-1"}));

    let opener = {
        let kernel = fx.kernel.clone();
        tokio::spawn(async move { kernel.open(request, &CancellationToken::new()).await })
    };
    let token = loop {
        if let Some(req) = fx.inbox.pending().into_iter().next() {
            break req.token;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    fx.inbox.deny(&token, "account has open disputes");

    let admission = opener.await.unwrap().unwrap();
    assert!(matches!(
        admission.error(),
        Some(KernelError::ApprovalDenied { detail }) if detail.contains("disputes")
    ));
}
