//! Scenario catalogue for the dispatch simulator.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DSS-001: every item sits in exactly one state at every step
    Partition,

    /// DSS-002: higher priority leaves the queue first
    PriorityOrder,

    /// DSS-003: terminal failure after exactly max_retries + 1 attempts
    RetryBound,

    /// DSS-004: re-adding a live id changes nothing
    IdempotentAdmission,

    /// DSS-005: capacity 10, 1 token/s refill
    BucketRefill,

    /// DSS-006: per-provider cap of 1 while providers overlap
    ProviderCap,

    /// DSS-007: one org's trigger budget never touches another's
    ScopeIsolation,

    // ═══════════════════════════════════════════════════
    // CHAOS SCENARIOS - faults injected mid-run
    // ═══════════════════════════════════════════════════

    /// DSS-008: shared store drops out mid-run and comes back
    StoreOutage,

    /// DSS-009: process dies with items processing, queue is recovered
    CrashRecovery,

    /// DSS-010: flaky and hanging providers
    ProviderChaos,

    /// DSS-011: run cancelled between batches
    Cancellation,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        let mut all = Self::properties();
        all.extend(Self::chaos());
        all
    }

    /// Scenarios checking one queue, bucket or orchestrator property.
    pub fn properties() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Partition,
            ScenarioId::PriorityOrder,
            ScenarioId::RetryBound,
            ScenarioId::IdempotentAdmission,
            ScenarioId::BucketRefill,
            ScenarioId::ProviderCap,
            ScenarioId::ScopeIsolation,
        ]
    }

    /// Returns chaos scenarios only.
    pub fn chaos() -> Vec<ScenarioId> {
        vec![
            ScenarioId::StoreOutage,
            ScenarioId::CrashRecovery,
            ScenarioId::ProviderChaos,
            ScenarioId::Cancellation,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Partition => "partition",
            ScenarioId::PriorityOrder => "priority_order",
            ScenarioId::RetryBound => "retry_bound",
            ScenarioId::IdempotentAdmission => "idempotent_admission",
            ScenarioId::BucketRefill => "bucket_refill",
            ScenarioId::ProviderCap => "provider_cap",
            ScenarioId::ScopeIsolation => "scope_isolation",
            ScenarioId::StoreOutage => "store_outage",
            ScenarioId::CrashRecovery => "crash_recovery",
            ScenarioId::ProviderChaos => "provider_chaos",
            ScenarioId::Cancellation => "cancellation",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Partition => "Random add/get/complete/fail/requeue, partition checked after every step",
            ScenarioId::PriorityOrder => "P1(priority=0) then P2(priority=10); get() must return P2",
            ScenarioId::RetryBound => "Items fail with retry until terminal; attempts must equal max_retries + 1",
            ScenarioId::IdempotentAdmission => "Re-add pending and processing ids; queue size must not move",
            ScenarioId::BucketRefill => "acquire(10), deny with retry_after 1, sleep 1s, acquire(1)",
            ScenarioId::ProviderCap => "Per-provider cap 1: X never overlaps itself, X and Y overlap",
            ScenarioId::ScopeIsolation => "Org A's 6th trigger denied, org B's 1st trigger allowed",
            ScenarioId::StoreOutage => "🔥 STORE DOWN mid-run: dispatch continues, mirror resyncs",
            ScenarioId::CrashRecovery => "🔥 CRASH with items processing: recovered queue finishes them",
            ScenarioId::ProviderChaos => "🔥 FLAKY PROVIDERS: 30% errors, hung calls, every item completes",
            ScenarioId::Cancellation => "🔥 CANCEL after first batch: remaining items stay pending",
        }
    }

    /// Returns true if this scenario injects faults.
    pub fn is_chaos(&self) -> bool {
        matches!(
            self,
            ScenarioId::StoreOutage | ScenarioId::CrashRecovery | ScenarioId::ProviderChaos | ScenarioId::Cancellation
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "partition" | "dss-001" => Ok(ScenarioId::Partition),
            "priority_order" | "priority" | "dss-002" => Ok(ScenarioId::PriorityOrder),
            "retry_bound" | "retry" | "dss-003" => Ok(ScenarioId::RetryBound),
            "idempotent_admission" | "idempotent" | "dss-004" => Ok(ScenarioId::IdempotentAdmission),
            "bucket_refill" | "bucket" | "dss-005" => Ok(ScenarioId::BucketRefill),
            "provider_cap" | "cap" | "dss-006" => Ok(ScenarioId::ProviderCap),
            "scope_isolation" | "isolation" | "dss-007" => Ok(ScenarioId::ScopeIsolation),
            "store_outage" | "outage" | "dss-008" => Ok(ScenarioId::StoreOutage),
            "crash_recovery" | "crash" | "dss-009" => Ok(ScenarioId::CrashRecovery),
            "provider_chaos" | "dss-010" => Ok(ScenarioId::ProviderChaos),
            "cancellation" | "cancel" | "dss-011" => Ok(ScenarioId::Cancellation),
            "chaos" => Err("Use --chaos to run the chaos scenarios".to_string()),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
