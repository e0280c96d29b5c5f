//! Pre-flight allow/deny decision against the configured budget.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::keys::KeyStore;
use crate::ledger::CostLedger;

pub struct AdmissionController {
    keys: Arc<KeyStore>,
    ledger: Arc<dyn CostLedger>,
}

impl AdmissionController {
    pub fn new(keys: Arc<KeyStore>, ledger: Arc<dyn CostLedger>) -> Self {
        Self { keys, ledger }
    }

    /// Denies iff recorded spend has reached the ceiling. This is a read-only
    /// check: the actual cost of a call is unknown until the backend returns,
    /// so a request admitted just under the ceiling may push spend past it.
    /// That bounded overshoot is the contract; there is no reservation or
    /// pre-charge here.
    pub async fn check_admit(&self, token: &str) -> Result<(), GatewayError> {
        let Some(policy) = self.keys.policy_for(token) else {
            // Authentication upstream should make this unreachable; a valid
            // looking token without a policy points at a store inconsistency.
            return Err(GatewayError::UnknownKey);
        };

        let entry = self.ledger.current_spend(token).await?;
        if entry.total_usd_micros >= policy.total_usd_micros {
            return Err(GatewayError::BudgetExceeded {
                limit_usd_micros: policy.total_usd_micros,
                spent_usd_micros: entry.total_usd_micros,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ApiKey, BudgetPolicy, ResetPeriod};
    use crate::ledger::MemoryLedger;

    fn fixture(total_usd_micros: u64) -> (Arc<KeyStore>, Arc<MemoryLedger>, AdmissionController) {
        let keys = Arc::new(KeyStore::new());
        keys.register(ApiKey::new(
            "sk-test",
            BudgetPolicy {
                total_usd_micros,
                period: ResetPeriod::None,
            },
        ))
        .expect("register");
        let ledger = Arc::new(MemoryLedger::new());
        let admission = AdmissionController::new(
            Arc::clone(&keys),
            Arc::clone(&ledger) as Arc<dyn CostLedger>,
        );
        (keys, ledger, admission)
    }

    #[tokio::test]
    async fn admits_just_under_the_ceiling() {
        // $9.99 spent against a $10.00 ceiling.
        let (_keys, ledger, admission) = fixture(10_000_000);
        ledger
            .record_cost("sk-test", "gpt-4o-mini", 9_990_000)
            .await
            .expect("record");
        admission.check_admit("sk-test").await.expect("admit");
    }

    #[tokio::test]
    async fn denies_at_the_ceiling() {
        let (_keys, ledger, admission) = fixture(10_000_000);
        ledger
            .record_cost("sk-test", "gpt-4o-mini", 10_000_000)
            .await
            .expect("record");
        let err = admission.check_admit("sk-test").await.expect_err("deny");
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded {
                limit_usd_micros: 10_000_000,
                spent_usd_micros: 10_000_000,
            }
        ));
    }

    #[tokio::test]
    async fn zero_budget_never_admits() {
        let (_keys, _ledger, admission) = fixture(0);
        let err = admission.check_admit("sk-test").await.expect_err("deny");
        assert!(matches!(err, GatewayError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (_keys, _ledger, admission) = fixture(10_000_000);
        let err = admission.check_admit("sk-never-issued").await.expect_err("deny");
        assert!(matches!(err, GatewayError::UnknownKey));
    }

    #[tokio::test]
    async fn admission_does_not_mutate_the_ledger() {
        let (_keys, ledger, admission) = fixture(10_000_000);
        admission.check_admit("sk-test").await.expect("admit");
        let entry = ledger.current_spend("sk-test").await.expect("read");
        assert_eq!(entry.total_usd_micros, 0);
    }
}
