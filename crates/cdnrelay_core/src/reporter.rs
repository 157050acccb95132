use cdnrelay_transfer::QuotaReport;
use futures::future::join_all;
use tracing::warn;

use crate::pool::{Account, AccountPool};

/// Quota of every account, in pool order. A failing account yields an
/// `Unavailable` entry instead of failing the whole report.
pub async fn storage_info(pool: &AccountPool) -> Vec<QuotaReport> {
    join_all(pool.all().map(account_quota)).await
}

async fn account_quota(account: &Account) -> QuotaReport {
    let session = account.lock().await;
    match session.quota().await {
        Ok(quota) => QuotaReport::usage(account.email(), quota.used, quota.total),
        Err(err) => {
            warn!(account = %account.email(), error = %err, "failed to get account info");
            QuotaReport::Unavailable {
                email: account.email().to_string(),
                error: "Failed to get account info".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdnrelay_cloud::InMemoryCloud;

    #[tokio::test]
    async fn one_failing_account_does_not_hide_the_others() {
        let cloud = InMemoryCloud::new()
            .with_account("a@example.com", "pa")
            .with_account("b@example.com", "pb")
            .with_quota("a@example.com", 1_000);
        cloud.seed_file("a@example.com", "x.bin", &[0u8; 250]);
        cloud.fail_quota("b@example.com");
        let pool = AccountPool::initialize(&cloud, "a@example.com:pa;b@example.com:pb")
            .await
            .expect("pool");

        let reports = storage_info(&pool).await;
        assert_eq!(
            reports,
            vec![
                QuotaReport::usage("a@example.com", 250, 1_000),
                QuotaReport::Unavailable {
                    email: "b@example.com".to_string(),
                    error: "Failed to get account info".to_string(),
                },
            ]
        );
    }
}
