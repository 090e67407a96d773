//! Concurrent per-account enrichment.
//!
//! Fans out independent, idempotent lookups (membership summary, per-account
//! detail) across a bounded worker pool, then reduces the immutable results
//! back onto the base table keyed by `accountId`. Tasks never share mutable
//! state; a failing account's task is logged, runs its siblings to
//! completion, and is surfaced attributed to that account.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::accounts::UserType;
use crate::client::{take_key, CrmApi};
use crate::config::CrmConfig;
use crate::error::CrmError;
use crate::membership::{fetch_membership_summary, MembershipSummary};
use crate::table::{flatten, Row, Table};

/// Run one task per id under a fixed-size worker pool and collect every
/// outcome. Submission acquires a permit before spawning, so at most
/// `limit` tasks are in flight; completion order is irrelevant because
/// results stay paired with their id.
pub(crate) async fn fan_out<T, F, Fut>(
    ids: &[i64],
    limit: usize,
    make_task: F,
) -> Result<Vec<(i64, Result<T, CrmError>)>, CrmError>
where
    T: Send + 'static,
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<T, CrmError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut handles = Vec::with_capacity(ids.len());
    for &id in ids {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CrmError::TaskFailed(format!("worker pool closed: {}", e)))?;
        let task = make_task(id);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            task.await
        }));
    }

    let joined = futures::future::join_all(handles).await;
    Ok(ids
        .iter()
        .copied()
        .zip(joined)
        .map(|(id, outcome)| {
            let outcome = match outcome {
                Ok(result) => result,
                // A panicked task must not be silently swallowed.
                Err(join_err) => Err(CrmError::TaskFailed(join_err.to_string())),
            };
            (id, outcome)
        })
        .collect())
}

/// Split fan-out outcomes into a one-to-one result map, logging every
/// failure and returning the first one wrapped by `wrap`.
fn reduce_results<T>(
    results: Vec<(i64, Result<T, CrmError>)>,
    what: &str,
    wrap: impl Fn(i64, Box<CrmError>) -> CrmError,
) -> Result<BTreeMap<i64, T>, CrmError> {
    let mut by_id = BTreeMap::new();
    let mut first_failure = None;
    for (id, outcome) in results {
        match outcome {
            Ok(value) => {
                if by_id.insert(id, value).is_some() {
                    return Err(CrmError::JoinKeyViolation(format!(
                        "duplicate id {} in {} results",
                        id, what
                    )));
                }
            }
            Err(err) => {
                log::error!("{} failed for {}: {}", what, id, err);
                if first_failure.is_none() {
                    first_failure = Some(wrap(id, Box::new(err)));
                }
            }
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(by_id),
    }
}

fn summary_row(summary: &MembershipSummary) -> Row {
    let mut row = Row::new();
    row.insert(
        "Membership Type".to_string(),
        Value::String(summary.membership_type.clone()),
    );
    row.insert(
        "Fee".to_string(),
        serde_json::Number::from_f64(summary.fee)
            .map(Value::Number)
            .unwrap_or(Value::Null),
    );
    row.insert(
        "Term End Date".to_string(),
        summary
            .term_end_date
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    row.insert(
        "Transaction Date".to_string(),
        summary
            .transaction_date
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    row.insert(
        "Number of Memberships".to_string(),
        json!(summary.total_memberships),
    );
    row
}

/// Populate the derived membership columns for every account in the table.
pub async fn add_membership_columns(
    api: Arc<dyn CrmApi>,
    cfg: &CrmConfig,
    table: &mut Table,
    today: NaiveDate,
) -> Result<(), CrmError> {
    log::info!("fetching membership summaries for {} accounts", table.len());
    let ids = table.account_ids()?;
    let results = fan_out(&ids, cfg.max_concurrency, |id| {
        let api = api.clone();
        async move { fetch_membership_summary(api.as_ref(), id, today).await }
    })
    .await?;

    let summaries = reduce_results(results, "membership lookup", |account_id, source| {
        CrmError::AccountTask { account_id, source }
    })?;
    let rows: BTreeMap<i64, Row> = summaries
        .iter()
        .map(|(id, summary)| (*id, summary_row(summary)))
        .collect();
    table.merge_by_account_id(&rows, false)
}

/// Fetch one account's detail record, flattened.
async fn fetch_detail(
    api: &dyn CrmApi,
    account_id: i64,
    expected: UserType,
) -> Result<Row, CrmError> {
    log::debug!("fetching account detail for {}", account_id);
    let path = format!("/accounts/{}", account_id);
    let body = api.get(&path).await?;
    let detail = take_key(body, &path, expected.detail_key())?;
    if !detail.is_object() {
        return Err(CrmError::MalformedResponse {
            url: path,
            detail: format!("{:?} is not an object", expected.detail_key()),
        });
    }
    Ok(flatten(&detail))
}

fn minimal_row(account_id: i64) -> Row {
    let mut row = Row::new();
    row.insert("accountId".to_string(), json!(account_id));
    row
}

/// Enrich every account with its detail record (creation date, contact
/// fields, and whatever else the upstream carries for its type).
///
/// An account whose declared `userType` does not match the caller's
/// expected type gets a minimal record containing only the id — the
/// upstream occasionally misfiles accounts, and that must not fail the run.
/// Columns already populated by the listing keep their base values.
pub async fn add_account_details(
    api: Arc<dyn CrmApi>,
    cfg: &CrmConfig,
    table: &mut Table,
    expected: UserType,
) -> Result<(), CrmError> {
    log::info!(
        "fetching account details for {} {} accounts",
        table.len(),
        expected
    );
    let ids = table.account_ids()?;
    let declared: Arc<BTreeMap<i64, Option<UserType>>> = Arc::new(
        ids.iter()
            .zip(table.rows())
            .map(|(id, row)| {
                let declared = row
                    .get("userType")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                (*id, declared)
            })
            .collect(),
    );

    let results = fan_out(&ids, cfg.max_concurrency, |id| {
        let api = api.clone();
        let declared = declared.clone();
        async move {
            match declared.get(&id).copied().flatten() {
                Some(declared_type) if declared_type != expected => {
                    log::debug!(
                        "account {} declares {}, expected {} — keeping minimal record",
                        id,
                        declared_type,
                        expected
                    );
                    Ok(minimal_row(id))
                }
                _ => fetch_detail(api.as_ref(), id, expected).await,
            }
        }
    })
    .await?;

    let details = reduce_results(results, "detail lookup", |account_id, source| {
        CrmError::AccountTask { account_id, source }
    })?;
    table.merge_by_account_id(&details, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeApi;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn base_table(records: &[Value]) -> Table {
        let mut table = Table::new();
        for record in records {
            table.push_row(flatten(record));
        }
        table
    }

    fn two_account_fixture() -> FakeApi {
        FakeApi::new()
            .with(
                "/accounts/1001/memberships",
                json!({"memberships": [
                    {"membershipLevel": {"name": "Gold"}, "fee": "500",
                     "termEndDate": "2099-01-01", "transactionDate": "2024-01-15"},
                    {"membershipLevel": {"name": "Silver"}, "fee": "100",
                     "termEndDate": "2020-01-01", "transactionDate": "2019-01-15"}
                ]}),
            )
            .with("/accounts/1002/memberships", json!({"memberships": []}))
    }

    #[tokio::test]
    async fn test_membership_columns_scenarios() {
        let api: Arc<dyn CrmApi> = Arc::new(two_account_fixture());
        let cfg = CrmConfig::new("org", "key");
        let mut table = base_table(&[
            json!({"accountId": 1001, "userType": "INDIVIDUAL"}),
            json!({"accountId": 1002, "userType": "INDIVIDUAL"}),
        ]);

        add_membership_columns(api, &cfg, &mut table, run_date())
            .await
            .unwrap();

        assert_eq!(table.get(0, "Membership Type"), Some(&json!("Gold")));
        assert_eq!(table.get(0, "Fee"), Some(&json!(500.0)));
        assert_eq!(table.get(0, "Number of Memberships"), Some(&json!(2)));
        assert_eq!(table.get(1, "Membership Type"), Some(&json!("No Membership active")));
        assert_eq!(table.get(1, "Fee"), Some(&json!(0.0)));
        assert_eq!(table.get(1, "Number of Memberships"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_membership_enrichment_is_idempotent() {
        let cfg = CrmConfig::new("org", "key");
        let mut first = base_table(&[
            json!({"accountId": 1001, "userType": "INDIVIDUAL"}),
            json!({"accountId": 1002, "userType": "INDIVIDUAL"}),
        ]);
        let mut second = first.clone();

        let api: Arc<dyn CrmApi> = Arc::new(two_account_fixture());
        add_membership_columns(api.clone(), &cfg, &mut first, run_date())
            .await
            .unwrap();
        add_membership_columns(api, &cfg, &mut second, run_date())
            .await
            .unwrap();

        assert_eq!(first.columns(), second.columns());
        assert_eq!(first.rows(), second.rows());
    }

    #[tokio::test]
    async fn test_account_failure_is_attributed_and_siblings_finish() {
        let calls = Arc::new(AtomicUsize::new(0));
        let api = two_account_fixture()
            .without("/accounts/1002/memberships")
            .on_call(calls.clone());
        let api: Arc<dyn CrmApi> = Arc::new(api);
        let cfg = CrmConfig::new("org", "key");
        let mut table = base_table(&[
            json!({"accountId": 1001, "userType": "INDIVIDUAL"}),
            json!({"accountId": 1002, "userType": "INDIVIDUAL"}),
        ]);

        let err = add_membership_columns(api, &cfg, &mut table, run_date())
            .await
            .unwrap_err();
        match err {
            CrmError::AccountTask { account_id, .. } => assert_eq!(account_id, 1002),
            other => panic!("unexpected error: {}", other),
        }
        // The sibling's request was still issued.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_detail_enrichment_and_type_mismatch() {
        let api: Arc<dyn CrmApi> = Arc::new(
            FakeApi::new().with(
                "/accounts/1001",
                json!({"individualAccount": {
                    "accountId": "1001",
                    "timestamps": {"createdDateTime": "2015-03-01T10:00:00Z"}
                }}),
            ),
        );
        let cfg = CrmConfig::new("org", "key");
        let mut table = base_table(&[
            json!({"accountId": 1001, "userType": "INDIVIDUAL", "firstName": "Ada"}),
            // Misfiled company in the individual listing: no detail fetch.
            json!({"accountId": 2002, "userType": "COMPANY"}),
        ]);

        add_account_details(api, &cfg, &mut table, UserType::Individual)
            .await
            .unwrap();

        assert_eq!(
            table.get(0, "timestamps.createdDateTime"),
            Some(&json!("2015-03-01T10:00:00Z"))
        );
        // Base value kept over the detail's string-typed id.
        assert_eq!(table.get(0, "accountId"), Some(&json!(1001)));
        assert_eq!(table.get(1, "timestamps.createdDateTime"), None);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_fan_out_bounded_and_keyed() {
        let ids: Vec<i64> = (1..=20).collect();
        let results = fan_out(&ids, 4, |id| async move { Ok::<i64, CrmError>(id * 10) })
            .await
            .unwrap();
        assert_eq!(results.len(), 20);
        for (id, outcome) in results {
            assert_eq!(outcome.unwrap(), id * 10);
        }
    }
}
