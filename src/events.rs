//! Event attendance history.
//!
//! Fetches the full event list once, fans out per-event attendee lookups,
//! and reduces the results into an attended-event-id set per account. The
//! accumulation is order-independent: sets keyed by `accountId`, never
//! positional appends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::accounts::fetch_all_pages;
use crate::client::{take_key, CrmApi};
use crate::config::CrmConfig;
use crate::enrich::fan_out;
use crate::error::CrmError;
use crate::table::{parse_id, Row, Table};

/// All event ids, across every listing page.
pub async fn fetch_event_ids(api: &dyn CrmApi, cfg: &CrmConfig) -> Result<Vec<i64>, CrmError> {
    let records = fetch_all_pages(api, "/events", cfg.page_size, "events").await?;
    records
        .iter()
        .map(|event| {
            event.get("id").and_then(parse_id).ok_or_else(|| {
                CrmError::MalformedResponse {
                    url: "/events".to_string(),
                    detail: "event without a parseable id".to_string(),
                }
            })
        })
        .collect()
}

/// Deduplicated attendee account ids for one event. The endpoint returns
/// `"attendees": null` when nobody registered. Attendees without a
/// `registrantAccountId` (guest registrations) are skipped.
pub async fn fetch_attendees(
    api: &dyn CrmApi,
    event_id: i64,
) -> Result<BTreeSet<i64>, CrmError> {
    log::debug!("fetching attendees for event {}", event_id);
    let path = format!("/events/{}/attendees", event_id);
    let body = api.get(&path).await?;
    let attendees = match take_key(body, &path, "attendees")? {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        _ => {
            return Err(CrmError::MalformedResponse {
                url: path,
                detail: "\"attendees\" is not an array".to_string(),
            })
        }
    };

    let mut ids = BTreeSet::new();
    for attendee in &attendees {
        match attendee.get("registrantAccountId").and_then(parse_id) {
            Some(id) => {
                ids.insert(id);
            }
            None => log::debug!("event {} attendee without registrantAccountId", event_id),
        }
    }
    Ok(ids)
}

/// Attach an `event_ids` column holding the set of events each account
/// attended. Attendees not present in the base table are ignored, not
/// inserted.
pub async fn attach_event_history(
    api: Arc<dyn CrmApi>,
    cfg: &CrmConfig,
    table: &mut Table,
) -> Result<(), CrmError> {
    let event_ids = fetch_event_ids(api.as_ref(), cfg).await?;
    log::info!(
        "joining attendance for {} events onto {} accounts",
        event_ids.len(),
        table.len()
    );

    let results = fan_out(&event_ids, cfg.max_concurrency, |event_id| {
        let api = api.clone();
        async move { fetch_attendees(api.as_ref(), event_id).await }
    })
    .await?;

    // Reduce after the fan-in: immutable per-event results, no shared table.
    let mut attended: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    let mut first_failure = None;
    for (event_id, outcome) in results {
        match outcome {
            Ok(attendee_ids) => {
                for account_id in attendee_ids {
                    attended.entry(account_id).or_default().insert(event_id);
                }
            }
            Err(err) => {
                log::error!("attendee fetch failed for event {}: {}", event_id, err);
                if first_failure.is_none() {
                    first_failure = Some(CrmError::EventTask {
                        event_id,
                        source: Box::new(err),
                    });
                }
            }
        }
    }
    if let Some(err) = first_failure {
        return Err(err);
    }

    let by_id: BTreeMap<i64, Row> = table
        .account_ids()?
        .into_iter()
        .map(|account_id| {
            let ids: Vec<Value> = attended
                .get(&account_id)
                .map(|set| set.iter().map(|id| Value::from(*id)).collect())
                .unwrap_or_default();
            let mut row = Row::new();
            row.insert("event_ids".to_string(), Value::Array(ids));
            (account_id, row)
        })
        .collect();
    table.merge_by_account_id(&by_id, false)
}
