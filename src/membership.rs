//! Membership lookup and active-membership selection.
//!
//! An account has zero or more memberships; the "active" one is the first
//! in API order whose term end date is strictly after the run date. The API
//! returns fees as decimal strings, which are parsed to numbers here so the
//! export carries a usable numeric column.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::client::{take_key, CrmApi};
use crate::error::CrmError;

/// Sentinel membership type for accounts without an active membership.
pub const NO_ACTIVE_MEMBERSHIP: &str = "No Membership active";

const TERM_DATE_FORMAT: &str = "%Y-%m-%d";

/// One membership record as returned by `/accounts/{id}/memberships`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    #[serde(default)]
    pub membership_level: MembershipLevel,
    /// Decimal-as-string in the source; occasionally a plain number.
    #[serde(default)]
    pub fee: Option<Value>,
    #[serde(default)]
    pub term_end_date: Option<String>,
    #[serde(default)]
    pub transaction_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MembershipLevel {
    #[serde(default)]
    pub name: Option<String>,
}

/// Derived membership columns for one account.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipSummary {
    pub membership_type: String,
    pub fee: f64,
    pub term_end_date: Option<String>,
    pub transaction_date: Option<String>,
    /// Count of all memberships, active or not.
    pub total_memberships: usize,
}

impl MembershipSummary {
    fn none_active(total_memberships: usize) -> Self {
        Self {
            membership_type: NO_ACTIVE_MEMBERSHIP.to_string(),
            fee: 0.0,
            term_end_date: None,
            transaction_date: None,
            total_memberships,
        }
    }
}

fn parse_fee(account_id: i64, fee: Option<&Value>) -> f64 {
    match fee {
        Some(Value::String(s)) => match s.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!(
                    "account {}: unparseable membership fee {:?}, exporting 0",
                    account_id,
                    s
                );
                0.0
            }
        },
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Select the active membership per the run date.
///
/// Memberships are scanned in API order and the first future-dated term
/// wins; accounts with zero memberships short-circuit to the sentinel
/// without any date parsing. An unparseable term end date on a non-empty
/// list is a malformed response.
pub fn select_active(
    account_id: i64,
    memberships: &[Membership],
    today: NaiveDate,
) -> Result<MembershipSummary, CrmError> {
    if memberships.is_empty() {
        return Ok(MembershipSummary::none_active(0));
    }

    for membership in memberships {
        let raw = membership.term_end_date.as_deref().ok_or_else(|| {
            CrmError::MalformedResponse {
                url: format!("/accounts/{}/memberships", account_id),
                detail: "membership without termEndDate".to_string(),
            }
        })?;
        let term_end = NaiveDate::parse_from_str(raw, TERM_DATE_FORMAT).map_err(|e| {
            CrmError::MalformedResponse {
                url: format!("/accounts/{}/memberships", account_id),
                detail: format!("bad termEndDate {:?}: {}", raw, e),
            }
        })?;
        if today < term_end {
            return Ok(MembershipSummary {
                membership_type: membership
                    .membership_level
                    .name
                    .clone()
                    .unwrap_or_else(|| NO_ACTIVE_MEMBERSHIP.to_string()),
                fee: parse_fee(account_id, membership.fee.as_ref()),
                term_end_date: membership.term_end_date.clone(),
                transaction_date: membership.transaction_date.clone(),
                total_memberships: memberships.len(),
            });
        }
    }

    Ok(MembershipSummary::none_active(memberships.len()))
}

/// Fetch and summarize one account's memberships.
pub async fn fetch_membership_summary(
    api: &dyn CrmApi,
    account_id: i64,
    today: NaiveDate,
) -> Result<MembershipSummary, CrmError> {
    log::debug!("fetching memberships for account {}", account_id);
    let path = format!("/accounts/{}/memberships", account_id);
    let body = api.get(&path).await?;
    let memberships: Vec<Membership> = match take_key(body, &path, "memberships")? {
        Value::Null => Vec::new(),
        value => serde_json::from_value(value)?,
    };
    select_active(account_id, &memberships, today)
}
