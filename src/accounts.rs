//! Account listing.
//!
//! Fetches the paginated account collections for one user type and
//! normalizes the nested records into a flat base table keyed by
//! `accountId`.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::client::{take_key, CrmApi};
use crate::config::CrmConfig;
use crate::error::CrmError;
use crate::table::{flatten, parse_id, Table};

/// Upstream account type. The two types carry differently shaped payloads
/// and are exported separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    Individual,
    Company,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Individual => "INDIVIDUAL",
            UserType::Company => "COMPANY",
        }
    }

    /// Top-level key of the per-account detail response for this type.
    pub fn detail_key(&self) -> &'static str {
        match self {
            UserType::Individual => "individualAccount",
            UserType::Company => "companyAccount",
        }
    }

    /// File stem used for this type's CSV exports.
    pub fn file_stem(&self) -> &'static str {
        match self {
            UserType::Individual => "individuals",
            UserType::Company => "companies",
        }
    }
}

impl std::fmt::Display for UserType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserType {
    type Err = CrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INDIVIDUAL" => Ok(UserType::Individual),
            "COMPANY" => Ok(UserType::Company),
            other => Err(CrmError::Config(format!("invalid user type {:?}", other))),
        }
    }
}

/// Fetch every page of a listing endpoint and return the concatenated
/// records under `key`.
///
/// The page loop is driven by the response's `pagination.totalPages` when
/// the API provides it; otherwise a short page ends the loop. Either way a
/// result set larger than one page is fetched completely rather than
/// silently truncated.
pub(crate) async fn fetch_all_pages(
    api: &dyn CrmApi,
    path: &str,
    page_size: u32,
    key: &str,
) -> Result<Vec<Value>, CrmError> {
    let separator = if path.contains('?') { '&' } else { '?' };
    let mut records = Vec::new();
    let mut page: u64 = 0;

    loop {
        let page_path = format!(
            "{}{}pageSize={}&currentPage={}",
            path, separator, page_size, page
        );
        let body = api.get(&page_path).await?;
        let total_pages = body
            .get("pagination")
            .and_then(|p| p.get("totalPages"))
            .and_then(Value::as_u64);

        let page_records = match take_key(body, &page_path, key)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            _ => {
                return Err(CrmError::MalformedResponse {
                    url: page_path,
                    detail: format!("{:?} is not an array", key),
                })
            }
        };
        let fetched = page_records.len();
        records.extend(page_records);
        page += 1;

        let more = match total_pages {
            Some(total) => page < total,
            // No pagination metadata: a full page may mean more to fetch.
            None => fetched as u64 == page_size as u64 && fetched > 0,
        };
        if !more {
            break;
        }
    }

    Ok(records)
}

/// Fetch all accounts of one type as a flat table.
///
/// Every row must carry a unique `accountId`; a duplicate in the listing
/// would corrupt every later join and fails the run immediately.
pub async fn list_accounts(
    api: &dyn CrmApi,
    cfg: &CrmConfig,
    user_type: UserType,
) -> Result<Table, CrmError> {
    log::info!("listing {} accounts", user_type);
    let path = format!("/accounts?userType={}", user_type.as_str());
    let records = fetch_all_pages(api, &path, cfg.page_size, "accounts").await?;

    let mut table = Table::new();
    let mut seen = BTreeSet::new();
    for record in &records {
        let row = flatten(record);
        let id = row.get("accountId").and_then(parse_id).ok_or_else(|| {
            CrmError::JoinKeyViolation(format!(
                "{} listing returned a record without accountId",
                user_type
            ))
        })?;
        if !seen.insert(id) {
            return Err(CrmError::JoinKeyViolation(format!(
                "duplicate accountId {} in {} listing",
                id, user_type
            )));
        }
        table.push_row(row);
    }

    log::info!("received {} {} accounts", table.len(), user_type);
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeApi;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_accounts_single_page() {
        let api = FakeApi::new().with(
            "/accounts?userType=INDIVIDUAL&pageSize=5000&currentPage=0",
            json!({
                "accounts": [
                    {"accountId": "1001", "firstName": "Ada", "userType": "INDIVIDUAL"},
                    {"accountId": "1002", "firstName": "Bob", "userType": "INDIVIDUAL"}
                ],
                "pagination": {"currentPage": 0, "totalPages": 1}
            }),
        );
        let cfg = CrmConfig::new("org", "key");
        let table = list_accounts(&api, &cfg, UserType::Individual).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.account_ids().unwrap(), vec![1001, 1002]);
    }

    #[tokio::test]
    async fn test_list_accounts_walks_all_pages() {
        let api = FakeApi::new()
            .with(
                "/accounts?userType=COMPANY&pageSize=2&currentPage=0",
                json!({
                    "accounts": [{"accountId": 1}, {"accountId": 2}],
                    "pagination": {"totalPages": 2}
                }),
            )
            .with(
                "/accounts?userType=COMPANY&pageSize=2&currentPage=1",
                json!({
                    "accounts": [{"accountId": 3}],
                    "pagination": {"totalPages": 2}
                }),
            );
        let mut cfg = CrmConfig::new("org", "key");
        cfg.page_size = 2;
        let table = list_accounts(&api, &cfg, UserType::Company).await.unwrap();
        assert_eq!(table.account_ids().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_account_id_fails_loudly() {
        let api = FakeApi::new().with(
            "/accounts?userType=INDIVIDUAL&pageSize=5000&currentPage=0",
            json!({
                "accounts": [{"accountId": 7}, {"accountId": 7}],
                "pagination": {"totalPages": 1}
            }),
        );
        let cfg = CrmConfig::new("org", "key");
        let err = list_accounts(&api, &cfg, UserType::Individual)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::JoinKeyViolation(_)));
    }

    #[test]
    fn test_user_type_parsing() {
        assert_eq!("individual".parse::<UserType>().unwrap(), UserType::Individual);
        assert_eq!("COMPANY".parse::<UserType>().unwrap(), UserType::Company);
        assert!("household".parse::<UserType>().is_err());
    }
}
