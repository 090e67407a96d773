//! End-to-end extraction for one account type.
//!
//! Lister → per-account enrichment + event attendance (both against the
//! same base table) → merge/filter → CSV. The run either completes with a
//! full enriched table or fails naming the call or account that broke it;
//! there is no partial export.

use std::path::Path;
use std::sync::Arc;

use chrono::Local;

use crate::accounts::{list_accounts, UserType};
use crate::client::CrmApi;
use crate::config::CrmConfig;
use crate::enrich::{add_account_details, add_membership_columns};
use crate::error::CrmError;
use crate::events::attach_event_history;
use crate::export::{finalize, ExportTables, EXPORT_DATE_FORMAT};

/// Fetch and enrich every account of one type, returning the two export
/// views. `today` drives active-membership selection; `exported_at` is the
/// stamp written to every row.
pub async fn extract_accounts(
    api: Arc<dyn CrmApi>,
    cfg: &CrmConfig,
    user_type: UserType,
    today: chrono::NaiveDate,
    exported_at: &str,
) -> Result<ExportTables, CrmError> {
    let mut table = list_accounts(api.as_ref(), cfg, user_type).await?;

    add_membership_columns(api.clone(), cfg, &mut table, today).await?;
    attach_event_history(api.clone(), cfg, &mut table).await?;
    add_account_details(api.clone(), cfg, &mut table, user_type).await?;

    Ok(finalize(user_type, table, exported_at))
}

/// Run the full extraction for the given account types and write the CSVs.
pub async fn run(
    api: Arc<dyn CrmApi>,
    cfg: &CrmConfig,
    user_types: &[UserType],
    output_dir: &Path,
) -> Result<(), CrmError> {
    let now = Local::now();
    let today = now.date_naive();
    let exported_at = now.format(EXPORT_DATE_FORMAT).to_string();

    for &user_type in user_types {
        let views = extract_accounts(api.clone(), cfg, user_type, today, &exported_at).await?;
        crate::export::write_exports(output_dir, user_type, &views)?;
    }
    Ok(())
}
