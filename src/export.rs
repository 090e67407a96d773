//! Final merge/filter pass and CSV export.
//!
//! Produces two named views per account type: the headline export of
//! members only, and the full table including accounts without an active
//! membership. Both go through the same cleanup — the hand-maintained
//! per-type drop list, an empty-column sweep, and the export timestamp.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::accounts::UserType;
use crate::error::CrmError;
use crate::membership::NO_ACTIVE_MEMBERSHIP;
use crate::table::Table;

/// Format of the `Export Date` column.
pub const EXPORT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Columns known to be redundant or irrelevant in individual exports.
/// Maintained by hand against the upstream schema; names not present in a
/// given run are ignored.
const INDIVIDUAL_DROP_COLUMNS: &[&str] = &[
    "noSolicitation",
    "accountCustomFields",
    "sendSystemEmail",
    "accountCurrentMembershipStatus",
    "primaryContact.contactId",
    "primaryContact.firstName",
    "primaryContact.middleName",
    "primaryContact.lastName",
    "primaryContact.salutation",
    "primaryContact.preferredName",
    "primaryContact.deceased",
    "primaryContact.department",
    "primaryContact.title",
    "generosityIndicator.indicator",
    "generosityIndicator.affinity",
    "generosityIndicator.recency",
    "generosityIndicator.frequency",
    "generosityIndicator.monetaryValue",
    "company.name",
    "login.username",
    "primaryContact.gender.code",
    "primaryContact.gender.name",
    "individualTypes",
];

/// Columns dropped from company exports.
const COMPANY_DROP_COLUMNS: &[&str] = &[
    "firstName",
    "lastName",
    "noSolicitation",
    "accountCustomFields",
    "sendSystemEmail",
    "accountCurrentMembershipStatus",
    "name",
    "primaryContact.contactId",
    "primaryContact.accountId",
    "primaryContact.firstName",
    "primaryContact.middleName",
    "primaryContact.lastName",
    "primaryContact.prefix",
    "primaryContact.suffix",
    "primaryContact.salutation",
    "primaryContact.preferredName",
    "primaryContact.email1",
    "primaryContact.deceased",
    "primaryContact.department",
    "primaryContact.title",
    "primaryContact.primaryContact",
    "primaryContact.currentEmployer",
    "primaryContact.startDate",
    "primaryContact.addresses",
    "generosityIndicator.indicator",
    "generosityIndicator.affinity",
    "generosityIndicator.recency",
    "generosityIndicator.frequency",
    "generosityIndicator.monetaryValue",
    "login.username",
    "primaryContact.gender.code",
    "primaryContact.gender.name",
    "companyTypes",
];

fn drop_columns_for(user_type: UserType) -> &'static [&'static str] {
    match user_type {
        UserType::Individual => INDIVIDUAL_DROP_COLUMNS,
        UserType::Company => COMPANY_DROP_COLUMNS,
    }
}

/// The two export views of one account type.
#[derive(Debug, Clone)]
pub struct ExportTables {
    /// Accounts with an active membership — the headline export.
    pub active: Table,
    /// Every account, members or not.
    pub all: Table,
}

fn clean(mut table: Table, user_type: UserType, exported_at: &str) -> Table {
    table.drop_columns(drop_columns_for(user_type));
    table.drop_empty_columns();
    table.set_column("Export Date", Value::String(exported_at.to_string()));
    table
}

/// Apply the per-type column filters and produce both named views, each
/// stamped with the run's export timestamp. Neither view overwrites the
/// other; callers persist both.
pub fn finalize(user_type: UserType, table: Table, exported_at: &str) -> ExportTables {
    let active = table.filter_rows(|row| {
        row.get("Membership Type")
            .and_then(Value::as_str)
            .map(|t| t != NO_ACTIVE_MEMBERSHIP)
            .unwrap_or(false)
    });
    log::info!(
        "{}: {} accounts total, {} with an active membership",
        user_type,
        table.len(),
        active.len()
    );
    ExportTables {
        active: clean(active, user_type, exported_at),
        all: clean(table, user_type, exported_at),
    }
}

/// Write both views as CSV under `output_dir` and return the paths
/// (`individuals.csv` + `individuals_all.csv`, same for companies).
pub fn write_exports(
    output_dir: &Path,
    user_type: UserType,
    tables: &ExportTables,
) -> Result<(PathBuf, PathBuf), CrmError> {
    std::fs::create_dir_all(output_dir)?;
    let active_path = output_dir.join(format!("{}.csv", user_type.file_stem()));
    let all_path = output_dir.join(format!("{}_all.csv", user_type.file_stem()));

    tables
        .active
        .write_csv(BufWriter::new(File::create(&active_path)?))?;
    tables
        .all
        .write_csv(BufWriter::new(File::create(&all_path)?))?;

    log::info!(
        "wrote {} ({} rows) and {} ({} rows)",
        active_path.display(),
        tables.active.len(),
        all_path.display(),
        tables.all.len()
    );
    Ok((active_path, all_path))
}
