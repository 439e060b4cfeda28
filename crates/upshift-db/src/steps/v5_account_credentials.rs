use tracing::info;
use upshift_common::{Error, Result};

use crate::migrations::{MigrationStep, StepContext};

const CREATE_ACCOUNTS: &str = "
CREATE TABLE accounts (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    has_credentials INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Moves plaintext provider keys out of `accounts` into the credential
/// store and purges soft-deleted accounts. Jumps straight from 3 to 5.
///
/// Credential writes are idempotent, so re-running after a rolled-back
/// attempt is safe.
pub struct AccountCredentials;

impl MigrationStep for AccountCredentials {
    fn from_version(&self) -> u32 {
        3
    }

    fn to_version(&self) -> u32 {
        5
    }

    fn title(&self) -> &str {
        "account_credentials"
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let rows = ctx.query("SELECT id, api_key, deleted FROM accounts", &[])?;

        let touches_vault = rows
            .iter()
            .any(|row| !row[1].is_null() || row[2].as_i64() == Some(1));
        if touches_vault {
            let credentials = ctx.credentials()?;
            let mut moved = 0;
            let mut purged = 0;
            for row in &rows {
                let Some(id) = row[0].as_str() else {
                    continue;
                };
                if row[2].as_i64() == Some(1) {
                    credentials.remove_identity(id)?;
                    purged += 1;
                } else if let Some(key) = row[1].as_str() {
                    credentials.set(id, "api_key", key)?;
                    // The plaintext column is dropped below, so the vault
                    // copy must be readable before we go on.
                    if credentials.get(id, "api_key")?.as_deref() != Some(key) {
                        return Err(Error::Credential(format!(
                            "credential store did not retain the api key of account {id}"
                        )));
                    }
                    moved += 1;
                }
            }
            info!("moved {moved} api key(s) to the credential store, purged {purged} account(s)");
        }

        ctx.execute_batch("ALTER TABLE accounts RENAME TO accounts_old")?;
        ctx.execute_batch(CREATE_ACCOUNTS)?;
        ctx.execute(
            "INSERT INTO accounts (id, provider, has_credentials, created_at)
             SELECT id, provider, api_key IS NOT NULL, created_at
             FROM accounts_old
             WHERE deleted = 0",
            &[],
        )?;
        ctx.execute_batch("DROP TABLE accounts_old")?;
        Ok(())
    }
}
