use tracing::warn;
use upshift_common::Result;

use crate::migrations::{MigrationStep, StepContext};

const BATCH_SIZE: i64 = 500;

const CREATE_MESSAGES: &str = "
CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    channel_id TEXT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

const COPY_BATCH: &str = "
INSERT INTO messages (id, session_id, channel_id, role, content, created_at)
SELECT m.id, m.session_id, s.channel_id, m.role, m.content, m.created_at
FROM messages_old m
LEFT JOIN sessions s ON s.id = m.session_id
ORDER BY m.rowid
LIMIT ?1 OFFSET ?2";

/// Denormalizes the session's channel onto every message.
///
/// SQLite cannot add a column with a foreign-key-aware default in place, so
/// the table is rebuilt: rename, create, copy in batches, drop.
pub struct MessageChannels;

impl MigrationStep for MessageChannels {
    fn from_version(&self) -> u32 {
        2
    }

    fn to_version(&self) -> u32 {
        3
    }

    fn title(&self) -> &str {
        "message_channels"
    }

    fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        ctx.execute_batch("DROP INDEX IF EXISTS idx_messages_session")?;
        ctx.execute_batch("ALTER TABLE messages RENAME TO messages_old")?;
        ctx.execute_batch(CREATE_MESSAGES)?;

        let total = ctx
            .query("SELECT count(*) FROM messages_old", &[])?
            .first()
            .and_then(|row| row[0].as_i64())
            .unwrap_or(0);

        let mut throttle = ctx.throttle();
        let mut copied: i64 = 0;
        loop {
            let inserted = ctx.execute(COPY_BATCH, &[BATCH_SIZE.into(), copied.into()])? as i64;
            if inserted == 0 {
                break;
            }
            copied += inserted;

            if !ctx.heartbeat() {
                warn!("upgrade lease could not be extended while copying messages");
            }
            if throttle.ready() {
                ctx.progress()
                    .message(&format!("copied {copied} of {total} messages"));
            }
        }

        ctx.execute_batch("DROP TABLE messages_old")?;
        ctx.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at)",
        )?;
        Ok(())
    }
}
