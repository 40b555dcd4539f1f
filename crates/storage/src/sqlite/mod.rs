use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, StorageError, StorageResult,
};
use super::error::{
    InvariantViolationSnafu, NotFoundSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu,
};
use super::ids::{ConversationId, MessageId, UserId};
use super::types::{
    ConversationCreation, ConversationRecord, MessageRecord, NewConversation, NewMessage,
};
use super::{ConversationStore, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        // Every store call opens its own connection, so a private in-memory database
        // would vanish between calls.
        if database_location == ":memory:" || database_location.contains("mode=memory") {
            return InvariantViolationSnafu {
                stage: "sqlite-open-memory-unsupported",
                details: "SqliteStorage needs a file-backed database; use MemoryStorage instead"
                    .to_string(),
            }
            .fail();
        }

        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite conversation store");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation_if_absent(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationCreation> {
        input.ensure_distinct_participants("conversation-create-participants")?;
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;
            let [low, high] = &input.participants;
            let now = unix_timestamp_millis();

            // Racing creators carry the same payload, so the loser simply reads the winner's row.
            let inserted = sqlx::query(
                "INSERT INTO conversations (id, participant_low, participant_high, created_at) VALUES (?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
            )
            .bind(input.id.as_str())
            .bind(low.as_str())
            .bind(high.as_str())
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            let record = load_conversation(&mut connection, &input.id, "conversation-create-load")
                .await?
                .ok_or_else(|| {
                    NotFoundSnafu {
                        stage: "conversation-create-load-missing",
                        entity: "conversation",
                        id: input.id.to_string(),
                    }
                    .build()
                })?;

            if record.participants != input.participants {
                return super::error::ConflictSnafu {
                    stage: "conversation-create-participants-mismatch",
                    entity: "conversation",
                    details: format!(
                        "conversation '{}' already exists with participants {} and {}",
                        record.id, record.participants[0], record.participants[1]
                    ),
                }
                .fail();
            }

            Ok(ConversationCreation {
                record,
                created: inserted.rows_affected() == 1,
            })
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            load_conversation(&mut connection, &conversation_id, "conversation-get-query").await
        })
    }

    fn list_conversations_for(&self, user_id: &UserId) -> StorageResult<Vec<ConversationRecord>> {
        let database_url = self.database_url.clone();
        let user_id = user_id.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, participant_low, participant_high, created_at FROM conversations WHERE participant_low = ? OR participant_high = ? ORDER BY created_at DESC, id DESC",
            )
            .bind(user_id.as_str())
            .bind(user_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        conversation_id: &ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            if !conversation_exists(&mut connection, &conversation_id).await? {
                return NotFoundSnafu {
                    stage: "message-append-missing-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let now = unix_timestamp_millis();
            let message_id = MessageId::new_v7();

            // seq is computed inside the INSERT so concurrent writers serialize on the
            // sqlite write lock instead of racing on a separate MAX(seq) read.
            let seq = sqlx::query_scalar::<_, i64>(
                "INSERT INTO messages (id, conversation_id, seq, sender_id, sender_display_name, text, created_at) SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ? FROM messages WHERE conversation_id = ? RETURNING seq",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.as_str())
            .bind(input.sender_id.as_str())
            .bind(input.sender_display_name.as_str())
            .bind(input.text.as_str())
            .bind(now)
            .bind(conversation_id.as_str())
            .fetch_one(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            Ok(MessageRecord {
                id: message_id,
                conversation_id,
                seq: i64_to_u64(seq, "message-append-seq")?,
                sender_id: input.sender_id,
                sender_display_name: input.sender_display_name,
                text: input.text,
                created_at_unix_millis: i64_to_u64(now, "message-append-created-at")?,
            })
        })
    }

    fn list_messages(&self, conversation_id: &ConversationId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        let conversation_id = conversation_id.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, seq, sender_id, sender_display_name, text, created_at FROM messages WHERE conversation_id = ? ORDER BY seq ASC, id ASC",
            )
            .bind(conversation_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    participant_low: String,
    participant_high: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    sender_id: String,
    sender_display_name: String,
    text: String,
    created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(row.id)?,
        participants: [
            UserId::parse(row.participant_low)?,
            UserId::parse(row.participant_high)?,
        ],
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        sender_id: UserId::parse(row.sender_id)?,
        sender_display_name: row.sender_display_name,
        text: row.text,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_conversation(
    connection: &mut SqliteConnection,
    conversation_id: &ConversationId,
    stage: &'static str,
) -> StorageResult<Option<ConversationRecord>> {
    let row = sqlx::query_as::<_, ConversationRow>(
        "SELECT id, participant_low, participant_high, created_at FROM conversations WHERE id = ?",
    )
    .bind(conversation_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(conversation_row_to_record).transpose()
}

async fn conversation_exists(
    connection: &mut SqliteConnection,
    conversation_id: &ConversationId,
) -> StorageResult<bool> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
        .bind(conversation_id.as_str())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-exists-query",
        })?;

    Ok(existing.is_some())
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("expected non-negative integer, got {value}"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}
