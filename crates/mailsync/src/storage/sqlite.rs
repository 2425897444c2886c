//! SQLite-based record storage with zstd-compressed message bodies

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::RecordStore;
use crate::models::{
    AttachmentRecord, ContentHash, CursorState, EmailAddress, MessageId, MessageRecord,
    ResumeMarker, ScopeKey, SyncCursor, ThreadId,
};

/// zstd level for bodies (good balance of speed vs compression)
const COMPRESSION_LEVEL: i32 = 3;

/// How long a writer waits on a locked database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Address header kinds, in storage order
const ADDRESS_KINDS: [&str; 4] = ["from", "to", "cc", "bcc"];

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Canonical message records with zstd-compressed bodies
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                date TEXT NOT NULL,          -- RFC 3339, original offset
                timestamp INTEGER NOT NULL,  -- ms since epoch
                body_text BLOB NOT NULL,     -- zstd compressed
                body_html BLOB,              -- zstd compressed
                raw_size INTEGER NOT NULL DEFAULT 0,
                source_ref TEXT NOT NULL,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                ingested_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX idx_messages_thread_id ON messages(thread_id);
            CREATE INDEX idx_messages_timestamp ON messages(timestamp);

            -- Addresses per header (from/to/cc/bcc), ordered
            CREATE TABLE message_addresses (
                message_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT,
                email TEXT NOT NULL,
                PRIMARY KEY (message_id, kind, position),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE TABLE message_labels (
                message_id TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (message_id, label),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_message_labels_label ON message_labels(label);

            -- Attachment records; many may share one blob
            CREATE TABLE attachments (
                message_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                storage_path TEXT NOT NULL,
                PRIMARY KEY (message_id, content_hash, filename)
            );

            CREATE INDEX idx_attachments_hash ON attachments(content_hash);

            -- Incremental sync position per scope
            CREATE TABLE sync_cursors (
                mailbox TEXT NOT NULL,
                filter TEXT NOT NULL,
                state TEXT NOT NULL,
                token TEXT,
                watermark TEXT,
                advanced_at TEXT,
                covered INTEGER NOT NULL DEFAULT 0,
                sync_version INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (mailbox, filter)
            );
            "#,
        ),
        // Migration 2: Resume checkpoints and enrichment-owned columns
        M::up(
            r#"
            -- Full extraction checkpoint (JSON ResumeMarker)
            ALTER TABLE sync_cursors ADD COLUMN resume TEXT;

            -- Written by downstream enrichment, never by message upserts
            ALTER TABLE messages ADD COLUMN enrichment TEXT;
            ALTER TABLE messages ADD COLUMN enriched_at TEXT;
            "#,
        ),
        // Migration 3: When the last run over a scope finished
        M::up("ALTER TABLE sync_cursors ADD COLUMN completed_at TEXT;"),
    ])
}

/// SQLite-based record storage
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open (or create) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers going during writes; NORMAL sync is safe with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        debug!("[STORE] Opened {:?}", db_path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Write one message inside an open transaction
    fn write_message(conn: &Connection, record: &MessageRecord) -> Result<()> {
        let body_text = zstd::encode_all(record.body_text.as_bytes(), COMPRESSION_LEVEL)
            .context("Failed to compress body_text")?;
        let body_html = record
            .body_html
            .as_ref()
            .map(|html| zstd::encode_all(html.as_bytes(), COMPRESSION_LEVEL))
            .transpose()
            .context("Failed to compress body_html")?;
        let now = Utc::now().to_rfc3339();
        let id = record.id.as_str();
        let first_source: Option<String> = conn
            .query_row("SELECT source_ref FROM messages WHERE id = ?", [id], |row| row.get(0))
            .optional()?;

        // ON CONFLICT DO UPDATE keeps enrichment columns, ingested_at and the
        // first delivery's thread_id and source_ref
        conn.execute(
            "INSERT INTO messages
             (id, thread_id, subject, date, timestamp, body_text, body_html,
              raw_size, source_ref, has_attachments, ingested_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                date = excluded.date,
                timestamp = excluded.timestamp,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                raw_size = excluded.raw_size,
                has_attachments = excluded.has_attachments,
                updated_at = excluded.updated_at",
            params![
                id,
                record.thread_id.as_str(),
                record.subject,
                record.date.to_rfc3339(),
                record.timestamp_millis(),
                body_text,
                body_html,
                record.raw_size as i64,
                record.source_ref,
                record.has_attachments,
                now,
                now,
            ],
        )?;

        conn.execute("DELETE FROM message_addresses WHERE message_id = ?", [id])?;
        // Labels from another transport are merged in, never replaced
        if first_source.is_none_or(|source| source == record.source_ref) {
            conn.execute("DELETE FROM message_labels WHERE message_id = ?", [id])?;
        }

        let mut address_stmt = conn.prepare_cached(
            "INSERT INTO message_addresses (message_id, kind, position, name, email)
             VALUES (?, ?, ?, ?, ?)",
        )?;
        for (kind, addresses) in ADDRESS_KINDS
            .iter()
            .zip([&record.from, &record.to, &record.cc, &record.bcc])
        {
            for (i, addr) in addresses.iter().enumerate() {
                address_stmt.execute(params![id, kind, i as i64, addr.name, addr.email])?;
            }
        }

        let mut label_stmt =
            conn.prepare_cached("INSERT OR IGNORE INTO message_labels (message_id, label) VALUES (?, ?)")?;
        for label in &record.labels {
            label_stmt.execute(params![id, label])?;
        }

        Ok(())
    }

    fn write_attachment(conn: &Connection, record: &AttachmentRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO attachments
             (message_id, content_hash, filename, content_type, size, storage_path)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, content_hash, filename) DO UPDATE SET
                content_type = excluded.content_type,
                size = excluded.size,
                storage_path = excluded.storage_path",
            params![
                record.message_id.as_str(),
                record.content_hash.as_str(),
                record.filename,
                record.content_type,
                record.size as i64,
                record.storage_path,
            ],
        )?;
        Ok(())
    }

    fn load_addresses(conn: &Connection, id: &str, kind: &str) -> Result<Vec<EmailAddress>> {
        let mut stmt = conn.prepare_cached(
            "SELECT name, email FROM message_addresses
             WHERE message_id = ? AND kind = ?
             ORDER BY position",
        )?;
        let addresses = stmt
            .query_map(params![id, kind], |row| {
                Ok(EmailAddress {
                    name: row.get(0)?,
                    email: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(addresses)
    }

    fn load_labels(conn: &Connection, id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached("SELECT label FROM message_labels WHERE message_id = ?")?;
        let labels = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(labels)
    }
}

fn decompress(data: &[u8], what: &str) -> Result<String> {
    let bytes = zstd::decode_all(data).with_context(|| format!("Failed to decompress {}", what))?;
    String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", what))
}

fn parse_utc(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp {:?}", v))
        })
        .transpose()
}

impl RecordStore for SqliteRecordStore {
    fn upsert_message(&self, record: &MessageRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::write_message(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_attachment(&self, record: &AttachmentRecord) -> Result<()> {
        let conn = self.conn()?;
        Self::write_attachment(&conn, record)
    }

    fn commit_message(&self, record: &MessageRecord, attachments: &[AttachmentRecord]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for attachment in attachments {
            Self::write_attachment(&tx, attachment)?;
        }
        Self::write_message(&tx, record)?;
        tx.commit()
            .with_context(|| format!("Failed to commit message {}", record.id))?;
        Ok(())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT thread_id, subject, date, body_text, body_html, raw_size,
                        source_ref, has_attachments
                 FROM messages WHERE id = ?",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((thread_id, subject, date, body_text, body_html, raw_size, source_ref, has_attachments)) =
            row
        else {
            return Ok(None);
        };

        let date = DateTime::parse_from_rfc3339(&date)
            .with_context(|| format!("Invalid date for message {}", id))?;
        let body_text = decompress(&body_text, "body_text")?;
        let body_html = body_html
            .map(|data| decompress(&data, "body_html"))
            .transpose()?;

        let mut addresses = ADDRESS_KINDS
            .iter()
            .map(|kind| Self::load_addresses(&conn, id.as_str(), kind))
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let mut next = || addresses.next().unwrap_or_default();
        let (from, to, cc, bcc) = (next(), next(), next(), next());

        Ok(Some(
            MessageRecord::builder(id.clone(), ThreadId::new(thread_id), date)
                .from(from)
                .to(to)
                .cc(cc)
                .bcc(bcc)
                .subject(subject)
                .body_text(body_text)
                .body_html(body_html)
                .labels(Self::load_labels(&conn, id.as_str())?)
                .raw_size(raw_size as u64)
                .source_ref(source_ref)
                .has_attachments(has_attachments)
                .build(),
        ))
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?)",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn count_messages(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn list_attachments(&self, id: &MessageId) -> Result<Vec<AttachmentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT content_hash, filename, content_type, size, storage_path
             FROM attachments WHERE message_id = ?
             ORDER BY filename, content_hash",
        )?;
        let rows = stmt
            .query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(hash, filename, content_type, size, storage_path)| {
                Ok(AttachmentRecord {
                    message_id: id.clone(),
                    content_hash: ContentHash::from_hex(&hash)
                        .ok_or_else(|| anyhow!("Invalid content hash {:?}", hash))?,
                    filename,
                    content_type,
                    size: size as u64,
                    storage_path,
                })
            })
            .collect()
    }

    fn load_cursor(&self, scope: &ScopeKey) -> Result<Option<SyncCursor>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT state, token, watermark, advanced_at, covered, resume, sync_version,
                        completed_at
                 FROM sync_cursors WHERE mailbox = ? AND filter = ?",
                params![scope.mailbox, scope.filter],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((state, token, watermark, advanced_at, covered, resume, sync_version, completed_at)) =
            row
        else {
            return Ok(None);
        };

        let resume: Option<ResumeMarker> = resume
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .context("Failed to parse resume marker")?;

        Ok(Some(SyncCursor {
            scope: scope.clone(),
            state: CursorState::parse(&state)
                .ok_or_else(|| anyhow!("Unknown cursor state {:?}", state))?,
            token,
            watermark: parse_utc(watermark)?,
            advanced_at: parse_utc(advanced_at)?,
            completed_at: parse_utc(completed_at)?,
            covered: covered as u64,
            resume,
            sync_version: sync_version as u32,
        }))
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let resume = cursor
            .resume
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize resume marker")?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_cursors
             (mailbox, filter, state, token, watermark, advanced_at, completed_at, covered,
              resume, sync_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(mailbox, filter) DO UPDATE SET
                state = excluded.state,
                token = excluded.token,
                watermark = excluded.watermark,
                advanced_at = excluded.advanced_at,
                completed_at = excluded.completed_at,
                covered = excluded.covered,
                resume = excluded.resume,
                sync_version = excluded.sync_version",
            params![
                cursor.scope.mailbox,
                cursor.scope.filter,
                cursor.state.as_str(),
                cursor.token,
                cursor.watermark.map(|w| w.to_rfc3339()),
                cursor.advanced_at.map(|a| a.to_rfc3339()),
                cursor.completed_at.map(|c| c.to_rfc3339()),
                cursor.covered as i64,
                resume,
                cursor.sync_version,
            ],
        )?;
        Ok(())
    }

    fn delete_cursor(&self, scope: &ScopeKey) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM sync_cursors WHERE mailbox = ? AND filter = ?",
            params![scope.mailbox, scope.filter],
        )?;
        Ok(())
    }
}
