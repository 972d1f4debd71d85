//! Postgres schema, applied idempotently at startup.
//!
//! The vector side needs the pgvector extension: `message_embeddings` stores
//! half-precision 3072-dim vectors under an HNSW cosine index, and
//! `match_windows_in_guild` is the one read RPC the retrieval path calls.

pub const SCHEMA_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS channels (
    channel_id      TEXT PRIMARY KEY,
    guild_id        TEXT NOT NULL,
    category_id     TEXT,
    name            TEXT,
    type            TEXT,
    last_scanned_at TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS threads (
    thread_id       TEXT PRIMARY KEY,
    guild_id        TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    name            TEXT,
    archived        BOOLEAN NOT NULL DEFAULT FALSE,
    last_scanned_at TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS messages (
    message_id       TEXT PRIMARY KEY,
    guild_id         TEXT NOT NULL,
    category_id      TEXT,
    channel_id       TEXT NOT NULL,
    thread_id        TEXT,
    author_id        TEXT,
    content_md       TEXT,
    content_plain    TEXT,
    created_at       TIMESTAMPTZ,
    edited_at        TIMESTAMPTZ,
    deleted_at       TIMESTAMPTZ,
    mentions         JSONB,
    attachments      JSONB,
    jump_link        TEXT,
    token_count      INTEGER,
    allowed_role_ids TEXT[],
    allowed_user_ids TEXT[]
);
CREATE INDEX IF NOT EXISTS idx_messages_channel_created ON messages (channel_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_guild_created ON messages (guild_id, created_at);

CREATE TABLE IF NOT EXISTS message_windows (
    window_id   UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    guild_id    TEXT NOT NULL,
    category_id TEXT,
    channel_id  TEXT NOT NULL,
    thread_id   TEXT,
    date        DATE NOT NULL,
    window_seq  INTEGER NOT NULL,
    message_ids TEXT[] NOT NULL,
    start_at    TIMESTAMPTZ NOT NULL,
    end_at      TIMESTAMPTZ NOT NULL,
    token_est   INTEGER,
    text        TEXT,
    UNIQUE (channel_id, date, window_seq)
);
CREATE INDEX IF NOT EXISTS idx_message_windows_guild ON message_windows (guild_id);

CREATE TABLE IF NOT EXISTS message_embeddings (
    window_id  UUID PRIMARY KEY REFERENCES message_windows(window_id) ON DELETE CASCADE,
    embedding  HALFVEC(3072) NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_message_embeddings_hnsw
    ON message_embeddings USING hnsw (embedding halfvec_cosine_ops)
    WITH (m = 16, ef_construction = 64);

CREATE TABLE IF NOT EXISTS embed_queue (
    id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    window_id  UUID NOT NULL UNIQUE REFERENCES message_windows(window_id) ON DELETE CASCADE,
    priority   INTEGER NOT NULL DEFAULT 0,
    status     TEXT NOT NULL DEFAULT 'ready',
    attempts   INTEGER NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_embed_queue_ready ON embed_queue (status, priority DESC, updated_at ASC);

CREATE TABLE IF NOT EXISTS sync_operations (
    id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    guild_id     TEXT NOT NULL,
    scope        TEXT NOT NULL,
    mode         TEXT NOT NULL,
    target_ids   TEXT[],
    since        TIMESTAMPTZ,
    requested_by TEXT NOT NULL,
    status       TEXT NOT NULL DEFAULT 'queued',
    progress     JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_sync_operations_status_created ON sync_operations (status, created_at);

CREATE TABLE IF NOT EXISTS sync_cursors (
    guild_id        TEXT PRIMARY KEY,
    last_message_id TEXT,
    last_synced_at  TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS sync_chunks (
    id         BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    op_id      UUID NOT NULL REFERENCES sync_operations(id) ON DELETE CASCADE,
    target_id  TEXT NOT NULL,
    date       DATE NOT NULL,
    cursor     TEXT,
    status     TEXT NOT NULL DEFAULT 'done',
    attempts   INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE OR REPLACE FUNCTION match_windows_in_guild(
    query_embedding HALFVEC(3072),
    p_guild_id TEXT,
    p_limit INTEGER DEFAULT 200
)
RETURNS TABLE (window_id UUID, similarity DOUBLE PRECISION)
LANGUAGE sql STABLE
AS $fn$
    SELECT w.window_id,
           1 - (e.embedding <=> query_embedding) AS similarity
    FROM message_embeddings e
    JOIN message_windows w ON w.window_id = e.window_id
    WHERE w.guild_id = p_guild_id
    ORDER BY e.embedding <=> query_embedding ASC
    LIMIT p_limit;
$fn$;
"#;
