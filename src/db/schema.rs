pub const SCHEMA: &str = r#"
-- Users: identity records
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT 'google',
    provider_id TEXT,
    public_slug TEXT UNIQUE,
    created_at TEXT NOT NULL
);

-- Shared folders: drive folders under sync
CREATE TABLE IF NOT EXISTS shared_folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    drive_folder_id TEXT NOT NULL,
    name TEXT NOT NULL,
    webhook_token TEXT NOT NULL UNIQUE,
    sync_status TEXT NOT NULL DEFAULT 'idle',   -- 'idle', 'syncing', 'error'
    last_error TEXT,
    last_synced_at TEXT,

    -- OAuth material for the owning account
    access_token TEXT,
    refresh_token TEXT,
    token_expiry TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (owner_id, drive_folder_id),
    FOREIGN KEY (owner_id) REFERENCES users(id) ON DELETE CASCADE
);

-- Read grants; ownership is not recorded here
CREATE TABLE IF NOT EXISTS user_folder_access (
    user_id INTEGER NOT NULL,
    folder_id INTEGER NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, folder_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (folder_id) REFERENCES shared_folders(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_folder_access_folder ON user_folder_access(folder_id);

-- Photos ingested from shared folders
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shared_folder_id INTEGER NOT NULL,
    drive_file_id TEXT NOT NULL,
    file_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    drive_folder_path TEXT NOT NULL DEFAULT '',
    face_status TEXT NOT NULL DEFAULT 'pending',  -- 'pending', 'processing', 'completed', 'failed'
    face_count INTEGER NOT NULL DEFAULT 0,
    face_error TEXT,
    is_trashed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,              -- last face_status transition
    UNIQUE (shared_folder_id, drive_file_id),
    FOREIGN KEY (shared_folder_id) REFERENCES shared_folders(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photos_face_status ON photos(face_status, created_at);
CREATE INDEX IF NOT EXISTS idx_photos_folder_path ON photos(shared_folder_id, drive_folder_path);
CREATE INDEX IF NOT EXISTS idx_photos_processing ON photos(updated_at) WHERE face_status = 'processing';

-- People: named face clusters owned by a user
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    face_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- Detected faces with embeddings (little-endian f32 blob)
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    person_id INTEGER,
    bbox_x REAL NOT NULL,
    bbox_y REAL NOT NULL,
    bbox_w REAL NOT NULL,
    bbox_h REAL NOT NULL,
    confidence REAL NOT NULL,
    embedding BLOB NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);

-- Folder ingestion runs
CREATE TABLE IF NOT EXISTS sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    folder_id INTEGER NOT NULL,
    job_type TEXT NOT NULL,               -- 'drive_sync', 'face_process'
    status TEXT NOT NULL DEFAULT 'pending', -- 'pending', 'running', 'completed', 'failed', 'cancelled'
    total_items INTEGER NOT NULL DEFAULT 0,
    processed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (folder_id) REFERENCES shared_folders(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_sync_jobs_folder_status ON sync_jobs(folder_id, status);
CREATE INDEX IF NOT EXISTS idx_sync_jobs_user_type ON sync_jobs(user_id, job_type, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_one_active ON sync_jobs(folder_id)
    WHERE status IN ('pending', 'running');

-- Append-only audit trail, pruned by age
CREATE TABLE IF NOT EXISTS activity_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    folder_id INTEGER NOT NULL,
    activity_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',   -- JSON
    created_at TEXT NOT NULL,
    FOREIGN KEY (folder_id) REFERENCES shared_folders(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_activity_folder ON activity_logs(folder_id, created_at);
"#;
