pub const SCHEMA: &str = r#"
-- Clusters: one row per mission-level grouping
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY,

    -- Descriptive fields
    "grouping" TEXT,
    area TEXT,
    organisation TEXT,
    creator_name TEXT,
    project TEXT,
    theme TEXT,

    -- Workflow flags
    mosaic INTEGER NOT NULL DEFAULT 1,
    classify INTEGER NOT NULL DEFAULT 1,
    publish INTEGER NOT NULL DEFAULT 1,
    readyforsigma INTEGER NOT NULL DEFAULT 0,
    skip INTEGER NOT NULL DEFAULT 0,
    senttosigma TEXT,

    -- Processing configuration, JSON object copied verbatim on split
    settings TEXT NOT NULL DEFAULT '{}',

    -- Derived from member files
    nfiles INTEGER NOT NULL DEFAULT 0,
    "datetime" TEXT,
    min_datetime TEXT,
    max_datetime TEXT,
    centroid_lon REAL,
    centroid_lat REAL
);

-- Files: one row per uploaded asset
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    directory TEXT NOT NULL,
    filename TEXT NOT NULL,
    filetype TEXT,
    lon REAL,
    lat REAL,
    datetimetaken TEXT,
    datetimemodified TEXT,
    cluster_id INTEGER REFERENCES clusters(id),
    UNIQUE (directory, filename)
);

CREATE INDEX IF NOT EXISTS idx_files_cluster ON files(cluster_id);
CREATE INDEX IF NOT EXISTS idx_files_datetimetaken ON files(datetimetaken);
"#;

/// Additive migrations for databases created before these columns existed.
/// Each is attempted once per start; "duplicate column" failures are expected.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE clusters ADD COLUMN skip INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE clusters ADD COLUMN readyforsigma INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE clusters ADD COLUMN senttosigma TEXT",
    "ALTER TABLE clusters ADD COLUMN max_datetime TEXT",
    "ALTER TABLE clusters ADD COLUMN centroid_lon REAL",
    "ALTER TABLE clusters ADD COLUMN centroid_lat REAL",
    "ALTER TABLE clusters ADD COLUMN settings TEXT NOT NULL DEFAULT '{}'",
];
