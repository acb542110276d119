pub const POSTGRES_SCHEMA: &str = r#"
-- PostgreSQL schema for fieldclusters

CREATE TABLE IF NOT EXISTS clusters (
    id BIGINT PRIMARY KEY,

    "grouping" TEXT,
    area TEXT,
    organisation TEXT,
    creator_name TEXT,
    project TEXT,
    theme TEXT,

    mosaic BOOLEAN NOT NULL DEFAULT TRUE,
    classify BOOLEAN NOT NULL DEFAULT TRUE,
    publish BOOLEAN NOT NULL DEFAULT TRUE,
    readyforsigma BOOLEAN NOT NULL DEFAULT FALSE,
    skip BOOLEAN NOT NULL DEFAULT FALSE,
    senttosigma TEXT,

    settings TEXT NOT NULL DEFAULT '{}',

    nfiles BIGINT NOT NULL DEFAULT 0,
    "datetime" TEXT,
    min_datetime TEXT,
    max_datetime TEXT,
    centroid_lon DOUBLE PRECISION,
    centroid_lat DOUBLE PRECISION
);

CREATE TABLE IF NOT EXISTS files (
    id BIGSERIAL PRIMARY KEY,
    directory TEXT NOT NULL,
    filename TEXT NOT NULL,
    filetype TEXT,
    lon DOUBLE PRECISION,
    lat DOUBLE PRECISION,
    datetimetaken TEXT,
    datetimemodified TEXT,
    cluster_id BIGINT REFERENCES clusters(id),
    CONSTRAINT files_unique UNIQUE (directory, filename)
);

CREATE INDEX IF NOT EXISTS idx_files_cluster ON files(cluster_id);
CREATE INDEX IF NOT EXISTS idx_files_datetimetaken ON files(datetimetaken);

ALTER TABLE clusters ADD COLUMN IF NOT EXISTS skip BOOLEAN NOT NULL DEFAULT FALSE;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS readyforsigma BOOLEAN NOT NULL DEFAULT FALSE;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS senttosigma TEXT;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS max_datetime TEXT;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS centroid_lon DOUBLE PRECISION;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS centroid_lat DOUBLE PRECISION;
ALTER TABLE clusters ADD COLUMN IF NOT EXISTS settings TEXT NOT NULL DEFAULT '{}';
"#;
