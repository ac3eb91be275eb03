/// File and directory names shared by every stage of the pipeline.

// Cache layout
pub const NORMALIZED_DIR: &str = "normalized";
pub const EMAILS_DIR: &str = "emails";
pub const TEXT_DIR: &str = "text";
pub const DEDUPED_DIR: &str = "deduped";
pub const OUTPUT_DIR: &str = "output";
pub const SPLITS_DIR: &str = "splits";
pub const FINAL_DIR: &str = "final";
pub const LOGS_DIR: &str = "logs";

// Artifact names
pub const ALL_DEDUPED_FILE: &str = "all_deduped.parquet";
pub const DEDUPED_CHUNKS_FILE: &str = "deduped_chunks.txt";
pub const STREAMING_EXPORT_FILE: &str = "aggregator_nicks.txt";
pub const ORIGINAL_EXPORT_FILE: &str = "aggregator_nicks_with_original.parquet";
pub const DOWNLOAD_ERROR_LOG: &str = "download_error.log";
pub const STAGE_ERROR_LOG: &str = "errors.log";
pub const CHUNK_PREFIX: &str = "chunk_";

// Column names
pub const NICK_COLUMN: &str = "nick";
pub const ORIGINAL_COLUMN: &str = "original";
pub const EMAIL_COLUMN: &str = "email";
pub const LOCAL_PART_COLUMN: &str = "local_part";
pub const DOMAIN_COLUMN: &str = "domain";

// Sizes
pub const DEFAULT_WORKERS: usize = 32;
pub const DEFAULT_SPLIT_MAX_LINES: usize = 5_000_000;
pub const DEFAULT_DEDUPE_BATCH_SIZE: usize = 10_000_000;
pub const DEFAULT_EXPORT_CHUNK_SIZE: usize = 1_000_000;
pub const DEFAULT_FINAL_CHUNK_LINES: usize = 1_000_000;
pub const PARQUET_ROW_GROUP_SIZE: usize = 1_000_000;
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Ordered canonical column names; the first match wins.
pub const CANDIDATE_COLUMNS: &[&str] = &[
    "nick",
    "nickname",
    "username",
    "user",
    "name",
    "pseudo",
    "handle",
    "forename",
    "firstname",
    "first_name",
    "surname",
    "lastname",
    "last_name",
    "fullname",
    "full_name",
    "display_name",
    "displayname",
];

pub fn default_data_file_exts() -> Vec<String> {
    [".txt", ".csv", ".parquet", ".json", ".tsv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Extensions the splitter treats as line oriented text.
pub const SPLIT_EXTENSIONS: &[&str] = &["txt", "csv", "tsv"];

/// Files and directories kept by a strict cleanup.
pub const STRICT_CLEAN_ALLOW_LIST: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "README.md",
    "config.toml",
    "src",
    "tests",
    ".git",
    ".github",
];

/// Formats a chunk file name, e.g. `chunk_000007.txt`.
pub fn chunk_file_name(index: usize) -> String {
    format!("{}{:06}.txt", CHUNK_PREFIX, index)
}

/// Parses the numeric index out of a `chunk_NNN.txt` file name.
pub fn chunk_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(".txt")?
        .parse()
        .ok()
}
