// -
// Storage namespaces

/// Globals keyspace entries
pub(crate) const GLOBAL_HIGHEST_TARGET_ID: &str = "_highest_target_id";
pub(crate) const GLOBAL_LAST_REMOTE_SNAPSHOT_VERSION: &str = "_last_remote_snapshot_version";
pub(crate) const GLOBAL_HIGHEST_SEQUENCE_NUMBER: &str = "_highest_sequence_number";
pub(crate) const GLOBAL_REMOTE_DOCUMENT_BYTES: &str = "_remote_document_bytes";
pub(crate) const GLOBAL_FIELD_INDEXES: &str = "_field_indexes";

/// Per-user globals, suffixed with the user key
pub(crate) const GLOBAL_NEXT_BATCH_ID_PREFIX: &str = "_next_batch_id/";
pub(crate) const GLOBAL_STREAM_TOKEN_PREFIX: &str = "_stream_token/";

// -
// Protocol

/// Special field path that refers to the document key
pub const KEY_FIELD_NAME: &str = "__name__";

/// Length of generated document ids
pub(crate) const AUTO_ID_LENGTH: usize = 20;

pub(crate) const AUTO_ID_ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

/// Request header carrying the bearer credential
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Request header identifying the client instance
pub const CLIENT_ID_HEADER: &str = "x-docsync-client";

/// Unary endpoint used for one-shot document reads
pub const BATCH_GET_DOCUMENTS_ENDPOINT: &str = "BatchGetDocuments";
