//! Workspace-wide constants.

/// Application name, used for platform directories.
pub const APP_NAME: &str = "modbuild";

/// Default manifest file name looked up in the working directory.
pub const MANIFEST_FILENAME: &str = "modbuild.toml";

/// Length of truncated object hashes (cache keys).
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Bumped whenever the set or encoding of cache key inputs changes.
pub const KEY_FORMAT_VERSION: u32 = 1;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "MODBUILD_CACHE";

/// Environment variable overriding the default worker count.
pub const PARALLELISM_ENV: &str = "MODBUILD_PARALLELISM";

/// Name of the variant requested when the manifest declares none.
pub const DEFAULT_VARIANT_NAME: &str = "default";
