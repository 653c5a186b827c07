//! Cache command: inspect cache files

use super::CommandResult;
use chrono::{DateTime, Utc};
use kiln_build::action_history::ACTION_HISTORY_SIGNATURE;
use kiln_cache::{
    CacheHeader, CacheSignature, FLATTENED_CACHE_SIGNATURE, INCLUDE_CACHE_SIGNATURE, inspect,
};
use std::path::Path;

const KNOWN_CACHES: [(CacheSignature, &str); 3] = [
    (INCLUDE_CACHE_SIGNATURE, "include resolution cache"),
    (FLATTENED_CACHE_SIGNATURE, "flattened include cache"),
    (ACTION_HISTORY_SIGNATURE, "action history"),
];

pub fn info(path: &Path) -> CommandResult<()> {
    let header = inspect(path)?;
    print!("{}", describe(path, &header));
    Ok(())
}

/// Human-readable description of a cache header.
pub fn describe(path: &Path, header: &CacheHeader) -> String {
    let kind = KNOWN_CACHES
        .iter()
        .find(|(signature, _)| *signature == header.signature)
        .map_or("unknown or outdated format", |(_, name)| *name);
    let written = DateTime::<Utc>::from_timestamp(
        header.created.unix_seconds(),
        header.created.nanoseconds(),
    )
    .map_or_else(|| "unknown".to_string(), |time| time.to_rfc3339());

    let mut text = format!("{}\n", path.display());
    text.push_str(&format!("  Signature: {} ({kind})\n", header.signature));
    text.push_str(&format!("  Written:   {written}\n"));
    text.push_str(&format!("  Entries:   {}\n", header.entry_count));
    text.push_str(&format!("  Paths:     {}\n", header.path_count));
    if header.locked {
        text.push_str("  Locked: the last build did not save it; it will be ignored\n");
    }
    text
}
