//! Command lines that produced each output, kept between builds.
//!
//! Changing a compiler flag changes the command line but not any input
//! timestamp; comparing against the history catches that.

use crate::action_graph::BuildAction;
use kiln_cache::{
    CacheReader, CacheResult, CacheSignature, CacheValue, CacheWriter, FileIdentity, PathTable,
    PersistentKeyedCache,
};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Signature of action history files.
pub const ACTION_HISTORY_SIGNATURE: CacheSignature = CacheSignature::new(*b"AH", 1);

/// SHA-256 of a command line, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandDigest(String);

impl CommandDigest {
    fn of(command_line: &str) -> Self {
        Self(hex::encode(Sha256::digest(command_line.as_bytes())))
    }
}

impl CacheValue for CommandDigest {
    fn collect_paths(&self, _table: &mut PathTable) {}

    fn write(&self, writer: &mut CacheWriter<'_>) -> CacheResult<()> {
        writer.write_str(&self.0)
    }

    fn read(reader: &mut CacheReader<'_>) -> CacheResult<Self> {
        reader.read_str().map(Self)
    }
}

pub struct ActionHistory {
    store: PersistentKeyedCache<CommandDigest>,
}

impl ActionHistory {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            store: PersistentKeyedCache::load(path, ACTION_HISTORY_SIGNATURE),
        }
    }

    /// Whether `item` was last produced by a different command line.
    ///
    /// Items with no recorded history count as changed.
    #[must_use]
    pub fn is_command_line_changed(&self, item: &FileIdentity, command_line: &str) -> bool {
        self.store
            .get(item)
            .is_none_or(|digest| *digest != CommandDigest::of(command_line))
    }

    /// Remember that `item` was produced by `command_line`.
    pub fn record(&mut self, item: &FileIdentity, command_line: &str) {
        let digest = CommandDigest::of(command_line);
        if self.store.get(item) != Some(&digest) {
            self.store.insert(item.clone(), digest);
        }
    }

    /// Record every output of an action that completed successfully.
    pub fn record_action(&mut self, action: &BuildAction) {
        let command_line = action.command_line();
        for item in &action.produced {
            self.record(item, &command_line);
        }
    }

    pub fn save(&mut self) {
        self.store.save();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_graph::{ActionGraph, ActionKind};
    use tempfile::TempDir;

    #[test]
    fn unknown_items_count_as_changed() {
        let tmp = TempDir::new().unwrap();
        let history = ActionHistory::load(tmp.path().join("History.bin"));
        assert!(history.is_command_line_changed(&FileIdentity::new("/obj/a.o"), "cc -c a.c"));
    }

    #[test]
    fn history_survives_a_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("History.bin");
        let object = FileIdentity::new("/obj/a.o");

        let mut graph = ActionGraph::new();
        let action = graph.add(ActionKind::Compile);
        action.command_path = PathBuf::from("cc");
        action.arguments = vec!["-O2".into(), "-c".into(), "a.c".into()];
        action.produced = vec![object.clone()];

        {
            let mut history = ActionHistory::load(&path);
            history.record_action(&graph.actions()[0]);
            assert!(history.is_dirty());
            history.save();
        }

        let history = ActionHistory::load(&path);
        assert_eq!(history.len(), 1);
        assert!(!history.is_command_line_changed(&object, "cc -O2 -c a.c"));
        assert!(history.is_command_line_changed(&object, "cc -O0 -c a.c"));
    }

    #[test]
    fn recording_the_same_command_keeps_the_history_clean() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("History.bin");
        let object = FileIdentity::new("/obj/a.o");

        let mut history = ActionHistory::load(&path);
        history.record(&object, "cc -c a.c");
        history.save();
        history.record(&object, "cc -c a.c");
        assert!(!history.is_dirty());
    }
}
