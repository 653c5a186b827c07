//! Grouping of a module's source files into unity compilation units.
//!
//! Files are sorted, then accumulated into units until a unit's size passes
//! the split threshold. Files in the working set are compiled on their own,
//! but their size is still counted against the unit they would have joined.
//! Editing a file therefore moves it out of its unit without reshuffling the
//! files after it.

use crate::config::UnityConfig;
use crate::error::{BuildError, BuildResult};
use crate::working_set::WorkingSetOracle;
use kiln_cache::{FileItem, FlattenedIncludeCache};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BANNER: &str = "// This file is automatically generated at build time by kiln.\n\
                      // Do not edit; it is rewritten whenever the module's sources change.\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Generated file including several sources.
    Unity,
    /// A source compiled by itself.
    Standalone,
}

/// One translation unit handed to the compiler.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    /// The generated unity file, or the source itself for standalone units.
    pub path: PathBuf,
    pub kind: UnitKind,
    pub members: Vec<Arc<FileItem>>,
    /// Bytes of the members.
    pub cumulative_bytes: u64,
    /// Bytes of the members plus working-set files that were split out.
    pub virtual_bytes: u64,
}

impl CompilationUnit {
    fn standalone(file: &Arc<FileItem>) -> Self {
        let length = file.length();
        Self {
            path: file.path().to_path_buf(),
            kind: UnitKind::Standalone,
            members: vec![Arc::clone(file)],
            cumulative_bytes: length,
            virtual_bytes: length,
        }
    }

    #[must_use]
    pub fn member_names(&self) -> Vec<String> {
        self.members
            .iter()
            .map(|m| m.identity().file_name())
            .collect()
    }
}

/// Result of planning one module.
#[derive(Debug, Clone, Default)]
pub struct UnityPlan {
    /// Unity units first, then standalone units.
    pub units: Vec<CompilationUnit>,
    /// Working-set exclusion was active for this module.
    pub adaptive: bool,
    /// The whole module went into one unit.
    pub single_unit: bool,
}

impl UnityPlan {
    pub fn unity_units(&self) -> impl Iterator<Item = &CompilationUnit> {
        self.units.iter().filter(|u| u.kind == UnitKind::Unity)
    }

    pub fn standalone_units(&self) -> impl Iterator<Item = &CompilationUnit> {
        self.units.iter().filter(|u| u.kind == UnitKind::Standalone)
    }
}

#[derive(Default)]
struct PendingUnit {
    members: Vec<Arc<FileItem>>,
    cumulative_bytes: u64,
    virtual_bytes: u64,
}

/// Accumulates files and closes units at the split threshold.
struct UnitBuilder {
    split_bytes: Option<u64>,
    current: PendingUnit,
    closed: Vec<PendingUnit>,
}

impl UnitBuilder {
    fn new(split_bytes: Option<u64>) -> Self {
        Self {
            split_bytes,
            current: PendingUnit::default(),
            closed: Vec::new(),
        }
    }

    fn add_file(&mut self, file: Arc<FileItem>, length: u64) {
        self.current.members.push(file);
        self.current.cumulative_bytes += length;
        self.current.virtual_bytes += length;
        self.close_if_full();
    }

    /// Count `length` against the current unit without adding a member.
    fn add_virtual(&mut self, length: u64) {
        self.current.virtual_bytes += length;
        self.close_if_full();
    }

    fn close_if_full(&mut self) {
        if self
            .split_bytes
            .is_some_and(|split| self.current.virtual_bytes > split)
        {
            self.close();
        }
    }

    fn close(&mut self) {
        let unit = std::mem::take(&mut self.current);
        if !unit.members.is_empty() {
            self.closed.push(unit);
        }
    }

    fn finish(mut self) -> Vec<PendingUnit> {
        self.close();
        self.closed
    }
}

pub struct UnityAggregator<'a> {
    config: &'a UnityConfig,
    working_set: &'a dyn WorkingSetOracle,
}

impl<'a> UnityAggregator<'a> {
    pub fn new(config: &'a UnityConfig, working_set: &'a dyn WorkingSetOracle) -> Self {
        Self {
            config,
            working_set,
        }
    }

    /// Group `files` of `module` into units placed in `output_dir`.
    ///
    /// The result depends only on the set of files, their sizes and the
    /// working set, never on input order.
    pub fn plan(&self, module: &str, output_dir: &Path, files: &[Arc<FileItem>]) -> UnityPlan {
        let mut sorted: Vec<Arc<FileItem>> = files.to_vec();
        sorted.sort_by_cached_key(|file| file.identity().key().to_lowercase());
        sorted.dedup_by(|a, b| a.identity() == b.identity());

        let (wrappers, candidates): (Vec<_>, Vec<_>) = sorted
            .into_iter()
            .partition(|file| self.is_always_standalone(file));

        let mut adaptive = self.config.adaptive;
        if adaptive
            && !candidates.is_empty()
            && candidates
                .iter()
                .all(|file| self.working_set.contains(file.identity()))
        {
            info!(
                "All {} source file(s) of {} are in the working set; adaptive unity disabled",
                candidates.len(),
                module
            );
            adaptive = false;
        }

        let total_bytes: u64 = candidates.iter().map(|file| file.length()).sum();
        let single_unit =
            self.config.use_pch && total_bytes < self.config.split_bytes.saturating_mul(2);

        let mut builder = UnitBuilder::new((!single_unit).then_some(self.config.split_bytes));
        let mut split_out = Vec::new();
        for file in candidates {
            let length = file.length();
            if adaptive && self.working_set.contains(file.identity()) {
                debug!("{} is in the working set, compiling it alone", file.path().display());
                builder.add_virtual(length);
                split_out.push(file);
            } else {
                builder.add_file(file, length);
            }
        }

        let groups = builder.finish();
        let count = groups.len();
        let mut units: Vec<CompilationUnit> = groups
            .into_iter()
            .enumerate()
            .map(|(index, group)| CompilationUnit {
                path: output_dir.join(unit_file_name(module, index, count)),
                kind: UnitKind::Unity,
                members: group.members,
                cumulative_bytes: group.cumulative_bytes,
                virtual_bytes: group.virtual_bytes,
            })
            .collect();
        units.extend(split_out.iter().map(CompilationUnit::standalone));
        units.extend(wrappers.iter().map(CompilationUnit::standalone));

        debug!(
            "{}: {} unity unit(s), {} standalone, {} bytes",
            module,
            count,
            units.len() - count,
            total_bytes
        );

        UnityPlan {
            units,
            adaptive,
            single_unit,
        }
    }

    /// Write every unity unit of `plan` whose content changed.
    ///
    /// Returns the files that were (re)written.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::Io` if a unit cannot be written.
    pub fn write_units(&self, plan: &UnityPlan, module_dir: &Path) -> BuildResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for unit in plan.unity_units() {
            let contents = self.unit_contents(unit, module_dir);
            if std::fs::read(&unit.path).is_ok_and(|existing| existing == contents.as_bytes()) {
                debug!("{} is unchanged", unit.path.display());
                continue;
            }
            if let Some(parent) = unit.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
            }
            std::fs::write(&unit.path, contents).map_err(|e| BuildError::io(&unit.path, e))?;
            written.push(unit.path.clone());
        }
        Ok(written)
    }

    /// Text of a generated unity file.
    #[must_use]
    pub fn unit_contents(&self, unit: &CompilationUnit, module_dir: &Path) -> String {
        let mut contents = String::from(BANNER);
        contents.push('\n');
        for member in &unit.members {
            let path = if self.config.relative_includes {
                member.path().strip_prefix(module_dir).unwrap_or(member.path())
            } else {
                member.path()
            };
            let include = path.to_string_lossy().replace('\\', "/");
            contents.push_str(&format!("#include \"{include}\"\n"));
        }
        contents
    }

    fn is_always_standalone(&self, file: &FileItem) -> bool {
        self.config
            .standalone_suffixes
            .iter()
            .any(|suffix| file.identity().has_suffix(suffix))
    }
}

/// Drop flattened include entries of files now compiled through a unity
/// unit. Returns how many entries were removed.
pub fn forget_absorbed_files(plan: &UnityPlan, flattened: &mut FlattenedIncludeCache) -> usize {
    let absorbed: HashSet<_> = plan
        .unity_units()
        .flat_map(|unit| unit.members.iter().map(|m| m.identity().clone()))
        .collect();
    absorbed
        .iter()
        .filter(|identity| flattened.remove_dependencies_for_file(identity))
        .count()
}

fn unit_file_name(module: &str, index: usize, count: usize) -> String {
    if count == 1 {
        format!("Module.{module}.cpp")
    } else {
        format!("Module.{module}.{}_of_{count}.cpp", index + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::working_set::EmptyWorkingSet;
    use kiln_cache::{FileIdentity, FileRegistry};
    use tempfile::TempDir;

    const KB: u64 = 1024;

    struct Editing(HashSet<FileIdentity>);

    impl WorkingSetOracle for Editing {
        fn contains(&self, file: &FileIdentity) -> bool {
            self.0.contains(file)
        }
    }

    struct Fixture {
        dir: TempDir,
        registry: FileRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                registry: FileRegistry::new(),
            }
        }

        fn source(&self, name: &str, bytes: u64) -> Arc<FileItem> {
            let path = self.dir.path().join(name);
            std::fs::write(&path, vec![b' '; usize::try_from(bytes).unwrap()]).unwrap();
            self.registry.item(path)
        }

        fn five_files(&self) -> Vec<Arc<FileItem>> {
            ["A.cpp", "B.cpp", "C.cpp", "D.cpp", "E.cpp"]
                .into_iter()
                .map(|name| self.source(name, 100 * KB))
                .collect()
        }

        fn editing(&self, names: &[&str]) -> Editing {
            Editing(
                names
                    .iter()
                    .map(|name| FileIdentity::new(self.dir.path().join(name)))
                    .collect(),
            )
        }
    }

    fn config(split_bytes: u64) -> UnityConfig {
        UnityConfig {
            split_bytes,
            ..UnityConfig::default()
        }
    }

    fn unity_groups(plan: &UnityPlan) -> Vec<Vec<String>> {
        plan.unity_units().map(CompilationUnit::member_names).collect()
    }

    fn standalone_names(plan: &UnityPlan) -> Vec<String> {
        plan.standalone_units()
            .flat_map(CompilationUnit::member_names)
            .collect()
    }

    #[test]
    fn five_files_split_at_threshold() {
        let fx = Fixture::new();
        let config = config(250 * KB);
        let aggregator = UnityAggregator::new(&config, &EmptyWorkingSet);

        let plan = aggregator.plan("Engine", fx.dir.path(), &fx.five_files());

        assert_eq!(
            unity_groups(&plan),
            vec![vec!["A.cpp", "B.cpp", "C.cpp"], vec!["D.cpp", "E.cpp"]]
        );
        assert!(standalone_names(&plan).is_empty());
        assert!(!plan.single_unit);
        assert!(plan.units[0].path.ends_with("Module.Engine.1_of_2.cpp"));
        assert!(plan.units[1].path.ends_with("Module.Engine.2_of_2.cpp"));
        assert_eq!(plan.units[0].cumulative_bytes, 300 * KB);
    }

    #[test]
    fn working_set_file_keeps_its_place() {
        let fx = Fixture::new();
        let config = config(250 * KB);
        let editing = fx.editing(&["C.cpp"]);
        let aggregator = UnityAggregator::new(&config, &editing);

        let plan = aggregator.plan("Engine", fx.dir.path(), &fx.five_files());

        assert!(plan.adaptive);
        assert_eq!(
            unity_groups(&plan),
            vec![vec!["A.cpp", "B.cpp"], vec!["D.cpp", "E.cpp"]]
        );
        assert_eq!(standalone_names(&plan), vec!["C.cpp"]);

        let first = &plan.units[0];
        assert_eq!(first.cumulative_bytes, 200 * KB);
        assert_eq!(first.virtual_bytes, 300 * KB);
    }

    #[test]
    fn editing_a_file_does_not_reshuffle_later_units() {
        let fx = Fixture::new();
        let files = fx.five_files();
        let config = config(250 * KB);

        let before = UnityAggregator::new(&config, &EmptyWorkingSet).plan("M", fx.dir.path(), &files);
        let editing = fx.editing(&["B.cpp"]);
        let after = UnityAggregator::new(&config, &editing).plan("M", fx.dir.path(), &files);

        assert_eq!(unity_groups(&before)[1], unity_groups(&after)[1]);
        assert_eq!(unity_groups(&after)[0], vec!["A.cpp", "C.cpp"]);
    }

    #[test]
    fn full_working_set_disables_adaptive_exclusion() {
        let fx = Fixture::new();
        let files = fx.five_files();
        let config = config(250 * KB);
        let editing = fx.editing(&["A.cpp", "B.cpp", "C.cpp", "D.cpp", "E.cpp"]);

        let plan = UnityAggregator::new(&config, &editing).plan("M", fx.dir.path(), &files);

        assert!(!plan.adaptive);
        assert!(standalone_names(&plan).is_empty());
        assert_eq!(
            unity_groups(&plan),
            vec![vec!["A.cpp", "B.cpp", "C.cpp"], vec!["D.cpp", "E.cpp"]]
        );
    }

    #[test]
    fn small_module_with_pch_is_one_unit() {
        let fx = Fixture::new();
        let files = vec![fx.source("a.cpp", 10 * KB), fx.source("b.cpp", 10 * KB)];

        let with_pch = config(15 * KB);
        let plan = UnityAggregator::new(&with_pch, &EmptyWorkingSet).plan("Small", fx.dir.path(), &files);
        assert!(plan.single_unit);
        assert_eq!(unity_groups(&plan), vec![vec!["a.cpp", "b.cpp"]]);
        assert!(plan.units[0].path.ends_with("Module.Small.cpp"));

        let without_pch = UnityConfig {
            use_pch: false,
            ..config(15 * KB)
        };
        let plan = UnityAggregator::new(&without_pch, &EmptyWorkingSet).plan("Small", fx.dir.path(), &files);
        assert!(!plan.single_unit);
        assert_eq!(unity_groups(&plan), vec![vec!["a.cpp", "b.cpp"]]);
        assert_eq!(plan.unity_units().count(), 1);
    }

    #[test]
    fn generated_wrappers_are_never_merged() {
        let fx = Fixture::new();
        let files = vec![
            fx.source("Widget.cpp", KB),
            fx.source("Module.init.gen.cpp", KB),
            fx.source("Other.cpp", KB),
        ];
        let config = UnityConfig::default();

        let plan = UnityAggregator::new(&config, &EmptyWorkingSet).plan("UI", fx.dir.path(), &files);

        assert_eq!(unity_groups(&plan), vec![vec!["Other.cpp", "Widget.cpp"]]);
        assert_eq!(standalone_names(&plan), vec!["Module.init.gen.cpp"]);
    }

    #[test]
    fn no_sources_no_units() {
        let fx = Fixture::new();
        let config = UnityConfig::default();
        let plan = UnityAggregator::new(&config, &EmptyWorkingSet).plan("Empty", fx.dir.path(), &[]);
        assert!(plan.units.is_empty());
    }

    #[test]
    fn plan_ignores_input_order_and_case() {
        let fx = Fixture::new();
        let files = vec![
            fx.source("beta.cpp", 200 * KB),
            fx.source("Alpha.cpp", 200 * KB),
            fx.source("gamma.cpp", 200 * KB),
        ];
        let mut reversed = files.clone();
        reversed.reverse();
        let config = config(250 * KB);
        let aggregator = UnityAggregator::new(&config, &EmptyWorkingSet);

        let a = aggregator.plan("M", fx.dir.path(), &files);
        let b = aggregator.plan("M", fx.dir.path(), &reversed);

        assert_eq!(unity_groups(&a), unity_groups(&b));
        assert_eq!(unity_groups(&a), vec![vec!["Alpha.cpp", "beta.cpp"], vec!["gamma.cpp"]]);
    }

    #[test]
    fn units_are_rewritten_only_when_changed() {
        let fx = Fixture::new();
        let files = vec![fx.source("a.cpp", KB), fx.source("b.cpp", KB)];
        let out = fx.dir.path().join("Intermediate");
        let config = UnityConfig {
            relative_includes: true,
            ..UnityConfig::default()
        };
        let aggregator = UnityAggregator::new(&config, &EmptyWorkingSet);
        let plan = aggregator.plan("Core", &out, &files);

        let written = aggregator.write_units(&plan, fx.dir.path()).unwrap();
        assert_eq!(written, vec![out.join("Module.Core.cpp")]);
        let text = std::fs::read_to_string(&written[0]).unwrap();
        assert!(text.starts_with("// This file is automatically generated"));
        assert!(text.contains("#include \"a.cpp\"\n#include \"b.cpp\"\n"));

        assert!(aggregator.write_units(&plan, fx.dir.path()).unwrap().is_empty());
    }

    #[test]
    fn absolute_includes_by_default() {
        let fx = Fixture::new();
        let file = fx.source("a.cpp", KB);
        let config = UnityConfig::default();
        let aggregator = UnityAggregator::new(&config, &EmptyWorkingSet);
        let plan = aggregator.plan("Core", fx.dir.path(), std::slice::from_ref(&file));

        let text = aggregator.unit_contents(&plan.units[0], fx.dir.path());
        let expected = file.path().to_string_lossy().replace('\\', "/");
        assert!(text.contains(&format!("#include \"{expected}\"")));
    }

    #[test]
    fn absorbed_files_leave_the_flattened_cache() {
        let fx = Fixture::new();
        let registry = Arc::new(FileRegistry::new());
        let merged = registry.item(fx.source("a.cpp", KB).path());
        let wrapper = registry.item(fx.source("x.init.gen.cpp", KB).path());
        let mut flattened =
            FlattenedIncludeCache::load(fx.dir.path().join("Flat.bin"), Arc::clone(&registry));
        flattened.set_dependencies_for_file(&merged, None, &[]);
        flattened.set_dependencies_for_file(&wrapper, None, &[]);

        let config = UnityConfig::default();
        let plan = UnityAggregator::new(&config, &EmptyWorkingSet).plan(
            "M",
            fx.dir.path(),
            &[Arc::clone(&merged), Arc::clone(&wrapper)],
        );

        assert_eq!(forget_absorbed_files(&plan, &mut flattened), 1);
        assert!(flattened.get_dependencies_for_file(&merged).is_none());
        assert!(flattened.get_dependencies_for_file(&wrapper).is_some());
    }
}
