//! Unity command: group a module's sources into unity files

use super::CommandResult;
use kiln_build::{BuildSession, UnitKind, UnityPlan, find_source_files};
use std::path::Path;

pub fn execute(
    session: &BuildSession,
    module: &str,
    source_dir: &Path,
    output_dir: &Path,
) -> CommandResult<()> {
    let files = find_source_files(source_dir, &["cpp"]);
    if files.is_empty() {
        println!("No .cpp files under {}", source_dir.display());
        return Ok(());
    }

    let plan = session.generate_unity(module, source_dir, &files, output_dir)?;
    print!("{}", describe(&plan));
    Ok(())
}

/// One line per unit, then its members indented.
pub fn describe(plan: &UnityPlan) -> String {
    let mut text = String::new();
    for unit in &plan.units {
        let kind = match unit.kind {
            UnitKind::Unity => "unity",
            UnitKind::Standalone => "standalone",
        };
        text.push_str(&format!(
            "{} [{}, {} bytes]\n",
            unit.path.display(),
            kind,
            unit.cumulative_bytes
        ));
        if unit.kind == UnitKind::Unity {
            for name in unit.member_names() {
                text.push_str(&format!("    {name}\n"));
            }
        }
    }
    if !plan.adaptive {
        text.push_str("(adaptive unity disabled)\n");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_build::{BuildConfiguration, SystemHost, WorkingSetProvider};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn plan_lists_unity_members() {
        let tmp = TempDir::new().unwrap();
        let source_dir = tmp.path().join("Source");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("B.cpp"), "int b;").unwrap();
        std::fs::write(source_dir.join("a.cpp"), "int a;").unwrap();

        let mut config = BuildConfiguration::default();
        config.target.output_dir = tmp.path().join("Intermediate");
        config.working_set.provider = WorkingSetProvider::None;
        let session = BuildSession::new(config, Arc::new(SystemHost));

        let output_dir = tmp.path().join("Intermediate/Core");
        execute(&session, "Core", &source_dir, &output_dir).unwrap();
        let unit = std::fs::read_to_string(output_dir.join("Module.Core.cpp")).unwrap();
        let a = unit.find("a.cpp").unwrap();
        let b = unit.find("B.cpp").unwrap();
        assert!(a < b);

        let files = find_source_files(&source_dir, &["cpp"]);
        let plan = session
            .generate_unity("Core", &source_dir, &files, &output_dir)
            .unwrap();
        let text = describe(&plan);
        assert!(text.starts_with(&format!("{} [unity", output_dir.join("Module.Core.cpp").display())));
        assert!(text.contains("    a.cpp\n    B.cpp\n"));
    }
}
