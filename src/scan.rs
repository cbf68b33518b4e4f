use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use serde_sarif::sarif::{Artifact, ArtifactLocation, ArtifactRoles};

use crate::ir::{Class, ClassTable};

/// Classes read by a scan, with one artifact per file.
pub(crate) struct ScanOutput {
    pub(crate) classes: ClassTable,
    /// Names of the classes read from the input, as opposed to the classpath.
    pub(crate) targets: BTreeSet<String>,
    pub(crate) artifacts: Vec<Artifact>,
}

impl ScanOutput {
    /// The subset of the class table read from the input.
    pub(crate) fn target_classes(&self) -> ClassTable {
        self.classes
            .iter()
            .filter(|(name, _)| self.targets.contains(*name))
            .map(|(name, class)| (name.clone(), class.clone()))
            .collect()
    }
}

/// Reads class documents from `input` and the classpath entries. Each may be a
/// `.json` file or a directory searched recursively.
pub(crate) fn scan_inputs(input: &Path, classpath: &[PathBuf]) -> Result<ScanOutput> {
    let mut scan = ScanOutput {
        classes: ClassTable::new(),
        targets: BTreeSet::new(),
        artifacts: Vec::new(),
    };

    scan_path(input, true, true, &mut scan)?;

    // Keep deterministic ordering by sorting classpath entries and directory listings.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by_key(|path| path_key(path));

    for entry in classpath_entries {
        scan_path(&entry, false, true, &mut scan)?;
    }

    log::info!(
        "loaded {} classes ({} targets) from {} files",
        scan.classes.len(),
        scan.targets.len(),
        scan.artifacts.len()
    );
    Ok(scan)
}

fn scan_path(path: &Path, is_input: bool, strict: bool, scan: &mut ScanOutput) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, is_input, scan);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "json" => scan_class_file(path, is_input, scan),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, is_input: bool, scan: &mut ScanOutput) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by_key(|path| path_key(path));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, is_input, scan)?;
        } else {
            scan_path(&entry, is_input, false, scan)?;
        }
    }

    Ok(())
}

fn scan_class_file(path: &Path, is_input: bool, scan: &mut ScanOutput) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let class: Class = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let roles = if is_input {
        Some(vec![serde_json::to_value(ArtifactRoles::AnalysisTarget)
            .context("failed to serialize artifact role")?])
    } else {
        None
    };
    push_artifact(path_to_uri(path), data.len() as u64, roles, &mut scan.artifacts);

    if scan.classes.contains_key(&class.name) {
        log::warn!("{}: class {} is already loaded, ignored", path.display(), class.name);
        return Ok(());
    }
    if is_input {
        scan.targets.insert(class.name.clone());
    }
    scan.classes.insert(class.name.clone(), class);
    Ok(())
}

fn push_artifact(uri: String, len: u64, roles: Option<Vec<Value>>, artifacts: &mut Vec<Artifact>) {
    let location = ArtifactLocation::builder().uri(uri).build();
    let artifact = match roles {
        Some(roles) => Artifact::builder()
            .location(location)
            .length(len as i64)
            .roles(roles)
            .build(),
        None => Artifact::builder()
            .location(location)
            .length(len as i64)
            .build(),
    };
    artifacts.push(artifact);
}

fn path_to_uri(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn class_json(name: &str, super_name: Option<&str>) -> String {
        serde_json::json!({
            "name": name,
            "super_name": super_name,
            "methods": [{
                "sig": { "class": name, "ret": "void", "name": "run", "params": [] },
                "locals": { "out": "java.io.PrintStream" },
                "code": [
                    { "op": "invoke", "call": {
                        "kind": "virtual", "receiver": "out", "name": "println",
                        "args": ["\"hello\""], "line": 3
                    } },
                    { "op": "return" }
                ]
            }]
        })
        .to_string()
    }

    #[test]
    fn scan_inputs_reads_directories_in_order() {
        let dir = tempdir().expect("create temp dir");
        let nested = dir.path().join("app");
        fs::create_dir_all(&nested).expect("create nested dir");
        fs::write(nested.join("B.json"), class_json("app.B", Some("app.A"))).expect("write class");
        fs::write(dir.path().join("A.json"), class_json("app.A", None)).expect("write class");
        fs::write(dir.path().join("notes.txt"), "skip me").expect("write note");

        let scan = scan_inputs(dir.path(), &[]).expect("scan directory");

        assert_eq!(2, scan.classes.len());
        assert_eq!(Some("app.A"), scan.classes["app.B"].super_name.as_deref());
        let uris: Vec<String> = scan
            .artifacts
            .iter()
            .filter_map(|artifact| artifact.location.as_ref())
            .filter_map(|location| location.uri.clone())
            .collect();
        assert_eq!(2, uris.len());
        assert!(uris[0].ends_with("A.json"));
        assert!(uris[1].ends_with("B.json"));
    }

    #[test]
    fn scan_inputs_separates_targets_from_classpath() {
        let dir = tempdir().expect("create temp dir");
        let input = dir.path().join("Main.json");
        let library = dir.path().join("Lib.json");
        fs::write(&input, class_json("Main", None)).expect("write class");
        fs::write(&library, class_json("Lib", None)).expect("write class");

        let scan = scan_inputs(&input, &[library]).expect("scan");

        assert_eq!(2, scan.classes.len());
        assert_eq!(BTreeSet::from(["Main".to_string()]), scan.targets);
        assert_eq!(vec!["Main".to_string()], scan.target_classes().into_keys().collect::<Vec<_>>());
        let value = serde_json::to_value(&scan.artifacts).expect("serialize artifacts");
        assert_eq!("analysisTarget", value[0]["roles"][0]);
        assert!(value[1].get("roles").is_none());
    }

    #[test]
    fn scan_inputs_rejects_invalid_class_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("bad.json");
        fs::write(&path, b"nope").expect("write test class");

        assert!(scan_inputs(&path, &[]).is_err());
    }

    #[test]
    fn scan_inputs_rejects_unsupported_input() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("Main.class");
        fs::write(&path, b"\xca\xfe\xba\xbe").expect("write test class");

        assert!(scan_inputs(&path, &[]).is_err());
    }
}
