//! Kubeconfig rewriting and the operator's local kubeconfig file.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use kiln_core::config::home_dir;

use crate::error::{ProvisionError, ProvisionResult};
use crate::scripts::LOOPBACK_ADDRESS;

const SECTIONS: [&str; 3] = ["clusters", "contexts", "users"];

fn parse(raw: &str) -> ProvisionResult<Value> {
    serde_yaml::from_str(raw)
        .map_err(|e| ProvisionError::Kubeconfig(format!("failed to parse kubeconfig YAML: {e}")))
}

fn render(doc: &Value) -> ProvisionResult<String> {
    serde_yaml::to_string(doc)
        .map_err(|e| ProvisionError::Kubeconfig(format!("failed to serialize kubeconfig: {e}")))
}

fn first_entry<'a>(doc: &'a mut Value, section: &str) -> ProvisionResult<&'a mut Value> {
    doc.get_mut(section)
        .and_then(Value::as_sequence_mut)
        .and_then(|s| s.first_mut())
        .ok_or_else(|| ProvisionError::Kubeconfig(format!("kubeconfig has no {section}")))
}

fn set(entry: &mut Value, key: &str, value: &str) -> ProvisionResult<()> {
    let map = entry
        .as_mapping_mut()
        .ok_or_else(|| ProvisionError::Kubeconfig(format!("{key} parent is not a mapping")))?;
    map.insert(Value::from(key), Value::from(value));
    Ok(())
}

/// Point a freshly extracted kubeconfig at the floating API address and
/// rename its single cluster, context and user to `fqcn`.
///
/// Everything else in the document is left as it was.
pub fn rewrite_kubeconfig(raw: &str, floating_address: &str, fqcn: &str) -> ProvisionResult<String> {
    let mut doc = parse(&raw.replace(LOOPBACK_ADDRESS, floating_address))?;

    set(first_entry(&mut doc, "clusters")?, "name", fqcn)?;
    let context = first_entry(&mut doc, "contexts")?;
    set(context, "name", fqcn)?;
    let inner = context
        .get_mut("context")
        .ok_or_else(|| ProvisionError::Kubeconfig("context entry has no context".into()))?;
    set(inner, "cluster", fqcn)?;
    set(inner, "user", fqcn)?;
    set(first_entry(&mut doc, "users")?, "name", fqcn)?;
    set(&mut doc, "current-context", fqcn)?;

    render(&doc)
}

/// The operator's local kubeconfig.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeconfigFile {
    path: PathBuf,
}

impl KubeconfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Explicit override, else the first `$KUBECONFIG` entry, else
    /// `~/.kube/config`.
    pub fn locate(override_path: Option<&Path>) -> Option<Self> {
        if let Some(path) = override_path {
            return Some(Self::new(path));
        }
        if let Some(first) = std::env::var_os("KUBECONFIG")
            .as_deref()
            .and_then(|v| std::env::split_paths(v).find(|p| !p.as_os_str().is_empty()))
        {
            return Some(Self::new(first));
        }
        home_dir().map(|home| Self::new(home.join(".kube").join("config")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> ProvisionError {
        ProvisionError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> ProvisionResult<Option<Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(None),
            Ok(raw) => parse(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn store(&self, doc: &Value) -> ProvisionResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        std::fs::write(&self.path, render(doc)?).map_err(|e| self.io_err(e))
    }

    /// Merge every cluster, context and user of `raw` into the file,
    /// replacing same-named entries. `current-context` is only set when the
    /// file has none.
    pub fn merge(&self, raw: &str) -> ProvisionResult<()> {
        let incoming = parse(raw)?;
        let mut doc = self.load()?.unwrap_or_else(empty_document);
        let root = doc
            .as_mapping_mut()
            .ok_or_else(|| ProvisionError::Kubeconfig("local kubeconfig is not a mapping".into()))?;

        for section in SECTIONS {
            let Some(entries) = incoming.get(section).and_then(Value::as_sequence) else {
                continue;
            };
            let existing = root
                .entry(Value::from(section))
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if existing.is_null() {
                *existing = Value::Sequence(Vec::new());
            }
            let Some(existing) = existing.as_sequence_mut() else {
                return Err(ProvisionError::Kubeconfig(format!(
                    "local kubeconfig {section} is not a list"
                )));
            };
            for entry in entries {
                let name = entry.get("name").cloned();
                existing.retain(|e| name.is_none() || e.get("name") != name.as_ref());
                existing.push(entry.clone());
            }
        }

        let current = root.get("current-context").and_then(Value::as_str);
        if current.is_none_or(str::is_empty) {
            if let Some(ctx) = incoming.get("current-context").cloned() {
                root.insert(Value::from("current-context"), ctx);
            }
        }

        self.store(&doc)?;
        info!(path = %self.path.display(), "kubeconfig merged");
        Ok(())
    }

    /// Remove the cluster, context and user named `fqcn`. A missing file is
    /// left missing.
    pub fn remove(&self, fqcn: &str) -> ProvisionResult<()> {
        let Some(mut doc) = self.load()? else {
            debug!(path = %self.path.display(), "no local kubeconfig to clean");
            return Ok(());
        };
        let Some(root) = doc.as_mapping_mut() else {
            return Ok(());
        };

        let mut removed = 0;
        for section in SECTIONS {
            if let Some(entries) = root.get_mut(section).and_then(Value::as_sequence_mut) {
                let before = entries.len();
                entries.retain(|e| e.get("name").and_then(Value::as_str) != Some(fqcn));
                removed += before - entries.len();
            }
        }
        if root.get("current-context").and_then(Value::as_str) == Some(fqcn) {
            root.insert(Value::from("current-context"), Value::from(""));
        }

        self.store(&doc)?;
        info!(path = %self.path.display(), %fqcn, removed, "kubeconfig entries removed");
        Ok(())
    }
}

fn empty_document() -> Value {
    let mut root = Mapping::new();
    root.insert(Value::from("apiVersion"), Value::from("v1"));
    root.insert(Value::from("kind"), Value::from("Config"));
    root.insert(Value::from("preferences"), Value::Mapping(Mapping::new()));
    for section in SECTIONS {
        root.insert(Value::from(section), Value::Sequence(Vec::new()));
    }
    root.insert(Value::from("current-context"), Value::from(""));
    Value::Mapping(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    const K3S_KUBECONFIG: &str = "\
apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
preferences: {}
users:
- name: default
  user:
    client-certificate-data: Y2VydA==
    client-key-data: a2V5
";

    #[test]
    fn rewrite_renames_entries_and_replaces_loopback() {
        let out = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.7", "alpha.team1").unwrap();
        let doc: Value = serde_yaml::from_str(&out).unwrap();

        assert_eq!(doc["clusters"][0]["name"], "alpha.team1");
        assert_eq!(
            doc["clusters"][0]["cluster"]["server"],
            "https://203.0.113.7:6443"
        );
        assert_eq!(doc["contexts"][0]["name"], "alpha.team1");
        assert_eq!(doc["contexts"][0]["context"]["cluster"], "alpha.team1");
        assert_eq!(doc["contexts"][0]["context"]["user"], "alpha.team1");
        assert_eq!(doc["users"][0]["name"], "alpha.team1");
        assert_eq!(doc["current-context"], "alpha.team1");
    }

    #[test]
    fn rewrite_leaves_other_structure_alone() {
        let out = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.7", "alpha.team1").unwrap();
        let mut got: Value = serde_yaml::from_str(&out).unwrap();
        let mut want: Value = serde_yaml::from_str(K3S_KUBECONFIG).unwrap();

        for doc in [&mut got, &mut want] {
            doc["clusters"][0]["name"] = Value::from("x");
            doc["clusters"][0]["cluster"]["server"] = Value::from("x");
            doc["contexts"][0]["name"] = Value::from("x");
            doc["contexts"][0]["context"]["cluster"] = Value::from("x");
            doc["contexts"][0]["context"]["user"] = Value::from("x");
            doc["users"][0]["name"] = Value::from("x");
            doc["current-context"] = Value::from("x");
        }
        assert_eq!(got, want);
    }

    #[test]
    fn rewrite_rejects_document_without_clusters() {
        let err = rewrite_kubeconfig("apiVersion: v1\nkind: Config\n", "1.2.3.4", "a.b").unwrap_err();
        assert!(matches!(err, ProvisionError::Kubeconfig(_)));
    }

    #[test]
    fn merge_creates_file_and_sets_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let file = KubeconfigFile::new(dir.path().join("kube").join("config"));
        let alpha = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.7", "alpha.team1").unwrap();

        file.merge(&alpha).unwrap();

        let doc: Value =
            serde_yaml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(doc["current-context"], "alpha.team1");
        assert_eq!(doc["clusters"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn merge_replaces_same_name_and_keeps_current_context() {
        let dir = tempfile::tempdir().unwrap();
        let file = KubeconfigFile::new(dir.path().join("config"));
        let alpha = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.7", "alpha.team1").unwrap();
        let beta = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.8", "beta.team1").unwrap();
        let alpha_again = rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.9", "alpha.team1").unwrap();

        file.merge(&alpha).unwrap();
        file.merge(&beta).unwrap();
        file.merge(&alpha_again).unwrap();

        let doc: Value =
            serde_yaml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        let clusters = doc["clusters"].as_sequence().unwrap();
        assert_eq!(clusters.len(), 2);
        let alpha_entry = clusters
            .iter()
            .find(|c| c["name"] == "alpha.team1")
            .unwrap();
        assert_eq!(alpha_entry["cluster"]["server"], "https://203.0.113.9:6443");
        assert_eq!(doc["current-context"], "alpha.team1");
    }

    #[test]
    fn remove_drops_named_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = KubeconfigFile::new(dir.path().join("config"));
        file.merge(&rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.7", "alpha.team1").unwrap())
            .unwrap();
        file.merge(&rewrite_kubeconfig(K3S_KUBECONFIG, "203.0.113.8", "beta.team1").unwrap())
            .unwrap();

        file.remove("alpha.team1").unwrap();

        let doc: Value =
            serde_yaml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        for section in SECTIONS {
            let names: Vec<_> = doc[section]
                .as_sequence()
                .unwrap()
                .iter()
                .map(|e| e["name"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(names, vec!["beta.team1"]);
        }
        assert_eq!(doc["current-context"], "");
    }

    #[test]
    fn remove_without_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let file = KubeconfigFile::new(dir.path().join("absent"));
        file.remove("alpha.team1").unwrap();
        assert!(!file.path().exists());
    }
}
