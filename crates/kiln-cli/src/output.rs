//! Human-readable rendering of records and failures.

use std::fmt::Write as _;

use kiln_provision::ProvisionError;
use kiln_remote::RemoteError;
use kiln_state::ClusterRecord;

/// Multi-line description of a cluster record.
pub fn cluster_details(record: &ClusterRecord) -> String {
    let mut out = String::new();
    let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());

    let _ = writeln!(out, "Name:            {}", record.name);
    let _ = writeln!(out, "Namespace:       {}", record.namespace);
    let _ = writeln!(out, "Type:            {}", record.cluster_type);
    let _ = writeln!(out, "State:           {:?}", record.state);
    let _ = writeln!(out, "Phase:           {:?}", record.phase());
    let _ = writeln!(out, "Version:         {}", opt(&record.software_version));
    let _ = writeln!(out, "Storage:         {}", opt(&record.storage_version));
    let _ = writeln!(out, "Network:         {}", opt(&record.node_network));
    let _ = writeln!(out, "API (inner):     {}", opt(&record.api_address_inner));
    let _ = writeln!(out, "API (floating):  {}", opt(&record.api_address_floating));
    let _ = writeln!(out, "Next serial:     {}", record.node_serial);
    list(&mut out, "Control plane:", &record.control_plane_nodes);
    list(&mut out, "Workers:", &record.worker_nodes);
    list(&mut out, "Addresses:", &record.routed_addresses);
    out
}

fn list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        let _ = writeln!(out, "{title:<17}-");
        return;
    }
    let _ = writeln!(out, "{title}");
    for item in items {
        let _ = writeln!(out, "  {item}");
    }
}

/// The error report printed before a non-zero exit. Failed remote commands
/// carry their captured output.
pub fn report(err: &anyhow::Error) -> String {
    let remote = err.downcast_ref::<RemoteError>().or_else(|| {
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::Remote(remote)) => Some(remote),
            _ => None,
        }
    });

    let mut out = String::new();
    match remote {
        Some(RemoteError::CommandFailed {
            instance,
            instance_name,
            command,
            exit_code,
            stdout,
            stderr,
        }) => {
            let _ = writeln!(out, "Error: command failed on {instance_name} ({instance})");
            let _ = writeln!(out, "  command:   {command}");
            let _ = writeln!(out, "  exit code: {exit_code}");
            prefixed(&mut out, "stdout", stdout);
            prefixed(&mut out, "stderr", stderr);
        }
        Some(RemoteError::FetchFailed { path, message }) => {
            let _ = writeln!(out, "Error: unable to fetch {path} from the node");
            let _ = writeln!(out, "  {message}");
        }
        _ => {
            let _ = writeln!(out, "Error: {err}");
            for cause in err.chain().skip(1) {
                let _ = writeln!(out, "  caused by: {cause}");
            }
        }
    }
    out
}

fn prefixed(out: &mut String, label: &str, text: &str) {
    for line in text.lines() {
        let _ = writeln!(out, "  {label}| {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_state::StateError;

    #[test]
    fn command_failure_shows_captured_output() {
        let err: anyhow::Error = ProvisionError::Remote(RemoteError::CommandFailed {
            instance: "inst-0001".into(),
            instance_name: "alpha-001".into(),
            command: "curl -sfL https://get.k3s.io | sh -".into(),
            exit_code: 7,
            stdout: "downloading\nretrying".into(),
            stderr: "curl: (7) connection refused".into(),
        })
        .into();

        let text = report(&err);
        assert!(text.contains("alpha-001 (inst-0001)"));
        assert!(text.contains("exit code: 7"));
        assert!(text.contains("  stdout| downloading\n  stdout| retrying\n"));
        assert!(text.contains("  stderr| curl: (7) connection refused\n"));
    }

    #[test]
    fn fetch_failure_names_path() {
        let err: anyhow::Error = RemoteError::FetchFailed {
            path: "/etc/rancher/k3s/k3s.yaml".into(),
            message: "No such file or directory".into(),
        }
        .into();
        let text = report(&err);
        assert!(text.contains("/etc/rancher/k3s/k3s.yaml"));
        assert!(text.contains("No such file or directory"));
    }

    #[test]
    fn name_taken_is_reported_plainly() {
        let err: anyhow::Error = ProvisionError::State(StateError::NameTaken {
            namespace: "team1".into(),
            name: "alpha".into(),
        })
        .into();
        assert_eq!(
            report(&err),
            "Error: cluster name alpha is already taken in namespace team1\n"
        );
    }

    #[test]
    fn details_cover_topology_and_phase() {
        let mut record = ClusterRecord::new("alpha", "team1", "1.30.4+k3s1", 4, "net-0001");
        record.control_plane_nodes.push("inst-0001".into());
        let text = cluster_details(&record);
        assert!(text.contains("Name:            alpha\n"));
        assert!(text.contains("Phase:           NetworkReady\n"));
        assert!(text.contains("Control plane:\n  inst-0001\n"));
        assert!(text.contains("Workers:         -\n"));
        assert!(text.contains("Next serial:     4\n"));
    }
}
