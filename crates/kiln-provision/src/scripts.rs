//! Shell command sequences run on cluster nodes through the agent.
//!
//! The installed software is opaque: each command's only contract is its
//! exit status and captured output.

use kiln_core::NodeRole;

/// Token additional control-plane nodes join with.
pub const SERVER_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/token";

/// Token workers join with.
pub const NODE_TOKEN_PATH: &str = "/var/lib/rancher/k3s/server/node-token";

/// Admin kubeconfig written by the installer on control-plane nodes.
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Address the generated kubeconfig points its server at.
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Port the cluster API listens on.
pub const API_PORT: u16 = 6443;

const INSTALLER: &str = "curl -sfL https://get.k3s.io";

const METALLB_MANIFEST_PATH: &str = "/etc/sf/metallb-range-allocation.yaml";

/// Configure and install the founding control-plane node, plus helm.
///
/// The floating address is pinned into the API certificate's SAN list.
pub fn control_plane_install(floating_address: &str, version: &str) -> Vec<String> {
    vec![
        "mkdir -p /etc/rancher/k3s/".to_string(),
        format!(
            "cat - > /etc/rancher/k3s/config.yaml << EOF\n\
             write-kubeconfig-mode: \"0644\"\n\
             tls-san:\n  \
             - \"{floating_address}\"\n\
             cluster-init: true\n\
             EOF\n"
        ),
        format!("{INSTALLER} | INSTALL_K3S_CHANNEL={version} sh -s - server"),
        "curl https://baltocdn.com/helm/signing.asc | gpg --dearmor | \
         sudo tee /usr/share/keyrings/helm.gpg"
            .to_string(),
        "sudo apt-get install -y apt-transport-https".to_string(),
        "echo \"deb [arch=$(dpkg --print-architecture) \
         signed-by=/usr/share/keyrings/helm.gpg] \
         https://baltocdn.com/helm/stable/debian/ all main\" | \
         sudo tee /etc/apt/sources.list.d/helm-stable-debian.list"
            .to_string(),
        "sudo apt-get update".to_string(),
        "sudo apt-get install -y helm".to_string(),
    ]
}

/// Join nodes to an existing cluster. Control-plane nodes join with the
/// server token, workers with the node token.
pub fn join(version: &str, api_address_inner: &str, token: &str, role: NodeRole) -> Vec<String> {
    vec![
        "sudo apt-get update".to_string(),
        "sudo apt-get install -y".to_string(),
        format!(
            "{INSTALLER} | INSTALL_K3S_CHANNEL={version} \
             K3S_URL=https://{api_address_inner}:{API_PORT} \
             K3S_TOKEN={token} sh -s - {}",
            role.installer_keyword()
        ),
    ]
}

/// Install the load-balancer controller.
pub fn metallb_install() -> Vec<String> {
    vec![
        "kubectl create ns metallb-system".to_string(),
        format!(
            "KUBECONFIG={KUBECONFIG_PATH} helm upgrade --install -n metallb-system metallb \
             oci://registry-1.docker.io/bitnamicharts/metallb"
        ),
    ]
}

/// Declarative pool manifest with every routed address as a /32.
pub fn metallb_manifest(addresses: &[String]) -> String {
    let mut manifest = String::from(
        "apiVersion: metallb.io/v1beta1\n\
         kind: IPAddressPool\n\
         metadata:\n  \
         name: empty\n  \
         namespace: metallb-system\n\
         spec:\n  \
         addresses:\n",
    );
    for address in addresses {
        manifest.push_str(&format!("  - {address}/32\n"));
    }
    manifest.push_str(
        "---\n\
         apiVersion: metallb.io/v1beta1\n\
         kind: L2Advertisement\n\
         metadata:\n  \
         name: empty\n  \
         namespace: metallb-system\n",
    );
    manifest
}

/// Wait for the controller, then write and apply the address pool.
pub fn metallb_configure(addresses: &[String]) -> Vec<String> {
    vec![
        format!(
            "kubectl wait --kubeconfig {KUBECONFIG_PATH} -n metallb-system pod \
             --for=condition=Ready -l app.kubernetes.io/name=metallb --timeout=300s"
        ),
        "mkdir -p /etc/sf".to_string(),
        format!(
            "cat - > {METALLB_MANIFEST_PATH} << EOF\n{}EOF\n",
            metallb_manifest(addresses)
        ),
        format!("kubectl apply -f {METALLB_MANIFEST_PATH}"),
    ]
}

/// Install the storage layer and stop `local-path` being the default class.
pub fn longhorn_install(version: &str) -> Vec<String> {
    vec![
        "helm repo add longhorn https://charts.longhorn.io".to_string(),
        "helm repo update".to_string(),
        "kubectl create namespace longhorn-system || true".to_string(),
        format!(
            "KUBECONFIG={KUBECONFIG_PATH} helm install longhorn longhorn/longhorn \
             --namespace longhorn-system --version {version}"
        ),
        "kubectl patch storageclass local-path -p \
         '{\"metadata\": {\"annotations\":{\"storageclass.kubernetes.io/is-default-class\":\"false\"}}}'"
            .to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_plane_config_pins_floating_address() {
        let cmds = control_plane_install("203.0.113.7", "stable");
        assert!(cmds[1].contains("tls-san:\n  - \"203.0.113.7\"\n"));
        assert!(cmds[1].contains("cluster-init: true\n"));
        assert_eq!(
            cmds[2],
            "curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL=stable sh -s - server"
        );
        assert_eq!(cmds.last().unwrap(), "sudo apt-get install -y helm");
    }

    #[test]
    fn join_uses_inner_address_and_role_keyword() {
        let cmds = join("v1.30", "10.0.0.11", "K10abc::server:xyz", NodeRole::Worker);
        assert_eq!(
            cmds[2],
            "curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL=v1.30 \
             K3S_URL=https://10.0.0.11:6443 K3S_TOKEN=K10abc::server:xyz sh -s - agent"
        );
        let cp = join("v1.30", "10.0.0.11", "t", NodeRole::ControlPlane);
        assert!(cp[2].ends_with("sh -s - server"));
    }

    #[test]
    fn manifest_lists_each_address_as_host_route() {
        let manifest = metallb_manifest(&["192.0.2.5".into(), "192.0.2.6".into()]);
        assert!(manifest.contains("  addresses:\n  - 192.0.2.5/32\n  - 192.0.2.6/32\n---\n"));
        assert!(manifest.contains("kind: L2Advertisement\n"));

        let cmds = metallb_configure(&["192.0.2.5".into()]);
        assert!(cmds[2].starts_with("cat - > /etc/sf/metallb-range-allocation.yaml << EOF\n"));
        assert!(cmds[2].ends_with("namespace: metallb-system\nEOF\n"));
    }

    #[test]
    fn longhorn_install_pins_version() {
        let cmds = longhorn_install("1.7.1");
        assert!(cmds[3].ends_with("--namespace longhorn-system --version 1.7.1"));
    }
}
