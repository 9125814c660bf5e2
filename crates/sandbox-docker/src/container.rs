use std::collections::HashMap;
use std::net::IpAddr;

use bollard::container::Config;
use bollard::models::{HostConfig, PortBinding, PortMap};
use sandbox::CreateRequest;

/// Label present on every container this crate creates.
pub const MANAGED_LABEL: &str = "sqlbox.managed";
/// Label carrying the owning session key.
pub const SESSION_LABEL: &str = "sqlbox.session";

const MIB: i64 = 1024 * 1024;

/// Translate a sandbox policy into a Docker create body.
///
/// The container port is published on `bind_ip:host_port` only, never on
/// all interfaces.
pub(crate) fn build_container_config(request: &CreateRequest<'_>, bind_ip: IpAddr) -> Config<String> {
    let policy = request.policy;
    let port_key = format!("{}/tcp", policy.container_port);

    let mut port_bindings = PortMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some(bind_ip.to_string()),
            host_port: Some(request.host_port.to_string()),
        }]),
    );

    let mut security_opt = Vec::new();
    if policy.security.no_new_privileges {
        security_opt.push("no-new-privileges:true".to_string());
    }

    let r = &policy.resources;
    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        memory: Some(i64::from(r.memory_mb) * MIB),
        memory_swap: Some(i64::from(r.memory_swap_mb) * MIB),
        cpu_shares: Some(i64::from(r.cpu_shares)),
        cpu_quota: Some(i64::from(r.cpu_quota_us)),
        cpu_period: Some(i64::from(r.cpu_period_us)),
        pids_limit: Some(i64::from(r.pids_limit)),
        cap_drop: Some(policy.security.cap_drop.clone()),
        cap_add: (!policy.security.cap_add.is_empty()).then(|| policy.security.cap_add.clone()),
        readonly_rootfs: Some(policy.security.read_only_rootfs),
        security_opt: (!security_opt.is_empty()).then_some(security_opt),
        tmpfs: (!policy.tmpfs.is_empty()).then(|| {
            policy
                .tmpfs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }),
        network_mode: Some(policy.network_mode.clone()),
        auto_remove: Some(policy.auto_remove),
        ..Default::default()
    };

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (SESSION_LABEL.to_string(), request.session_key.to_string()),
    ]);

    Config {
        image: Some(policy.image.clone()),
        env: (!policy.env.is_empty()).then(|| policy.env.clone()),
        exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
        labels: Some(labels),
        stop_timeout: Some(i64::from(policy.stop_timeout_secs)),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{ContainerRef, presets};

    fn build(policy: &sandbox::SandboxPolicy) -> Config<String> {
        let container = ContainerRef::new("sqlbox-test");
        build_container_config(
            &CreateRequest {
                container: &container,
                session_key: "ex-42",
                host_port: 41000,
                policy,
            },
            IpAddr::from([127, 0, 0, 1]),
        )
    }

    #[test]
    fn publishes_container_port_on_loopback() {
        let config = build(&presets::postgres());
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        let binding = bindings["5432/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding[0].host_port.as_deref(), Some("41000"));
        assert!(config.exposed_ports.unwrap().contains_key("5432/tcp"));
    }

    #[test]
    fn applies_resource_caps_in_bytes() {
        let policy = presets::postgres();
        let host = build(&policy).host_config.unwrap();
        assert_eq!(
            host.memory,
            Some(i64::from(policy.resources.memory_mb) * MIB)
        );
        assert_eq!(host.memory, host.memory_swap);
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.pids_limit, Some(128));
    }

    #[test]
    fn applies_hardening() {
        let host = build(&presets::postgres()).host_config.unwrap();
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_string()])
        );
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert!(host.tmpfs.unwrap().contains_key("/var/lib/postgresql/data"));
    }

    #[test]
    fn omits_empty_optional_sections() {
        let mut policy = presets::postgres();
        policy.security.cap_add.clear();
        policy.security.no_new_privileges = false;
        policy.tmpfs.clear();
        policy.env.clear();
        let config = build(&policy);
        let host = config.host_config.unwrap();
        assert!(host.cap_add.is_none());
        assert!(host.security_opt.is_none());
        assert!(host.tmpfs.is_none());
        assert!(config.env.is_none());
    }

    #[test]
    fn labels_identify_session() {
        let labels = build(&presets::mysql()).labels.unwrap();
        assert_eq!(labels[MANAGED_LABEL], "true");
        assert_eq!(labels[SESSION_LABEL], "ex-42");
    }
}
