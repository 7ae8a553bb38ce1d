//! # Environment Resolver
//!
//! Replaces `envFrom` and `valueFrom` ConfigMap/Secret references with the
//! literal values found in the root cache, and adds service-link variables
//! for the Services of the pod's namespace.
//!
//! The leaf has no copy of the referenced objects when the pod starts, so
//! references are resolved once, on the create path. Precedence follows the
//! kubelet: service links < `envFrom` < explicit `env`.

use crate::env::EnvResourceGetter;
use crate::{Error, Result};
use k8s_openapi::api::core::v1::{Container, EnvFromSource, EnvVar, Pod, Service};
use std::collections::HashMap;
use tracing::debug;

/// Ordered variable list where a later write of a name replaces the earlier one
#[derive(Default)]
struct EnvBuilder {
    vars: Vec<EnvVar>,
    index: HashMap<String, usize>,
}

impl EnvBuilder {
    fn set(&mut self, var: EnvVar) {
        if let Some(&i) = self.index.get(&var.name) {
            self.vars[i] = var;
        } else {
            self.index.insert(var.name.clone(), self.vars.len());
            self.vars.push(var);
        }
    }

    fn set_value(&mut self, name: String, value: String) {
        self.set(EnvVar {
            name,
            value: Some(value),
            value_from: None,
        });
    }
}

/// Resolve every container (init containers included) of `pod` in place
pub fn resolve_pod_env(pod: &mut Pod, getter: &dyn EnvResourceGetter) -> Result<()> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let Some(spec) = pod.spec.as_mut() else {
        return Ok(());
    };

    let service_vars = if spec.enable_service_links == Some(false) {
        Vec::new()
    } else {
        service_link_vars(&namespace, &getter.list_services())
    };

    for container in spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut())
    {
        resolve_container_env(container, &namespace, &service_vars, getter)?;
    }
    Ok(())
}

fn resolve_container_env(
    container: &mut Container,
    namespace: &str,
    service_vars: &[EnvVar],
    getter: &dyn EnvResourceGetter,
) -> Result<()> {
    let mut env = EnvBuilder::default();
    for var in service_vars {
        env.set(var.clone());
    }

    for source in container.env_from.take().unwrap_or_default() {
        resolve_env_from(&source, namespace, getter, &mut env)?;
    }

    for var in container.env.take().unwrap_or_default() {
        if let Some(resolved) = resolve_env_var(var, namespace, getter)? {
            env.set(resolved);
        }
    }

    debug!(container = %container.name, vars = env.vars.len(), "resolved container environment");
    container.env = (!env.vars.is_empty()).then_some(env.vars);
    Ok(())
}

fn resolve_env_from(
    source: &EnvFromSource,
    namespace: &str,
    getter: &dyn EnvResourceGetter,
    env: &mut EnvBuilder,
) -> Result<()> {
    let prefix = source.prefix.as_deref().unwrap_or_default();

    if let Some(cm_ref) = &source.config_map_ref {
        let name = cm_ref.name.as_str();
        match getter.get_config_map(namespace, name) {
            Some(cm) => {
                for (key, value) in cm.data.iter().flatten() {
                    env.set_value(format!("{prefix}{key}"), value.clone());
                }
            }
            None if cm_ref.optional == Some(true) => {
                debug!(namespace, name, "optional envFrom ConfigMap missing, skipping");
            }
            None => return Err(missing("ConfigMap", namespace, name)),
        }
    }

    if let Some(secret_ref) = &source.secret_ref {
        let name = secret_ref.name.as_str();
        match getter.get_secret(namespace, name) {
            Some(secret) => {
                for (key, value) in secret.data.iter().flatten() {
                    env.set_value(
                        format!("{prefix}{key}"),
                        String::from_utf8_lossy(&value.0).into_owned(),
                    );
                }
                for (key, value) in secret.string_data.iter().flatten() {
                    env.set_value(format!("{prefix}{key}"), value.clone());
                }
            }
            None if secret_ref.optional == Some(true) => {
                debug!(namespace, name, "optional envFrom Secret missing, skipping");
            }
            None => return Err(missing("Secret", namespace, name)),
        }
    }
    Ok(())
}

/// Resolve one `env` entry; `Ok(None)` drops an unresolvable optional reference
fn resolve_env_var(
    var: EnvVar,
    namespace: &str,
    getter: &dyn EnvResourceGetter,
) -> Result<Option<EnvVar>> {
    let Some(value_from) = &var.value_from else {
        return Ok(Some(var));
    };

    if let Some(key_ref) = &value_from.config_map_key_ref {
        let name = key_ref.name.as_str();
        let value = getter
            .get_config_map(namespace, name)
            .and_then(|cm| cm.data.as_ref()?.get(&key_ref.key).cloned());
        return match value {
            Some(value) => Ok(Some(literal(var.name, value))),
            None if key_ref.optional == Some(true) => Ok(None),
            None => Err(missing("ConfigMap", namespace, name)),
        };
    }

    if let Some(key_ref) = &value_from.secret_key_ref {
        let name = key_ref.name.as_str();
        let value = getter.get_secret(namespace, name).and_then(|secret| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(&key_ref.key))
                .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
                .or_else(|| secret.string_data.as_ref()?.get(&key_ref.key).cloned())
        });
        return match value {
            Some(value) => Ok(Some(literal(var.name, value))),
            None if key_ref.optional == Some(true) => Ok(None),
            None => Err(missing("Secret", namespace, name)),
        };
    }

    // fieldRef and resourceFieldRef are evaluated by the leaf kubelet
    Ok(Some(var))
}

fn literal(name: String, value: String) -> EnvVar {
    EnvVar {
        name,
        value: Some(value),
        value_from: None,
    }
}

fn missing(kind: &'static str, namespace: &str, name: &str) -> Error {
    Error::MissingDependency {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

/// Docker-link style variables for every Service of `namespace` with a cluster IP
pub fn service_link_vars(namespace: &str, services: &[std::sync::Arc<Service>]) -> Vec<EnvVar> {
    let mut services: Vec<&Service> = services
        .iter()
        .map(AsRef::as_ref)
        .filter(|svc| svc.metadata.namespace.as_deref() == Some(namespace))
        .collect();
    services.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    let mut env = EnvBuilder::default();
    for svc in services {
        let Some(spec) = &svc.spec else { continue };
        let Some(ip) = spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
        else {
            continue;
        };
        let ports = spec.ports.as_deref().unwrap_or_default();
        let Some(first) = ports.first() else { continue };
        let prefix = env_name(svc.metadata.name.as_deref().unwrap_or_default());

        env.set_value(format!("{prefix}_SERVICE_HOST"), ip.to_string());
        env.set_value(format!("{prefix}_SERVICE_PORT"), first.port.to_string());
        for port in ports {
            if let Some(port_name) = port.name.as_deref().filter(|n| !n.is_empty()) {
                env.set_value(
                    format!("{prefix}_SERVICE_PORT_{}", env_name(port_name)),
                    port.port.to_string(),
                );
            }
        }

        let first_proto = first.protocol.as_deref().unwrap_or("TCP");
        env.set_value(
            format!("{prefix}_PORT"),
            format!("{}://{ip}:{}", first_proto.to_lowercase(), first.port),
        );
        for port in ports {
            let proto = port.protocol.as_deref().unwrap_or("TCP");
            let base = format!("{prefix}_PORT_{}_{}", port.port, proto.to_uppercase());
            env.set_value(
                base.clone(),
                format!("{}://{ip}:{}", proto.to_lowercase(), port.port),
            );
            env.set_value(format!("{base}_PROTO"), proto.to_lowercase());
            env.set_value(format!("{base}_PORT"), port.port.to_string());
            env.set_value(format!("{base}_ADDR"), ip.to_string());
        }
    }
    env.vars
}

fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}
