//! Environment materialization
//!
//! Expands the `envFrom` and `env` entries of every container into literal
//! key/value pairs read from the resource manager. `env` wins over `envFrom`
//! on a key collision, and service link variables fill in whatever is left.
//! After materialization `envFrom` is empty and `env` holds plain values.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, ObjectFieldSelector, Pod, ResourceFieldSelector, Service,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

use crate::adapters::EventRecorder;
use crate::manager::{object_key, ResourceManager};
use crate::{Error, Result};

pub const REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND: &str = "OptionalConfigMapNotFound";
pub const REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND: &str = "OptionalConfigMapKeyNotFound";
pub const REASON_MANDATORY_CONFIG_MAP_NOT_FOUND: &str = "MandatoryConfigMapNotFound";
pub const REASON_MANDATORY_CONFIG_MAP_KEY_NOT_FOUND: &str = "MandatoryConfigMapKeyNotFound";
pub const REASON_OPTIONAL_SECRET_NOT_FOUND: &str = "OptionalSecretNotFound";
pub const REASON_OPTIONAL_SECRET_KEY_NOT_FOUND: &str = "OptionalSecretKeyNotFound";
pub const REASON_MANDATORY_SECRET_NOT_FOUND: &str = "MandatorySecretNotFound";
pub const REASON_MANDATORY_SECRET_KEY_NOT_FOUND: &str = "MandatorySecretKeyNotFound";
pub const REASON_INVALID_ENVIRONMENT_VARIABLE_NAMES: &str = "InvalidEnvironmentVariableNames";

/// Services whose variables every pod sees regardless of `enableServiceLinks`
const MASTER_SERVICES: &[&str] = &["kubernetes"];
const DEFAULT_NAMESPACE: &str = "default";

/// Warning raised while resolving, recorded against the pod afterwards
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvEvent {
    pub reason: &'static str,
    pub message: String,
}

/// Whether `name` is a valid shell environment variable identifier
pub fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolve the environment of every init and regular container of `pod` in place.
///
/// Warning events are recorded against the pod whether or not resolution succeeds.
pub async fn populate_environment_variables(
    pod: &mut Pod,
    resources: &ResourceManager,
    recorder: &EventRecorder,
) -> Result<()> {
    let mut events = Vec::new();
    let resolved = resolve_pod(pod, resources, &mut events);

    for event in &events {
        recorder.warning(pod, event.reason, event.message.clone()).await;
    }

    let (init, regular) = resolved?;
    if let Some(spec) = pod.spec.as_mut() {
        if let Some(containers) = spec.init_containers.as_mut() {
            for (container, env) in containers.iter_mut().zip(init) {
                apply_env(container, env);
            }
        }
        for (container, env) in spec.containers.iter_mut().zip(regular) {
            apply_env(container, env);
        }
    }
    Ok(())
}

type ResolvedEnv = BTreeMap<String, String>;

fn apply_env(container: &mut Container, env: ResolvedEnv) {
    container.env_from = None;
    container.env = Some(
        env.into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                value_from: None,
            })
            .collect(),
    );
}

fn resolve_pod(
    pod: &Pod,
    resources: &ResourceManager,
    events: &mut Vec<EnvEvent>,
) -> Result<(Vec<ResolvedEnv>, Vec<ResolvedEnv>)> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok((Vec::new(), Vec::new()));
    };

    let namespace = pod.namespace().unwrap_or_default();
    let service_links = spec.enable_service_links.unwrap_or(true);
    let service_env = service_env_map(&resources.get_services(), &namespace, service_links);

    let mut init = Vec::new();
    for container in spec.init_containers.iter().flatten() {
        init.push(resolve_container(pod, container, resources, &service_env, events)?);
    }
    let mut regular = Vec::new();
    for container in &spec.containers {
        regular.push(resolve_container(pod, container, resources, &service_env, events)?);
    }
    Ok((init, regular))
}

fn resolve_container(
    pod: &Pod,
    container: &Container,
    resources: &ResourceManager,
    service_env: &ResolvedEnv,
    events: &mut Vec<EnvEvent>,
) -> Result<ResolvedEnv> {
    let mut env = ResolvedEnv::new();
    for source in container.env_from.iter().flatten() {
        resolve_env_from(pod, source, resources, &mut env, events)?;
    }

    for var in container.env.iter().flatten() {
        let value = match &var.value_from {
            None => Some(expand(
                var.value.as_deref().unwrap_or_default(),
                &[&env, service_env],
            )),
            Some(source) => {
                if let Some(sel) = &source.config_map_key_ref {
                    config_map_key(pod, &var.name, &sel.name, &sel.key, sel.optional, resources, events)?
                } else if let Some(sel) = &source.secret_key_ref {
                    secret_key(pod, &var.name, &sel.name, &sel.key, sel.optional, resources, events)?
                } else if let Some(sel) = &source.field_ref {
                    Some(field_ref_value(pod, sel)?)
                } else if let Some(sel) = &source.resource_field_ref {
                    resource_field_value(pod, container, sel)?
                } else {
                    tracing::warn!(env = %var.name, "Environment variable has an empty valueFrom, skipping");
                    None
                }
            }
        };
        if let Some(value) = value {
            env.insert(var.name.clone(), value);
        }
    }

    for (name, value) in service_env {
        env.entry(name.clone()).or_insert_with(|| value.clone());
    }
    Ok(env)
}

fn resolve_env_from(
    pod: &Pod,
    source: &EnvFromSource,
    resources: &ResourceManager,
    env: &mut ResolvedEnv,
    events: &mut Vec<EnvEvent>,
) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let prefix = source.prefix.as_deref().unwrap_or_default();

    if let Some(r) = &source.config_map_ref {
        let optional = r.optional.unwrap_or(false);
        let Some(cm) = resources.get_config_map(&r.name, &namespace) else {
            let message = format!("configmap {:?} not found", r.name);
            if optional {
                events.push(EnvEvent {
                    reason: REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND,
                    message,
                });
                return Ok(());
            }
            events.push(EnvEvent {
                reason: REASON_MANDATORY_CONFIG_MAP_NOT_FOUND,
                message: message.clone(),
            });
            return Err(Error::Materialization(message));
        };
        let data = cm.data.clone().unwrap_or_default();
        merge_keys(prefix, data, "configmap", &namespace, &r.name, env, events);
    } else if let Some(r) = &source.secret_ref {
        let optional = r.optional.unwrap_or(false);
        let Some(secret) = resources.get_secret(&r.name, &namespace) else {
            let message = format!("secret {:?} not found", r.name);
            if optional {
                events.push(EnvEvent {
                    reason: REASON_OPTIONAL_SECRET_NOT_FOUND,
                    message,
                });
                return Ok(());
            }
            events.push(EnvEvent {
                reason: REASON_MANDATORY_SECRET_NOT_FOUND,
                message: message.clone(),
            });
            return Err(Error::Materialization(message));
        };
        let data = secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
            .collect();
        merge_keys(prefix, data, "secret", &namespace, &r.name, env, events);
    }
    Ok(())
}

/// Merge `data` under `prefix`, skipping and reporting keys that are not valid variable names
fn merge_keys(
    prefix: &str,
    data: BTreeMap<String, String>,
    kind: &str,
    namespace: &str,
    name: &str,
    env: &mut ResolvedEnv,
    events: &mut Vec<EnvEvent>,
) {
    let mut invalid = Vec::new();
    for (key, value) in data {
        let key = format!("{}{}", prefix, key);
        if is_valid_env_var_name(&key) {
            env.insert(key, value);
        } else {
            invalid.push(key);
        }
    }
    if !invalid.is_empty() {
        invalid.sort();
        events.push(EnvEvent {
            reason: REASON_INVALID_ENVIRONMENT_VARIABLE_NAMES,
            message: format!(
                "keys [{}] from {} {}/{} were skipped since they are invalid as environment variable names",
                invalid.join(", "),
                kind,
                namespace,
                name
            ),
        });
    }
}

fn config_map_key(
    pod: &Pod,
    var: &str,
    name: &str,
    key: &str,
    optional: Option<bool>,
    resources: &ResourceManager,
    events: &mut Vec<EnvEvent>,
) -> Result<Option<String>> {
    let optional = optional.unwrap_or(false);
    let namespace = pod.namespace().unwrap_or_default();
    let Some(cm) = resources.get_config_map(name, &namespace) else {
        if optional {
            events.push(EnvEvent {
                reason: REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND,
                message: format!("skipping optional envvar {:?}: configmap {:?} not found", var, name),
            });
            return Ok(None);
        }
        let message = format!("configmap {:?} not found", name);
        events.push(EnvEvent {
            reason: REASON_MANDATORY_CONFIG_MAP_NOT_FOUND,
            message: message.clone(),
        });
        return Err(Error::Materialization(message));
    };

    match cm.data.as_ref().and_then(|d| d.get(key)) {
        Some(value) => Ok(Some(value.clone())),
        None if optional => {
            events.push(EnvEvent {
                reason: REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND,
                message: format!(
                    "skipping optional envvar {:?}: key {:?} does not exist in configmap {:?}",
                    var, key, name
                ),
            });
            Ok(None)
        }
        None => {
            events.push(EnvEvent {
                reason: REASON_MANDATORY_CONFIG_MAP_KEY_NOT_FOUND,
                message: format!("key {:?} does not exist in configmap {:?}", key, name),
            });
            Err(Error::Materialization(format!(
                "configmap {:?} doesn't contain the {:?} key required by pod {}",
                name,
                key,
                pod.name_any()
            )))
        }
    }
}

fn secret_key(
    pod: &Pod,
    var: &str,
    name: &str,
    key: &str,
    optional: Option<bool>,
    resources: &ResourceManager,
    events: &mut Vec<EnvEvent>,
) -> Result<Option<String>> {
    let optional = optional.unwrap_or(false);
    let namespace = pod.namespace().unwrap_or_default();
    let Some(secret) = resources.get_secret(name, &namespace) else {
        if optional {
            events.push(EnvEvent {
                reason: REASON_OPTIONAL_SECRET_NOT_FOUND,
                message: format!("skipping optional envvar {:?}: secret {:?} not found", var, name),
            });
            return Ok(None);
        }
        let message = format!("secret {:?} not found", name);
        events.push(EnvEvent {
            reason: REASON_MANDATORY_SECRET_NOT_FOUND,
            message: message.clone(),
        });
        return Err(Error::Materialization(message));
    };

    match secret.data.as_ref().and_then(|d| d.get(key)) {
        Some(value) => Ok(Some(String::from_utf8_lossy(&value.0).into_owned())),
        None if optional => {
            events.push(EnvEvent {
                reason: REASON_OPTIONAL_SECRET_KEY_NOT_FOUND,
                message: format!(
                    "skipping optional envvar {:?}: key {:?} does not exist in secret {:?}",
                    var, key, name
                ),
            });
            Ok(None)
        }
        None => {
            events.push(EnvEvent {
                reason: REASON_MANDATORY_SECRET_KEY_NOT_FOUND,
                message: format!("key {:?} does not exist in secret {:?}", key, name),
            });
            Err(Error::Materialization(format!(
                "secret {:?} doesn't contain the {:?} key required by pod {}",
                name,
                key,
                pod.name_any()
            )))
        }
    }
}

/// Value of a downward API field of the pod
pub fn field_ref_value(pod: &Pod, selector: &ObjectFieldSelector) -> Result<String> {
    let path = selector.field_path.as_str();
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();

    if let Some(key) = subscript(path, "metadata.labels") {
        return Ok(pod.labels().get(key).cloned().unwrap_or_default());
    }
    if let Some(key) = subscript(path, "metadata.annotations") {
        return Ok(pod.annotations().get(key).cloned().unwrap_or_default());
    }

    let value = match path {
        "metadata.name" => pod.name_any(),
        "metadata.namespace" => pod.namespace().unwrap_or_default(),
        "metadata.uid" => pod.uid().unwrap_or_default(),
        "spec.nodeName" => spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
        "spec.serviceAccountName" => spec
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_default(),
        "status.hostIP" => status.and_then(|s| s.host_ip.clone()).unwrap_or_default(),
        "status.podIP" => status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        "status.podIPs" => status
            .and_then(|s| s.pod_ips.as_ref())
            .map(|ips| ips.iter().map(|ip| ip.ip.clone()).collect::<Vec<_>>().join(","))
            .unwrap_or_default(),
        other => {
            return Err(Error::Materialization(format!(
                "unsupported field path {:?}",
                other
            )))
        }
    };
    Ok(value)
}

/// `metadata.labels['key']` style subscript
fn subscript<'a>(path: &'a str, field: &str) -> Option<&'a str> {
    path.strip_prefix(field)?
        .strip_prefix("['")?
        .strip_suffix("']")
}

/// Value of a container resource divided by the selector divisor, rounded up.
/// Limits fall back to requests; a resource set on neither yields no variable.
pub fn resource_field_value(
    pod: &Pod,
    container: &Container,
    selector: &ResourceFieldSelector,
) -> Result<Option<String>> {
    let target = match selector.container_name.as_deref() {
        Some(name) if !name.is_empty() && name != container.name => pod
            .spec
            .as_ref()
            .and_then(|s| {
                s.containers
                    .iter()
                    .chain(s.init_containers.iter().flatten())
                    .find(|c| c.name == name)
            })
            .ok_or_else(|| Error::Materialization(format!("container {:?} not found", name)))?,
        _ => container,
    };

    let (kind, resource) = selector
        .resource
        .split_once('.')
        .ok_or_else(|| Error::Materialization(format!("unsupported resource {:?}", selector.resource)))?;
    if !matches!(resource, "cpu" | "memory" | "ephemeral-storage") {
        return Err(Error::Materialization(format!(
            "unsupported resource {:?}",
            selector.resource
        )));
    }

    let requirements = target.resources.as_ref();
    let requests = requirements.and_then(|r| r.requests.as_ref()).and_then(|m| m.get(resource));
    let limits = requirements.and_then(|r| r.limits.as_ref()).and_then(|m| m.get(resource));
    let quantity = match kind {
        "requests" => requests,
        "limits" => limits.or(requests),
        _ => {
            return Err(Error::Materialization(format!(
                "unsupported resource {:?}",
                selector.resource
            )))
        }
    };
    let Some(quantity) = quantity else {
        tracing::debug!(resource = %selector.resource, container = %target.name, "Resource not set, skipping variable");
        return Ok(None);
    };

    let divisor = selector
        .divisor
        .as_ref()
        .map(|d| parse_quantity_nanos(d))
        .transpose()?
        .unwrap_or(NANOS);
    if divisor <= 0 {
        return Err(Error::Materialization("resource divisor must be positive".to_string()));
    }
    let value = parse_quantity_nanos(quantity)?;
    let rounded = value / divisor + i128::from(value % divisor > 0);
    Ok(Some(rounded.to_string()))
}

const NANOS: i128 = 1_000_000_000;

/// Parse a resource quantity into billionths of a unit, rounding up
fn parse_quantity_nanos(quantity: &Quantity) -> Result<i128> {
    let s = quantity.0.trim();
    let invalid = || Error::Materialization(format!("invalid quantity {:?}", quantity.0));

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (numerator, denominator): (i128, i128) = match suffix {
        "" => (NANOS, 1),
        "n" => (1, 1),
        "u" => (1_000, 1),
        "m" => (1_000_000, 1),
        "k" => (NANOS * 1_000, 1),
        "M" => (NANOS * 1_000_000, 1),
        "G" => (NANOS * 1_000_000_000, 1),
        "T" => (NANOS * 1_000_000_000_000, 1),
        "P" => (NANOS * 1_000_000_000_000_000, 1),
        "E" => (NANOS * 1_000_000_000_000_000_000, 1),
        "Ki" => (NANOS << 10, 1),
        "Mi" => (NANOS << 20, 1),
        "Gi" => (NANOS << 30, 1),
        "Ti" => (NANOS << 40, 1),
        "Pi" => (NANOS << 50, 1),
        "Ei" => (NANOS << 60, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let e: i32 = exp[1..].parse().map_err(|_| invalid())?;
            if e >= 0 {
                (NANOS * 10i128.checked_pow(e as u32).ok_or_else(invalid)?, 1)
            } else {
                (NANOS, 10i128.checked_pow(e.unsigned_abs()).ok_or_else(invalid)?)
            }
        }
        _ => return Err(invalid()),
    };

    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    let mantissa: i128 = format!("{}{}", whole, fraction)
        .parse()
        .map_err(|_| invalid())?;
    let scale = 10i128
        .checked_pow(fraction.len() as u32)
        .ok_or_else(invalid)?;

    let num = mantissa.checked_mul(numerator).ok_or_else(invalid)?;
    let den = scale.checked_mul(denominator).ok_or_else(invalid)?;
    let value = num / den + i128::from(num % den > 0);
    Ok(if negative { -value } else { value })
}

/// Expand `$(NAME)` references from `sources`, searched in order.
/// `$$` escapes a dollar sign; unknown references are left as written.
pub fn expand(input: &str, sources: &[&ResolvedEnv]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('(') {
            match body.find(')') {
                Some(end) => {
                    let name = &body[..end];
                    match sources.iter().find_map(|s| s.get(name)) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("$(");
                            out.push_str(name);
                            out.push(')');
                        }
                    }
                    rest = &body[end + 1..];
                }
                None => {
                    out.push_str("$(");
                    rest = body;
                }
            }
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn env_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

fn service_ip_set(service: &Service) -> bool {
    matches!(
        service.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()),
        Some(ip) if !ip.is_empty() && ip != "None"
    )
}

/// Service link variables visible to a pod in `namespace`
pub fn service_env_map<S>(services: &[S], namespace: &str, enable_service_links: bool) -> ResolvedEnv
where
    S: Borrow<Service>,
{
    let mut selected: BTreeMap<String, &Service> = BTreeMap::new();
    for service in services.iter().map(Borrow::borrow) {
        if !service_ip_set(service) {
            continue;
        }
        let name = service.name_any();
        let svc_ns = service.namespace().unwrap_or_default();
        if svc_ns == DEFAULT_NAMESPACE && MASTER_SERVICES.contains(&name.as_str()) {
            selected.entry(name).or_insert(service);
        } else if svc_ns == namespace && enable_service_links {
            selected.insert(name, service);
        }
    }

    let mut env = ResolvedEnv::new();
    for service in selected.values() {
        service_vars(service, &mut env);
    }
    env
}

fn service_vars(service: &Service, env: &mut ResolvedEnv) {
    let Some(spec) = service.spec.as_ref() else {
        return;
    };
    let ip = spec.cluster_ip.clone().unwrap_or_default();
    let prefix = env_name(&service.name_any());
    let ports = spec.ports.as_deref().unwrap_or_default();

    env.insert(format!("{}_SERVICE_HOST", prefix), ip.clone());
    let Some(first) = ports.first() else {
        return;
    };
    env.insert(format!("{}_SERVICE_PORT", prefix), first.port.to_string());
    for port in ports {
        if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
            env.insert(
                format!("{}_SERVICE_PORT_{}", prefix, env_name(name)),
                port.port.to_string(),
            );
        }
    }

    let host = if ip.contains(':') {
        format!("[{}]", ip)
    } else {
        ip.clone()
    };
    for (i, port) in ports.iter().enumerate() {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        let url = format!("{}://{}:{}", protocol.to_lowercase(), host, port.port);
        if i == 0 {
            env.insert(format!("{}_PORT", prefix), url.clone());
        }
        let port_prefix = format!("{}_PORT_{}_{}", prefix, port.port, protocol.to_uppercase());
        env.insert(port_prefix.clone(), url);
        env.insert(format!("{}_PROTO", port_prefix), protocol.to_lowercase());
        env.insert(format!("{}_PORT", port_prefix), port.port.to_string());
        env.insert(format!("{}_ADDR", port_prefix), ip.clone());
    }
}

/// `namespace/name` keys of the configmaps and secrets a pod references through
/// `env`, `envFrom` or volumes
pub fn pod_references(pod: &Pod) -> (BTreeSet<String>, BTreeSet<String>) {
    let namespace = pod.namespace().unwrap_or_default();
    let mut config_maps = BTreeSet::new();
    let mut secrets = BTreeSet::new();
    let Some(spec) = pod.spec.as_ref() else {
        return (config_maps, secrets);
    };

    let containers = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten());
    for container in containers {
        for source in container.env_from.iter().flatten() {
            if let Some(r) = &source.config_map_ref {
                config_maps.insert(object_key(&namespace, &r.name));
            }
            if let Some(r) = &source.secret_ref {
                secrets.insert(object_key(&namespace, &r.name));
            }
        }
        for var in container.env.iter().flatten() {
            let Some(source) = &var.value_from else {
                continue;
            };
            if let Some(sel) = &source.config_map_key_ref {
                config_maps.insert(object_key(&namespace, &sel.name));
            }
            if let Some(sel) = &source.secret_key_ref {
                secrets.insert(object_key(&namespace, &sel.name));
            }
        }
    }

    for volume in spec.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            config_maps.insert(object_key(&namespace, &cm.name));
        }
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.as_deref()) {
            secrets.insert(object_key(&namespace, name));
        }
    }
    (config_maps, secrets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ResourceRequirements, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn env_var_names_follow_shell_rules() {
        assert!(is_valid_env_var_name("FOO_BAR1"));
        assert!(is_valid_env_var_name("_x"));
        assert!(!is_valid_env_var_name("1ABC"));
        assert!(!is_valid_env_var_name("with-dash"));
        assert!(!is_valid_env_var_name("a.b"));
        assert!(!is_valid_env_var_name(""));
    }

    #[test]
    fn quantities_parse_to_nanos() {
        assert_eq!(parse_quantity_nanos(&q("1")).unwrap(), NANOS);
        assert_eq!(parse_quantity_nanos(&q("250m")).unwrap(), NANOS / 4);
        assert_eq!(parse_quantity_nanos(&q("1.5")).unwrap(), 1_500_000_000);
        assert_eq!(parse_quantity_nanos(&q("1Ki")).unwrap(), 1024 * NANOS);
        assert_eq!(parse_quantity_nanos(&q("2e3")).unwrap(), 2000 * NANOS);
        assert!(parse_quantity_nanos(&q("abc")).is_err());
        assert!(parse_quantity_nanos(&q("1Xi")).is_err());
    }

    fn container_with_resources() -> Container {
        Container {
            name: "app".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), q("250m")),
                    ("memory".to_string(), q("64Mi")),
                ])),
                limits: Some(BTreeMap::from([("cpu".to_string(), q("1500m"))])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn resource_ref(resource: &str, divisor: Option<&str>) -> ResourceFieldSelector {
        ResourceFieldSelector {
            container_name: None,
            divisor: divisor.map(q),
            resource: resource.to_string(),
        }
    }

    #[test]
    fn resource_refs_round_up() {
        let pod = Pod::default();
        let container = container_with_resources();
        let value = |r: &str, d: Option<&str>| {
            resource_field_value(&pod, &container, &resource_ref(r, d)).unwrap()
        };

        assert_eq!(value("requests.cpu", None).as_deref(), Some("1"));
        assert_eq!(value("requests.cpu", Some("1m")).as_deref(), Some("250"));
        assert_eq!(value("limits.cpu", None).as_deref(), Some("2"));
        assert_eq!(value("limits.memory", Some("1Mi")).as_deref(), Some("64"));
        assert_eq!(value("requests.ephemeral-storage", None), None);
        assert!(resource_field_value(&pod, &container, &resource_ref("requests.gpu", None)).is_err());
    }

    #[test]
    fn field_refs_read_pod_metadata() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "shop".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        let field = |path: &str| {
            field_ref_value(
                &pod,
                &ObjectFieldSelector {
                    api_version: None,
                    field_path: path.to_string(),
                },
            )
        };
        assert_eq!(field("metadata.name").unwrap(), "web");
        assert_eq!(field("metadata.namespace").unwrap(), "prod");
        assert_eq!(field("metadata.labels['app']").unwrap(), "shop");
        assert_eq!(field("metadata.annotations['missing']").unwrap(), "");
        assert_eq!(field("status.podIP").unwrap(), "");
        assert!(field("spec.containers").is_err());
    }

    #[test]
    fn expansion_resolves_known_references() {
        let env = ResolvedEnv::from([("HOST".to_string(), "db".to_string())]);
        assert_eq!(expand("$(HOST):5432", &[&env]), "db:5432");
        assert_eq!(expand("$(MISSING)", &[&env]), "$(MISSING)");
        assert_eq!(expand("$$(HOST)", &[&env]), "$(HOST)");
        assert_eq!(expand("cost $5", &[&env]), "cost $5");
        assert_eq!(expand("$(HOST", &[&env]), "$(HOST");
    }

    fn service(ns: &str, name: &str, ip: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(ip.to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 8080,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn service_links_cover_namespace_and_master_service() {
        let services = vec![
            service("default", "kubernetes", "10.0.0.1"),
            service("shop", "redis-main", "10.0.0.2"),
            service("shop", "headless", "None"),
            service("other", "db", "10.0.0.3"),
        ];

        let env = service_env_map(&services, "shop", true);
        assert_eq!(env["KUBERNETES_SERVICE_HOST"], "10.0.0.1");
        assert_eq!(env["REDIS_MAIN_SERVICE_HOST"], "10.0.0.2");
        assert_eq!(env["REDIS_MAIN_SERVICE_PORT"], "8080");
        assert_eq!(env["REDIS_MAIN_SERVICE_PORT_HTTP"], "8080");
        assert_eq!(env["REDIS_MAIN_PORT"], "tcp://10.0.0.2:8080");
        assert_eq!(env["REDIS_MAIN_PORT_8080_TCP_PROTO"], "tcp");
        assert_eq!(env["REDIS_MAIN_PORT_8080_TCP_ADDR"], "10.0.0.2");
        assert!(!env.contains_key("HEADLESS_SERVICE_HOST"));
        assert!(!env.contains_key("DB_SERVICE_HOST"));

        let env = service_env_map(&services, "shop", false);
        assert!(env.contains_key("KUBERNETES_SERVICE_HOST"));
        assert!(!env.contains_key("REDIS_MAIN_SERVICE_HOST"));
    }
}
