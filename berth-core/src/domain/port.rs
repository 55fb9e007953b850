//! Port spec parsing
//!
//! Turns `[ip:][hostPort:]containerPort[/proto]` specs (ports or inclusive
//! ranges) into the exposed-port set and host bindings used when creating a
//! container.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid port spec {spec:?}: {reason}")]
pub struct PortSpecError {
    pub spec: String,
    pub reason: String,
}

/// A single host binding for a container port
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

/// One parsed port spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub host_ip: Option<String>,
    pub host_ports: Option<RangeInclusive<u16>>,
    pub container_ports: RangeInclusive<u16>,
    pub protocol: String,
}

/// Exposed ports and bindings, keyed by `port/proto`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    pub exposed: BTreeSet<String>,
    pub bindings: BTreeMap<String, Vec<PortBinding>>,
}

impl PortSpec {
    pub fn parse(spec: &str) -> Result<Self, PortSpecError> {
        let fail = |reason: String| PortSpecError {
            spec: spec.to_string(),
            reason,
        };

        let (addr, protocol) = match spec.rsplit_once('/') {
            Some((addr, proto)) => (addr, proto.to_ascii_lowercase()),
            None => (spec, "tcp".to_string()),
        };
        if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
            return Err(fail(format!("unsupported protocol {protocol:?}")));
        }

        // IPv6 host addresses come bracketed: [::1]:8080:80
        let (host_ip, ports) = match addr.strip_prefix('[') {
            Some(bracketed) => {
                let (ip, rest) = bracketed
                    .split_once("]:")
                    .ok_or_else(|| fail("unterminated IPv6 address".to_string()))?;
                (Some(ip.to_string()), rest)
            }
            None => match addr.matches(':').count() {
                0 | 1 => (None, addr),
                2 => {
                    let (ip, rest) = addr.split_once(':').unwrap_or_default();
                    ((!ip.is_empty()).then(|| ip.to_string()), rest)
                }
                _ => return Err(fail("too many ':' separators".to_string())),
            },
        };

        let (host_part, container_part) = match ports.split_once(':') {
            Some((host, container)) => (Some(host), container),
            None => (None, ports),
        };

        let container_ports = parse_range(container_part).map_err(&fail)?;
        let host_ports = match host_part {
            None | Some("") => None,
            Some(host) => Some(parse_range(host).map_err(&fail)?),
        };

        if let Some(host) = &host_ports {
            let host_len = host.end() - host.start();
            let container_len = container_ports.end() - container_ports.start();
            // A host range for one container port lets the runtime pick a free one
            if host_len != container_len && container_len != 0 {
                return Err(fail(if host_len == 0 {
                    "a single host port can't bind a container port range".to_string()
                } else {
                    "host and container port ranges differ in size".to_string()
                }));
            }
        }

        Ok(Self {
            host_ip,
            host_ports,
            container_ports,
            protocol,
        })
    }

    /// Expands the spec into `(port/proto, binding)` pairs
    pub fn entries(&self) -> Vec<(String, PortBinding)> {
        self.container_ports
            .clone()
            .enumerate()
            .map(|(offset, port)| {
                let host_port = self.host_ports.as_ref().map(|range| {
                    if self.container_ports.start() == self.container_ports.end()
                        && range.start() != range.end()
                    {
                        format!("{}-{}", range.start(), range.end())
                    } else {
                        (range.start() + offset as u16).to_string()
                    }
                });
                (
                    format!("{}/{}", port, self.protocol),
                    PortBinding {
                        host_ip: self.host_ip.clone(),
                        host_port,
                    },
                )
            })
            .collect()
    }
}

/// Parses a list of port specs into exposed ports and bindings
pub fn parse_port_specs<S: AsRef<str>>(specs: &[S]) -> Result<PortMap, PortSpecError> {
    let mut map = PortMap::default();
    for spec in specs {
        for (key, binding) in PortSpec::parse(spec.as_ref())?.entries() {
            map.exposed.insert(key.clone());
            map.bindings.entry(key).or_default().push(binding);
        }
    }
    Ok(map)
}

fn parse_range(text: &str) -> Result<RangeInclusive<u16>, String> {
    let parse_port = |s: &str| {
        s.parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port {s:?}"))
    };

    match text.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse_port(start)?, parse_port(end)?);
            if end < start {
                return Err(format!("invalid port range {text:?}"));
            }
            Ok(start..=end)
        }
        None => {
            let port = parse_port(text)?;
            Ok(port..=port)
        }
    }
}
