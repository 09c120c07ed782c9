use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};
use crate::models::{Environment, ServiceSpec};

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap());

/// A start command fully parameterized for one service at one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub service: String,
    pub shell_line: String,
    pub working_path: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Static, ordered catalog of services. Built once per run from the loaded
/// config; read-only thereafter.
pub struct ServiceRegistry {
    specs: Vec<ServiceSpec>,
}

impl ServiceRegistry {
    pub fn new(specs: Vec<ServiceSpec>) -> Result<Self> {
        let mut seen_names: HashMap<&str, ()> = HashMap::new();
        let mut seen_ports: HashMap<u16, &str> = HashMap::new();
        for spec in &specs {
            if seen_names.insert(spec.name.as_str(), ()).is_some() {
                return Err(OrchestratorError::Config(format!(
                    "duplicate service name '{}'",
                    spec.name
                )));
            }
            if let Some(other) = seen_ports.insert(spec.production_port, spec.name.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "production port {} shared by '{}' and '{}'",
                    spec.production_port, other, spec.name
                )));
            }
        }
        for spec in &specs {
            let shadow_port = spec.production_port as u32 + spec.shadow_port_offset as u32;
            if shadow_port > u16::MAX as u32 {
                return Err(OrchestratorError::Config(format!(
                    "shadow port {shadow_port} of '{}' is outside the valid port range",
                    spec.name
                )));
            }
            if seen_ports.contains_key(&(shadow_port as u16)) {
                return Err(OrchestratorError::Config(format!(
                    "shadow port {shadow_port} of '{}' collides with a production port",
                    spec.name
                )));
            }
            for dep in &spec.dependencies {
                if !seen_names.contains_key(dep.as_str()) {
                    return Err(OrchestratorError::Config(format!(
                        "service '{}' depends on unknown service '{dep}'",
                        spec.name
                    )));
                }
            }
        }
        Ok(Self { specs })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn specs(&self) -> &[ServiceSpec] {
        &self.specs
    }

    /// Services in dependency-first topological order. A cycle fails the
    /// deployment here rather than looping.
    pub fn topo_order(&self) -> Result<Vec<&ServiceSpec>> {
        let index: HashMap<&str, usize> = self
            .specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.specs.len()];
        for (i, spec) in self.specs.iter().enumerate() {
            for dep in &spec.dependencies {
                let d = index[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        // Seed with registry order so independent services keep their
        // declared position.
        let mut queue: VecDeque<usize> = (0..self.specs.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.specs.len());
        while let Some(i) = queue.pop_front() {
            order.push(&self.specs[i]);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }

        if order.len() != self.specs.len() {
            let stuck: Vec<&str> = self
                .specs
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.name.as_str())
                .collect();
            return Err(OrchestratorError::Config(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    /// Produce the fully parameterized start command for `name` at `port`.
    ///
    /// `PORT` and `TAG` are injected bindings; every other `${VAR}`
    /// placeholder and every variable in the spec's `env` list must be
    /// present in the validated environment.
    pub fn resolve(
        &self,
        name: &str,
        port: u16,
        tag: &str,
        environment: &Environment,
    ) -> Result<ResolvedCommand> {
        let spec = self
            .get(name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;

        let mut bindings: HashMap<&str, String> = HashMap::new();
        bindings.insert("PORT", port.to_string());
        bindings.insert("TAG", tag.to_string());
        for var in &spec.env {
            let value = environment.get(var).ok_or_else(|| {
                OrchestratorError::Config(format!(
                    "service '{}' requires environment variable '{var}'",
                    spec.name
                ))
            })?;
            bindings.insert(var.as_str(), value.to_string());
        }

        let mut unresolved = None;
        let shell_line = PLACEHOLDER_RE
            .replace_all(&spec.start_command, |caps: &regex::Captures<'_>| {
                match bindings.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => {
                        unresolved.get_or_insert_with(|| caps[1].to_string());
                        String::new()
                    }
                }
            })
            .into_owned();
        if let Some(var) = unresolved {
            return Err(OrchestratorError::Config(format!(
                "start command for '{}' references '{var}', which is not in its env list",
                spec.name
            )));
        }

        let mut env: Vec<(String, String)> = spec
            .env
            .iter()
            .map(|var| (var.clone(), bindings[var.as_str()].clone()))
            .collect();
        env.push(("PORT".into(), port.to_string()));
        env.push(("TAG".into(), tag.to_string()));

        Ok(ResolvedCommand {
            service: spec.name.clone(),
            shell_line,
            working_path: PathBuf::from(&spec.working_path),
            env,
        })
    }
}
