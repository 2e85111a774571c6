//! The immutable resolved plan: a task, its main container, and the
//! transitive container dependency graph, plus any run-time overrides (§3).

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stacked_errors::{Result, StackableErr};

/// Where a container's image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSource {
    Pull {
        reference: String,
    },
    Build {
        context_path: PathBuf,
        dockerfile: Option<PathBuf>,
        build_args: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub options: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Overrides to a container's declared Docker healthcheck. `None` fields mean
/// "use whatever the image itself declares" (§4.3: zero when unspecified).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAndGroup {
    pub uid: u32,
    pub gid: u32,
}

/// A declared container: image source, environment, volumes, ports, health
/// check, and the set of other containers it depends on (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image_source: ImageSource,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub volume_mounts: BTreeSet<VolumeMountKey>,
    pub port_mappings: BTreeSet<PortMapping>,
    pub health_check: HealthCheckConfig,
    pub user_and_group: Option<UserAndGroup>,
    pub dependencies: BTreeSet<String>,
}

/// `VolumeMount` wrapped so it has a total order (`Duration`-free `Ord`),
/// letting it live in a `BTreeSet` alongside the rest of the container's
/// declaration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeMountKey(pub VolumeMount);

impl PartialOrd for PortMapping {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PortMapping {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.host_port, self.container_port).cmp(&(other.host_port, other.container_port))
    }
}

impl PartialOrd for VolumeMount {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VolumeMount {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.host_path, &self.container_path, &self.options).cmp(&(
            &other.host_path,
            &other.container_path,
            &other.options,
        ))
    }
}

/// A task: the main container to run, an optional command override, extra
/// environment for the main container, plus (once resolved) the implicit
/// dependency closure (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub main_container: String,
    pub command_override: Option<String>,
    pub environment_overrides: BTreeMap<String, String>,
}

/// The fully resolved plan handed to the engine at construction: a task plus
/// every container in its transitive dependency closure, in a stable
/// dependency-first order (§3, §4.4).
#[derive(Debug, Clone)]
pub struct TaskModel {
    pub task: Task,
    containers: BTreeMap<String, Container>,
    /// Dependency-first (topological) order of `containers` keys.
    build_order: Vec<String>,
}

impl TaskModel {
    /// Resolves `task` against `all_containers` (every container declared in
    /// the project), keeping only the transitive dependency closure of the
    /// task's main container.
    pub fn resolve(task: Task, all_containers: Vec<Container>) -> Result<Self> {
        let by_name: BTreeMap<String, Container> = all_containers
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        if !by_name.contains_key(&task.main_container) {
            return Err(format!(
                "task \"{}\" references unknown main container \"{}\"",
                task.name, task.main_container
            ))
            .stack();
        }

        let mut closure = BTreeSet::new();
        let mut stack = vec![task.main_container.clone()];
        while let Some(name) = stack.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let container = by_name
                .get(&name)
                .stack_err_with(|| format!("dependency \"{name}\" is not declared"))?;
            for dep in &container.dependencies {
                stack.push(dep.clone());
            }
        }

        let containers: BTreeMap<String, Container> = by_name
            .into_iter()
            .filter(|(name, _)| closure.contains(name))
            .collect();

        let build_order = topological_order(&containers).stack_err_with(|| {
            format!("task \"{}\" has a cyclic container dependency graph", task.name)
        })?;

        Ok(Self {
            task,
            containers,
            build_order,
        })
    }

    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    pub fn main_container(&self) -> &Container {
        self.containers
            .get(&self.task.main_container)
            .expect("TaskModel::resolve guarantees the main container is present")
    }

    /// All containers in the closure, dependency-first.
    pub fn containers_in_build_order(&self) -> impl Iterator<Item = &Container> {
        self.build_order.iter().map(move |name| &self.containers[name])
    }

    pub fn container_names(&self) -> impl Iterator<Item = &str> {
        self.build_order.iter().map(String::as_str)
    }

    pub fn is_main_container(&self, name: &str) -> bool {
        name == self.task.main_container
    }
}

fn topological_order(containers: &BTreeMap<String, Container>) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut order = Vec::with_capacity(containers.len());

    fn visit<'a>(
        name: &'a str,
        containers: &'a BTreeMap<String, Container>,
        marks: &mut BTreeMap<&'a str, Mark>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(format!("dependency cycle through container \"{name}\"")).stack()
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        if let Some(container) = containers.get(name) {
            for dep in &container.dependencies {
                visit(dep, containers, marks, order)?;
            }
        }
        marks.insert(name, Mark::Done);
        order.push(name.to_owned());
        Ok(())
    }

    for name in containers.keys() {
        visit(name, containers, &mut marks, &mut order)?;
    }

    Ok(order)
}
