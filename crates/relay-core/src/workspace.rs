//! Workspace packages and the package dependency graph

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::Deserialize;
use tracing::{info, instrument};

use crate::error::GraphError;
use crate::paths::AbsolutePath;

/// Name of the synthetic root vertex.
pub const ROOT_PKG_NAME: &str = "___ROOT___";

/// A workspace member.
#[derive(Debug, Clone)]
pub struct PackageInfo {
    /// Package name from its manifest
    pub name: String,
    /// Absolute package directory
    pub dir: AbsolutePath,
    /// Script name to command, from the manifest `scripts` table
    pub scripts: BTreeMap<String, String>,
    /// Names of workspace-internal packages this package depends on
    pub workspace_dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RootManifest {
    #[serde(default)]
    workspaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MemberManifest {
    name: String,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: BTreeMap<String, String>,
}

/// Enumerate workspace members from the root manifest's `workspaces`
/// globs, then resolve workspace-internal dependencies by name.
#[instrument(skip_all, fields(root = %root))]
pub fn discover_packages(root: &AbsolutePath) -> Result<Vec<PackageInfo>, GraphError> {
    let root_manifest_path = root.join("package.json");
    let content = root_manifest_path
        .read_to_string()
        .map_err(|_| GraphError::MissingRootManifest(root_manifest_path.as_path().to_path_buf()))?;
    let root_manifest: RootManifest =
        serde_json::from_str(&content).map_err(|e| GraphError::InvalidManifest {
            path: root_manifest_path.as_path().to_path_buf(),
            message: e.to_string(),
        })?;

    let mut members = Vec::new();
    for pattern in &root_manifest.workspaces {
        let full_pattern = root.join(pattern).to_string_lossy().to_string();
        let Ok(paths) = glob::glob(&full_pattern) else {
            continue;
        };
        for dir in paths.flatten() {
            let manifest_path = dir.join("package.json");
            if !manifest_path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: MemberManifest =
                serde_json::from_str(&content).map_err(|e| GraphError::InvalidManifest {
                    path: manifest_path.clone(),
                    message: e.to_string(),
                })?;
            members.push((AbsolutePath::new_unchecked(dir), manifest));
        }
    }

    if members.is_empty() {
        return Err(GraphError::NoPackages);
    }

    let names: BTreeSet<String> = members.iter().map(|(_, m)| m.name.clone()).collect();
    let packages = members
        .into_iter()
        .map(|(dir, manifest)| {
            let workspace_dependencies = manifest
                .dependencies
                .keys()
                .chain(manifest.dev_dependencies.keys())
                .filter(|dep| names.contains(*dep))
                .cloned()
                .collect();
            PackageInfo {
                name: manifest.name,
                dir,
                scripts: manifest.scripts,
                workspace_dependencies,
            }
        })
        .collect::<Vec<_>>();

    info!(count = packages.len(), "discovered workspace packages");
    Ok(packages)
}

/// A node in the package dependency graph.
#[derive(Debug, Clone)]
struct PackageNode {
    info: PackageInfo,
    /// Direct predecessors: packages this one depends on
    dependencies: BTreeSet<String>,
    /// Direct successors: packages depending on this one
    dependents: BTreeSet<String>,
}

/// Acyclic directed graph over package names plus a synthetic root
/// vertex. Edges encode "depends on".
#[derive(Debug, Clone)]
pub struct PackageGraph {
    nodes: BTreeMap<String, PackageNode>,
    root: AbsolutePath,
}

impl PackageGraph {
    /// Build the graph from discovered packages and validate it is
    /// acyclic. The synthetic root vertex carries the workspace root
    /// directory and the root manifest's scripts.
    #[instrument(skip_all, fields(packages = packages.len()))]
    pub fn build(root: AbsolutePath, packages: Vec<PackageInfo>) -> Result<Self, GraphError> {
        let mut nodes: BTreeMap<String, PackageNode> = BTreeMap::new();
        nodes.insert(
            ROOT_PKG_NAME.to_string(),
            PackageNode {
                info: PackageInfo {
                    name: ROOT_PKG_NAME.to_string(),
                    dir: root.clone(),
                    scripts: BTreeMap::new(),
                    workspace_dependencies: Vec::new(),
                },
                dependencies: BTreeSet::new(),
                dependents: BTreeSet::new(),
            },
        );
        for pkg in packages {
            let dependencies = pkg.workspace_dependencies.iter().cloned().collect();
            nodes.insert(
                pkg.name.clone(),
                PackageNode {
                    info: pkg,
                    dependencies,
                    dependents: BTreeSet::new(),
                },
            );
        }

        // Reverse edges
        let edges: Vec<(String, String)> = nodes
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(|dep| (dep.clone(), node.info.name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(dep_node) = nodes.get_mut(&dep) {
                dep_node.dependents.insert(dependent);
            }
        }

        let graph = Self { nodes, root };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn root_dir(&self) -> &AbsolutePath {
        &self.root
    }

    /// All package names, root excluded, in sorted order.
    pub fn package_names(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|name| *name != ROOT_PKG_NAME)
            .cloned()
            .collect()
    }

    pub fn package_info(&self, name: &str) -> Option<&PackageInfo> {
        self.nodes.get(name).map(|node| &node.info)
    }

    /// Direct predecessors of a package (what it depends on), the
    /// synthetic root excluded.
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.nodes
            .get(name)
            .map(|node| {
                node.dependencies
                    .iter()
                    .filter(|dep| {
                        *dep != ROOT_PKG_NAME && self.nodes.contains_key(dep.as_str())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct successors of a package (what depends on it).
    pub fn dependents(&self, name: &str) -> BTreeSet<String> {
        self.nodes
            .get(name)
            .map(|node| node.dependents.clone())
            .unwrap_or_default()
    }

    /// Packages in topological order, dependencies first. Kahn's
    /// algorithm with a sorted frontier, so the order is deterministic.
    pub fn topo_sort(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut frontier: BTreeSet<&str> = BTreeSet::new();
        for (name, node) in &self.nodes {
            let degree = node
                .dependencies
                .iter()
                .filter(|d| self.nodes.contains_key(d.as_str()))
                .count();
            in_degree.insert(name, degree);
            if degree == 0 {
                frontier.insert(name);
            }
        }

        let mut sorted = Vec::new();
        while let Some(name) = frontier.iter().next().copied() {
            frontier.remove(name);
            if name != ROOT_PKG_NAME {
                sorted.push(name.to_string());
            }
            if let Some(node) = self.nodes.get(name) {
                for dependent in &node.dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            frontier.insert(dependent);
                        }
                    }
                }
            }
        }
        sorted
    }

    /// Depth-first cycle detection with color marks. Reports one cycle
    /// in dependency order.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            graph: &PackageGraph,
            name: &str,
            colors: &mut HashMap<String, Color>,
            stack: &mut VecDeque<String>,
        ) -> Option<Vec<String>> {
            colors.insert(name.to_string(), Color::Gray);
            stack.push_back(name.to_string());
            if let Some(node) = graph.nodes.get(name) {
                for dep in &node.dependencies {
                    if !graph.nodes.contains_key(dep) {
                        continue;
                    }
                    match colors.get(dep).copied().unwrap_or(Color::White) {
                        Color::White => {
                            if let Some(cycle) = visit(graph, dep, colors, stack) {
                                return Some(cycle);
                            }
                        }
                        Color::Gray => {
                            let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack.iter().skip(start).cloned().collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }
            stack.pop_back();
            colors.insert(name.to_string(), Color::Black);
            None
        }

        let mut colors: HashMap<String, Color> = HashMap::new();
        for name in self.nodes.keys() {
            if colors.get(name).copied().unwrap_or(Color::White) == Color::White {
                let mut stack = VecDeque::new();
                if let Some(cycle) = visit(self, name, &mut colors, &mut stack) {
                    return Err(GraphError::CyclicDependency(cycle.join(" -> ")));
                }
            }
        }
        Ok(())
    }
}

/// The package manager whose `run` command executes task scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
}

impl PackageManager {
    /// Infer the package manager from lockfiles at the workspace root.
    pub fn detect(root: &AbsolutePath) -> Self {
        if root.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else if root.join("yarn.lock").exists() {
            Self::Yarn
        } else {
            Self::Npm
        }
    }

    /// The binary to invoke.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        }
    }
}
