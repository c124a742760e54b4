use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;

use crate::error::{AppError, Result};
use crate::manifest::ServiceSpec;

/// Dependency ordering for the plan and shutdown phases.
///
/// Services are grouped by dependency depth and sorted alphabetically within
/// a depth, so port assignment and debug-port counting are reproducible
/// across runs regardless of declaration order.
#[derive(Debug)]
pub struct DependencyGraph {
    order: Vec<String>,
    depths: HashMap<String, usize>,
}

impl DependencyGraph {
    pub fn build(services: &IndexMap<String, ServiceSpec>) -> Result<Self> {
        let names: Vec<&str> = services.keys().map(String::as_str).collect();

        for (name, svc) in services {
            for dep in &svc.depends_on {
                if !services.contains_key(dep) {
                    return Err(AppError::DependencyGraph(format!(
                        "service '{name}' depends on unknown service '{dep}'"
                    )));
                }
            }
        }

        // Kahn's algorithm over dep -> dependent edges, tracking the longest
        // path from a root as each node's depth.
        let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = names.iter().map(|n| (*n, vec![])).collect();
        for (name, svc) in services {
            for dep in &svc.depends_on {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = names
            .iter()
            .filter(|n| in_degree[*n] == 0)
            .copied()
            .collect();
        for n in &queue {
            depth.insert(*n, 0);
        }

        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            let d = depth[node];
            for &dep in &dependents[node] {
                let e = depth.entry(dep).or_insert(0);
                *e = (*e).max(d + 1);
                let deg = in_degree.get_mut(dep).expect("known node");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dep);
                }
            }
        }

        if visited < names.len() {
            let cycled: Vec<&str> = names
                .iter()
                .filter(|n| in_degree[*n] > 0)
                .copied()
                .collect();
            return Err(AppError::DependencyGraph(format!(
                "dependency cycle involving: {}",
                cycled.join(", ")
            )));
        }

        let mut order: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        order.sort_by(|a, b| {
            depth[a.as_str()]
                .cmp(&depth[b.as_str()])
                .then_with(|| a.cmp(b))
        });

        let depths = depth
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Ok(Self { order, depths })
    }

    /// Services in start order.
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// Reverse dependency order for shutdown.
    pub fn stop_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().rev().map(String::as_str)
    }

    pub fn depth(&self, name: &str) -> usize {
        self.depths.get(name).copied().unwrap_or(0)
    }

    /// The named services plus everything they transitively depend on,
    /// in start order.
    pub fn closure(&self, services: &IndexMap<String, ServiceSpec>, roots: &[String]) -> Vec<String> {
        let mut keep: Vec<String> = Vec::new();
        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        while let Some(name) = stack.pop() {
            if keep.iter().any(|k| k == name) {
                continue;
            }
            keep.push(name.to_string());
            if let Some(svc) = services.get(name) {
                stack.extend(svc.depends_on.iter().map(String::as_str));
            }
        }
        self.order
            .iter()
            .filter(|n| keep.iter().any(|k| k == *n))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Language, ServiceKind};
    use std::path::PathBuf;

    fn make_services(list: Vec<(&str, Vec<&str>)>) -> IndexMap<String, ServiceSpec> {
        let mut map = IndexMap::new();
        for (name, deps) in list {
            map.insert(
                name.to_string(),
                ServiceSpec {
                    name: name.to_string(),
                    kind: ServiceKind::Process {
                        language: Language::Node,
                        framework: None,
                    },
                    working_dir: PathBuf::from("."),
                    requested_ports: vec![],
                    env: Default::default(),
                    command: Some("echo".into()),
                    health: None,
                    debug: None,
                    depends_on: deps.iter().map(|s| s.to_string()).collect(),
                },
            );
        }
        map
    }

    #[test]
    fn test_simple_order() {
        let services = make_services(vec![("b", vec!["a"]), ("a", vec![])]);
        let g = DependencyGraph::build(&services).unwrap();
        let order = g.start_order();
        assert!(
            order.iter().position(|s| s == "a") < order.iter().position(|s| s == "b")
        );
    }

    #[test]
    fn test_siblings_alphabetical() {
        let services = make_services(vec![("zeta", vec![]), ("alpha", vec![]), ("mid", vec![])]);
        let g = DependencyGraph::build(&services).unwrap();
        assert_eq!(g.start_order(), &["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_depth_groups() {
        let services = make_services(vec![
            ("web", vec!["api"]),
            ("api", vec!["db"]),
            ("db", vec![]),
            ("cache", vec![]),
        ]);
        let g = DependencyGraph::build(&services).unwrap();
        assert_eq!(g.depth("db"), 0);
        assert_eq!(g.depth("cache"), 0);
        assert_eq!(g.depth("api"), 1);
        assert_eq!(g.depth("web"), 2);
        assert_eq!(g.start_order(), &["cache", "db", "api", "web"]);
    }

    #[test]
    fn test_cycle_detected() {
        let services = make_services(vec![("a", vec!["b"]), ("b", vec!["a"])]);
        let err = DependencyGraph::build(&services).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_missing_dependency_detected() {
        let mut services = make_services(vec![("a", vec![])]);
        services.get_mut("a").unwrap().depends_on = vec!["ghost".into()];
        assert!(DependencyGraph::build(&services).is_err());
    }

    #[test]
    fn test_stop_order_is_reverse() {
        let services = make_services(vec![("api", vec!["db"]), ("db", vec![])]);
        let g = DependencyGraph::build(&services).unwrap();
        let stop: Vec<&str> = g.stop_order().collect();
        assert_eq!(stop, vec!["api", "db"]);
    }

    #[test]
    fn test_closure_pulls_dependencies() {
        let services = make_services(vec![
            ("web", vec!["api"]),
            ("api", vec!["db"]),
            ("db", vec![]),
            ("worker", vec![]),
        ]);
        let g = DependencyGraph::build(&services).unwrap();
        let subset = g.closure(&services, &["web".to_string()]);
        assert_eq!(subset, vec!["db", "api", "web"]);
    }
}
