//! Dependency graph construction and topological sorting

use crate::config::{ComposeProject, StateConditions};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet, VecDeque};

/// A service in the dependency graph with its resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Service name
    pub name: String,
    /// Direct dependencies
    pub dependencies: Vec<String>,
    /// Readiness conditions, if any
    pub conditions: Option<StateConditions>,
}

/// Dependency graph for compose services
#[derive(Debug)]
pub struct DependencyGraph {
    /// Services in start order
    pub services: Vec<ResolvedService>,
    /// Map from service name to index
    pub index_map: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build a dependency graph from a project.
    ///
    /// Ties between services that do not depend on each other are broken by
    /// declaration order, so the same project always yields the same order.
    pub fn build(project: &ComposeProject) -> Result<Self, DependencyError> {
        // Every dependency must name a declared service
        for (name, service) in &project.services {
            for dependency in &service.dependencies {
                if !project.services.contains_key(dependency) {
                    return Err(DependencyError::UnknownDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let resolved: IndexMap<String, ResolvedService> = project
            .services
            .iter()
            .map(|(name, service)| {
                let dependencies: IndexSet<String> =
                    service.dependencies.iter().cloned().collect();
                (
                    name.clone(),
                    ResolvedService {
                        name: name.clone(),
                        dependencies: dependencies.into_iter().collect(),
                        conditions: service.conditions.clone(),
                    },
                )
            })
            .collect();

        // Kahn's algorithm
        let sorted = Self::topological_sort(&resolved)?;

        let index_map: HashMap<String, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, service)| (service.name.clone(), i))
            .collect();

        Ok(Self {
            services: sorted,
            index_map,
        })
    }

    fn topological_sort(
        services: &IndexMap<String, ResolvedService>,
    ) -> Result<Vec<ResolvedService>, DependencyError> {
        // Edges point from a dependency to its dependents
        let mut in_degree: IndexMap<&str, usize> = IndexMap::with_capacity(services.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(services.len());

        for (name, service) in services {
            in_degree.insert(name.as_str(), service.dependencies.len());
            for dependency in &service.dependencies {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut sorted: Vec<ResolvedService> = Vec::with_capacity(services.len());

        while let Some(name) = queue.pop_front() {
            if let Some(service) = services.get(name) {
                sorted.push(service.clone());
            }

            for &dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if sorted.len() != services.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(|s| s.name.as_str()).collect();
            let cycle: Vec<String> = services
                .keys()
                .filter(|name| !sorted_names.contains(name.as_str()))
                .cloned()
                .collect();

            return Err(DependencyError::CyclicDependency(cycle));
        }

        Ok(sorted)
    }

    /// Services in start order
    pub fn launch_order(&self) -> impl Iterator<Item = &ResolvedService> {
        self.services.iter()
    }

    /// Service names in start order
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }

    /// Position of a service in the start order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index_map.get(name).copied()
    }

    /// Services that directly depend on a given service
    pub fn dependents(&self, name: &str) -> Vec<&ResolvedService> {
        self.services
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == name))
            .collect()
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on service '{dependency}' which is not included in the config")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency detected involving services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}
