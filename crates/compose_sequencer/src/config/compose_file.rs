//! Compose file loading
//!
//! Only the parts of a compose file that drive the startup order are read
//! here: `require`, `image`, `depends_on` and `state_conditions`. Everything
//! else is left to the container runtime, which receives the same list of
//! files.

use crate::config::conditions::{ConditionError, ConditionsSpec, StateConditions};
use crate::config::image::{image_overrides, AppVersion};
use crate::config::interpolation::{InterpolationError, Interpolator};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The subset of a compose file the sequencer understands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeFile {
    /// Further compose files, relative to this one
    #[serde(default, alias = "x-require")]
    pub require: Vec<String>,

    /// Service definitions (ordered map for deterministic start order)
    #[serde(default)]
    pub services: IndexMap<String, ServiceSpec>,
}

/// A service entry; unknown compose keys are ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Image reference, used to match `--app-version` overrides
    #[serde(default)]
    pub image: Option<String>,

    /// Services that must be ready first
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Readiness conditions
    #[serde(default, alias = "x-state-conditions")]
    pub state_conditions: Option<ConditionsSpec>,
}

/// `depends_on` in either the short (list) or long (map) compose syntax
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    List(Vec<String>),
    Map(IndexMap<String, serde_yaml::Value>),
}

impl Default for DependsOn {
    fn default() -> Self {
        DependsOn::List(Vec::new())
    }
}

impl DependsOn {
    /// Names of the services depended upon, in declared order
    pub fn names(&self) -> Vec<&str> {
        match self {
            DependsOn::List(names) => names.iter().map(String::as_str).collect(),
            DependsOn::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

impl ComposeFile {
    /// Load, parse and interpolate a compose file
    pub fn from_file(path: &Path, interpolator: &Interpolator) -> Result<Self, ComposeFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| ComposeFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content, interpolator).map_err(|e| e.in_file(path))
    }

    /// Parse a compose file from a YAML string
    pub fn from_yaml(content: &str, interpolator: &Interpolator) -> Result<Self, ComposeFileError> {
        let mut document: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(ComposeFileError::Parse)?;
        if document.is_null() {
            return Ok(Self::default());
        }
        interpolator.interpolate_value(&mut document)?;
        serde_yaml::from_value(document).map_err(ComposeFileError::Parse)
    }
}

/// A service as seen by the startup sequence
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    /// Image from the last file that sets one, as the runtime would use it
    pub image: Option<String>,
    /// Dependencies in declared order, without duplicates
    pub dependencies: Vec<String>,
    /// Readiness conditions; `None` means "do not wait"
    pub conditions: Option<StateConditions>,
}

/// The resolved service graph plus the files it came from
#[derive(Debug, Clone, Default)]
pub struct ComposeProject {
    /// Compose files in merge order, `require`s expanded
    pub files: Vec<PathBuf>,
    /// Services in first-declared order
    pub services: IndexMap<String, Service>,
}

impl ComposeProject {
    /// Load a project from one or more compose files.
    ///
    /// `require` stanzas are followed depth-first and each file is read at
    /// most once. When several files define the same service, values from
    /// the earlier file win; dependency lists are unioned.
    pub fn load(files: &[PathBuf], interpolator: &Interpolator) -> Result<Self, ComposeFileError> {
        let mut ordered: Vec<(PathBuf, ComposeFile)> = Vec::new();
        for file in files {
            resolve_requires(file, interpolator, &mut ordered)?;
        }

        let mut project = Self::default();
        for (path, file) in ordered {
            project
                .merge(file)
                .map_err(|e| e.in_file(&path))?;
            project.files.push(path);
        }
        Ok(project)
    }

    /// Build a project from a single YAML document
    pub fn from_yaml(content: &str, interpolator: &Interpolator) -> Result<Self, ComposeFileError> {
        let mut project = Self::default();
        project.merge(ComposeFile::from_yaml(content, interpolator)?)?;
        Ok(project)
    }

    fn merge(&mut self, file: ComposeFile) -> Result<(), ComposeFileError> {
        for (name, spec) in file.services {
            let conditions = spec
                .state_conditions
                .as_ref()
                .map(StateConditions::try_from)
                .transpose()
                .map_err(|source| ComposeFileError::Conditions {
                    service: name.clone(),
                    source,
                })?;

            let service = self
                .services
                .entry(name.clone())
                .or_insert_with(|| Service {
                    name: name.clone(),
                    image: None,
                    dependencies: Vec::new(),
                    conditions: None,
                });

            if spec.image.is_some() {
                service.image = spec.image;
            }

            let mut dependencies: IndexSet<String> = service.dependencies.drain(..).collect();
            dependencies.extend(spec.depends_on.names().into_iter().map(str::to_string));
            service.dependencies = dependencies.into_iter().collect();

            if service.conditions.is_none() {
                service.conditions = conditions;
            }
        }
        Ok(())
    }

    /// Image replacements for the given app versions: service name to new image
    pub fn image_overrides(&self, versions: &[AppVersion]) -> IndexMap<String, String> {
        let images = self
            .services
            .values()
            .filter_map(|s| Some((s.name.as_str(), s.image.as_deref()?)));
        image_overrides(images, versions)
    }

    /// Services that declare readiness conditions
    pub fn conditioned_services(&self) -> impl Iterator<Item = &Service> {
        self.services.values().filter(|s| s.conditions.is_some())
    }
}

/// Depth-first `require` expansion; files already visited are skipped
fn resolve_requires(
    file: &Path,
    interpolator: &Interpolator,
    ordered: &mut Vec<(PathBuf, ComposeFile)>,
) -> Result<(), ComposeFileError> {
    let file = normalize(file);
    if ordered.iter().any(|(seen, _)| *seen == file) {
        return Ok(());
    }

    let compose = ComposeFile::from_file(&file, interpolator)?;
    let base = file.parent().map(Path::to_path_buf).unwrap_or_default();
    let requires = compose.require.clone();
    ordered.push((file, compose));

    for require in requires {
        resolve_requires(&base.join(require), interpolator, ordered)?;
    }
    Ok(())
}

/// Lexical cleanup so `a/../b.yml` and `b.yml` count as the same file
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Errors that can occur when loading compose files
#[derive(Debug, thiserror::Error)]
pub enum ComposeFileError {
    #[error("Failed to read compose file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse compose file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    #[error("Service '{service}': invalid state_conditions: {source}")]
    Conditions {
        service: String,
        #[source]
        source: ConditionError,
    },

    #[error("{path}: {source}")]
    InFile {
        path: String,
        #[source]
        source: Box<ComposeFileError>,
    },
}

impl ComposeFileError {
    fn in_file(self, path: &Path) -> Self {
        match self {
            e @ (ComposeFileError::Io { .. } | ComposeFileError::InFile { .. }) => e,
            e => ComposeFileError::InFile {
                path: path.display().to_string(),
                source: Box::new(e),
            },
        }
    }
}
