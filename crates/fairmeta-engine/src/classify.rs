//! Path classification: deciding what a filesystem path means.
//!
//! Classification is purely lexical. It never touches the filesystem
//! beyond the path string handed to it, so it is cheap enough to run on
//! every debounced event and trivially deterministic to test.

use std::path::{Path, PathBuf};

use fairmeta_core::{MetaError, MetaResult};

/// Directory-name prefix marking a project root.
pub const PROJECT_PREFIX: &str = "p_";
/// Directory-name prefix marking a dataset inside a project.
pub const DATASET_PREFIX: &str = "d_";
/// Name of the hidden sidecar directory holding an entity's records.
pub const SIDECAR_DIR: &str = ".metadata";
/// Name of the per-root local schema override directory.
pub const OVERRIDE_SCHEMA_DIR: &str = ".template_schemas";

/// What a path under the monitored root turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A project directory (`p_*` directly under the monitored root, or
    /// nested anywhere outside another project).
    Project { path: PathBuf },
    /// A dataset directory (`d_*`) and the project directory enclosing it.
    Dataset { path: PathBuf, project: PathBuf },
    /// A regular file inside a dataset, attributed to that dataset.
    DataFile { path: PathBuf, dataset: PathBuf },
    /// Noise: sidecar internals, override schemas, ignored patterns, or
    /// paths with no entity context.
    Irrelevant,
}

/// Lexical classifier bound to one monitored root and its ignore set.
#[derive(Debug, Clone)]
pub struct Classifier {
    root: PathBuf,
    ignore_patterns: Vec<String>,
}

impl Classifier {
    #[must_use]
    pub fn new(root: PathBuf, ignore_patterns: Vec<String>) -> Self {
        Self {
            root,
            ignore_patterns,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether any component or suffix of `path` matches the ignore set.
    #[must_use]
    pub fn is_ignored(&self, path: &Path) -> bool {
        let Some(text) = path.to_str() else {
            // Non-UTF-8 paths cannot belong to the naming convention.
            return true;
        };
        self.ignore_patterns.iter().any(|pattern| {
            text.ends_with(pattern.as_str())
                || text.contains(&format!("/{pattern}/"))
                || path
                    .components()
                    .any(|c| c.as_os_str().to_str() == Some(pattern.as_str()))
        })
    }

    /// Classify a path. `is_dir` comes from the event source (or a stat at
    /// scan time) because a deleted path can no longer be stat-ed.
    ///
    /// # Errors
    ///
    /// Returns `MetaError::OrphanDataset` for a `d_*` directory with no
    /// enclosing `p_*` ancestor.
    pub fn classify(&self, path: &Path, is_dir: bool) -> MetaResult<Classification> {
        if !path.starts_with(&self.root) {
            return Ok(Classification::Irrelevant);
        }
        if self.is_ignored(path) || within_component(path, SIDECAR_DIR)
            || within_component(path, OVERRIDE_SCHEMA_DIR)
        {
            return Ok(Classification::Irrelevant);
        }

        if is_dir {
            let Some(name) = file_name(path) else {
                return Ok(Classification::Irrelevant);
            };
            if name.starts_with(DATASET_PREFIX) {
                // Datasets do not nest; a d_* directory inside another
                // dataset is treated as a plain folder.
                if enclosing_dataset(path, &self.root).is_some() {
                    return Ok(Classification::Irrelevant);
                }
                return match enclosing_project(path, &self.root) {
                    Some(project) => Ok(Classification::Dataset {
                        path: path.to_path_buf(),
                        project,
                    }),
                    None => Err(MetaError::OrphanDataset {
                        path: path.to_path_buf(),
                    }),
                };
            }
            if name.starts_with(PROJECT_PREFIX) {
                // Projects nested inside projects are treated as plain
                // folders; only the outermost p_* directory is an entity.
                if enclosing_project(path, &self.root).is_some() {
                    return Ok(Classification::Irrelevant);
                }
                return Ok(Classification::Project {
                    path: path.to_path_buf(),
                });
            }
            return Ok(Classification::Irrelevant);
        }

        // Regular file: relevant only when some ancestor is a dataset.
        match enclosing_dataset(path, &self.root) {
            Some(dataset) => Ok(Classification::DataFile {
                path: path.to_path_buf(),
                dataset,
            }),
            None => Ok(Classification::Irrelevant),
        }
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn within_component(path: &Path, component: &str) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_str() == Some(component))
}

/// Nearest strict ancestor under `root` whose name starts with `p_`.
fn enclosing_project(path: &Path, root: &Path) -> Option<PathBuf> {
    let mut cursor = path.parent();
    while let Some(dir) = cursor {
        if !dir.starts_with(root) || dir == root {
            break;
        }
        if let Some(name) = file_name(dir) {
            if name.starts_with(PROJECT_PREFIX) {
                return Some(dir.to_path_buf());
            }
        }
        cursor = dir.parent();
    }
    None
}

/// Outermost strict ancestor under `root` whose name starts with `d_`.
/// Datasets do not nest, so only the outermost one is an entity; inner
/// `d_*` folders and their files belong to it.
fn enclosing_dataset(path: &Path, root: &Path) -> Option<PathBuf> {
    let mut outermost = None;
    let mut cursor = path.parent();
    while let Some(dir) = cursor {
        if !dir.starts_with(root) || dir == root {
            break;
        }
        if let Some(name) = file_name(dir) {
            if name.starts_with(DATASET_PREFIX) {
                outermost = Some(dir.to_path_buf());
            }
        }
        cursor = dir.parent();
    }
    outermost
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairmeta_core::config::DEFAULT_IGNORE_PATTERNS;

    fn classifier() -> Classifier {
        Classifier::new(
            PathBuf::from("/data"),
            DEFAULT_IGNORE_PATTERNS.iter().map(|s| (*s).into()).collect(),
        )
    }

    #[test]
    fn project_directory_under_root() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_study"), true).unwrap(),
            Classification::Project {
                path: PathBuf::from("/data/p_study")
            }
        );
    }

    #[test]
    fn nested_project_directory_is_still_a_project() {
        // Deeper non-entity folders do not break project detection.
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/groups/lab1/p_study"), true)
                .unwrap(),
            Classification::Project {
                path: PathBuf::from("/data/groups/lab1/p_study")
            }
        );
    }

    #[test]
    fn project_inside_project_is_irrelevant() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_outer/p_inner"), true).unwrap(),
            Classification::Irrelevant
        );
    }

    #[test]
    fn dataset_requires_enclosing_project() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_study/d_cohort_a"), true)
                .unwrap(),
            Classification::Dataset {
                path: PathBuf::from("/data/p_study/d_cohort_a"),
                project: PathBuf::from("/data/p_study"),
            }
        );

        let err = c
            .classify(Path::new("/data/d_stray"), true)
            .expect_err("orphan dataset");
        assert!(matches!(err, MetaError::OrphanDataset { .. }));
    }

    #[test]
    fn dataset_nested_below_project_subfolder() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_study/raw/d_run1"), true)
                .unwrap(),
            Classification::Dataset {
                path: PathBuf::from("/data/p_study/raw/d_run1"),
                project: PathBuf::from("/data/p_study"),
            }
        );
    }

    #[test]
    fn dataset_inside_dataset_is_irrelevant() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_study/d_outer/d_inner"), true)
                .unwrap(),
            Classification::Irrelevant
        );
        // Files under the inner folder belong to the real entity.
        assert_eq!(
            c.classify(Path::new("/data/p_study/d_outer/d_inner/reads.csv"), false)
                .unwrap(),
            Classification::DataFile {
                path: PathBuf::from("/data/p_study/d_outer/d_inner/reads.csv"),
                dataset: PathBuf::from("/data/p_study/d_outer"),
            }
        );
    }

    #[test]
    fn data_file_attributed_to_nearest_dataset() {
        let c = classifier();
        assert_eq!(
            c.classify(
                Path::new("/data/p_study/d_cohort_a/sub/reads.fastq.gz"),
                false
            )
            .unwrap(),
            Classification::DataFile {
                path: PathBuf::from("/data/p_study/d_cohort_a/sub/reads.fastq.gz"),
                dataset: PathBuf::from("/data/p_study/d_cohort_a"),
            }
        );
    }

    #[test]
    fn file_outside_any_dataset_is_irrelevant() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/data/p_study/notes.txt"), false)
                .unwrap(),
            Classification::Irrelevant
        );
        assert_eq!(
            c.classify(Path::new("/data/readme.md"), false).unwrap(),
            Classification::Irrelevant
        );
    }

    #[test]
    fn sidecar_and_override_paths_are_irrelevant() {
        let c = classifier();
        for p in [
            "/data/p_study/.metadata/project_descriptive.json",
            "/data/p_study/d_x/.metadata/dataset_structural.json",
            "/data/.template_schemas/dataset_structural_schema.json",
        ] {
            assert_eq!(
                c.classify(Path::new(p), false).unwrap(),
                Classification::Irrelevant,
                "{p}"
            );
        }
    }

    #[test]
    fn ignored_patterns_short_circuit() {
        let c = classifier();
        assert!(c.is_ignored(Path::new("/data/p_study/.git/HEAD")));
        assert!(c.is_ignored(Path::new("/data/p_study/d_x/file.swp")));
        assert!(c.is_ignored(Path::new("/data/p_study/d_x/file.txt~")));
        assert!(!c.is_ignored(Path::new("/data/p_study/d_x/file.txt")));
        assert_eq!(
            c.classify(Path::new("/data/p_study/d_x/.DS_Store"), false)
                .unwrap(),
            Classification::Irrelevant
        );
    }

    #[test]
    fn paths_outside_root_are_irrelevant() {
        let c = classifier();
        assert_eq!(
            c.classify(Path::new("/elsewhere/p_study"), true).unwrap(),
            Classification::Irrelevant
        );
    }
}
