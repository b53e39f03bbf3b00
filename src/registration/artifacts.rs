//! Locating the engine's result among the files left in a working directory.

use crate::config::{AmbiguityPolicy, ArtifactConfig};
use crate::error::RegistrationError;
use std::fs;
use std::path::{Path, PathBuf};

/// Candidate file names in `directory`, sorted lexically.
///
/// A candidate is a regular file with one of the configured extensions whose
/// stem is not the exported initial transform and whose name is not in
/// `excluded` (the inputs staged next to the engine's output).
pub fn list_candidates(
    directory: &Path,
    config: &ArtifactConfig,
    excluded: &[String],
) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_candidate(&name, config) && !excluded.contains(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_candidate(name: &str, config: &ArtifactConfig) -> bool {
    let Some((stem, extension)) = name.rsplit_once('.') else {
        return false;
    };
    let extension_ok = config
        .extensions
        .iter()
        .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(extension));
    extension_ok && !stem.eq_ignore_ascii_case(&config.initial_transform_name)
}

/// Pick the result from sorted candidate names.
///
/// A name containing the result marker wins; otherwise a single candidate is
/// taken as is and several are resolved by the ambiguity policy. In both
/// steps candidates that `readable` accepts are preferred, so an unreadable
/// format is only chosen when nothing else is left.
pub fn select_artifact<'a>(
    candidates: &'a [String],
    config: &ArtifactConfig,
    readable: impl Fn(&str) -> bool,
) -> Result<Option<&'a str>, RegistrationError> {
    let marker = config.result_marker.to_lowercase();
    let (marked, unmarked): (Vec<&'a String>, Vec<&'a String>) =
        candidates.iter().partition(|c| c.to_lowercase().contains(&marker));

    if let Some(&first) = marked.first() {
        let chosen = marked.iter().copied().find(|c| readable(c.as_str())).unwrap_or(first);
        return Ok(Some(chosen.as_str()));
    }

    let preferred: Vec<&'a String> = unmarked.iter().copied().filter(|c| readable(c.as_str())).collect();
    let pool = if preferred.is_empty() { unmarked } else { preferred };

    let chosen = match pool.as_slice() {
        [] => None,
        [only] => Some(*only),
        [first, ..] => match config.ambiguity {
            AmbiguityPolicy::FirstByName => {
                tracing::warn!(
                    candidates = ?pool,
                    "No artifact carries the result marker, taking '{}'",
                    first
                );
                Some(*first)
            }
            AmbiguityPolicy::Reject => {
                return Err(RegistrationError::AmbiguousOutput {
                    candidates: pool.iter().map(|c| c.to_string()).collect(),
                })
            }
        },
    };
    Ok(chosen.map(String::as_str))
}

/// Find the result artifact in `directory`, ignoring the `excluded` input file names.
pub fn discover_artifact(
    directory: &Path,
    config: &ArtifactConfig,
    excluded: &[String],
    readable: impl Fn(&Path) -> bool,
) -> Result<PathBuf, RegistrationError> {
    let candidates = list_candidates(directory, config, excluded)?;
    tracing::debug!(directory = %directory.display(), candidates = ?candidates, "Scanned for artifacts");
    match select_artifact(&candidates, config, |name| readable(&directory.join(name)))? {
        Some(name) => Ok(directory.join(name)),
        None => Err(RegistrationError::MissingOutput {
            directory: directory.to_path_buf(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn any(_: &str) -> bool {
        true
    }

    fn text_only(name: &str) -> bool {
        name.ends_with(".tfm") || name.ends_with(".txt")
    }

    #[test]
    fn test_marker_wins_over_lexical_order() {
        let config = ArtifactConfig::default();
        let candidates = names(&["a_result.tfm", "Registration_Transform.h5"]);
        assert_eq!(select_artifact(&candidates, &config, any).unwrap(), Some("Registration_Transform.h5"));
    }

    #[test]
    fn test_readable_marked_artifact_preferred() {
        let config = ArtifactConfig::default();
        let candidates = names(&["registration_transform.h5", "registration_transform.tfm"]);
        assert_eq!(
            select_artifact(&candidates, &config, text_only).unwrap(),
            Some("registration_transform.tfm")
        );
        // an unreadable marked artifact is still reported rather than hidden
        let only_h5 = names(&["a.tfm", "registration_transform.h5"]);
        assert_eq!(
            select_artifact(&only_h5, &config, text_only).unwrap(),
            Some("registration_transform.h5")
        );
    }

    #[test]
    fn test_ambiguity_policies() {
        let mut config = ArtifactConfig::default();
        let candidates = names(&["a.tfm", "b.tfm"]);
        assert_eq!(select_artifact(&candidates, &config, any).unwrap(), Some("a.tfm"));

        config.ambiguity = AmbiguityPolicy::Reject;
        let err = select_artifact(&candidates, &config, any).unwrap_err();
        assert!(matches!(err, RegistrationError::AmbiguousOutput { ref candidates } if candidates.len() == 2));

        // a single unmarked candidate is never ambiguous
        assert_eq!(select_artifact(&names(&["b.tfm"]), &config, any).unwrap(), Some("b.tfm"));
        // nor is a single readable one next to unreadable formats
        assert_eq!(
            select_artifact(&names(&["a.mat", "b.tfm"]), &config, text_only).unwrap(),
            Some("b.tfm")
        );
    }

    #[test]
    fn test_no_candidates() {
        assert_eq!(select_artifact(&[], &ArtifactConfig::default(), any).unwrap(), None);
    }

    #[test]
    fn test_discover_filters_directory() {
        let dir = TempDir::new().unwrap();
        for name in [
            "initial_transform.tfm",
            "fixed.nrrd",
            "Rigid.json",
            "z_other.txt",
            "registration_transform.tfm",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested.tfm")).unwrap();

        let config = ArtifactConfig::default();
        assert_eq!(
            list_candidates(dir.path(), &config, &[]).unwrap(),
            vec!["registration_transform.tfm", "z_other.txt"]
        );
        assert_eq!(
            discover_artifact(dir.path(), &config, &[], |_| true).unwrap(),
            dir.path().join("registration_transform.tfm")
        );
    }

    #[test]
    fn test_staged_inputs_are_never_candidates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("params.txt"), "(Metric \"AdvancedMattesMutualInformation\")").unwrap();
        fs::write(dir.path().join("fixed.mat"), "").unwrap();
        let staged = names(&["params.txt", "fixed.mat"]);

        let err = discover_artifact(dir.path(), &ArtifactConfig::default(), &staged, |_| true).unwrap_err();
        assert!(matches!(err, RegistrationError::MissingOutput { .. }));

        fs::write(dir.path().join("stage_1.tfm"), "").unwrap();
        assert_eq!(
            discover_artifact(dir.path(), &ArtifactConfig::default(), &staged, |_| true).unwrap(),
            dir.path().join("stage_1.tfm")
        );
    }

    #[test]
    fn test_initial_transform_alone_is_missing_output() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("initial_transform.tfm"), "").unwrap();
        let err = discover_artifact(dir.path(), &ArtifactConfig::default(), &[], |_| true).unwrap_err();
        assert!(matches!(err, RegistrationError::MissingOutput { .. }));
    }
}
