use std::path::{Path, PathBuf};

use common::{error::AppError, utils::config::PipelineConfig};

/// Where one input's batch files, artifacts and checkpoint live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    /// Input file name without its final extension; prefixes every batch file.
    pub basename: String,
}

impl OutputLayout {
    /// `<input dir>/<input stem>/`, with a bare file name resolving against `.`.
    pub fn for_input(input: &Path) -> Result<Self, AppError> {
        let basename = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                AppError::InvalidInput(format!("{} has no file name", input.display()))
            })?;
        let parent = input
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        Ok(Self {
            output_dir: parent.join(&basename),
            basename,
        })
    }
}

pub fn validate_input(config: &PipelineConfig, input: &Path) -> Result<(), AppError> {
    if !config.accepts_extension(input) {
        return Err(AppError::InvalidInput(format!(
            "{} does not have an accepted extension ({})",
            input.display(),
            config.allowed_extensions.join(", ")
        )));
    }
    if !input.is_file() {
        return Err(AppError::InvalidInput(format!(
            "{} does not exist or is not a file",
            input.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_dir_sits_next_to_the_input() {
        let layout = OutputLayout::for_input(Path::new("/data/runs/uniprot.v2.fasta")).unwrap();
        assert_eq!(layout.output_dir, PathBuf::from("/data/runs/uniprot.v2"));
        assert_eq!(layout.basename, "uniprot.v2");

        let bare = OutputLayout::for_input(Path::new("proteins.fa")).unwrap();
        assert_eq!(bare.output_dir, PathBuf::from("./proteins"));
    }

    #[test]
    fn rejects_wrong_extension_and_missing_file() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::default();

        let text = dir.path().join("proteins.txt");
        std::fs::write(&text, ">A\nMK\n").unwrap();
        assert!(matches!(
            validate_input(&config, &text),
            Err(AppError::InvalidInput(_))
        ));

        let missing = dir.path().join("absent.fasta");
        assert!(matches!(
            validate_input(&config, &missing),
            Err(AppError::InvalidInput(_))
        ));

        let good = dir.path().join("proteins.fasta");
        std::fs::write(&good, ">A\nMK\n").unwrap();
        validate_input(&config, &good).unwrap();
    }
}
