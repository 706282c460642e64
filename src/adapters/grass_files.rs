/// Grass cache outputs: renaming, mod-folder packaging, leftovers, and the
/// "already generated" probe.
use super::{AdapterError, CompletionProbe, PostProcessor};
use crate::season::{Season, RAW_SUFFIX};
use chrono::Utc;
use std::path::{Path, PathBuf};

pub struct GrassFiles {
    output_dir: PathBuf,
    progress_file: PathBuf,
    archive_dir: PathBuf,
}

impl GrassFiles {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        progress_file: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            progress_file: progress_file.into(),
            archive_dir: archive_dir.into(),
        }
    }

    #[cfg(test)]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Files in `dir` matching `*<ext>`, sorted.
    fn files_with_ext(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, AdapterError> {
        let pattern = dir.join(format!("*{ext}"));
        let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Outputs in `dir` belonging to `work_unit`.
    pub fn outputs(&self, dir: &Path, work_unit: Season) -> Result<Vec<PathBuf>, AdapterError> {
        Ok(Self::files_with_ext(dir, RAW_SUFFIX)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| work_unit.owns_output(n))
            })
            .collect())
    }

    fn meta_ini(work_unit: Season, file_count: usize) -> String {
        format!(
            "[General]\n\
             modid=0\n\
             version=1.0\n\
             newestVersion=1.0\n\
             category=23\n\
             installationFile=Generated by precache-harness\n\
             comments={} grass cache, season type {}, {} files, generated {}\n",
            work_unit.display_name(),
            work_unit.config_code(),
            file_count,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

impl PostProcessor for GrassFiles {
    fn rename_outputs(&self, dir: &Path, suffix: &str) -> Result<usize, AdapterError> {
        if suffix.eq_ignore_ascii_case(RAW_SUFFIX) {
            return Ok(0);
        }
        let mut renamed = 0;
        for path in Self::files_with_ext(dir, RAW_SUFFIX)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if Season::has_seasonal_suffix(name) {
                continue;
            }
            let stem = &name[..name.len() - RAW_SUFFIX.len()];
            let target = path.with_file_name(format!("{stem}{suffix}"));
            std::fs::rename(&path, &target)?;
            renamed += 1;
        }
        tracing::info!(dir = %dir.display(), suffix, renamed, "renamed grass cache files");
        Ok(renamed)
    }

    fn archive(&self, dir: &Path, work_unit: Season) -> Result<PathBuf, AdapterError> {
        let files = self.outputs(dir, work_unit)?;
        if files.is_empty() {
            return Err(AdapterError::NoOutputs(work_unit));
        }

        let mod_dir = self
            .archive_dir
            .join(format!("{} Grass Cache", work_unit.display_name()));
        let grass_dir = mod_dir.join("Grass");
        std::fs::create_dir_all(&grass_dir)?;

        for file in &files {
            if let Some(name) = file.file_name() {
                std::fs::copy(file, grass_dir.join(name))?;
            }
        }
        std::fs::write(mod_dir.join("meta.ini"), Self::meta_ini(work_unit, files.len()))?;

        tracing::info!(
            %work_unit,
            files = files.len(),
            path = %mod_dir.display(),
            "packaged grass cache"
        );
        Ok(mod_dir)
    }

    fn cleanup(&self, dir: &Path) -> Result<usize, AdapterError> {
        let mut removed = 0;
        for path in Self::files_with_ext(dir, ".tmp")? {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove leftover"),
            }
        }
        if removed > 0 {
            tracing::info!(dir = %dir.display(), removed, "removed temporary files");
        }
        Ok(removed)
    }
}

impl CompletionProbe for GrassFiles {
    fn already_complete(&self, work_unit: Season) -> bool {
        if self.progress_file.exists() {
            return false;
        }
        match self.outputs(&self.output_dir, work_unit) {
            Ok(files) => !files.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list grass cache outputs");
                false
            }
        }
    }
}
