use std::path::{Path, PathBuf};

use super::{PipelineError, PipelineResult};
use crate::device::Precision;

pub const MODEL_INDEX: &str = "model_index.json";
pub const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";
pub const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";

/// Files a diffusers-style model directory must carry before anything is built.
pub const REQUIRED_FILES: [&str; 3] = [MODEL_INDEX, UNET_WEIGHTS, VAE_WEIGHTS];

/// Fail with every missing path at once.
pub fn check_layout(model_dir: &Path) -> PipelineResult<()> {
    let missing: Vec<PathBuf> = REQUIRED_FILES
        .iter()
        .map(|rel| model_dir.join(rel))
        .filter(|p| !p.is_file())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::MissingFiles(missing))
    }
}

/// Resolve a file under `model_dir`, preferring the `.fp16` variant for reduced precision.
///
/// `unet/diffusion_pytorch_model.safetensors` becomes
/// `unet/diffusion_pytorch_model.fp16.safetensors` when that file exists.
pub fn resolve_file(
    model_dir: &Path,
    relative: &str,
    precision: Precision,
) -> PipelineResult<PathBuf> {
    let plain = model_dir.join(relative);
    if precision.is_reduced() {
        if let Some(variant) = fp16_variant(&plain) {
            if variant.is_file() {
                return Ok(variant);
            }
        }
    }
    if plain.is_file() {
        Ok(plain)
    } else {
        Err(PipelineError::MissingFiles(vec![plain]))
    }
}

fn fp16_variant(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem()?.to_str()?;
    let ext = path.extension()?.to_str()?;
    Some(path.with_file_name(format!("{stem}.fp16.{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, rel: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_complete_layout_passes() {
        let dir = tempfile::tempdir().unwrap();
        for rel in REQUIRED_FILES {
            touch(dir.path(), rel);
        }
        assert!(check_layout(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_files_are_all_reported() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), MODEL_INDEX);
        match check_layout(dir.path()) {
            Err(PipelineError::MissingFiles(missing)) => {
                assert_eq!(missing.len(), 2);
                assert!(missing.contains(&dir.path().join(UNET_WEIGHTS)));
                assert!(missing.contains(&dir.path().join(VAE_WEIGHTS)));
            }
            other => panic!("expected missing files, got {:?}", other),
        }
    }

    #[test]
    fn test_nonexistent_dir_reports_everything() {
        let err = check_layout(Path::new("/definitely/not/here")).unwrap_err();
        match err {
            PipelineError::MissingFiles(missing) => assert_eq!(missing.len(), 3),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_fp16_variant_preferred_only_for_reduced_precision() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), UNET_WEIGHTS);
        touch(dir.path(), "unet/diffusion_pytorch_model.fp16.safetensors");

        let reduced = resolve_file(dir.path(), UNET_WEIGHTS, Precision::BFloat16).unwrap();
        assert!(reduced.ends_with("unet/diffusion_pytorch_model.fp16.safetensors"));

        let full = resolve_file(dir.path(), UNET_WEIGHTS, Precision::Float32).unwrap();
        assert!(full.ends_with(UNET_WEIGHTS));
    }

    #[test]
    fn test_plain_weights_used_when_no_variant() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), VAE_WEIGHTS);
        let path = resolve_file(dir.path(), VAE_WEIGHTS, Precision::BFloat16).unwrap();
        assert!(path.ends_with(VAE_WEIGHTS));
        assert!(resolve_file(dir.path(), "text_encoder/model.safetensors", Precision::Float32).is_err());
    }
}
