//! Configuration loading for the CLI: the TOML file plus `STEREONAV_*`
//! environment overrides.

use std::path::Path;

use stereonav_runtime::SteersmanConfig;
use stereonav_types::NavError;

/// Load the config at `path`. Returns `None` if the file does not exist.
pub fn load(path: &Path) -> Result<Option<SteersmanConfig>, NavError> {
    if !path.exists() {
        return Ok(None);
    }
    let mut cfg = SteersmanConfig::load_from(path)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `STEREONAV_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `STEREONAV_SAMPLE_COUNT` | `sampling.sample_count` |
/// | `STEREONAV_WORKERS` | `sampling.worker_threads` |
/// | `STEREONAV_SEED` | `sampling.seed` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut SteersmanConfig) {
    if let Ok(v) = std::env::var("STEREONAV_SAMPLE_COUNT")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.sampling.sample_count = n;
    }
    if let Ok(v) = std::env::var("STEREONAV_WORKERS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.sampling.worker_threads = n;
    }
    if let Ok(v) = std::env::var("STEREONAV_SEED")
        && let Ok(seed) = v.parse::<u64>()
    {
        cfg.sampling.seed = Some(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load(&dir.path().join("stereonav.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn load_reads_saved_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("stereonav.toml");
        let mut cfg = SteersmanConfig::default();
        cfg.sampling.radius_major_mm = 250.0;
        cfg.save_to(&path).expect("save");

        let loaded = load(&path).expect("load ok").expect("some");
        assert_eq!(loaded.sampling.radius_major_mm, 250.0);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("stereonav.toml");
        std::fs::write(&path, "[sampling]\nsample_count = 0\n").expect("write");
        assert!(load(&path).is_err());
    }

    // Each override test uses its own variable so parallel tests do not race.

    #[test]
    fn apply_env_overrides_changes_sample_count() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("STEREONAV_SAMPLE_COUNT", "123") };
        let mut cfg = SteersmanConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sampling.sample_count, 123);
        unsafe { std::env::remove_var("STEREONAV_SAMPLE_COUNT") };
    }

    #[test]
    fn apply_env_overrides_changes_seed() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("STEREONAV_SEED", "77") };
        let mut cfg = SteersmanConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sampling.seed, Some(77));
        unsafe { std::env::remove_var("STEREONAV_SEED") };
    }

    #[test]
    fn apply_env_overrides_ignores_unparsable_workers() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("STEREONAV_WORKERS", "many") };
        let mut cfg = SteersmanConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sampling.worker_threads, 0);
        unsafe { std::env::remove_var("STEREONAV_WORKERS") };
    }
}
