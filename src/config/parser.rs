use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// Relative keyword file paths are resolved against the directory that
/// contains the configuration file.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use medcrawl::config::load_config;
///
/// let config = load_config(Path::new("medcrawl.toml")).unwrap();
/// println!("Sources: {}", config.sources.len());
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;

    if let Some(base) = path.parent() {
        for source in &mut config.sources {
            if let Some(keywords) = source.keywords_path.as_mut() {
                let candidate = Path::new(keywords.as_str());
                if candidate.is_relative() {
                    *keywords = base.join(candidate).to_string_lossy().into_owned();
                }
            }
        }
    }

    validate(&config)?;

    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Stored with every run so runs made under different configurations can be
/// told apart.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

/// Reads a keyword file: one search term per line
///
/// Blank lines and lines starting with `#` are skipped; surrounding
/// whitespace is trimmed. Order is preserved.
pub fn load_keywords(path: &Path) -> Result<Vec<String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Keywords {
        path: path.display().to_string(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
