//! Command line interface for presenced.

use std::path::{Path, PathBuf};

use clap::Parser;
use presence_core::Settings;

/// Presence monitoring daemon.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "presenced", version, about)]
pub struct Cli {
    /// Extra configuration file, read after the default locations.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root working directory (configuration, device table, logs).
    #[arg(short, long, env = "PRESENCED_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Ignore the default configuration files.
    #[arg(short, long)]
    pub ignore: bool,

    /// Log level used when `RUST_LOG` and `PRESENCED_LOG_LEVEL` are unset.
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log JSON to a rolling file and compact text to stdout.
    #[arg(long)]
    pub production: bool,
}

impl Cli {
    /// Root directory: `--root`, `PRESENCED_ROOT`, else `~/presenced`.
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .or_else(default_root)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Configuration files in load order. `config` is the already absolute
    /// `--config` path.
    pub fn config_files(&self, root: &Path, config: Option<PathBuf>) -> Vec<PathBuf> {
        let mut files = if self.ignore {
            Vec::new()
        } else {
            Settings::default_files(root)
        };
        files.extend(config);
        files
    }
}

fn default_root() -> Option<PathBuf> {
    directories::UserDirs::new().map(|dirs| dirs.home_dir().join("presenced"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_short_flags() {
        let cli = Cli::try_parse_from([
            "presenced", "-c", "extra.toml", "-r", "/srv/presenced", "-i", "-l", "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("extra.toml")));
        assert_eq!(cli.root_dir(), PathBuf::from("/srv/presenced"));
        assert!(cli.ignore);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(!cli.production);
    }

    #[test]
    fn test_ignore_drops_default_files() {
        let root = Path::new("/srv/presenced");
        let explicit = PathBuf::from("/tmp/extra.toml");

        let cli = Cli {
            ignore: true,
            ..Cli::default()
        };
        assert_eq!(cli.config_files(root, Some(explicit.clone())), vec![explicit.clone()]);

        let files = Cli::default().config_files(root, Some(explicit.clone()));
        assert_eq!(files.first(), Some(&PathBuf::from("/etc/presenced/presenced.toml")));
        assert!(files.contains(&root.join("presenced.toml")));
        assert_eq!(files.last(), Some(&explicit));
    }
}
