use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

pub const ENV_PD: &str = "CLEANER_PD";
pub const ENV_MASTER: &str = "CLEANER_MASTER";
pub const ENV_MAX_CONNECTIONS: &str = "CLEANER_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Centralized sweeper configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// Metadata store endpoints, tried in order.
    pub endpoints: Vec<String>,
    /// Blob-store master; only needed by physical reclamation.
    pub master: Option<String>,
    pub max_connections: u32,
}

/// What the binary should do once configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    pub migrate: bool,
    pub list_orphans: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Finds orphaned multipart fragments in object-store metadata")]
pub struct Args {
    /// Comma-separated metadata store endpoints (overrides CLEANER_PD)
    #[arg(long)]
    pub pd: Option<String>,

    /// Blob-store master address (overrides CLEANER_MASTER)
    #[arg(long)]
    pub master: Option<String>,

    /// Metadata store pool size (overrides CLEANER_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Create the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,

    /// Print every orphaned fragment key
    #[arg(long)]
    pub list_orphans: bool,
}

impl CleanerConfig {
    /// Parse environment variables + CLI args into the config and run flags.
    pub fn from_env_and_args() -> Result<(Self, RunFlags)> {
        Self::merge(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge parsed `args` over the variables visible through `lookup`.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, RunFlags)> {
        let Some(pd) = args.pd.or_else(|| lookup(ENV_PD)) else {
            bail!("metadata store endpoints missing: set {ENV_PD} or pass --pd");
        };
        let endpoints = parse_endpoints(&pd);
        if endpoints.is_empty() {
            bail!("no metadata store endpoint in `{pd}`");
        }

        let env_max = match lookup(ENV_MAX_CONNECTIONS) {
            Some(value) => value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("parsing {ENV_MAX_CONNECTIONS} value `{value}`"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        // --- Merge ---
        let cfg = Self {
            endpoints,
            master: args
                .master
                .or_else(|| lookup(ENV_MASTER))
                .filter(|master| !master.trim().is_empty()),
            max_connections: args.max_connections.unwrap_or(env_max),
        };
        let flags = RunFlags {
            migrate: args.migrate,
            list_orphans: args.list_orphans,
        };
        Ok((cfg, flags))
    }
}

/// Split a comma-separated address list, dropping blanks.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn reads_environment() {
        let (cfg, flags) = CleanerConfig::merge(
            Args::default(),
            env(&[
                (ENV_PD, "sqlite://a.db, ,sqlite://b.db"),
                (ENV_MASTER, "10.0.0.1:9333"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.endpoints, vec!["sqlite://a.db", "sqlite://b.db"]);
        assert_eq!(cfg.master.as_deref(), Some("10.0.0.1:9333"));
        assert_eq!(cfg.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(flags, RunFlags::default());
    }

    #[test]
    fn arguments_override_environment() {
        let args = Args::parse_from([
            "meta-sweeper",
            "--pd",
            "sqlite://cli.db",
            "--max-connections",
            "2",
            "--list-orphans",
        ]);
        let (cfg, flags) = CleanerConfig::merge(
            args,
            env(&[(ENV_PD, "sqlite://env.db"), (ENV_MAX_CONNECTIONS, "9")]),
        )
        .unwrap();
        assert_eq!(cfg.endpoints, vec!["sqlite://cli.db"]);
        assert_eq!(cfg.max_connections, 2);
        assert!(flags.list_orphans);
        assert!(!flags.migrate);
    }

    #[test]
    fn endpoints_are_required() {
        assert!(CleanerConfig::merge(Args::default(), env(&[])).is_err());
        assert!(CleanerConfig::merge(Args::default(), env(&[(ENV_PD, " , ")])).is_err());
    }

    #[test]
    fn bad_pool_size_is_reported() {
        let err = CleanerConfig::merge(
            Args::default(),
            env(&[(ENV_PD, "sqlite://a.db"), (ENV_MAX_CONNECTIONS, "lots")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_CONNECTIONS));
    }
}
