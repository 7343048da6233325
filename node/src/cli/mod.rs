//! CLI and config handling.

use crate::archive::TransferSyntaxPolicy;
use crate::object::DEFAULT_HEADER_READ_BYTES;
use crate::run::QueryScope;
use crate::sync::{Granularity, RetrievalMode};
use clap::{ArgAction, Parser};
use serde::Serialize;
use std::path::PathBuf;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_DUPLICATES_DIR: &str = "duplicates";
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Archive synchronization configuration.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(
    name = "archive-sync",
    about = "Synchronize a local index against a remote query/retrieve archive"
)]
pub struct SyncConfig {
    /// Local index database (`:memory:` for a throwaway index).
    pub index_path: PathBuf,
    /// Folder received objects are placed under.
    pub save_dir: PathBuf,
    /// Remote archive host.
    pub remote_host: String,
    /// Remote archive port.
    pub remote_port: u16,
    /// Remote archive identity.
    pub remote_identity: String,
    /// Port the push listener binds.
    pub local_port: u16,
    /// Our identity; also the push destination.
    pub local_identity: String,
    /// Option tokens: GET|MOVE, ALL|SELECTIVE|<pattern file>,
    /// UNCOMPRESSED|ANY, STUDY|INSTANCE, REUSE|NEW.
    pub options: Vec<String>,

    /// Quiescence poll interval.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,
    /// End the run after this long without an arrival.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,
    /// Do not wait for outstanding objects after dispatching.
    #[arg(long)]
    pub skip_quiescence_wait: bool,
    /// Sub-folder of the save folder for conflicting copies.
    #[arg(long, default_value = DEFAULT_DUPLICATES_DIR)]
    pub duplicates_dir: String,
    /// Bytes read from each object to identify it.
    #[arg(long, default_value_t = DEFAULT_HEADER_READ_BYTES)]
    pub header_read_bytes: usize,
    /// Address the push listener binds.
    #[arg(long, default_value = DEFAULT_LISTEN_HOST)]
    pub listen_host: String,
    /// Write a JSON run report to this path.
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

impl SyncConfig {
    /// Parse `argv`, first element being the program name.
    pub fn try_from_argv(argv: &[String]) -> Result<Self, clap::Error> {
        Self::try_parse_from(argv)
    }

    pub fn run_options(&self) -> RunOptions {
        parse_run_options(&self.options)
    }
}

/// Choices carried by the trailing option tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub mode: RetrievalMode,
    pub scope: QueryScope,
    pub transfer_syntaxes: TransferSyntaxPolicy,
    pub granularity: Granularity,
    pub reuse_association: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Push,
            scope: QueryScope::All,
            transfer_syntaxes: TransferSyntaxPolicy::Uncompressed,
            granularity: Granularity::Instance,
            reuse_association: false,
        }
    }
}

/// Match option tokens case-insensitively; anything unrecognised names a
/// pattern file, the last one winning.
pub fn parse_run_options<S: AsRef<str>>(tokens: &[S]) -> RunOptions {
    let mut options = RunOptions::default();
    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() {
            continue;
        }
        match token.to_ascii_uppercase().as_str() {
            "GET" => options.mode = RetrievalMode::Pull,
            "MOVE" => options.mode = RetrievalMode::Push,
            "ALL" => options.scope = QueryScope::All,
            "SELECTIVE" => options.scope = QueryScope::Selective,
            "UNCOMPRESSED" => options.transfer_syntaxes = TransferSyntaxPolicy::Uncompressed,
            "ANY" => options.transfer_syntaxes = TransferSyntaxPolicy::Any,
            "STUDY" => options.granularity = Granularity::Study,
            "INSTANCE" => options.granularity = Granularity::Instance,
            "REUSE" => options.reuse_association = true,
            "NEW" => options.reuse_association = false,
            _ => options.scope = QueryScope::PatternFile(PathBuf::from(token)),
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITIONALS: [&str; 8] = [
        "archive-sync",
        "index.db",
        "save",
        "pacs.local",
        "104",
        "PACS",
        "11112",
        "SYNC",
    ];

    #[test]
    fn defaults_without_option_tokens() {
        let config = SyncConfig::try_parse_from(POSITIONALS).expect("parse");
        assert_eq!(config.remote_port, 104);
        assert_eq!(config.local_identity, "SYNC");
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
        assert_eq!(config.duplicates_dir, DEFAULT_DUPLICATES_DIR);
        assert!(!config.skip_quiescence_wait);
        assert_eq!(config.run_options(), RunOptions::default());
    }

    #[test]
    fn trailing_tokens_select_options() {
        let mut argv: Vec<&str> = POSITIONALS.to_vec();
        argv.extend(["-vv", "--idle-timeout-secs", "5", "get", "Selective", "ANY", "study", "REUSE"]);
        let config = SyncConfig::try_parse_from(argv).expect("parse");
        assert_eq!(config.verbosity, 2);
        assert_eq!(config.idle_timeout_secs, 5);
        assert_eq!(
            config.run_options(),
            RunOptions {
                mode: RetrievalMode::Pull,
                scope: QueryScope::Selective,
                transfer_syntaxes: TransferSyntaxPolicy::Any,
                granularity: Granularity::Study,
                reuse_association: true,
            }
        );
    }

    #[test]
    fn flags_after_option_tokens_still_parse() {
        let mut argv: Vec<&str> = POSITIONALS.to_vec();
        argv.extend(["GET", "-v", "--report", "r.json"]);
        let config = SyncConfig::try_parse_from(argv).expect("parse");
        assert_eq!(config.verbosity, 1);
        assert_eq!(config.report, Some(PathBuf::from("r.json")));
        let options = config.run_options();
        assert_eq!(options.mode, RetrievalMode::Pull);
        assert_eq!(options.scope, QueryScope::All);
    }

    #[test]
    fn unknown_flag_after_tokens_is_rejected() {
        let mut argv: Vec<&str> = POSITIONALS.to_vec();
        argv.extend(["MOVE", "--no-such-flag"]);
        assert!(SyncConfig::try_parse_from(argv).is_err());
    }

    #[test]
    fn unknown_token_is_pattern_file() {
        let options = parse_run_options(&["MOVE", "wards.txt", "NEW"]);
        assert_eq!(options.scope, QueryScope::PatternFile(PathBuf::from("wards.txt")));
        assert_eq!(options.mode, RetrievalMode::Push);
        assert!(!options.reuse_association);
    }

    #[test]
    fn missing_positionals_are_rejected() {
        assert!(SyncConfig::try_parse_from(["archive-sync", "index.db"]).is_err());
    }
}
