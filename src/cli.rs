//! CLI & mount-option surface (SPEC_FULL §4.F). Parses argv into
//! `MountOption`s and the daemon's own flags, keeping the template-tree
//! root (`-o templates=<path>`) as a distinct, required field rather than
//! folding it into the generic passthrough option list, since it is
//! consumed by this daemon, not handed to the kernel.

use std::path::PathBuf;

use clap::Parser;
use fuser::MountOption;

/// Positional mountpoint plus the common FUSE passthrough flags this
/// corpus's daemons expose, matching spec.md §6's command-line contract.
#[derive(Debug, Parser)]
#[command(name = "templatefs", version, about = "Template-rendering overlay filesystem")]
pub struct Cli {
    /// Directory to mount the overlay at.
    pub mountpoint: PathBuf,

    /// FUSE-style `-o key[=value][,key[=value]...]` options. `templates=<path>`
    /// is required; recognized passthrough flags are `ro`, `rw`,
    /// `allow_other`, `allow_root`, `auto_unmount`, `default_permissions`,
    /// `fsname=<name>`.
    #[arg(short = 'o', value_name = "OPT[,OPT...]")]
    pub options: Vec<String>,

    /// Run in the foreground. Always true here: this daemon never
    /// daemonizes itself (spec.md §6 exit code 5 is reserved but
    /// unreachable for that reason).
    #[arg(short = 'f', long = "foreground")]
    pub foreground: bool,

    /// Run the kernel session single-threaded.
    #[arg(short = 's', long = "single-thread")]
    pub single_thread: bool,

    /// Path to this daemon's own TOML configuration (logging, exec driver
    /// tuning). Distinct from the template config store (SPEC_FULL §4.G).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the hierarchical configuration-store TOML document templates
    /// render against. Overrides `DaemonConfig::config_store_path`.
    #[arg(long = "config-store", value_name = "PATH")]
    pub config_store: Option<PathBuf>,
}

/// The result of parsing `-o` options: the required template-tree root plus
/// whatever `MountOption`s are handed straight to `fuser`.
pub struct ParsedOptions {
    pub templates: PathBuf,
    pub fuse_options: Vec<MountOption>,
}

/// Distinguishes a missing/absent `templates=` option (spec.md §6 exit code
/// 2: "missing mountpoint or missing templates option") from a malformed one
/// (exit code 8: "template-specific option parse failure") and from any
/// other unrecognized `-o` entry (exit code 1: "common-option parse
/// failure").
#[derive(Debug)]
pub enum OptionError {
    TemplatesMissing,
    TemplatesMalformed(String),
    Unrecognized(String),
}

/// Splits every `-o` argument on commas and classifies each `key[=value]`
/// entry. `templates=` is pulled out rather than forwarded to `fuser`.
pub fn parse_mount_options(raw: &[String]) -> Result<ParsedOptions, OptionError> {
    let mut templates = None;
    let mut fuse_options = Vec::new();

    for group in raw {
        for entry in group.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some(("templates", "")) => return Err(OptionError::TemplatesMalformed(entry.to_string())),
                Some(("templates", path)) => templates = Some(PathBuf::from(path)),
                Some(("fsname", name)) => fuse_options.push(MountOption::FSName(name.to_string())),
                Some((key, _)) => return Err(OptionError::Unrecognized(key.to_string())),
                None => match entry {
                    "templates" => return Err(OptionError::TemplatesMalformed(entry.to_string())),
                    "ro" => fuse_options.push(MountOption::RO),
                    "rw" => fuse_options.push(MountOption::RW),
                    "allow_other" => fuse_options.push(MountOption::AllowOther),
                    "allow_root" => fuse_options.push(MountOption::AllowRoot),
                    "auto_unmount" => fuse_options.push(MountOption::AutoUnmount),
                    "default_permissions" => fuse_options.push(MountOption::DefaultPermissions),
                    other => return Err(OptionError::Unrecognized(other.to_string())),
                },
            }
        }
    }

    match templates {
        Some(path) => Ok(ParsedOptions { templates: path, fuse_options }),
        None => Err(OptionError::TemplatesMissing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_templates_path_and_leaves_it_out_of_fuse_options() {
        let parsed = parse_mount_options(&["templates=/tmp/tpl,ro".to_string()]).unwrap();
        assert_eq!(parsed.templates, PathBuf::from("/tmp/tpl"));
        assert_eq!(parsed.fuse_options.len(), 1);
    }

    #[test]
    fn missing_templates_is_a_distinct_error() {
        let err = parse_mount_options(&["ro".to_string()]).unwrap_err();
        assert!(matches!(err, OptionError::TemplatesMissing));
    }

    #[test]
    fn bare_templates_with_no_value_is_malformed_not_missing() {
        let err = parse_mount_options(&["templates".to_string()]).unwrap_err();
        assert!(matches!(err, OptionError::TemplatesMalformed(_)));
    }

    #[test]
    fn unknown_option_is_reported_distinctly() {
        let err = parse_mount_options(&["bogus=1".to_string()]).unwrap_err();
        assert!(matches!(err, OptionError::Unrecognized(_)));
    }
}
