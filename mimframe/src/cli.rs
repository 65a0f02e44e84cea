#![allow(deprecated)]
#![allow(dangerous_implicit_autorefs)]
use {
    crate::error::{ConfigError, CrateResult},
    clap::{crate_authors, crate_version, App, Arg},
    regex::Regex,
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
    },
};

pub fn generate_cli<'a, 'b>() -> App<'a, 'b> {
    App::new("mimframe")
        .about(
            "Standalone traffic record/replay server. Grab the host:port it announces on stdout \
             and run a program with TEXTTEST_MIM_SERVER set to it; the SUT-side interceptors do \
             the rest.",
        )
        .author(crate_authors!("\n"))
        .version(crate_version!())
        .arg(
            Arg::with_name("record")
                .short("r")
                .long("record")
                .takes_value(true)
                .value_name("FILE")
                .help("Record traffic to FILE"),
        )
        .arg(
            Arg::with_name("replay")
                .short("p")
                .long("replay")
                .takes_value(true)
                .value_name("FILE")
                .validator(|s| {
                    Some(s.as_str())
                        .filter(|s| Path::new(s).exists())
                        .map(|_| ())
                        .ok_or_else(|| format!("'{}' does not exist or is an invalid path", s))
                })
                .help("Replay traffic recorded in FILE"),
        )
        .arg(
            Arg::with_name("replay-items")
                .short("I")
                .long("replay-items")
                .takes_value(true)
                .value_name("ITEMS")
                .help("Attempt replay only for items in ITEMS, record the rest"),
        )
        .arg(
            Arg::with_name("record-file-edits")
                .short("F")
                .long("record-file-edits")
                .takes_value(true)
                .value_name("DIR")
                .help("Store edited files under DIR"),
        )
        .arg(
            Arg::with_name("replay-file-edits")
                .short("f")
                .long("replay-file-edits")
                .takes_value(true)
                .value_name("DIR")
                .help("Restore edited files referred to in the replayed file from DIR"),
        )
        .arg(
            Arg::with_name("ignore-edits")
                .short("i")
                .long("ignore-edits")
                .takes_value(true)
                .value_name("NAMES")
                .help("Ignore files and directories with the given names when monitoring edits"),
        )
        .arg(
            Arg::with_name("transfer-environment")
                .short("e")
                .long("transfer-environment")
                .takes_value(true)
                .value_name("DICT")
                .help(
                    "Environment variables significant to particular commands, recorded when \
                     changed. Form: cmd=VAR+VAR,... ('default' applies to every command)",
                ),
        )
        .arg(
            Arg::with_name("async-edit-commands")
                .short("a")
                .long("asynchronous-file-edit-commands")
                .takes_value(true)
                .value_name("CMDS")
                .help("Commands which may cause files to be edited after they have exited"),
        )
        .arg(
            Arg::with_name("alter-response")
                .short("A")
                .long("alter-response")
                .takes_value(true)
                .value_name("REPLACEMENTS")
                .help("Alterations to perform on response text before recording it"),
        )
        .arg(
            Arg::with_name("intercept-modules")
                .short("m")
                .long("intercept-modules")
                .takes_value(true)
                .value_name("MODULES")
                .help("Module names whose in-process surface is intercepted"),
        )
        .arg(
            Arg::with_name("sequential")
                .short("s")
                .long("sequential-mode")
                .help("Disable concurrent traffic, handle all incoming messages sequentially"),
        )
        .arg(
            Arg::with_name("test-path")
                .short("t")
                .long("test-path")
                .takes_value(true)
                .value_name("PATH")
                .help("Set a test path name for filtering and/or error messages"),
        )
        .arg(
            Arg::with_name("logdefaults")
                .short("l")
                .long("logdefaults")
                .takes_value(true)
                .value_name("DIRECTIVES")
                .help("Default log filter directives, used when RUST_LOG is unset"),
        )
        .arg(
            Arg::with_name("logfile")
                .short("L")
                .long("logfile")
                .takes_value(true)
                .value_name("FILE")
                .help("Write log output to FILE instead of stderr"),
        )
}

pub struct ProgramArgs {
    record: Option<PathBuf>,
    replay: Option<PathBuf>,
    replay_items: Vec<String>,
    record_edits: Option<PathBuf>,
    replay_edits: Option<PathBuf>,
    ignore_edits: Vec<String>,
    transfer_env: HashMap<String, Vec<String>>,
    async_edit_commands: Vec<String>,
    alterations: Vec<(Regex, String)>,
    intercept_modules: Vec<String>,
    sequential: bool,
    test_path: Option<String>,
    log_defaults: Option<String>,
    log_file: Option<PathBuf>,
}

impl ProgramArgs {
    pub fn try_init(cli: App<'_, '_>) -> CrateResult<Self> {
        let store = cli.get_matches();

        Ok(Self {
            record: store.value_of("record").map(PathBuf::from),
            replay: store.value_of("replay").map(PathBuf::from),
            replay_items: split_list(store.value_of("replay-items")),
            record_edits: store.value_of("record-file-edits").map(PathBuf::from),
            replay_edits: store.value_of("replay-file-edits").map(PathBuf::from),
            ignore_edits: split_list(store.value_of("ignore-edits")),
            transfer_env: parse_cmd_dictionary(store.value_of("transfer-environment"))?,
            async_edit_commands: split_list(store.value_of("async-edit-commands")),
            alterations: parse_alterations(store.value_of("alter-response"))?,
            intercept_modules: split_list(store.value_of("intercept-modules")),
            sequential: store.is_present("sequential"),
            test_path: store.value_of("test-path").map(String::from),
            log_defaults: store.value_of("logdefaults").map(String::from),
            log_file: store.value_of("logfile").map(PathBuf::from),
        })
    }

    pub fn record_file(&self) -> Option<&Path> {
        self.record.as_deref()
    }

    pub fn replay_file(&self) -> Option<&Path> {
        self.replay.as_deref()
    }

    pub fn replay_items(&self) -> &[String] {
        &self.replay_items
    }

    pub fn record_edits_dir(&self) -> Option<&Path> {
        self.record_edits.as_deref()
    }

    pub fn replay_edits_dir(&self) -> Option<&Path> {
        self.replay_edits.as_deref()
    }

    pub fn ignore_edits(&self) -> &[String] {
        &self.ignore_edits
    }

    pub fn transfer_env(&self) -> &HashMap<String, Vec<String>> {
        &self.transfer_env
    }

    pub fn async_edit_commands(&self) -> &[String] {
        &self.async_edit_commands
    }

    pub fn alterations(&self) -> &[(Regex, String)] {
        &self.alterations
    }

    pub fn intercept_modules(&self) -> &[String] {
        &self.intercept_modules
    }

    pub fn sequential(&self) -> bool {
        self.sequential
    }

    pub fn test_path(&self) -> Option<&str> {
        self.test_path.as_deref()
    }

    pub fn log_defaults(&self) -> Option<&str> {
        self.log_defaults.as_deref()
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|s| s.split(',').map(String::from).collect())
        .unwrap_or_default()
}

/// Parses the `-e` mapping, `cmd=VAR+VAR,...`. The `default` key applies to
/// every command
fn parse_cmd_dictionary(
    value: Option<&str>,
) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let mut dict = HashMap::new();
    if let Some(value) = value {
        for part in value.split(',') {
            let mut halves = part.splitn(2, '=');
            match (halves.next(), halves.next()) {
                (Some(cmd), Some(vars)) if !cmd.is_empty() => {
                    dict.insert(cmd.to_string(), vars.split('+').map(String::from).collect());
                }
                _ => return Err(ConfigError::BadEnvMapping(part.to_string())),
            }
        }
    }
    Ok(dict)
}

/// Parses the `-A` list, each entry `REGEX{REPLACE TEXT}`, comma separated.
/// Patterns are compiled once here
fn parse_alterations(value: Option<&str>) -> Result<Vec<(Regex, String)>, ConfigError> {
    let mut alterations = Vec::new();
    if let Some(value) = value {
        for part in value.split(',') {
            let trimmed = part
                .strip_suffix('}')
                .ok_or_else(|| ConfigError::BadAlteration(part.to_string()))?;
            let mut halves = trimmed.splitn(2, "{REPLACE ");
            match (halves.next(), halves.next()) {
                (Some(find), Some(replace)) => {
                    alterations.push((Regex::new(find)?, replace.to_string()))
                }
                _ => return Err(ConfigError::BadAlteration(part.to_string())),
            }
        }
    }
    Ok(alterations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_dictionary_splits_on_plus() {
        let dict = parse_cmd_dictionary(Some("gcc=PATH+CFLAGS,default=HOME")).unwrap();
        assert_eq!(dict["gcc"], vec!["PATH", "CFLAGS"]);
        assert_eq!(dict["default"], vec!["HOME"]);
        assert!(parse_cmd_dictionary(None).unwrap().is_empty());
    }

    #[test]
    fn cmd_dictionary_rejects_missing_equals() {
        assert!(parse_cmd_dictionary(Some("gcc")).is_err());
    }

    #[test]
    fn alterations_compile() {
        let alts = parse_alterations(Some(r"fo+{REPLACE bar}")).unwrap();
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].0.replace_all("foo food", &*alts[0].1), "bar bard");
    }

    #[test]
    fn alterations_reject_bad_shapes() {
        assert!(parse_alterations(Some("no-replace-marker}")).is_err());
        assert!(parse_alterations(Some("missing{REPLACE brace")).is_err());
    }
}
