use clap::{Arg, ArgAction, ArgMatches, Command};
use ruknock::sequence::SequenceId;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    List,
    Show(SequenceId),
    Knock { id: SequenceId, verify: bool },
    Check(SequenceId),
    /// Empty means every sequence with an enabled check.
    Watch(Vec<SequenceId>),
    Import(PathBuf),
    Export(PathBuf),
    Delete(SequenceId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub store: PathBuf,
    pub config: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub verbose: bool,
    pub command: CliCommand,
}

fn id_arg() -> Arg {
    Arg::new("id")
        .help("Sequence id")
        .required(true)
        .index(1)
        .value_parser(clap::value_parser!(SequenceId))
}

fn file_arg(help: &'static str) -> Arg {
    Arg::new("file")
        .help(help)
        .required(true)
        .index(1)
        .value_parser(clap::value_parser!(PathBuf))
}

pub fn build_cli() -> Command {
    Command::new("ruknock")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Port knocking client with resource access checks")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("store")
                .long("store")
                .short('s')
                .help("Sequence file")
                .value_name("path")
                .default_value("sequences.json")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Settings file")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("history")
                .long("history")
                .help("Append knock events to this file as JSON lines")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("list").about("List stored sequences"))
        .subcommand(Command::new("show").about("Show a sequence as JSON").arg(id_arg()))
        .subcommand(
            Command::new("knock").about("Run a knock sequence").arg(id_arg()).arg(
                Arg::new("verify")
                    .long("verify")
                    .help("Check the resource afterwards even if the sequence does not")
                    .action(ArgAction::SetTrue),
            ),
        )
        .subcommand(Command::new("check").about("Check the resource of a sequence once").arg(id_arg()))
        .subcommand(
            Command::new("watch")
                .about("Poll resources until stopped")
                .arg(
                    Arg::new("ids")
                        .help("Sequence ids (default: all with an enabled check)")
                        .index(1)
                        .num_args(0..)
                        .value_parser(clap::value_parser!(SequenceId)),
                ),
        )
        .subcommand(Command::new("import").about("Add sequences from an export file").arg(file_arg("File to read")))
        .subcommand(Command::new("export").about("Write all sequences to a file").arg(file_arg("File to write")))
        .subcommand(Command::new("delete").about("Delete a sequence").arg(id_arg()))
}

pub fn parse_args() -> anyhow::Result<CliArgs> {
    from_matches(&build_cli().get_matches())
}

pub fn parse_from<I, T>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    from_matches(&build_cli().try_get_matches_from(args)?)
}

fn from_matches(matches: &ArgMatches) -> anyhow::Result<CliArgs> {
    let Some((name, sub)) = matches.subcommand() else {
        return Err(anyhow::anyhow!("no command given"));
    };

    let id = || {
        sub.get_one::<SequenceId>("id")
            .copied()
            .ok_or_else(|| anyhow::anyhow!("missing sequence id"))
    };
    let file = || {
        sub.get_one::<PathBuf>("file")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing file"))
    };

    let command = match name {
        "list" => CliCommand::List,
        "show" => CliCommand::Show(id()?),
        "knock" => CliCommand::Knock {
            id: id()?,
            verify: sub.get_flag("verify"),
        },
        "check" => CliCommand::Check(id()?),
        "watch" => CliCommand::Watch(
            sub.get_many::<SequenceId>("ids")
                .map(|ids| ids.copied().collect())
                .unwrap_or_default(),
        ),
        "import" => CliCommand::Import(file()?),
        "export" => CliCommand::Export(file()?),
        "delete" => CliCommand::Delete(id()?),
        other => return Err(anyhow::anyhow!("unknown command '{}'", other)),
    };

    // Global args are propagated to the subcommand matches.
    let store = sub
        .get_one::<PathBuf>("store")
        .or_else(|| matches.get_one::<PathBuf>("store"))
        .cloned()
        .unwrap_or_else(|| PathBuf::from("sequences.json"));

    Ok(CliArgs {
        store,
        config: sub.get_one::<PathBuf>("config").cloned(),
        history: sub.get_one::<PathBuf>("history").cloned(),
        verbose: sub.get_flag("verbose"),
        command,
    })
}
