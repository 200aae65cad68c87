pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "steward",
    about = "Steward operator CLI",
    long_about = "Operate the Steward agent runtime: migrations, config inspection, readiness checks, \
                  conversations, runtime settings and tool servers.",
    after_help = "Examples:\n  steward doctor --json\n  steward chat --thread ops-1 \"What changed in the Acme account?\"\n  steward history --thread ops-1\n  steward tools\n  steward settings set llm_model_name gpt-4o-mini\n  steward servers add --name files --command npx --arg -y --arg @modelcontextprotocol/server-filesystem"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity and model credential readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Send one message to a conversation thread and print the reply")]
    Chat {
        #[arg(long, short, help = "Conversation thread id")]
        thread: String,
        #[arg(required = true, num_args = 1.., help = "Message text")]
        text: Vec<String>,
    },
    #[command(about = "Show a thread's message history, or list threads when no id is given")]
    History {
        #[arg(long, short, help = "Conversation thread id")]
        thread: Option<String>,
    },
    #[command(about = "Delete every checkpoint of a conversation thread")]
    Forget {
        #[arg(long, short, help = "Conversation thread id")]
        thread: String,
    },
    #[command(about = "Connect to the configured tool servers and report the available tools")]
    Tools,
    #[command(about = "Inspect or edit runtime settings such as the model provider and name")]
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    #[command(about = "Manage the tool servers stored in the database")]
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },
    #[command(about = "Send one message to the configured model without tools")]
    ModelTest {
        #[arg(required = true, num_args = 1.., help = "Message text")]
        text: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    #[command(about = "Show one setting, or every stored setting")]
    Get { key: Option<String> },
    #[command(about = "Store a setting; the value is parsed as JSON when possible")]
    Set {
        key: String,
        value: String,
        #[arg(long, help = "Operator-facing description of the setting")]
        description: Option<String>,
    },
    #[command(about = "Remove a stored setting so the config default applies again")]
    Unset { key: String },
}

#[derive(Debug, Subcommand)]
enum ServersAction {
    #[command(about = "List config-file and stored tool servers")]
    List,
    #[command(about = "Register a stdio tool server")]
    Add {
        #[arg(long, help = "Unique server name")]
        name: String,
        #[arg(long, help = "Executable to start")]
        command: String,
        #[arg(long = "arg", allow_hyphen_values = true, help = "Command argument, repeatable")]
        args: Vec<String>,
        #[arg(long = "env", help = "Environment entry as KEY=VALUE, repeatable")]
        env: Vec<String>,
        #[arg(long, help = "Store the server without starting it")]
        disabled: bool,
    },
    #[command(about = "Delete a stored server by id or name")]
    Remove { server: String },
    #[command(about = "Enable a stored server by id or name")]
    Enable { server: String },
    #[command(about = "Disable a stored server by id or name")]
    Disable { server: String },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Chat { thread, text } => commands::chat::run(&thread, &text.join(" ")),
        Command::History { thread } => commands::history::run(thread.as_deref()),
        Command::Forget { thread } => commands::history::forget(&thread),
        Command::Tools => commands::tools::run(),
        Command::Settings { action } => match action {
            SettingsAction::Get { key } => commands::settings::get(key.as_deref()),
            SettingsAction::Set { key, value, description } => {
                commands::settings::set(&key, &value, description.as_deref())
            }
            SettingsAction::Unset { key } => commands::settings::unset(&key),
        },
        Command::Servers { action } => match action {
            ServersAction::List => commands::servers::list(),
            ServersAction::Add { name, command, args, env, disabled } => {
                commands::servers::add(&name, &command, &args, &env, !disabled)
            }
            ServersAction::Remove { server } => commands::servers::remove(&server),
            ServersAction::Enable { server } => commands::servers::set_enabled(&server, true),
            ServersAction::Disable { server } => commands::servers::set_enabled(&server, false),
        },
        Command::ModelTest { text } => commands::model::test(&text.join(" ")),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command, ServersAction};

    #[test]
    fn server_arguments_may_start_with_a_hyphen() {
        let cli = Cli::try_parse_from([
            "steward", "servers", "add", "--name", "files", "--command", "npx", "--arg", "-y", "--env",
            "ROOT=/srv",
        ])
        .expect("parse");
        match cli.command {
            Command::Servers { action: ServersAction::Add { name, args, env, disabled, .. } } => {
                assert_eq!(name, "files");
                assert_eq!(args, vec!["-y".to_string()]);
                assert_eq!(env, vec!["ROOT=/srv".to_string()]);
                assert!(!disabled);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn model_test_joins_its_words() {
        let cli = Cli::try_parse_from(["steward", "model-test", "say", "hi"]).expect("parse");
        assert!(matches!(cli.command, Command::ModelTest { text } if text == ["say", "hi"]));
    }
}
