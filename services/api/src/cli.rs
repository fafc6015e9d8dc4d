use crate::commands::{run_rules, run_score, RulesArgs, ScoreArgs};
use crate::server;
use acuity::error::AppError;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "acuity-api",
    about = "Extract windowed clinical features and score them against a tiered rule table",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run a pipeline definition over a window catalog and write the output tables
    Score(ScoreArgs),
    /// Validate a rule table and print its components
    Rules(RulesArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Score(args) => run_score(args).await,
        Command::Rules(args) => run_rules(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_arguments_parse() {
        let cli = Cli::try_parse_from([
            "acuity-api",
            "score",
            "--pipeline",
            "pipeline.json",
            "--windows",
            "windows.csv",
            "--batch-size",
            "7",
            "--strict",
        ])
        .expect("arguments parse");

        match cli.command {
            Some(Command::Score(args)) => {
                assert_eq!(args.batch_size, Some(7));
                assert!(args.strict);
                assert!(args.entities.is_none());
                assert_eq!(args.out_dir, std::path::PathBuf::from("."));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rules_default_to_the_builtin_table() {
        let cli = Cli::try_parse_from(["acuity-api", "rules"]).expect("arguments parse");
        match cli.command {
            Some(Command::Rules(args)) => assert_eq!(args.table, "sofa"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn zero_workers_are_rejected() {
        let result = Cli::try_parse_from([
            "acuity-api",
            "score",
            "--pipeline",
            "p.json",
            "--windows",
            "w.csv",
            "--workers",
            "0",
        ]);
        assert!(result.is_err());
    }
}
