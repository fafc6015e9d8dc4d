use crate::infra::positive_count;
use acuity::config::AppConfig;
use acuity::error::AppError;
use acuity::pipeline::{
    BatchOptions, CancelFlag, PipelineDefinition, RunError, RunInputs, ScoringJob, Strictness,
    WindowCatalog,
};
use acuity::scoring::{RuleKind, RuleTable};
use acuity::telemetry;
use clap::Args;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Args, Debug)]
pub(crate) struct ScoreArgs {
    /// Pipeline definition (JSON); relative paths inside it resolve against its directory
    #[arg(long)]
    pub(crate) pipeline: PathBuf,
    /// Window catalog CSV with entity_id,start,end columns
    #[arg(long)]
    pub(crate) windows: PathBuf,
    /// Optional entity registry CSV; windows for other entities are rejected
    #[arg(long)]
    pub(crate) entities: Option<PathBuf>,
    /// Directory receiving features.csv and scores.csv
    #[arg(long, default_value = ".")]
    pub(crate) out_dir: PathBuf,
    /// Fail on the first invalid window or failed batch
    #[arg(long)]
    pub(crate) strict: bool,
    /// Entities per batch
    #[arg(long, value_parser = positive_count)]
    pub(crate) batch_size: Option<usize>,
    /// Concurrent batches
    #[arg(long, value_parser = positive_count)]
    pub(crate) workers: Option<usize>,
    /// Add rule id and source columns per component to scores.csv
    #[arg(long)]
    pub(crate) provenance: bool,
}

impl ScoreArgs {
    fn apply(&self, mut options: BatchOptions) -> BatchOptions {
        if let Some(size) = self.batch_size {
            options.size = size;
        }
        if let Some(workers) = self.workers {
            options.workers = workers;
        }
        if self.strict {
            options.strictness = Strictness::Strict;
        }
        options
    }
}

#[derive(Args, Debug)]
pub(crate) struct RulesArgs {
    /// Built-in table name (sofa, sofa2) or a path to a rule table JSON file
    #[arg(long, default_value = "sofa")]
    pub(crate) table: String,
}

pub(crate) async fn run_score(args: ScoreArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let base = args
        .pipeline
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let definition = PipelineDefinition::from_path(&args.pipeline)
        .map_err(RunError::from)?
        .resolve_paths(&base);
    let job = ScoringJob::from_definition(definition)?;
    let options = args.apply(job.batch_options(config.engine.batch_options()));

    let sources = job.load_sources()?;
    let windows = WindowCatalog::read_csv(File::open(&args.windows)?).map_err(RunError::from)?;
    let known_entities = match &args.entities {
        Some(path) => {
            Some(WindowCatalog::read_entities(File::open(path)?).map_err(RunError::from)?)
        }
        None => None,
    };

    let cancel = CancelFlag::default();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling remaining batches");
            on_interrupt.cancel();
        }
    });

    let output = job
        .run(
            RunInputs {
                sources,
                windows,
                known_entities,
            },
            options,
            cancel,
        )
        .await?;

    fs::create_dir_all(&args.out_dir)?;
    let features_path = args.out_dir.join("features.csv");
    let scores_path = args.out_dir.join("scores.csv");
    output
        .features
        .write_csv(BufWriter::new(File::create(&features_path)?))?;
    output
        .scores
        .write_csv(BufWriter::new(File::create(&scores_path)?), args.provenance)?;

    info!(
        features = %features_path.display(),
        scores = %scores_path.display(),
        "output tables written"
    );
    print!("{}", output.report.summary());
    Ok(())
}

pub(crate) fn run_rules(args: RulesArgs) -> Result<(), AppError> {
    let table = RuleTable::named_or_path(&args.table).map_err(RunError::from)?;
    print!("{}", render_rule_table(&table));
    Ok(())
}

fn render_rule_table(table: &RuleTable) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} v{} (tiers 0-{}, {} components)",
        table.name,
        table.version,
        table.max_tier,
        table.components.len()
    );

    for component in &table.components {
        let _ = writeln!(out, "\n{}", component.component);
        for rule in &component.rules {
            let kind = match rule.kind {
                RuleKind::Override => "override",
                RuleKind::Threshold => "threshold",
            };
            let when = serde_json::to_string(&rule.when).unwrap_or_default();
            let _ = writeln!(
                out,
                "  {:<28} {:<9} tier {}  {}",
                rule.id, kind, rule.tier, when
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn score_args() -> ScoreArgs {
        ScoreArgs {
            pipeline: PathBuf::from("pipeline.json"),
            windows: PathBuf::from("windows.csv"),
            entities: None,
            out_dir: PathBuf::from("."),
            strict: false,
            batch_size: None,
            workers: None,
            provenance: false,
        }
    }

    #[test]
    fn command_line_overrides_win() {
        let args = ScoreArgs {
            batch_size: Some(1),
            strict: true,
            ..score_args()
        };
        let options = args.apply(BatchOptions {
            size: 500,
            workers: 3,
            timeout: Some(Duration::from_secs(5)),
            strictness: Strictness::Lenient,
        });

        assert_eq!(options.size, 1);
        assert_eq!(options.workers, 3);
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.strictness, Strictness::Strict);
    }

    #[test]
    fn unset_flags_keep_configured_options() {
        let defaults = BatchOptions::default();
        let options = score_args().apply(defaults);
        assert_eq!(options.size, defaults.size);
        assert_eq!(options.strictness, Strictness::Lenient);
    }

    #[test]
    fn builtin_table_renders_every_component() {
        let table = RuleTable::builtin("sofa").expect("builtin table loads");
        let rendered = render_rule_table(&table);

        assert!(rendered.starts_with(&format!("{} v{}", table.name, table.version)));
        for component in table.component_names() {
            assert!(rendered.contains(&format!("\n{component}\n")));
        }
        assert!(rendered.contains("override"));
    }

    #[test]
    fn unknown_tables_are_input_errors() {
        let error = run_rules(RulesArgs {
            table: "does-not-exist.json".to_string(),
        })
        .expect_err("missing table");
        assert!(error.is_input_error());
    }
}
