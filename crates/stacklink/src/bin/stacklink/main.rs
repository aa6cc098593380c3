mod cli;

use anyhow::Context;
use stacklink::{Engine, Intent, SchemaRegistry, Template};

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKLINK_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let command_result = match cli.command {
        cli::Command::Parse(parse_cli) => parse(cli.schema, parse_cli),
        cli::Command::Apply(apply_cli) => apply(cli.schema, apply_cli),
        cli::Command::Dev(dev_cli) => dev(cli.schema, dev_cli),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

pub fn parse(schema: Option<std::path::PathBuf>, cli: cli::ParseCommand) -> anyhow::Result<()> {
    let registry = load_registry(schema)?;
    let template = load_template(&cli.input)?;
    let graph = Engine::new(&registry).parse(&template)?;

    if cli.owners {
        output(&cli.output, &graph.owners())
    } else {
        output(&cli.output, &graph)
    }
}

pub fn apply(schema: Option<std::path::PathBuf>, cli: cli::ApplyCommand) -> anyhow::Result<()> {
    let registry = load_registry(schema)?;
    let mut template = load_template(&cli.input)?;

    let text = std::fs::read_to_string(&cli.intent)
        .with_context(|| format!("Failed to read intent {}", cli.intent.display()))?;
    let intent: Intent = serde_yaml::from_str(&text)
        .with_context(|| format!("Invalid intent in {}", cli.intent.display()))?;

    let engine = Engine::new(&registry);
    let mut graph = engine.parse(&template)?;
    engine.apply(&mut template, &mut graph, &intent)?;
    tracing::info!(resources = graph.resources.len(), "applied");

    output(&cli.output, template.document())
}

fn load_registry(schema: Option<std::path::PathBuf>) -> anyhow::Result<SchemaRegistry> {
    let path = schema.context("No schema given (--schema)")?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read schema {}", path.display()))?;
    let registry = SchemaRegistry::from_yaml_str(&text)
        .with_context(|| format!("Invalid schema {}", path.display()))?;
    tracing::debug!(
        schema = %path.display(),
        types = registry.resource_types().count(),
        "Loaded schema"
    );
    Ok(registry)
}

fn load_template(input: &cli::InputArgs) -> anyhow::Result<Template> {
    let Some(path) = &input.template else {
        let stdin = std::io::read_to_string(std::io::stdin())?;
        return Ok(Template::from_str_guess(&stdin)?);
    };

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template {}", path.display()))?;
    let template = Template::from_str_guess(&text)
        .with_context(|| format!("Invalid template {}", path.display()))?;
    Ok(template)
}

fn output(output: &cli::OutputArgs, value: &impl serde::Serialize) -> anyhow::Result<()> {
    match output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), value)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), value)?,
    };

    Ok(())
}

/// (stacklink-)developer utilities
///
/// A quick way to expose internal structures for debugging purposes
pub fn dev(schema: Option<std::path::PathBuf>, cli: cli::DevCommand) -> anyhow::Result<()> {
    match cli.command {
        cli::DevSubCommand::Schema => {
            let registry = load_registry(schema)?;
            println!("{registry:#?}")
        }
        cli::DevSubCommand::Template(input) => {
            let template = load_template(&input)?;
            println!("{}", template.to_yaml_string()?)
        }
    }

    Ok(())
}
