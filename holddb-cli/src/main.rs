use clap::{Parser, Subcommand, ValueEnum};
use holddb::catalog::RegistrationStatus;
use holddb::{CollectionSpec, Engine, EngineConfig};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;

/// HoldDB CLI: register GraphQL types and query them from the command line
#[derive(Parser)]
#[command(name = "holddb", version, about)]
struct Cli {
    /// YAML config file (overrides --data-dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding catalog.db and records.db (default: current directory)
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Register the object types of a GraphQL type document
    Register {
        /// Schema file ("-" reads stdin)
        file: String,
        /// Opaque version recorded on the new collections
        #[arg(long, default_value = "")]
        schema_version: String,
    },

    /// Run a query document
    Query {
        /// Query file ("-" reads stdin)
        #[arg(conflicts_with = "query")]
        file: Option<String>,
        /// Inline query document
        #[arg(long, short)]
        query: Option<String>,
    },

    /// Validate a query document and print the catalog snapshot it needs
    Validate {
        /// Query file ("-" reads stdin)
        #[arg(conflicts_with = "query")]
        file: Option<String>,
        /// Inline query document
        #[arg(long, short)]
        query: Option<String>,
    },

    /// List registered collections, or show one (e.g. Person, staff.Person)
    Collections {
        collection: Option<String>,
    },

    /// Show the registration journal
    Registrations {
        /// Only entries with this status
        #[arg(long)]
        status: Option<StatusFilter>,
    },

    /// Insert a row
    Insert {
        /// Collection (e.g. Person, staff.Person)
        collection: String,
        /// Field values (e.g. --field name="Alice Chen" --field author=1)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Append a field to an existing collection
    AddField {
        /// Collection (e.g. Person, staff.Person)
        collection: String,
        /// Field name
        name: String,
        /// Field type in SDL syntax (e.g. Int, [Person])
        field_type: String,
        /// Namespace of the referenced type
        #[arg(long, default_value = "")]
        ref_namespace: String,
    },

    /// Repair catalog/record store drift left by interrupted registrations
    Reconcile,

    /// Show store paths, collection stats and journal summary
    Status,
}

#[derive(Clone, ValueEnum)]
enum StatusFilter {
    Pending,
    Complete,
    Failed,
}

impl From<StatusFilter> for RegistrationStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => RegistrationStatus::Pending,
            StatusFilter::Complete => RegistrationStatus::Complete,
            StatusFilter::Failed => RegistrationStatus::Failed,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// `Name` or `namespace.Name`.
fn parse_spec(s: &str) -> CollectionSpec {
    match s.rsplit_once('.') {
        Some((namespace, name)) => CollectionSpec::new(name, namespace),
        None => CollectionSpec::named(s),
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::in_dir(&cli.data_dir),
    };
    log::debug!("opening engine with {config:?}");
    let engine = Engine::open(config)?;

    match cli.command {
        Command::Register {
            file,
            schema_version,
        } => {
            let source = read_source(Some(&file), None)?;
            let report = engine.register_schema(&source, &schema_version)?;
            let collections: Vec<_> = report
                .collections
                .iter()
                .map(|(spec, id)| serde_json::json!({ "collection": spec.to_string(), "id": id }))
                .collect();
            print_output(
                &serde_json::json!({
                    "registration": report.registration_id,
                    "collections": collections,
                    "reference_fields": report.reference_fields,
                }),
                &cli.format,
            )?;
        }

        Command::Query { file, query } => {
            let source = read_source(file.as_deref(), query)?;
            let response = engine.execute(&source)?;
            // Raw JSON from the record store; reparse so YAML output works too.
            let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&response)?)?;
            print_output(&value, &cli.format)?;
        }

        Command::Validate { file, query } => {
            let source = read_source(file.as_deref(), query)?;
            let snapshot = engine.validate(&source)?;
            print_output(&serde_json::to_value(&snapshot)?, &cli.format)?;
        }

        Command::Collections { collection } => {
            let value = match collection {
                Some(spec) => serde_json::to_value(engine.collection(&parse_spec(&spec))?)?,
                None => serde_json::to_value(engine.list_collections()?)?,
            };
            print_output(&value, &cli.format)?;
        }

        Command::Registrations { status } => {
            let registrations = engine.registrations(status.map(Into::into))?;
            print_output(&serde_json::to_value(registrations)?, &cli.format)?;
        }

        Command::Insert { collection, fields } => {
            let spec = parse_spec(&collection);
            let id = engine.insert_record(&spec, &fields_to_map(&fields))?;
            print_output(
                &serde_json::json!({ "collection": spec.to_string(), "id": id }),
                &cli.format,
            )?;
        }

        Command::AddField {
            collection,
            name,
            field_type,
            ref_namespace,
        } => {
            let field =
                engine.append_field(&parse_spec(&collection), &name, &field_type, &ref_namespace)?;
            print_output(&serde_json::to_value(field)?, &cli.format)?;
        }

        Command::Reconcile => {
            // Engine::open already reconciled unless the config turned it off.
            let report = engine.reconcile()?;
            print_output(&serde_json::to_value(report)?, &cli.format)?;
        }

        Command::Status => {
            print_output(&engine.status()?, &cli.format)?;
        }
    }

    Ok(())
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_map(fields: &[(String, String)]) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Numbers, booleans and null parse as JSON; anything else is a string
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    map
}

/// Document text from an inline argument, a file, or stdin (`-`).
fn read_source(
    file: Option<&str>,
    inline: Option<String>,
) -> Result<String, Box<dyn std::error::Error>> {
    if let Some(text) = inline {
        return Ok(text);
    }
    match file {
        Some("-") | None => {
            let mut content = String::new();
            std::io::stdin().read_to_string(&mut content)?;
            Ok(content)
        }
        Some(path) => std::fs::read_to_string(Path::new(path))
            .map_err(|e| format!("Failed to read '{path}': {e}").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec() {
        assert_eq!(parse_spec("Person"), CollectionSpec::named("Person"));
        assert_eq!(parse_spec("staff.Person"), CollectionSpec::new("Person", "staff"));
    }

    #[test]
    fn test_fields_to_map() {
        let map = fields_to_map(&[
            ("name".into(), "Alice Chen".into()),
            ("author".into(), "1".into()),
            ("active".into(), "true".into()),
        ]);
        assert_eq!(map["name"], serde_json::json!("Alice Chen"));
        assert_eq!(map["author"], serde_json::json!(1));
        assert_eq!(map["active"], serde_json::json!(true));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "holddb",
            "--format",
            "json",
            "add-field",
            "staff.Person",
            "mentor",
            "Person",
            "--ref-namespace",
            "staff",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::AddField { .. }));

        let cli = Cli::try_parse_from(["holddb", "query", "-q", "{ findPost(id: 1) { title } }"])
            .unwrap();
        assert!(matches!(cli.command, Command::Query { query: Some(_), .. }));
    }
}
