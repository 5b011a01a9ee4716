use clap::{Parser, Subcommand, ValueEnum};
use nodestore::index::IndexSpec;
use nodestore::{DefaultExtractor, NodeQuery, Outcome, Reference, Store, StoreConfig, Walk};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;

/// nodestore CLI - read and write a file-system document store
#[derive(Parser)]
#[command(name = "nodestore", version, about)]
struct Cli {
    /// Store root directory (default: current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// YAML config file; its root wins over --root
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working schema, slash separated (default: the store root)
    #[arg(long, short, global = true, default_value = "")]
    schema: String,

    /// Output format
    #[arg(long, default_value = "json")]
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
    /// Read a node
    Get {
        id: String,
    },

    /// Create a node
    Add {
        /// Node value as JSON
        data: Option<String>,
        /// Explicit id (default: a generated UUID)
        #[arg(long)]
        id: Option<String>,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Deep-merge data into a node
    Set {
        id: String,
        data: Option<String>,
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Replace a node
    Put {
        id: String,
        data: Option<String>,
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a node, cascading to dependents
    Del {
        id: String,
    },

    /// List the node ids of the schema
    Ids,

    /// List nodes, optionally filtered, sorted and paged
    List {
        /// Predicate, e.g. "{age} > 30 && {name} != 'Bob'"
        #[arg(long = "where")]
        where_clause: Option<String>,
        #[arg(long)]
        offset: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        /// Field to sort on
        #[arg(long)]
        order: Option<String>,
        /// Sort descending
        #[arg(long)]
        desc: bool,
    },

    /// Count nodes matching a predicate
    Count {
        #[arg(long = "where")]
        where_clause: Option<String>,
    },

    /// Rename a node, repointing references
    Rename {
        old: String,
        new: String,
    },

    /// List a schema and every schema below it
    Schemas {
        from: Option<String>,
    },

    /// Delete a schema tree
    DelSchema {
        name: String,
    },

    /// Manage references between schemas
    Ref {
        #[command(subcommand)]
        command: RefCommand,
    },

    /// Build the full-text index of the schema
    Index {
        /// Index root (default: <schema>/.index)
        #[arg(long)]
        index_schema: Option<String>,
        /// One directory per word instead of per character
        #[arg(long)]
        whole_words: bool,
        /// Drop the existing index first
        #[arg(long)]
        clear: bool,
    },

    /// Search a full-text index
    Search {
        phrase: String,
        #[arg(long)]
        index_schema: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage ordered lists over the schema
    Order {
        #[command(subcommand)]
        command: OrderCommand,
    },

    /// Show or change the schema's stats
    Stats {
        /// Rebuild the count from a full scan
        #[arg(long)]
        recompute: bool,
        /// Expression such as "{visits} += 1"
        #[arg(long)]
        change: Option<String>,
    },
}

#[derive(Subcommand)]
enum RefCommand {
    /// Declare that <property> of the schema's nodes holds ids of <foreign>
    Add {
        foreign: String,
        property: String,
        /// Do not rewrite dependents when a referenced node is renamed
        #[arg(long)]
        no_update_cascade: bool,
        /// Null the property instead of deleting dependents
        #[arg(long)]
        no_delete_cascade: bool,
    },
    /// Remove a reference
    Del {
        foreign: String,
        property: String,
    },
    /// List the references of the schema
    List,
}

#[derive(Subcommand)]
enum OrderCommand {
    /// Insert a node at the position of a value
    Add {
        id: String,
        /// Sort value as JSON
        value: String,
        #[arg(long, default_value = nodestore::order::DEFAULT_TAG)]
        tag: String,
    },
    /// Walk a list
    List {
        #[arg(long, default_value = nodestore::order::DEFAULT_TAG)]
        tag: String,
        /// Start from the last entry
        #[arg(long)]
        reverse: bool,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
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
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::new(&cli.root),
    };
    let store = Store::with_config(config, &cli.schema)?;
    let schema = store.schema();
    log::debug!("Store root {}, schema '{schema}'", store.root().display());

    let output = match cli.command {
        Command::Get { id } => store.get_node(&id, &schema)?.unwrap_or(Value::Null),

        Command::Add { data, id, fields } => {
            let value = input_value(data.as_deref(), &fields)?;
            outcome_json(store.add_node(value, id.as_deref(), &schema)?, |id| json!({ "ok": true, "id": id }))
        }

        Command::Set { id, data, fields } => {
            let value = input_value(data.as_deref(), &fields)?;
            outcome_json(store.set_node(&id, value, &schema)?, |node| json!({ "ok": true, "node": node }))
        }

        Command::Put { id, data, fields } => {
            let value = input_value(data.as_deref(), &fields)?;
            outcome_json(store.put_node(&id, value, &schema)?, |node| json!({ "ok": true, "node": node }))
        }

        Command::Del { id } => outcome_json(store.del_node(&id, &schema)?, |_| json!({ "ok": true, "deleted": id })),

        Command::Ids => json!(store.get_ids(&schema)?),

        Command::List {
            where_clause,
            offset,
            limit,
            order,
            desc,
        } => {
            let query = NodeQuery {
                where_clause,
                offset,
                limit,
                order,
                order_asc: Some(!desc),
            };
            let nodes: Vec<Value> = store
                .get_nodes(&query, &schema)?
                .into_iter()
                .map(|(id, node)| json!({ "id": id, "node": node }))
                .collect();
            Value::Array(nodes)
        }

        Command::Count { where_clause } => {
            let query = NodeQuery {
                where_clause,
                ..Default::default()
            };
            json!({ "count": store.get_count(&query, &schema)? })
        }

        Command::Rename { old, new } => outcome_json(store.rename_node(&old, &new, &schema)?, |_| {
            json!({ "ok": true, "id": new })
        }),

        Command::Schemas { from } => {
            let from = from.unwrap_or(schema);
            json!(store.schemas(&from)?.collect::<Vec<_>>())
        }

        Command::DelSchema { name } => json!({ "ok": store.del_schema(&name)? }),

        Command::Ref { command } => match command {
            RefCommand::Add {
                foreign,
                property,
                no_update_cascade,
                no_delete_cascade,
            } => {
                let reference = Reference::new(&schema, &foreign, &property)
                    .update_cascade(!no_update_cascade)
                    .delete_cascade(!no_delete_cascade);
                json!({ "ok": store.references().add(&reference)? })
            }
            RefCommand::Del { foreign, property } => {
                let reference = Reference::new(&schema, &foreign, &property);
                json!({ "ok": store.references().remove(&reference)? })
            }
            RefCommand::List => serde_json::to_value(store.references().list(&schema)?)?,
        },

        Command::Index {
            index_schema,
            whole_words,
            clear,
        } => {
            let mut spec = IndexSpec::new(&schema).whole_words(whole_words);
            if let Some(index_schema) = index_schema {
                spec = spec.index_schema(&index_schema);
            }
            let indexed = store.index().create_index(&DefaultExtractor, &spec, clear)?;
            json!({ "ok": true, "indexed": indexed })
        }

        Command::Search {
            phrase,
            index_schema,
            offset,
            limit,
        } => {
            let index_schema = index_schema.unwrap_or_else(|| IndexSpec::new(&schema).index_schema);
            serde_json::to_value(store.index().search(&phrase, &index_schema, offset, limit)?)?
        }

        Command::Order { command } => match command {
            OrderCommand::Add { id, value, tag } => {
                let value = parse_value(&value);
                json!({ "ok": store.order(&schema, &tag)?.add(value, &id)? })
            }
            OrderCommand::List {
                tag,
                reverse,
                offset,
                limit,
            } => {
                let mut walk = if reverse { Walk::backward() } else { Walk::forward() };
                walk = walk.offset(offset);
                if let Some(limit) = limit {
                    walk = walk.limit(limit);
                }
                serde_json::to_value(store.order(&schema, &tag)?.entries(walk)?)?
            }
        },

        Command::Stats { recompute, change } => {
            let stats = store.stats();
            let record = if let Some(expression) = change {
                stats.change_expr(&schema, &expression)?
            } else if recompute {
                Some(stats.recompute(&schema)?)
            } else {
                stats.get(&schema)?
            };
            serde_json::to_value(record)?
        }
    };

    print_output(&output, &cli.format)
}

fn outcome_json<T>(outcome: Outcome<T>, done: impl FnOnce(T) -> Value) -> Value {
    match outcome {
        Outcome::Done(value) => done(value),
        Outcome::NotFound => json!({ "ok": false, "status": "not_found" }),
        Outcome::RolledBack => json!({ "ok": false, "status": "rolled_back" }),
    }
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Text that is not valid JSON is taken as a string.
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn input_value(data: Option<&str>, fields: &[(String, String)]) -> Result<Value, Box<dyn std::error::Error>> {
    let mut value = match data {
        Some(data) => serde_json::from_str(data).map_err(|e| format!("Invalid JSON data: {e}"))?,
        None => Value::Object(Default::default()),
    };
    if fields.is_empty() {
        return Ok(value);
    }
    let map = value
        .as_object_mut()
        .ok_or("--field needs the data to be a JSON object")?;
    for (key, val) in fields {
        map.insert(key.clone(), parse_value(val));
    }
    Ok(value)
}
