//! GrooveDB - CLI Client

use std::env;

use anyhow::{anyhow, bail, Context};
use groovedb::catalog::{Column, ColumnType, DatasetKeys, Schema};
use groovedb::server::client::QueryResult;
use groovedb::server::{Client, Request, Response, DEFAULT_PORT};
use groovedb::storage::{Record, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Print welcome banner
fn print_banner() {
    println!(
        r#"
  GrooveDB - dataset storage and query engine
  Type '.help' for help, '.quit' to exit
"#
    );
}

/// Print help message
fn print_help() {
    println!(
        r#"
Commands:
  .help                                  Show this help message
  .quit                                  Exit
  .datasets                              List datasets
  .describe <name>                       Show a dataset's schema and keys
  .create <name> <col>:<type>[!] ... [key=<col>,...]
                                         Create a dataset ('!' = not null)
  .drop <name>                           Drop a dataset
  .put <name> <json array of records>    Append rows
  .get <name> <json array of key values> Latest row with that key
  .session [id]                          Set or clear the ingestion session
  .flush                                 Seal the session's buffered rows
  .explain <query>                       Show the plan of a query

Queries end with ';':
  SELECT id, payload FROM events WHERE id = 1 ORDER BY ts DESC LIMIT 10;
"#
    );
}

/// Format query results as a table
fn format_results(result: &QueryResult) -> String {
    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }
    }

    let mut output = String::new();
    let separator: String = widths
        .iter()
        .map(|w| "-".repeat(*w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let separator = format!("+{}+\n", separator);

    output.push_str(&separator);
    let header: String = result
        .columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&separator);

    for row in &result.rows {
        let row_str: String = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v, width = *w))
            .collect::<Vec<_>>()
            .join("|");
        output.push_str(&format!("|{}|\n", row_str));
    }
    if !result.rows.is_empty() {
        output.push_str(&separator);
    }
    output.push_str(&format!("{} row(s) returned\n", result.rows.len()));
    output
}

/// Parse `.create` arguments: columns as `name:type[!]`, then `key=a,b`
fn parse_create(args: &[&str]) -> anyhow::Result<(Schema, DatasetKeys)> {
    let mut columns = Vec::new();
    let mut keys = DatasetKeys::default();
    for arg in args {
        if let Some(list) = arg.strip_prefix("key=") {
            keys = DatasetKeys::partition(list.split(',').filter(|s| !s.is_empty()));
            continue;
        }
        let (name, ty) = arg
            .split_once(':')
            .ok_or_else(|| anyhow!("expected <col>:<type>, got '{}'", arg))?;
        let (ty, not_null) = match ty.strip_suffix('!') {
            Some(ty) => (ty, true),
            None => (ty, false),
        };
        let column_type: ColumnType = serde_json::from_value(serde_json::json!(ty))
            .map_err(|_| anyhow!("unknown type '{}'", ty))?;
        columns.push(Column::new(name, column_type).nullable(!not_null));
    }
    if columns.is_empty() {
        bail!("a dataset needs at least one column");
    }
    Ok((Schema::from_columns(columns), keys))
}

struct Shell {
    client: Client,
    session: Option<String>,
}

impl Shell {
    async fn command(&mut self, line: &str) -> anyhow::Result<bool> {
        let mut parts = line.splitn(3, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default();
        let first = parts.next().unwrap_or_default().trim().to_string();
        let rest = parts.next().unwrap_or_default().trim().to_string();

        match cmd {
            ".help" => print_help(),
            ".quit" | ".exit" => return Ok(false),
            ".datasets" => {
                if let Response::Datasets { names } =
                    self.client.request(&Request::ListDatasets).await?
                {
                    if names.is_empty() {
                        println!("No datasets found.");
                    }
                    for name in names {
                        println!("  {}", name);
                    }
                }
            }
            ".describe" => {
                let response = self
                    .client
                    .request(&Request::DescribeDataset { name: first })
                    .await?;
                if let Response::Described { info } = response {
                    println!("{} (generation {})", info.name, info.generation);
                    for column in info.schema.columns() {
                        let null = if column.nullable { "" } else { " NOT NULL" };
                        println!("  {} {}{}", column.name, column.column_type, null);
                    }
                    let keys: Vec<&String> = info.keys.all().collect();
                    println!("  keys: {:?}", keys);
                }
            }
            ".create" => {
                let args: Vec<&str> = rest.split_whitespace().collect();
                let (schema, keys) = parse_create(&args)?;
                let response = self
                    .client
                    .request(&Request::CreateDataset {
                        name: first,
                        schema,
                        keys,
                    })
                    .await?;
                println!("{:?}", response);
            }
            ".drop" => {
                let response = self
                    .client
                    .request(&Request::DropDataset { name: first })
                    .await?;
                println!("{:?}", response);
            }
            ".put" => {
                let records: Vec<Record> =
                    serde_json::from_str(&rest).context("expected a JSON array of records")?;
                let response = self
                    .client
                    .request(&Request::Put {
                        dataset: first,
                        records,
                        session: self.session.clone(),
                    })
                    .await?;
                if let Response::Put(put) = response {
                    println!("{} row(s) accepted, seq {:?}", put.accepted, put.seq);
                    for failure in put.failures {
                        println!("  row {}: {}", failure.row, failure.message);
                    }
                }
            }
            ".get" => {
                let key: Vec<Value> =
                    serde_json::from_str(&rest).context("expected a JSON array of key values")?;
                let response = self
                    .client
                    .request(&Request::Get {
                        dataset: first,
                        key,
                        session: self.session.clone(),
                    })
                    .await?;
                if let Response::Row { values } = response {
                    println!("{}", serde_json::to_string(&values)?);
                }
            }
            ".session" => {
                self.session = (!first.is_empty()).then_some(first);
                println!("session: {:?}", self.session);
            }
            ".flush" => {
                let session = self
                    .session
                    .clone()
                    .ok_or_else(|| anyhow!("no session set"))?;
                let response = self.client.request(&Request::Flush { session }).await?;
                println!("{:?}", response);
            }
            ".explain" => {
                let text = format!("{} {}", first, rest);
                if let Response::Explained { plan } =
                    self.client.request(&Request::Explain { text }).await?
                {
                    print!("{}", plan);
                }
            }
            other => {
                eprintln!("Unknown command: {}", other);
                eprintln!("Type '.help' for available commands.");
            }
        }
        Ok(true)
    }

    async fn query(&mut self, text: &str) -> anyhow::Result<()> {
        let result = self.client.query(text, self.session.as_deref()).await?;
        print!("{}", format_results(&result));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let mut host = String::from("127.0.0.1");
    let mut port = DEFAULT_PORT;
    for i in 1..args.len() {
        match args[i].as_str() {
            "--host" | "-h" => {
                if let Some(h) = args.get(i + 1) {
                    host = h.clone();
                }
            }
            "--port" | "-p" => {
                if let Some(p) = args.get(i + 1) {
                    port = p.parse().context("invalid --port")?;
                }
            }
            _ => {}
        }
    }

    let addr = format!("{}:{}", host, port);
    let client = Client::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    let mut shell = Shell {
        client,
        session: None,
    };
    let mut editor = DefaultEditor::new()?;

    print_banner();

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "groove> " } else { "   ...> " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(trimmed);

        if buffer.is_empty() && trimmed.starts_with('.') {
            match shell.command(trimmed).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => eprintln!("Error: {}", e),
            }
            continue;
        }

        buffer.push_str(trimmed);
        buffer.push(' ');
        if trimmed.ends_with(';') {
            let text = std::mem::take(&mut buffer);
            if let Err(e) = shell.query(&text).await {
                eprintln!("Error: {}", e);
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}
