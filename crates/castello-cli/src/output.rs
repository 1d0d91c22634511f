//! Output formatting for CLI

use clap::ValueEnum;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

/// One property row of a table report
#[derive(Tabled)]
pub struct Row {
    #[tabled(rename = "Property")]
    pub property: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

impl Row {
    pub fn new(property: &str, value: impl ToString) -> Self {
        Self {
            property: property.to_string(),
            value: value.to_string(),
        }
    }
}

/// Print a report: JSON for `json`, a table for `table`, `key: value` lines
/// otherwise
pub fn print_report<T: Serialize>(data: &T, rows: Vec<Row>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
        OutputFormat::Table => println!("{}", Table::new(rows).with(Style::rounded())),
        OutputFormat::Text => {
            for row in rows {
                println!("  {:<18} {}", format!("{}:", row.property), row.value);
            }
        }
    }
    Ok(())
}
