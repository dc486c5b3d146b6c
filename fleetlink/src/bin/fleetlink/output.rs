use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color as TableColor, Table};
use fleetlink::{
    AssociationView, CascadeSummary, HistoryRecord, LinkResult, Page, RestoreSummary, SoftDeleteSummary,
    UnlinkResult, ValidationOutcome,
};
use serde::Serialize;

use crate::theme::{ICONS, THEME};

/// Output format options for CLI commands
#[derive(Clone, Debug, ValueEnum, Default, PartialEq)]
pub enum OutputFormat {
    /// Formatted table output (default)
    #[default]
    Table,
    /// JSON output for scripting
    Json,
    /// Compact single-line output
    Compact,
}

/// Global CLI options that affect output and behavior
#[derive(Clone, Debug, Default)]
pub struct GlobalOptions {
    pub output_format: OutputFormat,
    pub quiet: bool,
    pub no_color: bool,
}

/// Trait for data that can be displayed as a table
pub trait TableDisplay {
    fn to_table(&self, options: &GlobalOptions) -> Table;
    fn to_compact(&self) -> String;
}

/// Output manager handles formatting and display
pub struct OutputManager {
    pub options: GlobalOptions,
}

impl OutputManager {
    pub fn new(options: GlobalOptions) -> Self {
        Self { options }
    }

    /// Display data according to the configured output format
    pub fn display<T>(&self, data: &T) -> Result<()>
    where
        T: Serialize + TableDisplay,
    {
        if self.options.quiet {
            return Ok(());
        }

        match self.options.output_format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                println!("{json}");
            }
            OutputFormat::Table => {
                let table = data.to_table(&self.options);
                println!("{table}");
            }
            OutputFormat::Compact => {
                println!("{}", data.to_compact());
            }
        }
        Ok(())
    }

    fn is_json(&self) -> bool {
        matches!(self.options.output_format, OutputFormat::Json)
    }

    /// Display a success message with color and icon
    pub fn success(&self, message: &str) {
        if self.options.quiet || self.is_json() {
            return;
        }
        let output = if self.options.no_color {
            format!("{} {message}", ICONS.success)
        } else {
            format!("{} {}", ICONS.success.color(THEME.success), message.color(THEME.success))
        };
        println!("{output}");
    }

    /// Display an error message with color and icon
    pub fn error(&self, message: &str) {
        let output = if self.options.no_color {
            format!("{} {message}", ICONS.error)
        } else {
            format!("{} {}", ICONS.error.color(THEME.error), message.color(THEME.error))
        };
        eprintln!("{output}");
    }

    /// Display a warning message
    pub fn warning(&self, message: &str) {
        if self.options.quiet || self.is_json() {
            return;
        }
        let output = if self.options.no_color {
            format!("{} {message}", ICONS.warning)
        } else {
            format!("{} {}", ICONS.warning.color(THEME.warning), message.color(THEME.warning))
        };
        println!("{output}");
    }

    /// Display info message with color and icon
    pub fn info(&self, message: &str) {
        if self.options.quiet || self.is_json() {
            return;
        }
        let output = if self.options.no_color {
            format!("{} {message}", ICONS.info)
        } else {
            format!("{} {}", ICONS.info.color(THEME.info), message.color(THEME.info))
        };
        println!("{output}");
    }

    /// Display a bullet list item
    pub fn bullet(&self, text: &str) {
        if self.options.quiet || self.is_json() {
            return;
        }
        let output = if self.options.no_color {
            format!("  {} {text}", ICONS.bullet)
        } else {
            format!("  {} {text}", ICONS.bullet.color(THEME.muted))
        };
        println!("{output}");
    }
}

fn themed_table(options: &GlobalOptions, headers: &[&str]) -> Table {
    let mut table = Table::new();
    if options.no_color {
        table.load_preset(comfy_table::presets::ASCII_FULL);
    } else {
        table.load_preset(comfy_table::presets::UTF8_FULL_CONDENSED);
    }
    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|header| {
            let cell = Cell::new(header).add_attribute(Attribute::Bold);
            if options.no_color { cell } else { cell.fg(TableColor::Cyan) }
        })
        .collect();
    table.set_header(header_cells);
    table
}

fn key_value_table(options: &GlobalOptions, rows: Vec<(&str, String)>) -> Table {
    let mut table = themed_table(options, &["Field", "Value"]);
    for (key, value) in rows {
        table.add_row(vec![Cell::new(key), Cell::new(value)]);
    }
    table
}

fn optional(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

impl TableDisplay for Page<AssociationView> {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Relation", "Counterpart", "Label", "Status", "Linked at", "Linked by"]);
        for view in &self.items {
            table.add_row(vec![
                Cell::new(view.relation),
                Cell::new(&view.counterpart),
                Cell::new(optional(view.summary.as_ref().and_then(|summary| summary.label.as_deref()))),
                Cell::new(view.record.status.as_str()),
                Cell::new(view.record.linked_at.format("%Y-%m-%d %H:%M:%S UTC")),
                Cell::new(&view.record.linked_by),
            ]);
        }
        if let Some(cursor) = &self.next_cursor {
            table.add_row(vec![Cell::new("next cursor").add_attribute(Attribute::Italic), Cell::new(cursor)]);
        }
        table
    }

    fn to_compact(&self) -> String {
        let counterparts: Vec<String> = self.items.iter().map(|view| view.counterpart.to_string()).collect();
        format!("{} association(s): {}", self.items.len(), counterparts.join(", "))
    }
}

impl TableDisplay for Page<HistoryRecord> {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["When", "Action", "Relation", "Counterpart", "By", "Reason"]);
        for record in &self.items {
            table.add_row(vec![
                Cell::new(record.performed_at.format("%Y-%m-%d %H:%M:%S%.3f UTC")),
                Cell::new(record.action),
                Cell::new(record.relation),
                Cell::new(&record.counterpart),
                Cell::new(&record.performed_by),
                Cell::new(optional(record.reason.as_deref())),
            ]);
        }
        if let Some(cursor) = &self.next_cursor {
            table.add_row(vec![Cell::new("next cursor").add_attribute(Attribute::Italic), Cell::new(cursor)]);
        }
        table
    }

    fn to_compact(&self) -> String {
        format!("{} history record(s)", self.items.len())
    }
}

impl TableDisplay for LinkResult {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        key_value_table(
            options,
            vec![
                ("relation", self.association.relation.to_string()),
                ("subject", self.association.subject.to_string()),
                ("object", self.association.object.to_string()),
                ("linked_by", self.association.linked_by.clone()),
                ("history_record", self.history.record_id.clone()),
            ],
        )
    }

    fn to_compact(&self) -> String {
        format!(
            "linked {} -> {} ({})",
            self.association.subject, self.association.object, self.association.relation
        )
    }
}

impl TableDisplay for UnlinkResult {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        key_value_table(
            options,
            vec![
                ("relation", self.removed.relation.to_string()),
                ("subject", self.removed.subject.to_string()),
                ("object", self.removed.object.to_string()),
                ("status_before", self.removed.status.as_str().to_string()),
                ("history_record", self.history.record_id.clone()),
            ],
        )
    }

    fn to_compact(&self) -> String {
        format!(
            "unlinked {} -> {} ({})",
            self.removed.subject, self.removed.object, self.removed.relation
        )
    }
}

impl TableDisplay for CascadeSummary {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut rows = vec![
            ("associations_deleted", self.associations_deleted.to_string()),
            ("deleted_this_run", self.associations_deleted_this_run.to_string()),
            ("history_records_written", self.history_records_written.to_string()),
            ("entity_deleted", self.entity_deleted.to_string()),
        ];
        for (relation, count) in &self.per_relation {
            rows.push((relation.as_str(), count.to_string()));
        }
        key_value_table(options, rows)
    }

    fn to_compact(&self) -> String {
        format!(
            "deleted {} association(s), entity deleted: {}",
            self.associations_deleted, self.entity_deleted
        )
    }
}

impl TableDisplay for SoftDeleteSummary {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        key_value_table(
            options,
            vec![("associations_deactivated", self.associations_deactivated.to_string())],
        )
    }

    fn to_compact(&self) -> String {
        format!("deactivated {} association(s)", self.associations_deactivated)
    }
}

impl TableDisplay for RestoreSummary {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let join = |refs: &[fleetlink::EntityRef]| {
            if refs.is_empty() {
                "-".to_string()
            } else {
                refs.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            }
        };
        key_value_table(
            options,
            vec![
                ("associations_reactivated", self.associations_reactivated.to_string()),
                ("conflicts", join(&self.conflicts)),
                ("skipped_inactive_counterparts", join(&self.skipped_inactive_counterparts)),
            ],
        )
    }

    fn to_compact(&self) -> String {
        format!(
            "reactivated {} association(s), {} conflict(s)",
            self.associations_reactivated,
            self.conflicts.len()
        )
    }
}

impl TableDisplay for ValidationOutcome {
    fn to_table(&self, options: &GlobalOptions) -> Table {
        let mut table = themed_table(options, &["Entity", "Result"]);
        for entity in &self.valid {
            table.add_row(vec![Cell::new(entity), Cell::new("valid")]);
        }
        for invalid in &self.invalid {
            let reason = serde_json::to_value(invalid.reason)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();
            table.add_row(vec![Cell::new(&invalid.entity), Cell::new(reason)]);
        }
        table
    }

    fn to_compact(&self) -> String {
        format!("{} valid, {} invalid", self.valid.len(), self.invalid.len())
    }
}
