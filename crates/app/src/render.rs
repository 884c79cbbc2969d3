use std::io::{self, Write};

use chatwire_engine::{Activation, LoadingPhase, ReadModel, Role, TableData, Turn};
use serde_json::Value;

/// Prints settled turns and phase changes from successive read models.
///
/// Output is incremental: a turn is printed once it settles, and a table
/// attached later to an already printed turn is printed on its own.
pub struct TerminalRenderer<W: Write> {
    out: W,
    activation: Option<Activation>,
    phase: LoadingPhase,
    printed: Vec<Turn>,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            activation: None,
            phase: LoadingPhase::Idle,
            printed: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, model: &ReadModel) -> io::Result<()> {
        if model.activation != self.activation {
            self.activation = model.activation;
            self.phase = LoadingPhase::Idle;
            self.printed.clear();
            if let Some(activation) = model.activation {
                writeln!(self.out, "== session {} ==", activation.session_id)?;
            }
        }

        // Turns before the first open one are final in order.
        let settled = model
            .turns
            .iter()
            .take_while(|turn| !turn.is_open())
            .collect::<Vec<_>>();

        for (index, turn) in settled.iter().enumerate() {
            match self.printed.get(index) {
                Some(printed) if printed.table != turn.table => {
                    if let Some(table) = &turn.table {
                        write_table(&mut self.out, turn, table)?;
                    }
                    self.printed[index] = (*turn).clone();
                }
                Some(_) => {}
                None => {
                    write_turn(&mut self.out, turn)?;
                    self.printed.push((*turn).clone());
                }
            }
        }

        if model.phase != self.phase {
            self.phase = model.phase.clone();
            match &self.phase {
                LoadingPhase::Idle => {}
                LoadingPhase::Failed(reason) => writeln!(self.out, "[failed: {reason}]")?,
                phase => writeln!(self.out, "[{}...]", phase.label())?,
            }
        }

        if let Some(artifact) = &model.artifact
            && self.printed.is_empty()
            && model.turns.is_empty()
        {
            writeln!(self.out, "(file: {})", artifact.file_name)?;
        }

        self.out.flush()
    }
}

fn write_turn<W: Write>(out: &mut W, turn: &Turn) -> io::Result<()> {
    let speaker = match turn.role {
        Role::User => "you",
        Role::Assistant => "assistant",
    };
    if !turn.text.is_empty() {
        writeln!(out, "{speaker}> {}", turn.text)?;
    }
    if let Some(table) = &turn.table {
        write_table(out, turn, table)?;
    }
    Ok(())
}

fn write_table<W: Write>(out: &mut W, turn: &Turn, table: &TableData) -> io::Result<()> {
    if let Some(chart) = &turn.chart
        && !chart.renders_as_table()
    {
        writeln!(out, "[{} chart: {}]", chart.as_str(), chart.hint_title())?;
    }

    let cells = table
        .rows
        .iter()
        .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
        .collect::<Vec<_>>();
    let mut widths = table
        .columns
        .iter()
        .map(|column| column.chars().count())
        .collect::<Vec<_>>();
    for row in &cells {
        for (index, cell) in row.iter().enumerate() {
            let width = cell.chars().count();
            match widths.get_mut(index) {
                Some(current) => *current = (*current).max(width),
                None => widths.push(width),
            }
        }
    }

    writeln!(out, "{}", format_row(&table.columns, &widths))?;
    writeln!(
        out,
        "{}",
        widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("-+-")
    )?;
    for row in &cells {
        writeln!(out, "{}", format_row(row, &widths))?;
    }
    if cells.is_empty() {
        writeln!(out, "(no rows)")?;
    }
    Ok(())
}

fn format_row(cells: &[String], widths: &[usize]) -> String {
    widths
        .iter()
        .enumerate()
        .map(|(index, width)| {
            let cell = cells.get(index).map(String::as_str).unwrap_or("");
            format!("{cell:<width$}")
        })
        .collect::<Vec<_>>()
        .join(" | ")
        .trim_end()
        .to_string()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
