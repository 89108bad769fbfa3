use ansi_term::Style;
use pad::{Alignment, PadStr};
use std::fmt::{Display, Error, Formatter};
use unicode_width::UnicodeWidthStr;

/// Rows of text cells printed in aligned columns. The first row is the header.
pub struct Table {
    rows: Vec<Row>,
}

struct Row {
    style: Style,
    cells: Vec<Cell>,
}

struct Cell {
    text: String,
    align: Alignment,
}

impl Table {
    pub fn new() -> Table {
        Table { rows: Vec::new() }
    }

    /// Starts a new row. Rows after the first one use `style`.
    pub fn add_row(&mut self, style: Style) {
        let style = if self.rows.is_empty() {
            Style::new().bold()
        } else {
            style
        };
        self.rows.push(Row {
            style,
            cells: Vec::new(),
        });
    }

    fn push(&mut self, text: &str, align: Alignment) {
        if self.rows.is_empty() {
            self.add_row(Style::new());
        }
        if let Some(row) = self.rows.last_mut() {
            row.cells.push(Cell {
                text: text.to_string(),
                align,
            });
        }
    }

    pub fn add_cell(&mut self, text: &str) {
        self.push(text, Alignment::Left);
    }

    pub fn add_cell_rtl(&mut self, text: &str) {
        self.push(text, Alignment::Right);
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        let columns = self.rows.iter().map(|x| x.cells.len()).max().unwrap_or(0);
        let column_sizes: Vec<_> = (0..columns)
            .map(|i| {
                self.rows
                    .iter()
                    .filter_map(|x| x.cells.get(i))
                    .map(|x| UnicodeWidthStr::width(x.text.as_str()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        for row in self.rows.iter() {
            let line = row
                .cells
                .iter()
                .zip(column_sizes.iter())
                .map(|(cell, size)| cell.text.pad_to_width_with_alignment(*size, cell.align))
                .collect::<Vec<_>>()
                .join(" ");
            writeln!(f, "{}", row.style.paint(line.trim_end()))?;
        }

        Ok(())
    }
}
