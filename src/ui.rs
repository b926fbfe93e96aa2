//! Terminal tables for listings (cached cores, used libraries).

use colored::*;

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Rows with the wrong number of cells are ignored.
    pub fn add_row(&mut self, row: Vec<String>) {
        if row.len() == self.headers.len() {
            self.rows.push(row);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn print(&self) {
        let (_, width) = console::Term::stdout().size();
        print!("{}", self.render(width as usize));
    }

    /// Box-drawn table fitting in `max_width` columns. Cells too wide for
    /// their column are truncated with `...`.
    pub fn render(&self, max_width: usize) -> String {
        if self.headers.is_empty() {
            return String::new();
        }
        let mut widths: Vec<usize> = self
            .headers
            .iter()
            .map(|h| console::measure_text_width(h))
            .collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(console::measure_text_width(&flatten(cell)));
            }
        }

        // two spaces of indent, one border per column plus padding
        let overhead = 3 + 3 * widths.len();
        let available = max_width.saturating_sub(overhead);
        while widths.iter().sum::<usize>() > available {
            let Some((idx, &widest)) = widths.iter().enumerate().max_by_key(|(_, w)| **w) else {
                break;
            };
            if widest <= 8 {
                break;
            }
            widths[idx] -= 1;
        }

        let line = |left: &str, mid: &str, right: &str| {
            let cells: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("  {left}{}{right}\n", cells.join(mid))
        };
        let row_line = |cells: &[String], bold: bool| {
            let mut out = String::from("  │");
            for (cell, &width) in cells.iter().zip(&widths) {
                let text = console::truncate_str(&flatten(cell), width, "...").to_string();
                let pad = width.saturating_sub(console::measure_text_width(&text));
                let text = if bold { text.bold().to_string() } else { text };
                out.push_str(&format!(" {text}{} │", " ".repeat(pad)));
            }
            out.push('\n');
            out
        };

        let mut out = line("┌", "┬", "┐");
        out.push_str(&row_line(&self.headers, true));
        out.push_str(&line("├", "┼", "┤"));
        for row in &self.rows {
            out.push_str(&row_line(row, false));
        }
        out.push_str(&line("└", "┴", "┘"));
        out
    }
}

fn flatten(s: &str) -> String {
    s.replace(['\n', '\r', '\t'], " ")
}
