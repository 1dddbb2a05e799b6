//! Cell grid state mirrored from the backend's line-grid protocol.
//!
//! Grids come into existence on the first `grid_resize` naming their id and
//! go away on `grid_destroy`. Id 1 is the default grid. Update batches are
//! applied strictly in arrival order, records in order within each batch.

use rmpv::Value;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::nvim::UpdateBatch;

pub const DEFAULT_GRID_ID: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub glyph: char,
    pub hl_id: u64,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            glyph: ' ',
            hl_id: 0,
        }
    }
}

/// Foreground/background pair for one highlight attribute id. Anything the
/// renderer does not use (underline style, blend, ...) is dropped here.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HlAttr {
    pub foreground: Option<u32>,
    pub background: Option<u32>,
    pub reverse: bool,
}

#[derive(Debug)]
pub struct Grid {
    pub id: u64,
    pub rows: usize,
    pub cols: usize,
    cells: Vec<Cell>,
    pub dirty: bool,
}

impl Grid {
    fn new(id: u64, rows: usize, cols: usize) -> Self {
        Self {
            id,
            rows,
            cols,
            cells: vec![Cell::default(); rows * cols],
            dirty: true,
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        if row < self.rows && col < self.cols {
            self.cells.get(row * self.cols + col)
        } else {
            None
        }
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        let mut next = vec![Cell::default(); rows * cols];
        // Keep the overlapping region so a resize does not flash blank.
        for row in 0..rows.min(self.rows) {
            for col in 0..cols.min(self.cols) {
                next[row * cols + col] = self.cells[row * self.cols + col];
            }
        }
        self.rows = rows;
        self.cols = cols;
        self.cells = next;
        self.dirty = true;
    }

    fn clear(&mut self) {
        self.cells.fill(Cell::default());
        self.dirty = true;
    }

    fn set_cell(&mut self, row: usize, col: usize, cell: Cell) {
        if row < self.rows && col < self.cols {
            self.cells[row * self.cols + col] = cell;
        }
    }

    /// Vertical region scroll per the line-grid protocol: positive `rows`
    /// moves content up, negative moves it down. Vacated cells keep their
    /// stale content; the backend always overwrites them with `grid_line`.
    fn scroll(&mut self, top: i64, bot: i64, left: i64, right: i64, rows: i64) {
        let top = top.max(0) as usize;
        let bot = (bot.max(0) as usize).min(self.rows);
        let left = left.max(0) as usize;
        let right = (right.max(0) as usize).min(self.cols);
        if top >= bot || left >= right {
            return;
        }
        if rows > 0 {
            for dst in top..bot.saturating_sub(rows as usize) {
                let src = dst + rows as usize;
                self.copy_row_span(src, dst, left, right);
            }
        } else if rows < 0 {
            let shift = (-rows) as usize;
            for dst in (top + shift..bot).rev() {
                let src = dst - shift;
                self.copy_row_span(src, dst, left, right);
            }
        }
        self.dirty = true;
    }

    fn copy_row_span(&mut self, src_row: usize, dst_row: usize, left: usize, right: usize) {
        for col in left..right {
            let cell = self.cells[src_row * self.cols + col];
            self.cells[dst_row * self.cols + col] = cell;
        }
    }
}

#[derive(Debug, Default)]
pub struct GridSet {
    grids: FxHashMap<u64, Grid>,
    hl_attrs: FxHashMap<u64, HlAttr>,
    pub cursor: (u64, usize, usize),
    pub default_foreground: u32,
    pub default_background: u32,
    /// Set when a batch carried a `flush`, meaning the backend considers
    /// the screen consistent and a frame may be presented.
    pub flushed: bool,
}

impl GridSet {
    pub fn new() -> Self {
        Self {
            default_foreground: 0x00ff_ffff,
            default_background: 0x0000_0000,
            ..Self::default()
        }
    }

    pub fn grid(&self, id: u64) -> Option<&Grid> {
        self.grids.get(&id)
    }

    pub fn grids(&self) -> impl Iterator<Item = &Grid> {
        self.grids.values()
    }

    pub fn hl_attr(&self, id: u64) -> HlAttr {
        self.hl_attrs.get(&id).copied().unwrap_or_default()
    }

    pub fn any_dirty(&self) -> bool {
        self.grids.values().any(|grid| grid.dirty)
    }

    pub fn clear_dirty(&mut self) {
        for grid in self.grids.values_mut() {
            grid.dirty = false;
        }
        self.flushed = false;
    }

    /// Apply one update batch, records in order.
    pub fn apply(&mut self, batch: &UpdateBatch) {
        for record in &batch.0 {
            let Some(record) = record.as_array() else {
                warn!("update record is not an array");
                continue;
            };
            let Some(name) = record.first().and_then(Value::as_str) else {
                warn!("update record has no name tag");
                continue;
            };
            // One record may carry the same event for several grids:
            // ["grid_line", [args...], [args...], ...]
            for args in &record[1..] {
                let Some(args) = args.as_array() else {
                    continue;
                };
                self.apply_event(name, args);
            }
            if name == "flush" {
                self.flushed = true;
            }
        }
    }

    fn apply_event(&mut self, name: &str, args: &[Value]) {
        match name {
            "grid_resize" => {
                let (Some(id), Some(cols), Some(rows)) = (u64_at(args, 0), usize_at(args, 1), usize_at(args, 2)) else {
                    return;
                };
                match self.grids.get_mut(&id) {
                    Some(grid) => grid.resize(rows, cols),
                    None => {
                        trace!(id, rows, cols, "creating grid");
                        self.grids.insert(id, Grid::new(id, rows, cols));
                    }
                }
            }
            "grid_line" => self.apply_line(args),
            "grid_clear" => {
                if let Some(grid) = u64_at(args, 0).and_then(|id| self.grids.get_mut(&id)) {
                    grid.clear();
                }
            }
            "grid_scroll" => {
                let (Some(id), Some(top), Some(bot), Some(left), Some(right), Some(rows)) = (
                    u64_at(args, 0),
                    i64_at(args, 1),
                    i64_at(args, 2),
                    i64_at(args, 3),
                    i64_at(args, 4),
                    i64_at(args, 5),
                ) else {
                    return;
                };
                if let Some(grid) = self.grids.get_mut(&id) {
                    grid.scroll(top, bot, left, right, rows);
                }
            }
            "grid_destroy" => {
                if let Some(id) = u64_at(args, 0) {
                    trace!(id, "destroying grid");
                    self.grids.remove(&id);
                }
            }
            "grid_cursor_goto" => {
                let (Some(id), Some(row), Some(col)) =
                    (u64_at(args, 0), usize_at(args, 1), usize_at(args, 2))
                else {
                    return;
                };
                self.cursor = (id, row, col);
            }
            "hl_attr_define" => {
                let Some(id) = u64_at(args, 0) else { return };
                let Some(rgb) = args.get(1).and_then(Value::as_map) else {
                    return;
                };
                let mut attr = HlAttr::default();
                for (key, value) in rgb {
                    match (key.as_str(), value) {
                        (Some("foreground"), value) => attr.foreground = value.as_u64().map(|v| v as u32),
                        (Some("background"), value) => attr.background = value.as_u64().map(|v| v as u32),
                        (Some("reverse"), value) => attr.reverse = value.as_bool().unwrap_or(false),
                        _ => {}
                    }
                }
                self.hl_attrs.insert(id, attr);
            }
            "default_colors_set" => {
                if let Some(fg) = u64_at(args, 0) {
                    self.default_foreground = fg as u32;
                }
                if let Some(bg) = u64_at(args, 1) {
                    self.default_background = bg as u32;
                }
                // Defaults repaint everything.
                for grid in self.grids.values_mut() {
                    grid.dirty = true;
                }
            }
            "flush" => {}
            other => trace!(event = other, "ignoring update event"),
        }
    }

    /// `["grid_line", [grid, row, col_start, cells]]` where cells are
    /// `[text, hl_id?, repeat?]` triples and a missing hl id means "same as
    /// the previous cell".
    fn apply_line(&mut self, args: &[Value]) {
        let (Some(id), Some(row), Some(col_start)) =
            (u64_at(args, 0), usize_at(args, 1), usize_at(args, 2))
        else {
            return;
        };
        let Some(cells) = args.get(3).and_then(Value::as_array) else {
            return;
        };
        let Some(grid) = self.grids.get_mut(&id) else {
            return;
        };

        let mut col = col_start;
        let mut hl_id = 0u64;
        for chunk in cells {
            let Some(chunk) = chunk.as_array() else {
                continue;
            };
            let glyph = chunk
                .first()
                .and_then(Value::as_str)
                .and_then(|s| s.chars().next())
                .unwrap_or(' ');
            if let Some(new_hl) = chunk.get(1).and_then(Value::as_u64) {
                hl_id = new_hl;
            }
            let repeat = chunk.get(2).and_then(Value::as_u64).unwrap_or(1).max(1);
            for _ in 0..repeat {
                grid.set_cell(row, col, Cell { glyph, hl_id });
                col += 1;
            }
        }
        grid.dirty = true;
    }
}

fn u64_at(args: &[Value], index: usize) -> Option<u64> {
    args.get(index).and_then(Value::as_u64)
}

fn i64_at(args: &[Value], index: usize) -> Option<i64> {
    args.get(index).and_then(Value::as_i64)
}

fn usize_at(args: &[Value], index: usize) -> Option<usize> {
    u64_at(args, index).map(|v| v as usize)
}
