// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Brightness accumulation grid ("the panel").
//!
//! LED panels are driven by pulse-density modulation: a pixel's perceived
//! brightness is the fraction of half-cycles its LED spends lit. The panel
//! model therefore counts, per (row, column, channel) cell, how many
//! non-blanked half-cycles presented a 1 on that cell, and renders the
//! counts as a table once per interesting frame.

use std::fmt::Write as _;

use crate::config::FrameWindow;
use crate::shift::ShiftReg;

/// Fixed divisor applied when rendering accumulated counts, yielding an
/// `integer.remainder` magnitude in hex.
const BRIGHTNESS_SCALE: u32 = 0x10;

/// 3-channel brightness accumulator indexed by (row, column, channel).
///
/// Accumulators are `u32`: wide enough that no cell can overflow within one
/// frame window, so accumulation is plain counting with no saturation.
pub struct Panel {
    brightness: Vec<u32>,
    rows: usize,
    cols: usize,
    frame: u32,
    dump_channel: usize,
    dump_frames: Vec<FrameWindow>,
}

impl Panel {
    pub fn new(
        rows: usize,
        cols: usize,
        dump_channel: usize,
        dump_frames: Vec<FrameWindow>,
    ) -> Result<Self, String> {
        if rows == 0 || cols == 0 {
            return Err("panel geometry must be nonzero".to_string());
        }
        if rows != cols {
            return Err(format!(
                "column-flip addressing requires a square panel, got {}x{}",
                rows, cols
            ));
        }
        if dump_channel >= 3 {
            return Err(format!("dump channel {} out of range", dump_channel));
        }
        Ok(Panel {
            brightness: vec![0; rows * cols * 3],
            rows,
            cols,
            frame: 0,
            dump_channel,
            dump_frames,
        })
    }

    /// Last observed frame counter value.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Add one half-cycle's latched bits of an RGB lane triplet into the
    /// grid at logical row address `row_address` (must be `< rows`).
    ///
    /// The physical shift-out order reverses column order relative to
    /// accumulation order, so the row lands at the flipped coordinate
    /// `cols - row_address - 1`; flipping here keeps stored coordinates
    /// physically correct.
    pub fn accumulate(&mut self, lanes: &[ShiftReg; 3], row_address: usize) {
        let y = self.cols - row_address - 1;
        for (c, lane) in lanes.iter().enumerate() {
            for x in 0..self.cols {
                self.brightness[(y * self.cols + x) * 3 + c] += u32::from(lane.get(x));
            }
        }
    }

    /// Handle a change of the externally observed frame counter: record the
    /// new frame id, render the grid accumulated so far if the id falls in a
    /// configured dump window, then clear for the next frame.
    pub fn on_frame_boundary(&mut self, frame: u32) -> Option<String> {
        self.frame = frame;
        let dump = if self.dump_frames.iter().any(|w| w.contains(frame)) {
            Some(self.render())
        } else {
            None
        };
        self.clear();
        dump
    }

    /// Zero the grid without touching the frame id.
    pub fn clear(&mut self) {
        self.brightness.fill(0);
    }

    /// Accumulated count at (row, column, channel). Test/diagnostic accessor.
    pub fn value(&self, row: usize, column: usize, channel: usize) -> u32 {
        self.brightness[(row * self.cols + column) * 3 + channel]
    }

    /// Largest accumulated count on any cell.
    pub fn max_value(&self) -> u32 {
        self.brightness.iter().copied().max().unwrap_or(0)
    }

    /// Render the configured channel as a textual table: a frame header, a
    /// column-index header, then one line per row of `integer.remainder`
    /// magnitudes in hex (scale 16).
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "FRAME[{}]", self.frame);

        out.push_str("   ");
        for y in 0..self.cols {
            let _ = write!(out, "{:6x}", self.cols - y - 1);
        }
        out.push('\n');

        for x in 0..self.rows {
            let _ = write!(out, "{:2x} ", x);
            for y in 0..self.cols {
                let v = self.brightness[(y * self.cols + x) * 3 + self.dump_channel];
                let _ = write!(out, "{:4x}", v / BRIGHTNESS_SCALE);
                if v % BRIGHTNESS_SCALE != 0 {
                    let _ = write!(out, ".{:x}", v % BRIGHTNESS_SCALE);
                } else {
                    out.push_str("  ");
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shift::ShiftRegBank;

    const N: usize = 8;

    fn panel_dumping_all() -> Panel {
        Panel::new(N, N, 0, vec![FrameWindow { start: 0, end: 1000 }]).unwrap()
    }

    /// Bank whose low triplet has every R bit latched to 1.
    fn bank_with_red_row() -> ShiftRegBank {
        let mut bank = ShiftRegBank::new(N).unwrap();
        for _ in 0..N {
            bank.clock_in(0b001, 0b000);
        }
        bank.set_latch(true);
        bank.set_latch(false);
        bank
    }

    #[test]
    fn test_construction_rejects_bad_geometry() {
        assert!(Panel::new(0, 0, 0, vec![]).is_err());
        assert!(Panel::new(4, 8, 0, vec![]).is_err());
        assert!(Panel::new(8, 8, 3, vec![]).is_err());
    }

    #[test]
    fn test_accumulation_is_additive() {
        let mut panel = panel_dumping_all();
        let bank = bank_with_red_row();

        panel.accumulate(bank.low(), 2);
        let single = panel.value(N - 3, 0, 0);
        assert_eq!(single, 1);

        // Same pattern on a second, disjoint half-cycle: exactly double.
        panel.accumulate(bank.low(), 2);
        assert_eq!(panel.value(N - 3, 0, 0), 2 * single);
        // Other channels untouched.
        assert_eq!(panel.value(N - 3, 0, 1), 0);
        assert_eq!(panel.value(N - 3, 0, 2), 0);
    }

    #[test]
    fn test_column_flip() {
        let mut panel = panel_dumping_all();
        // Single bit at column 2 of the green lane.
        let mut bank = ShiftRegBank::new(N).unwrap();
        for i in 0..N {
            bank.clock_in(if i == 2 { 0b010 } else { 0 }, 0);
        }
        bank.set_latch(true);
        bank.set_latch(false);

        panel.accumulate(bank.low(), 5);
        // Row address flips, column index does not.
        assert_eq!(panel.value(N - 5 - 1, 2, 1), 1);
        for r in 0..N {
            for c in 0..N {
                if (r, c) != (N - 5 - 1, 2) {
                    assert_eq!(panel.value(r, c, 1), 0);
                }
            }
        }
    }

    #[test]
    fn test_frame_boundary_dumps_then_clears() {
        let mut panel = panel_dumping_all();
        let bank = bank_with_red_row();
        panel.accumulate(bank.low(), 0);

        let dump = panel.on_frame_boundary(1).expect("frame 1 is in the window");
        assert!(dump.starts_with("FRAME[1]\n"));
        assert_eq!(panel.frame(), 1);
        assert_eq!(panel.max_value(), 0, "boundary must clear the grid");
    }

    #[test]
    fn test_frame_outside_windows_not_dumped() {
        let mut panel = Panel::new(N, N, 0, vec![FrameWindow { start: 0, end: 2 }]).unwrap();
        let bank = bank_with_red_row();

        panel.accumulate(bank.low(), 0);
        assert!(panel.on_frame_boundary(1).is_some());

        panel.accumulate(bank.low(), 0);
        assert!(panel.on_frame_boundary(2).is_none());
        // Cleared regardless of whether a dump was emitted.
        assert_eq!(panel.max_value(), 0);
    }

    #[test]
    fn test_clear_keeps_frame_id() {
        let mut panel = panel_dumping_all();
        let bank = bank_with_red_row();
        panel.on_frame_boundary(7);
        panel.accumulate(bank.low(), 0);
        panel.clear();
        assert_eq!(panel.frame(), 7);
        assert_eq!(panel.max_value(), 0);
    }

    #[test]
    fn test_render_magnitude_and_remainder() {
        let mut panel = panel_dumping_all();
        let bank = bank_with_red_row();
        // 0x12 contributions at row address 0 land on grid row 7, which is
        // the last rendered column of every line: magnitude 1, remainder 2.
        for _ in 0..0x12 {
            panel.accumulate(bank.low(), 0);
        }
        let text = panel.render();
        assert!(
            text.lines().skip(2).all(|l| l.ends_with("   1.2")),
            "render:\n{}",
            text
        );

        // Exactly one scale unit renders with no remainder digits.
        let mut panel = panel_dumping_all();
        for _ in 0..0x10 {
            panel.accumulate(bank.low(), 0);
        }
        let text = panel.render();
        assert!(
            text.lines().skip(2).all(|l| l.ends_with("   1  ")),
            "render:\n{}",
            text
        );
    }
}
