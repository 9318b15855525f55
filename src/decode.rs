// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! The drive loop: half-cycle protocol state machine.
//!
//! This is where the multiplexing protocol actually lives. The loop steps
//! the DUT through rising/falling clock half-cycles and, from nothing but
//! the sampled signal values, decides when to shift, when to latch, when to
//! accumulate brightness, and when a displayed frame is complete:
//!
//! - shift registers clock in when the 2-bit `sclk` code reads `0b10` on a
//!   rising sample (never on falling samples);
//! - the 2-bit latch-enable carries one bit per clock phase (bit 0 rising,
//!   bit 1 falling), letting the driver request a capture on either phase;
//! - blanking is likewise per-phase, bit 1 on rising and bit 0 on falling;
//!   every non-blanked half-cycle contributes brightness for both row-halves
//!   (`addr` and `addr + rows/2`);
//! - a change of the frame counter ends the displayed frame.
//!
//! All of this is total combinational bit extraction; the only failure mode
//! is liveness (the frame counter never reaching the termination value),
//! which `run` bounds with `max_half_cycles` and reports as an error.

use std::io::Write;

use crate::config::DecodeConfig;
use crate::dut::{PanelDut, SignalSample, WaveProbe};
use crate::panel::Panel;
use crate::shift::ShiftRegBank;

/// Counters reported at the end of a run.
#[derive(Debug, Default, Clone)]
pub struct DecodeStats {
    pub half_cycles: u64,
    pub shift_clocks: u64,
    pub frames_seen: u32,
    pub frames_dumped: u32,
    pub settle_clears: u32,
}

/// The protocol state machine. Exclusively owns the shift register bank and
/// the panel; nothing else mutates them.
pub struct Decoder {
    bank: ShiftRegBank,
    panel: Panel,

    settle_threshold: u32,
    reset_warmup_pairs: u64,
    frame_limit: u32,
    max_half_cycles: u64,
    half_rows: usize,

    half_cycles: u64,
    pairs: u64,
    last_frame: Option<u32>,
    last_addr: Option<u32>,
    last_subframe: Option<u32>,
    rdy_high: u32,
    stats: DecodeStats,
}

impl Decoder {
    pub fn new(cfg: &DecodeConfig) -> Result<Self, String> {
        cfg.validate()?;
        Ok(Decoder {
            bank: ShiftRegBank::new(cfg.cols)?,
            panel: Panel::new(
                cfg.rows,
                cfg.cols,
                cfg.dump_channel,
                cfg.dump_frames.clone(),
            )?,
            settle_threshold: cfg.settle_threshold,
            reset_warmup_pairs: cfg.reset_warmup_pairs,
            frame_limit: cfg.frame_limit,
            max_half_cycles: cfg.max_half_cycles,
            half_rows: cfg.rows / 2,
            half_cycles: 0,
            pairs: 0,
            last_frame: None,
            last_addr: None,
            last_subframe: None,
            rdy_high: 0,
            stats: DecodeStats::default(),
        })
    }

    /// Drive the DUT until the frame counter reaches the configured limit,
    /// writing frame dumps to `out` and offering every half-cycle sample to
    /// `probe`.
    ///
    /// Reset is held asserted for the configured warm-up, then released; one
    /// extra clear discards whatever accumulated during the transient.
    pub fn run<D: PanelDut, P: WaveProbe, W: Write>(
        &mut self,
        dut: &mut D,
        probe: &mut P,
        out: &mut W,
    ) -> Result<DecodeStats, String> {
        dut.set_clk(false);
        dut.set_rst(true);
        let mut rst = true;

        loop {
            dut.set_clk(true);
            dut.step();
            let rising = dut.sample();
            probe.sample(self.half_cycles, true, rst, &rising);
            self.rising_half(&rising, out)?;
            self.half_cycles += 1;

            dut.set_clk(false);
            dut.step();
            let falling = dut.sample();
            probe.sample(self.half_cycles, false, rst, &falling);
            self.falling_half(&falling);
            self.half_cycles += 1;

            if self.pairs >= self.reset_warmup_pairs {
                dut.set_rst(false);
                if self.pairs == self.reset_warmup_pairs {
                    rst = false;
                    clilog::debug!("reset released, dropping warm-up accumulation");
                    self.panel.clear();
                }
            }
            self.pairs += 1;

            if falling.frame >= self.frame_limit {
                break;
            }
            if self.half_cycles >= self.max_half_cycles {
                return Err(format!(
                    "frame counter stuck at {} after {} half-cycles (limit {})",
                    falling.frame, self.half_cycles, self.frame_limit
                ));
            }
        }

        self.stats.half_cycles = self.half_cycles;
        Ok(self.stats.clone())
    }

    /// Rising-phase handling: frame boundary, readiness safety valve, shift
    /// clock, then the shared latch/blank handling.
    fn rising_half<W: Write>(&mut self, s: &SignalSample, out: &mut W) -> Result<(), String> {
        if self.last_frame != Some(s.frame) {
            clilog::info!("process frame {:5}", s.frame);
            self.stats.frames_seen += 1;
            if let Some(dump) = self.panel.on_frame_boundary(s.frame) {
                self.stats.frames_dumped += 1;
                write!(out, "{}", dump)
                    .map_err(|e| format!("cannot write frame dump: {}", e))?;
            }
        }
        self.last_frame = Some(s.frame);

        // Count half-cycles the driver has reported ready; once the settle
        // window elapses, whatever accumulated so far is stale start-up
        // state, not image data. Not a frame boundary, and the counter
        // keeps running.
        if s.rdy {
            self.rdy_high += 1;
            if self.rdy_high == self.settle_threshold {
                clilog::debug!(
                    "driver settled after {} ready half-cycles, dropping stale accumulation",
                    self.rdy_high
                );
                self.panel.clear();
                self.stats.settle_clears += 1;
            }
        }

        if s.sclk == 0b10 {
            self.bank.clock_in(s.rgb0, s.rgb1);
            self.stats.shift_clocks += 1;
        }

        let latch_rising = s.latch & 0b01 != 0;
        let blank_rising = s.blank & 0b10 != 0;
        self.phase_common(s, latch_rising, blank_rising);
        Ok(())
    }

    /// Falling-phase handling: no shifting, per-phase latch/blank bits, and
    /// the address/subframe change diagnostics.
    fn falling_half(&mut self, s: &SignalSample) {
        let latch_falling = s.latch & 0b10 != 0;
        let blank_falling = s.blank & 0b01 != 0;
        self.phase_common(s, latch_falling, blank_falling);

        if self.last_addr != Some(s.addr) {
            clilog::debug!(
                "addr {} subframe {}: {}",
                s.addr,
                s.subframe,
                self.bank.low()[1]
            );
        }
        self.last_addr = Some(s.addr);

        if self.last_subframe != Some(s.subframe) {
            clilog::debug!(
                "subframe {} at half-cycle {}: max brightness {}",
                s.subframe,
                self.half_cycles,
                self.panel.max_value()
            );
        }
        self.last_subframe = Some(s.subframe);
    }

    /// Latch and brightness handling shared by both phases, with the
    /// phase-specific latch/blank bits already extracted.
    fn phase_common(&mut self, s: &SignalSample, latch: bool, blank: bool) {
        self.bank.set_latch(latch);

        if !blank {
            let addr = s.addr as usize % self.half_rows;
            self.panel.accumulate(self.bank.low(), addr);
            self.panel.accumulate(self.bank.high(), addr + self.half_rows);
        }
    }

    /// Observed state of the panel grid. Test/diagnostic accessor.
    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }
}
