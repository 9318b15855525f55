// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! VCD input/output for driver traces.
//!
//! [`VcdDut`] replays a captured trace of the driver's output signals as a
//! [`PanelDut`]: one VCD timestamp per half-cycle, the format [`VcdProbe`]
//! itself writes. [`VcdProbe`] is the waveform-capture side of the decoder's
//! per-half-cycle snapshot point.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;

use vcd_ng::{
    FFValueChange, FastFlow, FastFlowToken, IdCode, Parser, Scope, ScopeItem, SimulationCommand,
    TimescaleUnit, Value, VecValue, Writer,
};

use crate::dut::{PanelDut, SignalSample, WaveProbe};

// ── Signal naming ───────────────────────────────────────────────────────────

/// Driver output bundle signals, as named in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sig {
    Clk,
    Rst,
    Addr,
    Frame,
    Subframe,
    Sclk,
    Latch,
    Blank,
    Rgb0,
    Rgb1,
    Rdy,
}

/// Wire name, signal, and whether replay requires it. `clk`/`rst` are
/// re-driven by the decode loop, so a trace without them still replays.
const SIGNALS: [(&str, Sig, bool); 11] = [
    ("clk", Sig::Clk, false),
    ("rst", Sig::Rst, false),
    ("o_addr", Sig::Addr, true),
    ("o_frame", Sig::Frame, true),
    ("o_subframe", Sig::Subframe, true),
    ("o_sclk", Sig::Sclk, true),
    ("o_latch", Sig::Latch, true),
    ("o_blank", Sig::Blank, true),
    ("o_rgb0", Sig::Rgb0, true),
    ("o_rgb1", Sig::Rgb1, true),
    ("o_rdy", Sig::Rdy, true),
];

fn set_u32(field: &mut u32, bit: u32, v: bool) {
    if bit >= 32 {
        return;
    }
    if v {
        *field |= 1 << bit;
    } else {
        *field &= !(1 << bit);
    }
}

fn set_u8(field: &mut u8, bit: u32, v: bool) {
    if bit >= 8 {
        return;
    }
    if v {
        *field |= 1 << bit;
    } else {
        *field &= !(1 << bit);
    }
}

fn set_field(s: &mut SignalSample, sig: Sig, bit: u32, v: bool) {
    match sig {
        Sig::Addr => set_u32(&mut s.addr, bit, v),
        Sig::Frame => set_u32(&mut s.frame, bit, v),
        Sig::Subframe => set_u32(&mut s.subframe, bit, v),
        Sig::Sclk => set_u8(&mut s.sclk, bit, v),
        Sig::Latch => set_u8(&mut s.latch, bit, v),
        Sig::Blank => set_u8(&mut s.blank, bit, v),
        Sig::Rgb0 => set_u8(&mut s.rgb0, bit, v),
        Sig::Rgb1 => set_u8(&mut s.rgb1, bit, v),
        Sig::Rdy => s.rdy = v,
        // clk/rst are tracked outside the sample bundle.
        Sig::Clk | Sig::Rst => {}
    }
}

// ── Scope matching utilities ────────────────────────────────────────────────

/// Try to match one component in a scope path.
/// Returns the remaining scope on success, or None on failure.
fn match_scope_path<'i>(mut scope: &'i str, cur: &str) -> Option<&'i str> {
    if scope.is_empty() {
        return Some("");
    }
    if scope.starts_with('/') {
        scope = &scope[1..];
    }
    if scope.is_empty() {
        Some("")
    } else if scope.starts_with(cur) {
        if scope.len() == cur.len() {
            Some("")
        } else if scope.as_bytes()[cur.len()] == b'/' {
            Some(&scope[cur.len() + 1..])
        } else {
            None
        }
    } else {
        None
    }
}

/// Find a scope by its path in the VCD hierarchy.
fn find_top_scope<'i>(items: &'i [ScopeItem], top_scope: &str) -> Option<&'i Scope> {
    for item in items {
        if let ScopeItem::Scope(scope) = item {
            if let Some(rest) = match_scope_path(top_scope, scope.identifier.as_str()) {
                return match rest {
                    "" => Some(scope),
                    _ => find_top_scope(&scope.children[..], rest),
                };
            }
        }
    }
    None
}

/// Recursively collect all scope paths from the VCD header.
fn collect_all_scopes<'a>(
    items: &'a [ScopeItem],
    prefix: &str,
    scopes: &mut Vec<(String, &'a Scope)>,
) {
    for item in items {
        if let ScopeItem::Scope(scope) = item {
            let path = if prefix.is_empty() {
                scope.identifier.to_string()
            } else {
                format!("{}/{}", prefix, scope.identifier)
            };
            scopes.push((path.clone(), scope));
            collect_all_scopes(&scope.children[..], &path, scopes);
        }
    }
}

/// Whether a scope's direct children carry every required driver signal.
fn scope_has_required(items: &[ScopeItem]) -> bool {
    let mut found = HashSet::new();
    for item in items {
        if let ScopeItem::Var(var) = item {
            found.insert(var.reference.to_string());
        }
    }
    SIGNALS
        .iter()
        .filter(|(_, _, required)| *required)
        .all(|(name, _, _)| found.contains(*name))
}

/// Resolve the scope holding the driver signals: the user-specified path, or
/// the first scope whose children carry every required signal.
fn resolve_scope<'i>(
    items: &'i [ScopeItem],
    scope: Option<&str>,
) -> Result<&'i [ScopeItem], String> {
    if let Some(path) = scope {
        let s = find_top_scope(items, path)
            .ok_or_else(|| format!("scope {} not found in VCD", path))?;
        return Ok(&s.children[..]);
    }
    if scope_has_required(items) {
        return Ok(items);
    }
    let mut scopes = Vec::new();
    collect_all_scopes(items, "", &mut scopes);
    for (path, s) in &scopes {
        if scope_has_required(&s.children[..]) {
            clilog::info!("auto-detected VCD scope: {}", path);
            return Ok(&s.children[..]);
        }
    }
    Err("no VCD scope contains the driver output signals; specify one explicitly".to_string())
}

/// Bit indices of a `[a:b]` vector range in VCD stream order (MSB first).
fn range_indices(a: i64, b: i64) -> Box<dyn Iterator<Item = i64>> {
    if a >= b {
        Box::new((b..=a).rev())
    } else {
        Box::new(a..=b)
    }
}

/// Map every recognized variable to `(id, stream_pos) -> (signal, bit)`.
fn map_signals(items: &[ScopeItem]) -> Result<HashMap<(u64, usize), (Sig, u32)>, String> {
    use vcd_ng::ReferenceIndex::*;

    let mut map = HashMap::new();
    let mut found = [false; SIGNALS.len()];
    for item in items {
        if let ScopeItem::Var(var) = item {
            let Some(slot) = SIGNALS
                .iter()
                .position(|(name, _, _)| *name == var.reference.as_str())
            else {
                continue;
            };
            let sig = SIGNALS[slot].1;
            found[slot] = true;
            match var.index {
                None => match var.size {
                    1 => {
                        map.insert((var.code.0, 0), (sig, 0));
                    }
                    w => {
                        for (pos, i) in (0..w).rev().enumerate() {
                            map.insert((var.code.0, pos), (sig, i));
                        }
                    }
                },
                Some(BitSelect(i)) => {
                    map.insert((var.code.0, 0), (sig, i as u32));
                }
                Some(Range(a, b)) => {
                    for (pos, i) in range_indices(a as i64, b as i64).enumerate() {
                        map.insert((var.code.0, pos), (sig, i as u32));
                    }
                }
            }
        }
    }

    let missing: Vec<&str> = SIGNALS
        .iter()
        .enumerate()
        .filter(|(slot, (_, _, required))| *required && !found[*slot])
        .map(|(_, (name, _, _))| *name)
        .collect();
    if !missing.is_empty() {
        return Err(format!("VCD scope is missing signals: {}", missing.join(", ")));
    }
    Ok(map)
}

// ── VCD trace replay ────────────────────────────────────────────────────────

enum StepAction {
    Continue,
    Boundary,
    Eof,
}

/// [`PanelDut`] backed by a captured VCD trace.
///
/// Each `step` advances one VCD timestamp, so the trace must be sampled once
/// per clock half-cycle (what [`VcdProbe`] writes). The driven clk/rst
/// levels are not forwarded anywhere; a recorded `clk` wire, when present,
/// is checked against the driven phase and a mismatch is logged once. When
/// the trace runs out the last sample stays visible and the decode loop's
/// liveness bound ends the run.
pub struct VcdDut {
    flow: FastFlow<File>,
    map: HashMap<(u64, usize), (Sig, u32)>,
    work: SignalSample,
    cur: SignalSample,
    work_clk: Option<bool>,
    driven_clk: bool,
    started: bool,
    exhausted: bool,
    clk_mismatch_warned: bool,
}

impl std::fmt::Debug for VcdDut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcdDut")
            .field("work_clk", &self.work_clk)
            .field("driven_clk", &self.driven_clk)
            .field("started", &self.started)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl VcdDut {
    /// Open a trace and resolve its signals, either under `scope` or in the
    /// first scope carrying all required driver outputs.
    pub fn open(path: &Path, scope: Option<&str>) -> Result<Self, String> {
        let file = File::open(path).map_err(|e| format!("cannot open VCD {:?}: {}", path, e))?;
        let mut bufrd = BufReader::with_capacity(65536, file);
        let mut parser = Parser::new(&mut bufrd);
        let header = parser
            .parse_header()
            .map_err(|e| format!("cannot parse VCD header of {:?}: {}", path, e))?;
        drop(parser);
        let mut vcd_file = bufrd.into_inner();
        vcd_file
            .seek(SeekFrom::Start(0))
            .map_err(|e| format!("cannot rewind VCD {:?}: {}", path, e))?;
        let flow = FastFlow::new(vcd_file, 65536);

        let scope_items = resolve_scope(&header.items[..], scope)?;
        let map = map_signals(scope_items)?;
        clilog::info!("mapped {} VCD signal bits for replay", map.len());

        Ok(VcdDut {
            flow,
            map,
            work: SignalSample::default(),
            cur: SignalSample::default(),
            work_clk: None,
            driven_clk: false,
            started: false,
            exhausted: false,
            clk_mismatch_warned: false,
        })
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    fn commit(&mut self) {
        self.cur = self.work;
        if let Some(recorded) = self.work_clk {
            if recorded != self.driven_clk && !self.clk_mismatch_warned {
                clilog::warn!(
                    "recorded clk does not match the driven phase; \
                     the trace may not be sampled once per half-cycle"
                );
                self.clk_mismatch_warned = true;
            }
        }
    }
}

impl PanelDut for VcdDut {
    fn set_clk(&mut self, level: bool) {
        self.driven_clk = level;
    }

    fn set_rst(&mut self, _level: bool) {
        // The recorded trace already contains the reset behavior.
    }

    fn step(&mut self) {
        if self.exhausted {
            return;
        }
        loop {
            let action = match self.flow.next_token() {
                Ok(Some(FastFlowToken::Timestamp(_))) => StepAction::Boundary,
                Ok(Some(FastFlowToken::Value(FFValueChange { id, bits }))) => {
                    for (pos, &b) in bits.iter().enumerate() {
                        if let Some(&(sig, bit)) = self.map.get(&(id.0, pos)) {
                            let v = b == b'1';
                            if sig == Sig::Clk {
                                self.work_clk = Some(v);
                            } else {
                                set_field(&mut self.work, sig, bit, v);
                            }
                        }
                    }
                    StepAction::Continue
                }
                Ok(None) => StepAction::Eof,
                Err(e) => {
                    clilog::warn!("error reading VCD stream: {}", e);
                    StepAction::Eof
                }
            };
            match action {
                StepAction::Continue => {}
                StepAction::Boundary => {
                    // A timestamp closes the previous sample period; values
                    // seen since then are that period's state.
                    if self.started {
                        self.commit();
                        return;
                    }
                    self.started = true;
                }
                StepAction::Eof => {
                    self.commit();
                    self.exhausted = true;
                    return;
                }
            }
        }
    }

    fn sample(&self) -> SignalSample {
        self.cur
    }
}

// ── VCD trace capture ───────────────────────────────────────────────────────

/// Waveform probe writing one VCD timestamp per half-cycle.
///
/// Wire widths match the driver's port declarations; only changed wires are
/// re-emitted per timestamp.
pub struct VcdProbe {
    writer: Writer<BufWriter<File>>,
    clk: IdCode,
    rst: IdCode,
    addr: IdCode,
    frame: IdCode,
    subframe: IdCode,
    sclk: IdCode,
    latch: IdCode,
    blank: IdCode,
    rgb0: IdCode,
    rgb1: IdCode,
    rdy: IdCode,
    last: Option<(bool, bool, SignalSample)>,
}

impl VcdProbe {
    pub fn create(path: &Path) -> Result<Self, String> {
        let file = File::create(path).map_err(|e| format!("cannot create VCD {:?}: {}", path, e))?;
        let mut writer = Writer::new(BufWriter::new(file));

        writer.timescale(1, TimescaleUnit::US).unwrap();
        writer.add_module("top").unwrap();
        let clk = writer.add_wire(1, "clk").unwrap();
        let rst = writer.add_wire(1, "rst").unwrap();
        let addr = writer.add_wire(6, "o_addr").unwrap();
        let frame = writer.add_wire(12, "o_frame").unwrap();
        let subframe = writer.add_wire(8, "o_subframe").unwrap();
        let sclk = writer.add_wire(2, "o_sclk").unwrap();
        let latch = writer.add_wire(2, "o_latch").unwrap();
        let blank = writer.add_wire(2, "o_blank").unwrap();
        let rgb0 = writer.add_wire(3, "o_rgb0").unwrap();
        let rgb1 = writer.add_wire(3, "o_rgb1").unwrap();
        let rdy = writer.add_wire(1, "o_rdy").unwrap();
        writer.upscope().unwrap();
        writer.enddefinitions().unwrap();
        writer.begin(SimulationCommand::Dumpvars).unwrap();

        Ok(VcdProbe {
            writer,
            clk,
            rst,
            addr,
            frame,
            subframe,
            sclk,
            latch,
            blank,
            rgb0,
            rgb1,
            rdy,
            last: None,
        })
    }
}

fn bit(v: bool) -> Value {
    if v {
        Value::V1
    } else {
        Value::V0
    }
}

/// Vector bits in VCD stream order (MSB first).
fn vec_bits(value: u32, width: u32) -> VecValue {
    (0..width)
        .rev()
        .map(|b| bit(value >> b & 1 != 0))
        .collect::<Vec<Value>>()
        .into()
}

impl WaveProbe for VcdProbe {
    fn sample(&mut self, half_cycle: u64, clk: bool, rst: bool, s: &SignalSample) {
        let w = &mut self.writer;
        w.timestamp(half_cycle).unwrap();
        let prev = self.last;

        if prev.map_or(true, |(c, _, _)| c != clk) {
            w.change_scalar(self.clk, bit(clk)).unwrap();
        }
        if prev.map_or(true, |(_, r, _)| r != rst) {
            w.change_scalar(self.rst, bit(rst)).unwrap();
        }
        let p = prev.map(|(_, _, p)| p);
        if p.map_or(true, |p| p.addr != s.addr) {
            w.change_vector(self.addr, &vec_bits(s.addr, 6)).unwrap();
        }
        if p.map_or(true, |p| p.frame != s.frame) {
            w.change_vector(self.frame, &vec_bits(s.frame, 12)).unwrap();
        }
        if p.map_or(true, |p| p.subframe != s.subframe) {
            w.change_vector(self.subframe, &vec_bits(s.subframe, 8))
                .unwrap();
        }
        if p.map_or(true, |p| p.sclk != s.sclk) {
            w.change_vector(self.sclk, &vec_bits(s.sclk.into(), 2))
                .unwrap();
        }
        if p.map_or(true, |p| p.latch != s.latch) {
            w.change_vector(self.latch, &vec_bits(s.latch.into(), 2))
                .unwrap();
        }
        if p.map_or(true, |p| p.blank != s.blank) {
            w.change_vector(self.blank, &vec_bits(s.blank.into(), 2))
                .unwrap();
        }
        if p.map_or(true, |p| p.rgb0 != s.rgb0) {
            w.change_vector(self.rgb0, &vec_bits(s.rgb0.into(), 3))
                .unwrap();
        }
        if p.map_or(true, |p| p.rgb1 != s.rgb1) {
            w.change_vector(self.rgb1, &vec_bits(s.rgb1.into(), 3))
                .unwrap();
        }
        if p.map_or(true, |p| p.rdy != s.rdy) {
            w.change_scalar(self.rdy, bit(s.rdy)).unwrap();
        }

        self.last = Some((clk, rst, *s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("prism_{}_{}.vcd", name, std::process::id()))
    }

    fn scripted_samples() -> Vec<SignalSample> {
        let mut trace = Vec::new();
        for i in 0..16u32 {
            trace.push(SignalSample {
                addr: i % 32,
                frame: i / 8,
                subframe: i % 4,
                sclk: if i % 2 == 0 { 0b10 } else { 0b00 },
                latch: (i % 3 == 0) as u8,
                blank: 0b11,
                rgb0: (i % 8) as u8 & 0b111,
                rgb1: 0b101,
                rdy: i > 10,
            });
        }
        trace
    }

    #[test]
    fn test_capture_replay_round_trip() {
        let path = temp_path("roundtrip");
        let trace = scripted_samples();

        let mut probe = VcdProbe::create(&path).unwrap();
        for (i, s) in trace.iter().enumerate() {
            probe.sample(i as u64, i % 2 == 0, i < 4, s);
        }
        drop(probe);

        let mut dut = VcdDut::open(&path, Some("top")).unwrap();
        for (i, expected) in trace.iter().enumerate() {
            dut.set_clk(i % 2 == 0);
            dut.step();
            assert_eq!(dut.sample(), *expected, "half-cycle {}", i);
        }
        dut.step();
        assert!(dut.exhausted());
        // Past the end the last sample stays visible.
        assert_eq!(dut.sample(), *trace.last().unwrap());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_auto_scope_detection() {
        let path = temp_path("autoscope");
        let trace = scripted_samples();
        let mut probe = VcdProbe::create(&path).unwrap();
        for (i, s) in trace.iter().enumerate() {
            probe.sample(i as u64, i % 2 == 0, false, s);
        }
        drop(probe);

        let mut dut = VcdDut::open(&path, None).unwrap();
        dut.set_clk(true);
        dut.step();
        assert_eq!(dut.sample(), trace[0]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_scope_and_signals_rejected() {
        let path = temp_path("badscope");
        let mut probe = VcdProbe::create(&path).unwrap();
        probe.sample(0, false, false, &SignalSample::default());
        drop(probe);

        assert!(VcdDut::open(&path, Some("nonexistent")).is_err());
        let _ = std::fs::remove_file(&path);

        // A VCD with none of the driver outputs must be rejected with the
        // missing names spelled out.
        let path = temp_path("nosignals");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(
                f,
                "$timescale 1 us $end\n$scope module top $end\n\
                 $var wire 1 ! clk $end\n$upscope $end\n\
                 $enddefinitions $end\n#0\n1!\n#1\n0!"
            )
            .unwrap();
        }
        let err = VcdDut::open(&path, None).unwrap_err();
        assert!(err.contains("driver output signals") || err.contains("missing"));
        let _ = std::fs::remove_file(&path);
    }
}
