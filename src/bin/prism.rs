// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Decode a captured LED panel driver trace into displayed frames.
//!
//! Reads a VCD trace of the driver's output signals (sampled once per clock
//! half-cycle), replays it through the protocol decoder, and prints the
//! reconstructed frames selected by the dump windows.
//!
//! Usage:
//!   cargo run -r --bin prism -- <trace.vcd> [--config testbench.json] [options]

use std::io::Write;
use std::path::PathBuf;

use prism::config::DecodeConfig;
use prism::decode::{DecodeStats, Decoder};
use prism::dut::NullProbe;
use prism::sim::vcd_io::{VcdDut, VcdProbe};

#[derive(clap::Parser, Debug)]
#[command(name = "prism")]
#[command(about = "Decode an LED panel driver signal trace into displayed frames")]
struct Args {
    /// VCD trace of the driver outputs, sampled once per clock half-cycle.
    input_vcd: PathBuf,

    /// Testbench configuration JSON file.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Scope path of the driver signals in the input VCD.
    ///
    /// Auto-detected when not given here or in the config file.
    #[clap(long)]
    vcd_scope: Option<String>,

    /// Re-emit the decoded half-cycle samples as a VCD waveform.
    #[clap(long)]
    output_vcd: Option<PathBuf>,

    /// Stop once the frame counter reaches this value.
    #[clap(long)]
    frame_limit: Option<u32>,

    /// Liveness bound on total half-cycles.
    #[clap(long)]
    max_half_cycles: Option<u64>,

    /// Color channel rendered in frame dumps (0 = R, 1 = G, 2 = B).
    #[clap(long)]
    dump_channel: Option<usize>,
}

fn run(args: &Args) -> Result<DecodeStats, String> {
    let mut cfg = match &args.config {
        Some(path) => DecodeConfig::from_file(path)?,
        None => DecodeConfig::default(),
    };
    if let Some(scope) = &args.vcd_scope {
        cfg.vcd_scope = Some(scope.clone());
    }
    if let Some(limit) = args.frame_limit {
        cfg.frame_limit = limit;
    }
    if let Some(bound) = args.max_half_cycles {
        cfg.max_half_cycles = bound;
    }
    if let Some(channel) = args.dump_channel {
        cfg.dump_channel = channel;
    }
    cfg.validate()?;

    let mut dut = VcdDut::open(&args.input_vcd, cfg.vcd_scope.as_deref())?;
    let mut decoder = Decoder::new(&cfg)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let stats = match &args.output_vcd {
        Some(path) => {
            let mut probe = VcdProbe::create(path)?;
            decoder.run(&mut dut, &mut probe, &mut out)
        }
        None => decoder.run(&mut dut, &mut NullProbe, &mut out),
    }?;
    out.flush().map_err(|e| format!("cannot flush output: {}", e))?;
    Ok(stats)
}

fn main() {
    clilog::init_stderr_color_debug();

    let args = <Args as clap::Parser>::parse();
    clilog::info!("panel decode args:\n{:#?}", args);

    match run(&args) {
        Ok(stats) => {
            println!();
            println!("=== Panel Decode Results ===");
            println!("Half-cycles: {}", stats.half_cycles);
            println!("Shift clocks: {}", stats.shift_clocks);
            println!("Frames seen: {}", stats.frames_seen);
            println!("Frames dumped: {}", stats.frames_dumped);
            println!("Settle clears: {}", stats.settle_clears);
        }
        Err(e) => {
            clilog::error!("{}", e);
            std::process::exit(1);
        }
    }
}
