// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//! Simulation trace infrastructure.
//!
//! - [`vcd_io`] — VCD input replay ([`vcd_io::VcdDut`]) and per-half-cycle
//!   waveform capture ([`vcd_io::VcdProbe`])

pub mod vcd_io;
