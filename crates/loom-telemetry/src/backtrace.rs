// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Stack frames for captured errors, read from `std::backtrace`.
//!
//! No symbolication happens here: frames carry whatever the standard library
//! resolved, demangled, plus an in-app guess.

use std::backtrace::{Backtrace, BacktraceStatus};

use loom_telemetry_core::Frame;
use rustc_demangle::demangle;

/// Frames of the caller's stack, innermost first.
///
/// Empty unless backtraces are enabled (`RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`).
pub fn capture_frames() -> Vec<Frame> {
	let backtrace = Backtrace::capture();
	if backtrace.status() != BacktraceStatus::Captured {
		return Vec::new();
	}
	parse_backtrace(&backtrace.to_string())
}

/// Parses the `Display` form of a backtrace.
///
/// Frame lines look like `  3: my_app::run` and may be followed by a
/// location line `at ./src/main.rs:10:5` describing that frame.
fn parse_backtrace(text: &str) -> Vec<Frame> {
	let mut frames: Vec<Frame> = Vec::new();

	for line in text.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}

		if let Some(location) = line.strip_prefix("at ") {
			if let Some(frame) = frames.last_mut() {
				apply_location(frame, location);
			}
			continue;
		}

		if let Some(frame) = parse_frame_line(line) {
			frames.push(frame);
		}
	}

	frames
}

fn parse_frame_line(line: &str) -> Option<Frame> {
	let function_part = match line.split_once(':') {
		Some((prefix, rest)) if prefix.trim().parse::<u32>().is_ok() => rest.trim(),
		_ => line,
	};
	if function_part.is_empty() {
		return None;
	}

	let demangled = demangle(function_part).to_string();
	let module = demangled.rfind("::").map(|idx| demangled[..idx].to_string());
	let in_app = is_in_app_frame(&demangled);

	Some(Frame {
		function: Some(demangled),
		module,
		in_app,
		..Default::default()
	})
}

/// Splits `path:line:col`, tolerating `:` inside the path.
fn apply_location(frame: &mut Frame, location: &str) {
	let mut parts = location.rsplitn(3, ':');
	let col = parts.next().and_then(|p| p.parse::<u32>().ok());
	let line = parts.next().and_then(|p| p.parse::<u32>().ok());
	let path = parts.next();

	match (path, line, col) {
		(Some(path), Some(line), Some(col)) => {
			frame.filename = Some(path.to_string());
			frame.lineno = Some(line);
			frame.colno = Some(col);
		}
		_ => frame.filename = Some(location.to_string()),
	}
}

fn is_in_app_frame(function: &str) -> bool {
	const SYSTEM_PREFIXES: &[&str] = &[
		"std::",
		"core::",
		"alloc::",
		"<std::",
		"<core::",
		"<alloc::",
		"tokio::",
		"<tokio::",
		"futures::",
		"<futures::",
		"async_trait::",
		"tracing::",
		"<tracing::",
		"loom_telemetry::",
		"<loom_telemetry::",
		"rust_begin_unwind",
		"__rust_",
		"_rust_",
	];

	const SYSTEM_CONTAINS: &[&str] = &[
		"::panicking::",
		"::rt::",
		"::runtime::",
		"::sys_common::",
	];

	!SYSTEM_PREFIXES.iter().any(|p| function.starts_with(p))
		&& !SYSTEM_CONTAINS.iter().any(|c| function.contains(c))
}
